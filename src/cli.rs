//! Command-line interface definitions for egress-proxy.
//!
//! Uses clap's derive API for type-safe argument parsing.

use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Egress-control proxy for sandboxed AI agents.
///
/// Runs an allowlisting HTTP proxy and DNS forwarder for a network-isolated
/// sandbox, plus an mTLS control API the host uses to widen the allowlist
/// at runtime.
#[derive(Parser, Debug)]
#[command(name = "egress-proxy")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Commands,

    /// Increase log verbosity.
    ///
    /// Can be specified multiple times:
    /// -v    = info level
    /// -vv   = debug level
    /// -vvv  = trace level
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

/// Subcommands for egress-proxy.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the proxy server.
    ///
    /// Control API TLS material is read from EGRESS_PROXY_TLS_KEY,
    /// EGRESS_PROXY_TLS_CERT and EGRESS_PROXY_CA_CERT.
    Serve {
        /// Path to the JSON config file. Defaults apply when omitted.
        #[arg(short = 'c', long = "config", value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Generate an ephemeral CA with server and client certificates.
    ///
    /// Prints shell `export` lines for the server side and the client
    /// certificate and key PEMs. Nothing is written to disk.
    IssueCredentials {
        /// Certificate lifetime in hours.
        #[arg(long = "validity-hours", default_value_t = 24, value_parser = clap::value_parser!(u64).range(1..))]
        validity_hours: u64,
    },

    /// Show the live allowlists and listener settings.
    Config(ClientArgs),

    /// Append entries to the HTTP allowlist (`host:port`).
    AllowHttp {
        /// Control API connection.
        #[command(flatten)]
        client: ClientArgs,
        /// Entries to add.
        #[arg(required = true, value_name = "HOST:PORT")]
        entries: Vec<String>,
    },

    /// Append entries to the DNS allowlist (bare names).
    AllowDns {
        /// Control API connection.
        #[command(flatten)]
        client: ClientArgs,
        /// Entries to add.
        #[arg(required = true, value_name = "NAME")]
        entries: Vec<String>,
    },

    /// Show aggregated agent metrics.
    Metrics(ClientArgs),

    /// Show agent telemetry events.
    Events {
        /// Control API connection.
        #[command(flatten)]
        client: ClientArgs,
        /// Only events with an id greater than this.
        #[arg(long, default_value_t = 0)]
        after: u64,
        /// Only events from this agent.
        #[arg(long)]
        agent: Option<String>,
    },

    /// Show allow/block decisions.
    Logs {
        /// Control API connection.
        #[command(flatten)]
        client: ClientArgs,
        /// Only entries with an id greater than this (0 = most recent).
        #[arg(long, default_value_t = 0)]
        after: u64,
    },

    /// Show per-domain allow/block counters.
    Stats(ClientArgs),
}

/// Connection settings for control API subcommands.
#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Control API address.
    #[arg(long, env = "EGRESS_PROXY_ADDR", default_value = "127.0.0.1:3129")]
    pub addr: SocketAddr,

    /// Client certificate (PEM file).
    #[arg(long, env = "EGRESS_PROXY_CLIENT_CERT", value_name = "PATH")]
    pub client_cert: PathBuf,

    /// Client private key (PEM file).
    #[arg(long, env = "EGRESS_PROXY_CLIENT_KEY", value_name = "PATH")]
    pub client_key: PathBuf,

    /// CA certificate that signed the server (PEM file).
    #[arg(long, env = "EGRESS_PROXY_CLIENT_CA", value_name = "PATH")]
    pub ca_cert: PathBuf,
}
