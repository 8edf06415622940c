//! Subcommand handling for egress-proxy.
//!
//! `serve` runs the proxy until Ctrl-C or SIGTERM; `issue-credentials`
//! prints fresh PEM material; the remaining commands talk to a running
//! proxy's control API and print the result.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

use crate::audit::{Action, LogEntry};
use crate::cli::{ClientArgs, Commands};
use crate::config::{CA_CERT_ENV, ConfigLoader, TLS_CERT_ENV, TLS_KEY_ENV, TlsMaterial};
use crate::control::ControlClient;
use crate::pki::generate_credentials;
use crate::server::{ProxyServer, wait_for_signal};
use crate::telemetry::{FormatterTable, MetricSummary};

/// Run one subcommand to completion.
pub fn handle_command(command: Commands) -> Result<()> {
    match command {
        Commands::Serve { config } => {
            let rt = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("Failed to create tokio runtime")?;
            rt.block_on(serve(config.as_deref()))
        }
        Commands::IssueCredentials { validity_hours } => issue_credentials(validity_hours),
        command => {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .context("Failed to create tokio runtime")?;
            rt.block_on(run_client_command(command))
        }
    }
}

async fn serve(config_path: Option<&Path>) -> Result<()> {
    let config = ConfigLoader::new()
        .load(config_path)
        .context("Failed to load configuration")?;
    let tls = TlsMaterial::from_env().context("Failed to load control API TLS material")?;
    let server = ProxyServer::new(config, tls).context("Invalid configuration")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let bound = server.bind(shutdown_rx).await?;

    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutting down");
        let _ = shutdown_tx.send(true);
    });

    bound.run().await
}

fn issue_credentials(validity_hours: u64) -> Result<()> {
    let validity = Duration::from_secs(validity_hours.saturating_mul(3600));
    let creds = generate_credentials(validity).context("Failed to generate credentials")?;

    println!("# Credentials valid until {}", creds.not_after());
    println!("export {}={}", TLS_KEY_ENV, shell_quote(creds.server_key_pem()));
    println!("export {}={}", TLS_CERT_ENV, shell_quote(creds.server_cert_pem()));
    println!("export {}={}", CA_CERT_ENV, shell_quote(creds.ca_cert_pem()));
    println!();
    println!("# Client certificate");
    print!("{}", creds.client_cert_pem());
    println!("# Client key");
    print!("{}", creds.client_key_pem());
    Ok(())
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn connect(args: &ClientArgs) -> Result<ControlClient> {
    let read = |path: &Path, what: &str| {
        std::fs::read_to_string(path).with_context(|| format!("Failed to read {} from {:?}", what, path))
    };
    let cert = read(&args.client_cert, "client certificate")?;
    let key = read(&args.client_key, "client key")?;
    let ca = read(&args.ca_cert, "CA certificate")?;
    ControlClient::from_pem(args.addr, &cert, &key, &ca).context("Invalid client TLS material")
}

async fn run_client_command(command: Commands) -> Result<()> {
    match command {
        Commands::Config(args) => {
            let config = connect(&args)?.config().await?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::AllowHttp { client, entries } => {
            let added = connect(&client)?.allow_http(&entries).await?;
            print_added(&added);
        }
        Commands::AllowDns { client, entries } => {
            let added = connect(&client)?.allow_dns(&entries).await?;
            print_added(&added);
        }
        Commands::Metrics(args) => {
            let metrics = connect(&args)?.metrics().await?;
            for line in format_metrics(&FormatterTable::builtin(), &metrics) {
                println!("{}", line);
            }
        }
        Commands::Events { client, after, agent } => {
            let events = connect(&client)?.events(after, agent.as_deref()).await?;
            for event in events {
                println!(
                    "{:>6} {} {} {}",
                    event.id,
                    event.time.format("%H:%M:%S"),
                    event.agent,
                    event.event_name
                );
            }
        }
        Commands::Logs { client, after } => {
            for entry in connect(&client)?.logs(after).await? {
                println!("{}", format_log_entry(&entry));
            }
        }
        Commands::Stats(args) => {
            let stats = connect(&args)?.stats().await?;
            println!("{:<40} {:>8} {:>8}", "DOMAIN", "ALLOWED", "BLOCKED");
            for (domain, counts) in stats {
                println!("{:<40} {:>8} {:>8}", domain, counts.allowed, counts.blocked);
            }
        }
        Commands::Serve { .. } | Commands::IssueCredentials { .. } => {
            anyhow::bail!("not a control API command")
        }
    }
    Ok(())
}

fn print_added(added: &[String]) {
    if added.is_empty() {
        println!("No new entries (already allowed)");
    }
    for entry in added {
        println!("added {}", entry);
    }
}

fn format_metrics(table: &FormatterTable, metrics: &[MetricSummary]) -> Vec<String> {
    let mut by_agent: BTreeMap<&str, Vec<MetricSummary>> = BTreeMap::new();
    for m in metrics {
        by_agent.entry(m.agent.as_str()).or_default().push(m.clone());
    }

    let mut lines = Vec::new();
    for (agent, group) in by_agent {
        lines.push(format!("{}:", agent));
        lines.extend(table.format_agent(agent, &group));
    }
    lines
}

fn format_log_entry(entry: &LogEntry) -> String {
    let action = match entry.action {
        Action::Allow => "ALLOW",
        Action::Block => "BLOCK",
    };
    let target = match entry.port {
        Some(port) => format!("{}:{}", entry.domain, port),
        None => entry.domain.clone(),
    };
    format!(
        "{:>6} {} {:<5} {:?}/{:?} {}",
        entry.id,
        entry.time.format("%H:%M:%S"),
        action,
        entry.source,
        entry.reason,
        target
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{Reason, Source};
    use chrono::Utc;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("abc"), "'abc'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_format_log_entry() {
        let entry = LogEntry {
            id: 7,
            time: Utc::now(),
            domain: "evil.example".to_string(),
            port: Some(443),
            action: Action::Block,
            source: Source::Proxy,
            reason: Reason::NotAllowlisted,
        };
        let line = format_log_entry(&entry);
        assert!(line.contains("BLOCK"));
        assert!(line.contains("evil.example:443"));
    }

    #[test]
    fn test_format_metrics_groups_by_agent() {
        let metrics = vec![
            MetricSummary {
                name: "requests".to_string(),
                agent: "b".to_string(),
                value: 2.0,
                attributes: Default::default(),
            },
            MetricSummary {
                name: "requests".to_string(),
                agent: "a".to_string(),
                value: 1.0,
                attributes: Default::default(),
            },
        ];
        let lines = format_metrics(&FormatterTable::builtin(), &metrics);
        assert_eq!(lines, vec!["a:", "  requests: 1", "b:", "  requests: 2"]);
    }
}
