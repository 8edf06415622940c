//! Plain-text rendering of metric summaries.
//!
//! Each summary belongs to a [`MetricFamily`] chosen by name prefix. The
//! [`FormatterTable`] maps families to formatting functions; it starts with
//! the built-in families and accepts explicit registrations before use.
//! Summaries with no matching prefix fall back to [`MetricFamily::Generic`].

use super::model::MetricSummary;
use std::collections::BTreeMap;

/// Known agent metric families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MetricFamily {
    /// `claude_code.*` metrics.
    ClaudeCode,
    /// `codex.*` metrics.
    Codex,
    /// Anything else.
    Generic,
}

impl MetricFamily {
    /// Name prefix identifying the family. Generic has none.
    pub fn prefix(self) -> Option<&'static str> {
        match self {
            MetricFamily::ClaudeCode => Some("claude_code."),
            MetricFamily::Codex => Some("codex."),
            MetricFamily::Generic => None,
        }
    }
}

/// Formatting function: agent name and that agent's summaries to lines.
pub type FormatFn = fn(&str, &[MetricSummary]) -> Vec<String>;

/// Dispatch table from family to formatter.
#[derive(Debug, Clone)]
pub struct FormatterTable {
    formatters: BTreeMap<MetricFamily, FormatFn>,
}

impl FormatterTable {
    /// Table with the built-in formatters.
    pub fn builtin() -> Self {
        let mut table = Self {
            formatters: BTreeMap::new(),
        };
        table.register(MetricFamily::ClaudeCode, format_claude_code);
        table.register(MetricFamily::Codex, format_generic);
        table.register(MetricFamily::Generic, format_generic);
        table
    }

    /// Install or replace the formatter for a family.
    pub fn register(&mut self, family: MetricFamily, formatter: FormatFn) {
        self.formatters.insert(family, formatter);
    }

    /// Family a metric name belongs to.
    pub fn family_of(name: &str) -> MetricFamily {
        [MetricFamily::ClaudeCode, MetricFamily::Codex]
            .into_iter()
            .find(|f| f.prefix().is_some_and(|p| name.starts_with(p)))
            .unwrap_or(MetricFamily::Generic)
    }

    /// Render one agent's summaries, grouped by family in a stable order.
    pub fn format_agent(&self, agent: &str, metrics: &[MetricSummary]) -> Vec<String> {
        let mut grouped: BTreeMap<MetricFamily, Vec<MetricSummary>> = BTreeMap::new();
        for m in metrics {
            grouped
                .entry(Self::family_of(&m.name))
                .or_default()
                .push(m.clone());
        }

        let mut lines = Vec::new();
        for (family, group) in grouped {
            let formatter = self
                .formatters
                .get(&family)
                .copied()
                .unwrap_or(format_generic as FormatFn);
            lines.extend(formatter(agent, &group));
        }
        lines
    }
}

impl Default for FormatterTable {
    fn default() -> Self {
        Self::builtin()
    }
}

/// One line per summary: `  name(type): value`.
pub fn format_generic(_agent: &str, metrics: &[MetricSummary]) -> Vec<String> {
    metrics
        .iter()
        .map(|m| match m.attributes.get("type") {
            Some(t) => format!("  {}({}): {}", m.name, t, m.value),
            None => format!("  {}: {}", m.name, m.value),
        })
        .collect()
}

fn format_claude_code(_agent: &str, metrics: &[MetricSummary]) -> Vec<String> {
    let mut model: Option<&str> = None;
    let mut cost = 0.0;
    let mut tokens: BTreeMap<&str, f64> = BTreeMap::new();
    let mut active: BTreeMap<&str, f64> = BTreeMap::new();
    let mut sessions = 0.0;

    for m in metrics {
        if model.is_none() {
            model = m.attributes.get("model").map(String::as_str);
        }
        let kind = m.attributes.get("type").map(String::as_str).unwrap_or("");
        match m.name.as_str() {
            "claude_code.cost.usage" => cost += m.value,
            "claude_code.token.usage" => *tokens.entry(kind).or_default() += m.value,
            "claude_code.active_time.total" => *active.entry(kind).or_default() += m.value,
            "claude_code.session.count" => sessions += m.value,
            _ => {}
        }
    }

    let mut lines = Vec::new();
    if let Some(model) = model {
        lines.push(format!("  Model:        {}", model));
    }
    if cost > 0.0 {
        lines.push(format!("  Cost:         ${:.4}", cost));
    }

    let token_parts: Vec<String> = [
        ("input", "input"),
        ("output", "output"),
        ("cacheRead", "cache read"),
        ("cacheCreation", "cache write"),
    ]
    .iter()
    .filter_map(|(key, label)| {
        tokens
            .get(key)
            .filter(|v| **v > 0.0)
            .map(|v| format!("{} {}", v, label))
    })
    .collect();
    if !token_parts.is_empty() {
        lines.push(format!("  Tokens:       {}", token_parts.join("  ")));
    }

    let time_parts: Vec<String> = ["user", "cli"]
        .iter()
        .filter_map(|key| {
            active
                .get(key)
                .filter(|v| **v > 0.0)
                .map(|v| format!("{:.1}s {}", v, key))
        })
        .collect();
    if !time_parts.is_empty() {
        lines.push(format!("  Active time:  {}", time_parts.join("  ")));
    }

    if sessions > 0.0 {
        lines.push(format!("  Sessions:     {}", sessions));
    }
    lines
}
