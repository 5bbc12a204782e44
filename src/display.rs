//! Output formatting
//!
//! Renders [`SnapshotReport`]s and block listings either as colored terminal
//! text or as pretty JSON. The `render_*` functions return strings so the
//! live monitor can redraw a whole frame at once.

use crate::models::CostSource;
use crate::snapshot::{BlockDetail, SnapshotReport};
use chrono::{DateTime, Local, Utc};
use colored::Colorize;
use serde::Serialize;

pub struct DisplayManager;

impl Default for DisplayManager {
    fn default() -> Self {
        Self::new()
    }
}

impl DisplayManager {
    pub fn new() -> Self {
        Self
    }

    pub fn display_snapshot(&self, report: &SnapshotReport, json_output: bool) {
        if json_output {
            print_json(report);
        } else {
            print!("{}", self.render_snapshot(report));
        }
    }

    pub fn display_blocks(&self, blocks: &[BlockDetail], json_output: bool) {
        if json_output {
            print_json(&serde_json::json!({ "blocks": blocks }));
        } else {
            print!("{}", self.render_blocks(blocks));
        }
    }

    pub fn render_snapshot(&self, report: &SnapshotReport) -> String {
        let mut out = String::new();
        out.push_str(&format!("{}\n", "=".repeat(60).bright_cyan()));
        out.push_str(&format!("{}\n", "Usage Window".bright_white().bold()));
        out.push_str(&format!("{}\n\n", "=".repeat(60).bright_cyan()));

        let (Some(start), Some(end)) = (report.window_start, report.window_end) else {
            out.push_str(&format!(
                "{} No active window at {}\n",
                "📝".bright_yellow(),
                local_time(report.as_of).bright_white()
            ));
            return out;
        };

        let remaining = (end - report.as_of).num_minutes().max(0);
        out.push_str(&format!(
            "🕐 {} → {}  ({} left)\n\n",
            local_time(start).bright_white().bold(),
            local_time(end).bright_white().bold(),
            format_minutes(remaining).bright_yellow()
        ));

        out.push_str(&format!(
            "⚡ Tokens:   {}\n",
            format_tokens(report.windowed_tokens).bright_white().bold()
        ));
        for (family, tokens) in &report.tokens_by_model {
            out.push_str(&format!(
                "   {:<8} {}\n",
                family.display_name().bright_cyan(),
                format_tokens(*tokens)
            ));
        }

        if report.burn_rate > 0.0 {
            out.push_str(&format!(
                "🔥 Burn:     {}/min\n",
                format_tokens(report.burn_rate).bright_yellow()
            ));
        }

        out.push_str(&format!(
            "💲 Cost:     {}{}\n",
            format!("${:.2}", report.cost.total).bright_green().bold(),
            cost_mix(report)
        ));
        out.push_str(&format!(
            "📂 Active:   {} projects, {} sessions, {} messages\n",
            report.active_projects.to_string().bright_white(),
            report.active_sessions.to_string().bright_white(),
            report.message_count.to_string().bright_white()
        ));
        if report.interrupted_count > 0 {
            out.push_str(&format!(
                "⛔ Interrupted: {}\n",
                report.interrupted_count.to_string().bright_red()
            ));
        }

        if !report.tool_counts.is_empty() {
            let mut tools: Vec<_> = report.tool_counts.iter().collect();
            tools.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
            let top: Vec<String> = tools
                .iter()
                .take(5)
                .map(|(name, count)| format!("{} {}", name, count))
                .collect();
            out.push_str(&format!("🔧 Tools:    {}\n", top.join(", ")));
        }

        if let Some(latest) = report.latest_activity {
            out.push_str(&format!("\n🏁 Last activity {}\n", local_time(latest).bright_white()));
        }
        out
    }

    pub fn render_blocks(&self, blocks: &[BlockDetail]) -> String {
        if blocks.is_empty() {
            return format!("{} No blocks\n", "📝".bright_yellow());
        }

        let mut out = String::new();
        for block in blocks {
            let span = format!(
                "{} → {}",
                block.start.format("%Y-%m-%d %H:%M"),
                block.end.format("%H:%M")
            );
            if block.is_gap {
                out.push_str(&format!("   {}  {}\n", span.dimmed(), "(gap)".dimmed()));
                continue;
            }
            out.push_str(&format!(
                "📦 {}  {}/{}  {} tokens  {} msgs over {}  {}\n",
                span.bright_white(),
                block.project_id.bright_cyan(),
                block.session_id,
                format_tokens(block.total_tokens()).bright_white().bold(),
                block.message_count,
                format_minutes(block.activity_minutes.round() as i64),
                format_cost(block.cost, block.cost_source)
            ));
        }
        out
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json_str) => println!("{}", json_str),
        Err(e) => eprintln!("Error serializing output to JSON: {}", e),
    }
}

fn cost_mix(report: &SnapshotReport) -> String {
    let mut parts = Vec::new();
    if report.cost.native > 0.0 {
        parts.push(format!("native ${:.2}", report.cost.native));
    }
    if report.cost.computed > 0.0 {
        parts.push(format!("computed ${:.2}", report.cost.computed));
    }
    if report.cost.unpriced_blocks > 0 {
        parts.push(format!("{} unpriced", report.cost.unpriced_blocks));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!("  ({})", parts.join(", ")).dimmed().to_string()
    }
}

fn format_cost(amount: f64, source: CostSource) -> String {
    match source {
        CostSource::Unpriced => "unpriced".dimmed().to_string(),
        _ => format!("${:.2}", amount).bright_green().to_string(),
    }
}

fn local_time(instant: DateTime<Utc>) -> String {
    instant.with_timezone(&Local).format("%H:%M").to_string()
}

/// Weighted totals can be fractional; small values keep one decimal.
pub fn format_tokens(tokens: f64) -> String {
    if tokens >= 1_000_000.0 {
        format!("{:.1}M", tokens / 1_000_000.0)
    } else if tokens >= 1_000.0 {
        format!("{:.1}K", tokens / 1_000.0)
    } else if tokens.fract() == 0.0 {
        format!("{:.0}", tokens)
    } else {
        format!("{:.1}", tokens)
    }
}

pub fn format_minutes(minutes: i64) -> String {
    if minutes < 60 {
        format!("{}m", minutes)
    } else {
        format!("{}h {}m", minutes / 60, minutes % 60)
    }
}
