//! Output formatting utilities

use colored::*;
use orchestra_types::{PlanStatus, StepStatus};
use serde::Serialize;
use tabled::{Table, Tabled};

/// Output format for CLI commands
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Pretty-printed table format
    #[default]
    Table,
    /// JSON format
    Json,
}

/// Print rows as a table
pub fn print_table<T: Tabled>(rows: Vec<T>) {
    if rows.is_empty() {
        println!("{}", "No results".dimmed());
    } else {
        println!("{}", Table::new(rows));
    }
}

/// Print a single item as pretty JSON
pub fn print_json<T: Serialize>(data: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(data)?);
    Ok(())
}

/// Print a success message
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green(), message);
}

/// Print an error message
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red(), message);
}

/// Print a warning message
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow(), message);
}

/// Print an info message
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue(), message);
}

pub fn step_status(status: StepStatus) -> ColoredString {
    let label = status.to_string();
    match status {
        StepStatus::Succeeded => label.green(),
        StepStatus::Failed | StepStatus::Aborted => label.red(),
        StepStatus::Escalated | StepStatus::RetryPending => label.yellow(),
        StepStatus::Running | StepStatus::Verifying => label.blue(),
        StepStatus::Pending | StepStatus::Ready => label.dimmed(),
    }
}

pub fn plan_status(status: PlanStatus) -> ColoredString {
    let label = status.to_string();
    match status {
        PlanStatus::Completed => label.green().bold(),
        PlanStatus::PartiallyCompleted | PlanStatus::EscalatedTerminal => label.yellow().bold(),
        PlanStatus::Aborted => label.red().bold(),
        _ => label.normal(),
    }
}

/// Shorten `text` to at most `max` characters
pub fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let kept: String = text.chars().take(max.saturating_sub(1)).collect();
    format!("{kept}…")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_format_default() {
        assert!(matches!(OutputFormat::default(), OutputFormat::Table));
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a longer value", 6), "a lon…");
        assert_eq!(truncate("ünïcödé", 4).chars().count(), 4);
    }
}
