//! Output formatting for CLI

use clap::ValueEnum;
use colored::Colorize;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use intentest_engine::RunReport;

/// Output format
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum OutputFormat {
    /// Human-readable table format
    #[default]
    Table,
    /// JSON format
    Json,
}

/// Print the outcome of a run
pub fn print_report(report: &RunReport, format: OutputFormat) {
    match format {
        OutputFormat::Table => print_table(report),
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(report).unwrap_or_default());
        }
    }
}

fn print_table(report: &RunReport) {
    if let Some(error) = &report.discovery_error {
        println!("{} {}", "❌".red(), error);
        return;
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["File", "Test", "Status", "Source", "Reason"]);

    for file in &report.files {
        let path = file.path.display().to_string();
        if let Some(error) = &file.error {
            table.add_row(vec![
                path.clone(),
                "-".to_string(),
                "error".to_string(),
                "-".to_string(),
                error.clone(),
            ]);
        }
        for test in &file.tests {
            let source = if test.from_cache { "cache" } else { "live" };
            table.add_row(vec![
                path.clone(),
                test.name.clone(),
                test.status.to_string(),
                source.to_string(),
                test.reason.clone().unwrap_or_default(),
            ]);
        }
    }
    println!("{table}");

    let summary = format!(
        "{} passed, {} failed ({} ms)",
        report.passed, report.failed, report.duration_ms
    );
    if report.success() {
        println!("{} {}", "✅".green(), summary.green());
    } else {
        println!("{} {}", "❌".red(), summary.red());
    }
}
