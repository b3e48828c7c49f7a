//! Terminal summary for a finished run

use colored::Colorize;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use std::path::Path;
use testpilot_common::{ExitCode, PhaseStatus};
use testpilot_harness::orchestrator::Phase;
use testpilot_harness::report::RunReport;
use testpilot_harness::TestRun;

fn status_cell(status: PhaseStatus) -> String {
    match status {
        PhaseStatus::Passed => "✓ passed".green().to_string(),
        PhaseStatus::Failed => "✗ failed".red().to_string(),
        PhaseStatus::Skipped => "- skipped".dimmed().to_string(),
        PhaseStatus::Running => "running".yellow().to_string(),
        PhaseStatus::Pending => "pending".dimmed().to_string(),
    }
}

fn duration_cell(phase: &Phase) -> String {
    match phase.status {
        PhaseStatus::Passed | PhaseStatus::Failed => format!("{:.1}s", phase.duration_ms as f64 / 1000.0),
        _ => String::new(),
    }
}

/// Print the phase table, smoke failures and the final verdict
pub fn print_summary(run: &TestRun, report_dir: &Path) {
    let report = RunReport::from_run(run);

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Phase", "Status", "Duration", "Detail"]);
    for phase in &run.phases {
        table.add_row(vec![
            phase.kind.to_string(),
            status_cell(phase.status),
            duration_cell(phase),
            phase.detail.clone().unwrap_or_default(),
        ]);
    }
    println!();
    println!("{table}");

    if !report.smoke_failures.is_empty() {
        println!();
        println!("{}", "Smoke failures:".bold());
        for f in &report.smoke_failures {
            let marker = if f.critical { "✗".red() } else { "!".yellow() };
            println!("  {} {} as {}: {}", marker, f.route.bold(), f.role, f.error);
        }
    }

    if let Some(abort) = &run.abort {
        print_error(&format!("Aborted during {}: {}", abort.stage, abort.message));
    }

    println!();
    println!("Run:     {}", run.run_id.to_string().dimmed());
    println!("Reports: {}", report_dir.display());
    match run.exit_code {
        ExitCode::Success => print_success(&format!("Exit {}", run.exit_code)),
        code => print_error(&format!("Exit {}", code)),
    }
}

/// Print success message
pub fn print_success(message: &str) {
    println!("✅ {}", message);
}

/// Print error message
pub fn print_error(message: &str) {
    eprintln!("❌ {}", message);
}
