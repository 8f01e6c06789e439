use anyhow::Result;
use colored::Colorize;
use std::io::Write;
use std::time::Duration;

use crate::simulation::SimulationRecord;

pub fn generate_console_report<W: Write + ?Sized>(
    out: &mut W,
    records: &[SimulationRecord],
    total_duration: Duration,
) -> Result<()> {
    writeln!(out)?;
    writeln!(out, "{}", "📊 Mission Simulation Summary".bright_cyan().bold())?;
    writeln!(out, "{}", "=============================".cyan())?;

    let total = records.len();
    let passed = records.iter().filter(|r| r.passed()).count();
    writeln!(out, "Seeds simulated: {total}")?;
    writeln!(out, "Passed: {}", passed.to_string().green())?;
    writeln!(out, "Failed: {}", (total - passed).to_string().red())?;
    writeln!(out, "Total time: {total_duration:?}")?;
    writeln!(out)?;

    for record in records {
        let status = if record.passed() {
            "✅ PASS".green()
        } else {
            "❌ FAIL".red()
        };
        writeln!(out, "{status} seed {}", record.seed.to_string().bold())?;
        writeln!(
            out,
            "   Days: {}  started: {}  phase 1: {}  phase 2: {}",
            record.days,
            record.missions_started,
            record.phase1_completions,
            record.phase2_completions
        )?;
        writeln!(
            out,
            "   Rejected: {}  early phase 2 tries: {}  credit failures: {}  reconciled: {}",
            record.rejected_submissions,
            record.locked_attempts,
            record.credit_failures,
            record.reconciled_phases
        )?;
        writeln!(
            out,
            "   Ledger: {} entries, {} total",
            record.ledger_entries, record.ledger_total
        )?;
        if !record.violations.is_empty() {
            writeln!(out, "   Violations:")?;
            for violation in &record.violations {
                writeln!(out, "     • {}", violation.to_string().red())?;
            }
        }
        writeln!(out)?;
    }
    Ok(())
}

pub fn generate_json_report<W: Write + ?Sized>(
    out: &mut W,
    records: &[SimulationRecord],
) -> Result<()> {
    let json_output = serde_json::to_string_pretty(records)?;
    writeln!(out, "{json_output}")?;
    Ok(())
}
