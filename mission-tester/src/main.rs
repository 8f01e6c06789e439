mod issuer;
mod reports;
mod setup;
mod simulation;
mod util;

use anyhow::{Context, Result, anyhow};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use colored::Colorize;
use mission_engine::{Clock, MissionDefinition, PhaseInput, PhaseOutcome, SystemClock};
use std::fs::File;
use std::io::{BufWriter, Write, stdout};
use std::path::PathBuf;
use std::time::Instant;

use setup::{TesterConfig, TesterCredits, TesterEngine, build_engine};
use simulation::{SimulationConfig, SimulationRecord, run_simulation};
use util::parse_seeds;

#[derive(Debug, Parser)]
#[command(name = "mission-tester", version = "0.1.0")]
#[command(about = "Drive the daily mission engine and simulate players over many days")]
struct Args {
    /// JSON file holding the persisted mission state
    #[arg(long, global = true, default_value = "mission-state.json")]
    state: PathBuf,

    /// Optional JSON settings file (credit_mode, live_secret, namespace, ...)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Treat this date (YYYY-MM-DD) as today
    #[arg(long, global = true)]
    today: Option<NaiveDate>,

    /// Player id the state belongs to
    #[arg(long, global = true, default_value = "local-player")]
    user: String,

    /// Optional path to write output to instead of stdout
    #[arg(long, global = true)]
    output: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Show today's mission and the player's progress
    Status,
    /// List the catalog, or show the mission scheduled for one date
    Catalog {
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Arm today's mission
    Start,
    /// Show today's briefing and mark it as seen
    Brief,
    /// Submit phase 1 of the active mission
    Phase1 {
        #[arg(long, default_value = "")]
        input: String,
    },
    /// Submit phase 2 of the active mission
    Phase2 {
        #[arg(long, default_value = "")]
        input: String,
    },
    /// Advance a gameplay counter
    Bump {
        key: String,
        #[arg(long, default_value_t = 1)]
        by: u32,
    },
    /// Show issued rewards
    Ledger,
    /// Retry credits for phases that advanced without a confirmed reward
    Reconcile,
    /// Wipe the mission state (counters and rewards are kept)
    Reset,
    /// Run seeded simulated players and audit reward conservation
    Simulate {
        #[arg(long, default_value_t = 30)]
        days: u32,
        /// Seeds to run (comma-separated)
        #[arg(long, default_value = "1337")]
        seeds: String,
        /// Probability that a single credit call fails
        #[arg(long, default_value_t = 0.1)]
        failure_rate: f64,
        /// Output report format
        #[arg(long, default_value = "console")]
        #[arg(value_parser = ["console", "json"])]
        report: String,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut output_target = OutputTarget::new(args.output.clone())?;
    let succeeded = run(&args, &mut output_target)?;
    output_target.flush_inner()?;

    if !succeeded {
        std::process::exit(1);
    }
    Ok(())
}

/// Execute the selected command; `Ok(false)` means it ran but did not succeed.
fn run(args: &Args, out: &mut dyn Write) -> Result<bool> {
    let config = TesterConfig::load(args.config.as_deref())?;
    let engine = match &args.command {
        Command::Simulate {
            days,
            seeds,
            failure_rate,
            report,
        } => return simulate(args, &config, *days, seeds, *failure_rate, report, out),
        _ => build_engine(&config, &args.state, &args.user, args.today)?,
    };

    match &args.command {
        Command::Status => print_status(&engine, out)?,
        Command::Catalog { date } => print_catalog(&engine, *date, out)?,
        Command::Start => {
            engine.start_mission()?;
            let view = engine.state();
            let mission = view
                .active_mission
                .ok_or_else(|| anyhow!("mission did not arm"))?;
            writeln!(out, "🚀 Started {} ({})", mission.title.bold(), mission.id)?;
            writeln!(out, "Phase 1: {}", mission.phase1.prompt)?;
        }
        Command::Brief => {
            let view = engine.state();
            let mission = view
                .current_mission
                .ok_or_else(|| anyhow!("no mission scheduled for {}", view.today))?;
            writeln!(out, "{}", mission.title.bright_cyan().bold())?;
            writeln!(out, "{}", mission.briefing)?;
            engine.mark_briefing_shown()?;
        }
        Command::Phase1 { input } => {
            let outcome = engine.complete_phase1(&PhaseInput::text(input))?;
            return report_phase(&engine, &outcome, out);
        }
        Command::Phase2 { input } => {
            let outcome = engine.complete_phase2(&PhaseInput::text(input))?;
            return report_phase(&engine, &outcome, out);
        }
        Command::Bump { key, by } => {
            let total = engine.record_progress(key, *by)?;
            writeln!(out, "{key}: {total}")?;
        }
        Command::Ledger => print_ledger(&engine, &args.user, out)?,
        Command::Reconcile => {
            let settled = engine.reconcile()?;
            if settled.is_empty() {
                writeln!(out, "Nothing to reconcile.")?;
            }
            for done in settled {
                writeln!(
                    out,
                    "Reconciled phase {} of {}: {} credits{}",
                    done.phase,
                    done.mission_id,
                    done.reward,
                    if done.newly_credited {
                        ""
                    } else {
                        " (already issued)"
                    }
                )?;
            }
        }
        Command::Reset => {
            engine.reset()?;
            writeln!(out, "Mission state reset.")?;
        }
        Command::Simulate { .. } => {}
    }
    Ok(true)
}

fn yes_no(flag: bool) -> &'static str {
    if flag { "yes" } else { "no" }
}

fn print_status(engine: &TesterEngine, out: &mut dyn Write) -> Result<()> {
    let view = engine.state();
    writeln!(out, "{}", "🗓  Daily Mission".bright_cyan().bold())?;
    writeln!(out, "Today: {}", view.today)?;
    if !view.enabled {
        writeln!(out, "Daily missions are disabled.")?;
        return Ok(());
    }
    if let Some(mission) = &view.current_mission {
        writeln!(
            out,
            "Mission of the day: {} ({}) - {} credits",
            mission.title, mission.id, mission.total_reward
        )?;
    }
    match &view.active_mission {
        Some(mission) => writeln!(out, "Active mission: {} ({})", mission.title, mission.id)?,
        None => writeln!(out, "Active mission: none")?,
    }
    let state = &view.mission_state;
    writeln!(out, "Phase: {}", state.phase)?;
    if let Some(day) = &state.day_key {
        writeln!(out, "Started: {day}")?;
    }
    writeln!(
        out,
        "Credited: phase 1 {} / phase 2 {}",
        yes_no(state.credited_phase1),
        yes_no(state.credited_phase2)
    )?;
    writeln!(out, "Pending rewards: {}", state.pending_rewards)?;
    let counters = engine.counters()?;
    if !counters.is_empty() {
        let listed: Vec<String> = counters
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect();
        writeln!(out, "Counters: {}", listed.join(", "))?;
    }
    if view.should_show_briefing {
        writeln!(out, "{}", "Briefing available: run `brief`".yellow())?;
    }
    if view.should_show_phase2_resume {
        writeln!(out, "{}", "Phase 2 is unlocked".green())?;
    }
    if view.needs_reconciliation {
        writeln!(out, "{}", "Credits pending: run `reconcile`".red())?;
    }
    Ok(())
}

fn print_mission(out: &mut dyn Write, mission: &MissionDefinition) -> Result<()> {
    let split = mission.reward_split();
    writeln!(out, "{} ({})", mission.title.bold(), mission.id)?;
    writeln!(out, "{}", mission.description)?;
    writeln!(
        out,
        "Phase 1 [{}]: {} -> {} credits",
        mission.phase1.action.label(),
        mission.phase1.prompt,
        split.phase1
    )?;
    writeln!(
        out,
        "Phase 2 [{}]: {} -> {} credits",
        mission.phase2.action.label(),
        mission.phase2.prompt,
        split.phase2
    )?;
    Ok(())
}

fn print_catalog(
    engine: &TesterEngine,
    date: Option<NaiveDate>,
    out: &mut dyn Write,
) -> Result<()> {
    let catalog = engine.catalog();
    if let Some(date) = date {
        let mission = catalog
            .mission_of_the_day(date)
            .ok_or_else(|| anyhow!("mission catalog is empty"))?;
        writeln!(out, "Mission for {date}:")?;
        return print_mission(out, mission);
    }

    let today = catalog
        .mission_of_the_day(engine.clock().today())
        .map(|mission| mission.id.as_str());
    writeln!(out, "Missions ({}):", catalog.len())?;
    for (index, mission) in catalog.missions.iter().enumerate() {
        let marker = if Some(mission.id.as_str()) == today {
            "▶"
        } else {
            " "
        };
        let difficulty = format!("{:?}", mission.difficulty).to_lowercase();
        writeln!(
            out,
            "{marker} {index:>2}  {:<22} {difficulty:<6} {:>3}  {}",
            mission.id, mission.total_reward, mission.title
        )?;
    }
    Ok(())
}

fn report_phase(
    engine: &TesterEngine,
    outcome: &PhaseOutcome,
    out: &mut dyn Write,
) -> Result<bool> {
    match outcome {
        PhaseOutcome::Completed(done) => {
            let note = if done.newly_credited {
                ""
            } else {
                " (already credited)"
            };
            writeln!(
                out,
                "✅ Phase {} of {} complete: +{} credits{note}",
                done.phase, done.mission_id, done.reward
            )?;
            if done.phase == 1
                && let Some(mission) = engine.state().active_mission
            {
                writeln!(out, "Come back tomorrow for phase 2: {}", mission.phase2.prompt)?;
            }
            Ok(true)
        }
        PhaseOutcome::Rejected(validation) => {
            let message = validation.error.as_deref().unwrap_or("Submission rejected.");
            writeln!(out, "❌ {}", message.red())?;
            Ok(false)
        }
    }
}

fn print_ledger(engine: &TesterEngine, user: &str, out: &mut dyn Write) -> Result<()> {
    match engine.credits() {
        TesterCredits::Safe(ledger) => {
            let entries = ledger.entries()?;
            writeln!(out, "Ledger (safe mode): {} entries", entries.len())?;
            for entry in &entries {
                writeln!(
                    out,
                    "  {:<32} {:>4}  {}",
                    entry.idempotency_key, entry.amount, entry.timestamp
                )?;
            }
            writeln!(out, "Total: {}", ledger.total()?)?;
        }
        TesterCredits::Live(adapter) => {
            let issuer = adapter.backend();
            let receipts = issuer.receipts(user)?;
            writeln!(out, "Issuer (live mode): {} receipts", receipts.len())?;
            for receipt in &receipts {
                writeln!(
                    out,
                    "  {:<32} {:>4}  balance {}",
                    receipt.idempotency_key, receipt.amount, receipt.balance
                )?;
            }
            writeln!(out, "Balance: {}", issuer.balance(user)?)?;
        }
    }
    Ok(())
}

fn simulate(
    args: &Args,
    config: &TesterConfig,
    days: u32,
    seeds: &str,
    failure_rate: f64,
    report: &str,
    out: &mut dyn Write,
) -> Result<bool> {
    if !(0.0..=1.0).contains(&failure_rate) {
        return Err(anyhow!("--failure-rate must be between 0 and 1"));
    }
    let catalog = config.catalog()?;
    let start = args.today.unwrap_or_else(|| SystemClock.today());
    let start_time = Instant::now();
    let records: Vec<SimulationRecord> = parse_seeds(seeds)?
        .into_iter()
        .map(|seed| {
            let sim = SimulationConfig::new(seed, days, start)
                .with_credit_failure_rate(failure_rate);
            run_simulation(&sim, &catalog)
        })
        .collect();

    match report {
        "json" => reports::generate_json_report(out, &records)?,
        _ => {
            reports::generate_console_report(out, &records, start_time.elapsed())?;
        }
    }
    Ok(records.iter().all(SimulationRecord::passed))
}

enum OutputTarget {
    Stdout(BufWriter<std::io::Stdout>),
    File(BufWriter<File>),
}

impl OutputTarget {
    fn new(path: Option<PathBuf>) -> Result<Self> {
        if let Some(path) = path {
            let file = File::create(&path)
                .with_context(|| format!("failed to create {}", path.display()))?;
            Ok(Self::File(BufWriter::new(file)))
        } else {
            Ok(Self::Stdout(BufWriter::new(stdout())))
        }
    }

    fn writer(&mut self) -> &mut dyn Write {
        match self {
            Self::Stdout(w) => w,
            Self::File(w) => w,
        }
    }

    fn flush_inner(&mut self) -> std::io::Result<()> {
        match self {
            Self::Stdout(w) => w.flush(),
            Self::File(w) => w.flush(),
        }
    }
}

impl Write for OutputTarget {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.writer().write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.flush_inner()
    }
}
