//! Seeded multi-day player simulation that audits reward conservation.
use chrono::{NaiveDate, NaiveTime, TimeDelta};
use mission_engine::{
    CreditAdapter, CreditError, CreditMode, CreditOutcome, CreditRequest, DayKey, EngineConfig,
    EngineError, ManualClock, MemoryStore, MissionCatalog, MissionEngine, MissionPhase,
    PhaseAction, PhaseInput, PhaseOutcome, SafeModeLedger, SessionFlag, ValidationRule,
    validate,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::Serialize;
use std::cell::Cell;
use std::collections::{BTreeMap, HashSet};
use std::rc::Rc;
use thiserror::Error;

/// Answers a simulated player tries against `regex` rules.
const SAMPLE_ANSWERS: [&str; 10] = [
    "ab123", "12:30", "Hall 7", "4b", "1889", "101.3", "b-12", "roma", "north", "yes",
];

#[derive(Debug, Clone, Copy)]
pub struct SimulationConfig {
    pub seed: u64,
    pub days: u32,
    pub start: NaiveDate,
    /// Probability that any single credit call fails.
    pub credit_failure_rate: f64,
}

impl SimulationConfig {
    #[must_use]
    pub const fn new(seed: u64, days: u32, start: NaiveDate) -> Self {
        Self {
            seed,
            days,
            start,
            credit_failure_rate: 0.1,
        }
    }

    #[must_use]
    pub const fn with_credit_failure_rate(mut self, rate: f64) -> Self {
        self.credit_failure_rate = rate;
        self
    }
}

/// Broken reward-conservation property.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Violation {
    #[error("{mission} started {day}: ledger holds {credited} of {total}")]
    OverCredited {
        mission: String,
        day: String,
        credited: u64,
        total: u32,
    },
    #[error("{mission} started {day}: completed with {credited} of {total} credited")]
    IncompleteCredit {
        mission: String,
        day: String,
        credited: u64,
        total: u32,
    },
    #[error("idempotency key {key} recorded more than once")]
    DuplicateKey { key: String },
    #[error("{mission} completed phase 2 on its start day {day}")]
    SameDayPhase2 { mission: String, day: String },
    #[error("ledger entry {key} names an unknown mission")]
    UnknownMission { key: String },
    #[error("unexpected engine error on {day}: {message}")]
    Engine { day: String, message: String },
}

/// Outcome of one seeded run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SimulationRecord {
    pub seed: u64,
    pub days: u32,
    pub missions_started: u32,
    pub phase1_completions: u32,
    pub phase2_completions: u32,
    pub rejected_submissions: u32,
    pub locked_attempts: u32,
    pub credit_failures: u32,
    pub reconciled_phases: u32,
    pub ledger_entries: usize,
    pub ledger_total: u64,
    pub violations: Vec<Violation>,
}

impl SimulationRecord {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Safe-mode ledger whose calls can be made to fail on demand.
#[derive(Debug, Clone)]
struct ChaosLedger {
    inner: SafeModeLedger<MemoryStore>,
    failing: Rc<Cell<bool>>,
}

impl CreditAdapter for ChaosLedger {
    fn mode(&self) -> CreditMode {
        self.inner.mode()
    }

    fn credit(&self, request: &CreditRequest) -> Result<CreditOutcome, CreditError> {
        if self.failing.get() {
            return Err(CreditError::Backend("simulated outage".to_string()));
        }
        self.inner.credit(request)
    }
}

struct Completion {
    mission: String,
    started: DayKey,
    finished: DayKey,
}

struct Player {
    engine: MissionEngine<MemoryStore, ManualClock, ChaosLedger>,
    rng: ChaCha20Rng,
    failing: Rc<Cell<bool>>,
    failure_rate: f64,
    record: SimulationRecord,
    completions: Vec<Completion>,
}

/// Run one simulated player through `config.days` calendar days.
#[must_use]
pub fn run_simulation(config: &SimulationConfig, catalog: &MissionCatalog) -> SimulationRecord {
    let mut record = SimulationRecord {
        seed: config.seed,
        days: config.days,
        ..SimulationRecord::default()
    };
    let store = MemoryStore::new();
    let engine_config = EngineConfig::for_user(&format!("sim-{}", config.seed));
    let ledger = SafeModeLedger::new(store.clone(), &engine_config.keyspace());
    let failing = Rc::new(Cell::new(false));
    let clock = ManualClock::on_date(config.start);
    let adapter = ChaosLedger {
        inner: ledger.clone(),
        failing: Rc::clone(&failing),
    };
    let engine = match MissionEngine::new(
        engine_config,
        catalog.clone(),
        store,
        clock.clone(),
        adapter,
        SessionFlag::signed_in(),
    ) {
        Ok(engine) => engine,
        Err(err) => {
            record.violations.push(Violation::Engine {
                day: config.start.to_string(),
                message: err.to_string(),
            });
            return record;
        }
    };

    let mut player = Player {
        engine,
        rng: ChaCha20Rng::seed_from_u64(config.seed),
        failing,
        failure_rate: config.credit_failure_rate,
        record,
        completions: Vec::new(),
    };
    for offset in 0..config.days {
        let hour = player.rng.gen_range(6..24);
        let minute = player.rng.gen_range(0..60);
        let time = NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or_default();
        let date = config.start + TimeDelta::days(i64::from(offset));
        clock.set(date.and_time(time));
        player.play_day();
    }

    // Outage over: every pending credit must settle.
    player.failing.set(false);
    if let Err(err) = player.engine.reconcile() {
        player.violation(err);
    }
    let Player {
        mut record,
        completions,
        ..
    } = player;
    audit(&ledger, catalog, &completions, &mut record);
    log::debug!(
        "seed {} finished with {} violation(s)",
        record.seed,
        record.violations.len()
    );
    record
}

impl Player {
    fn today(&self) -> String {
        self.engine.state().today.to_string()
    }

    fn violation(&mut self, err: EngineError) {
        let day = self.today();
        self.record.violations.push(Violation::Engine {
            day,
            message: err.to_string(),
        });
    }

    fn roll_outage(&mut self) {
        let failing = self.rng.gen_bool(self.failure_rate);
        self.failing.set(failing);
    }

    fn play_day(&mut self) {
        let view = self.engine.state();
        if view.should_show_briefing
            && self.rng.gen_bool(0.8)
            && let Err(err) = self.engine.mark_briefing_shown()
        {
            self.violation(err);
        }
        if view.needs_reconciliation && self.rng.gen_bool(0.5) {
            self.roll_outage();
            match self.engine.reconcile() {
                Ok(settled) => {
                    self.record.reconciled_phases +=
                        u32::try_from(settled.len()).unwrap_or(u32::MAX);
                }
                Err(EngineError::Credit(_)) => self.record.credit_failures += 1,
                Err(err) => self.violation(err),
            }
        }

        let state = &view.mission_state;
        let started_today = state.day_key.as_ref() == Some(&view.today);
        match state.phase {
            MissionPhase::AwaitingPhase2 if view.should_show_phase2_resume => {
                if self.rng.gen_bool(0.1) {
                    self.start_and_play();
                } else if self.rng.gen_bool(0.85) {
                    self.attempt(2);
                }
            }
            MissionPhase::AwaitingPhase2 => self.try_locked_phase2(),
            MissionPhase::Phase1Active if started_today => self.attempt(1),
            _ => {
                if self.rng.gen_bool(0.75) {
                    self.start_and_play();
                }
            }
        }
    }

    fn start_and_play(&mut self) {
        self.roll_outage();
        match self.engine.start_mission() {
            Ok(_) => {
                self.record.missions_started += 1;
                self.attempt(1);
            }
            Err(EngineError::Credit(_)) => self.record.credit_failures += 1,
            Err(err) => self.violation(err),
        }
    }

    fn try_locked_phase2(&mut self) {
        if !self.rng.gen_bool(0.3) {
            return;
        }
        match self.engine.complete_phase2(&PhaseInput::empty()) {
            Err(EngineError::Phase2Locked) => self.record.locked_attempts += 1,
            Ok(PhaseOutcome::Completed(done)) => {
                let day = self.today();
                self.record.violations.push(Violation::SameDayPhase2 {
                    mission: done.mission_id,
                    day,
                });
            }
            Ok(PhaseOutcome::Rejected(_)) => self.record.rejected_submissions += 1,
            Err(err) => self.violation(err),
        }
    }

    fn attempt(&mut self, phase: u8) {
        let view = self.engine.state();
        let (Some(mission), Some(started)) =
            (view.active_mission.clone(), view.mission_state.day_key.clone())
        else {
            return;
        };
        let spec = if phase == 1 { &mission.phase1 } else { &mission.phase2 };
        if let PhaseAction::Counter(counter) = &spec.action {
            let cap = u32::try_from(counter.target.max(1)).unwrap_or(u32::MAX);
            let by = self.rng.gen_range(0..=cap);
            if let Err(err) = self.engine.record_progress(&counter.key, by) {
                self.violation(err);
            }
        }
        let input = if self.rng.gen_bool(0.15) {
            PhaseInput::text("???")
        } else {
            PhaseInput::text(&answer_for(&spec.action, &mut self.rng))
        };

        self.roll_outage();
        let result = if phase == 1 {
            self.engine.complete_phase1(&input)
        } else {
            self.engine.complete_phase2(&input)
        };
        match result {
            Ok(PhaseOutcome::Completed(_)) => {}
            Ok(PhaseOutcome::Rejected(_)) => {
                self.record.rejected_submissions += 1;
                return;
            }
            Err(EngineError::Credit(_)) => self.record.credit_failures += 1,
            Err(err) => {
                self.violation(err);
                return;
            }
        }

        // The phase advanced even if its credit has to be reconciled later.
        if phase == 1 {
            self.record.phase1_completions += 1;
        } else {
            self.record.phase2_completions += 1;
            self.completions.push(Completion {
                mission: mission.id.clone(),
                started,
                finished: view.today,
            });
        }
        if self.rng.gen_bool(0.2) {
            self.double_submit(phase, &input);
        }
    }

    fn double_submit(&mut self, phase: u8, input: &PhaseInput) {
        let result = if phase == 1 {
            self.engine.complete_phase1(input)
        } else {
            self.engine.complete_phase2(input)
        };
        match result {
            Err(EngineError::WrongPhase { .. }) => {}
            Ok(PhaseOutcome::Completed(done)) => {
                let day = self.today();
                self.record.violations.push(Violation::Engine {
                    day,
                    message: format!("phase {} of {} completed twice", done.phase, done.mission_id),
                });
            }
            Ok(PhaseOutcome::Rejected(_)) => self.record.rejected_submissions += 1,
            Err(err) => self.violation(err),
        }
    }
}

/// Produce a plausible correct submission for `action`.
fn answer_for(action: &PhaseAction, rng: &mut ChaCha20Rng) -> String {
    match action {
        PhaseAction::Input { rule: None } | PhaseAction::Confirm | PhaseAction::Counter(_) => {
            String::new()
        }
        PhaseAction::Input { rule: Some(rule) } => answer_for_rule(rule, rng),
        PhaseAction::SelectZone { zones, .. } => {
            if zones.is_empty() {
                String::new()
            } else {
                zones[rng.gen_range(0..zones.len())].to_uppercase()
            }
        }
    }
}

fn answer_for_rule(rule: &ValidationRule, rng: &mut ChaCha20Rng) -> String {
    use mission_engine::RuleKind;
    match rule.kind {
        RuleKind::Any => "spotted it".to_string(),
        RuleKind::Exact if !rule.case_sensitive && rng.gen_bool(0.5) => {
            format!("  {}  ", rule.pattern.to_uppercase())
        }
        RuleKind::Exact => rule.pattern.clone(),
        RuleKind::Regex => SAMPLE_ANSWERS
            .iter()
            .find(|candidate| validate(candidate, Some(rule)).valid)
            .map_or_else(String::new, |candidate| (*candidate).to_string()),
    }
}

/// Check the ledger against the reward-conservation properties.
fn audit(
    ledger: &SafeModeLedger<MemoryStore>,
    catalog: &MissionCatalog,
    completions: &[Completion],
    record: &mut SimulationRecord,
) {
    let entries = match ledger.entries() {
        Ok(entries) => entries,
        Err(err) => {
            record.violations.push(Violation::Engine {
                day: "audit".to_string(),
                message: err.to_string(),
            });
            return;
        }
    };
    record.ledger_entries = entries.len();
    record.ledger_total = entries.iter().map(|e| u64::from(e.amount)).sum();

    let mut seen = HashSet::new();
    let mut per_run: BTreeMap<(String, String), u64> = BTreeMap::new();
    for entry in &entries {
        if !seen.insert(entry.idempotency_key.as_str()) {
            record.violations.push(Violation::DuplicateKey {
                key: entry.idempotency_key.clone(),
            });
        }
        let mut parts = entry.idempotency_key.rsplitn(3, ':');
        let (Some(day), Some(_phase), Some(mission)) = (parts.next(), parts.next(), parts.next())
        else {
            record.violations.push(Violation::UnknownMission {
                key: entry.idempotency_key.clone(),
            });
            continue;
        };
        *per_run
            .entry((mission.to_string(), day.to_string()))
            .or_insert(0) += u64::from(entry.amount);
    }

    for ((mission, day), credited) in &per_run {
        let Some(definition) = catalog.find(mission) else {
            record.violations.push(Violation::UnknownMission {
                key: format!("{mission}:{day}"),
            });
            continue;
        };
        if *credited > u64::from(definition.total_reward) {
            record.violations.push(Violation::OverCredited {
                mission: mission.clone(),
                day: day.clone(),
                credited: *credited,
                total: definition.total_reward,
            });
        }
    }

    for completion in completions {
        if completion.started == completion.finished {
            record.violations.push(Violation::SameDayPhase2 {
                mission: completion.mission.clone(),
                day: completion.started.to_string(),
            });
        }
        let total = catalog
            .find(&completion.mission)
            .map_or(0, |definition| definition.total_reward);
        let credited = per_run
            .get(&(completion.mission.clone(), completion.started.to_string()))
            .copied()
            .unwrap_or(0);
        if credited != u64::from(total) {
            record.violations.push(Violation::IncompleteCredit {
                mission: completion.mission.clone(),
                day: completion.started.to_string(),
                credited,
                total,
            });
        }
    }
}
