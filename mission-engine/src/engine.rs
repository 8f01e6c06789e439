//! Daily mission orchestrator: read model plus the phase write operations.
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::rc::Rc;
use thiserror::Error;

use crate::catalog::{CatalogError, MissionCatalog, MissionDefinition};
use crate::clock::{Clock, DayKey};
use crate::config::{ConfigError, EngineConfig};
use crate::counters::CounterStore;
use crate::credit::{CreditAdapter, CreditError, CreditRequest};
use crate::state::{
    MissionPhase, MissionState, MissionStateStore, ProgressData, ProgressValue, StateError,
};
use crate::storage::{KeyValueStore, StorageError};
use crate::validation::{ValidationOutcome, validate_action};

/// Authentication signal owned by the host application.
pub trait Session {
    fn is_authenticated(&self) -> bool;
}

/// Shared, settable sign-in flag.
#[derive(Debug, Clone, Default)]
pub struct SessionFlag(Rc<Cell<bool>>);

impl SessionFlag {
    #[must_use]
    pub fn signed_in() -> Self {
        Self(Rc::new(Cell::new(true)))
    }

    #[must_use]
    pub fn signed_out() -> Self {
        Self::default()
    }

    pub fn set(&self, authenticated: bool) {
        self.0.set(authenticated);
    }
}

impl Session for SessionFlag {
    fn is_authenticated(&self) -> bool {
        self.0.get()
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("daily missions are disabled")]
    Disabled,
    #[error("daily missions require a signed-in user")]
    NotAuthenticated,
    #[error("no mission is scheduled for {0}")]
    NoMissionToday(DayKey),
    #[error("no mission has been started")]
    NoActiveMission,
    #[error("mission {0:?} is not in the catalog")]
    UnknownMission(String),
    #[error("mission is {actual}, expected {expected}")]
    WrongPhase {
        expected: MissionPhase,
        actual: MissionPhase,
    },
    #[error("mission was started on {started}; start today's mission instead")]
    StaleMission { started: String },
    #[error("phase 2 unlocks on the day after the mission started")]
    Phase2Locked,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Credit(#[from] CreditError),
}

/// What the UI needs to decide what to show.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineView {
    pub enabled: bool,
    pub today: DayKey,
    /// Mission of the day for `today`.
    pub current_mission: Option<MissionDefinition>,
    /// Mission the player armed, which may be yesterday's while awaiting phase 2.
    pub active_mission: Option<MissionDefinition>,
    pub mission_state: MissionState,
    pub should_show_briefing: bool,
    pub should_show_phase2_resume: bool,
    pub needs_reconciliation: bool,
}

/// Player submission for a phase.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhaseInput {
    pub text: String,
    pub progress: ProgressData,
}

impl PhaseInput {
    #[must_use]
    pub fn text(text: &str) -> Self {
        Self {
            text: text.to_string(),
            progress: ProgressData::new(),
        }
    }

    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_progress(mut self, key: &str, value: ProgressValue) -> Self {
        self.progress.insert(key.to_string(), value);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseCompletion {
    pub mission_id: String,
    /// Phase that was credited (1 or 2).
    pub phase: u8,
    pub reward: u32,
    /// False when the issuing side already held this reward.
    pub newly_credited: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseOutcome {
    /// Submission failed validation; nothing changed.
    Rejected(ValidationOutcome),
    Completed(PhaseCompletion),
}

/// Per-user daily mission engine.
pub struct MissionEngine<S, C, A> {
    config: EngineConfig,
    catalog: MissionCatalog,
    states: MissionStateStore<S>,
    counters: CounterStore<S>,
    clock: C,
    credits: A,
    session: Box<dyn Session>,
}

impl<S, C, A> MissionEngine<S, C, A>
where
    S: KeyValueStore,
    C: Clock,
    A: CreditAdapter,
{
    /// Build an engine over `store`, crediting through `credits`.
    ///
    /// # Errors
    ///
    /// Returns an error if the config or catalog fails validation.
    pub fn new(
        config: EngineConfig,
        catalog: MissionCatalog,
        store: S,
        clock: C,
        credits: A,
        session: impl Session + 'static,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        catalog.validate()?;
        let keys = config.keyspace();
        log::debug!(
            "mission engine for {} using {:?} crediting",
            keys.prefix(),
            credits.mode()
        );
        Ok(Self {
            states: MissionStateStore::new(store.clone(), &keys),
            counters: CounterStore::new(store, &keys),
            config,
            catalog,
            clock,
            credits,
            session: Box::new(session),
        })
    }

    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub const fn catalog(&self) -> &MissionCatalog {
        &self.catalog
    }

    #[must_use]
    pub const fn credits(&self) -> &A {
        &self.credits
    }

    #[must_use]
    pub const fn clock(&self) -> &C {
        &self.clock
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.config.enabled && self.session.is_authenticated()
    }

    fn ensure_active(&self) -> Result<(), EngineError> {
        if !self.config.enabled {
            return Err(EngineError::Disabled);
        }
        if !self.session.is_authenticated() {
            return Err(EngineError::NotAuthenticated);
        }
        Ok(())
    }

    fn active_mission(&self, state: &MissionState) -> Result<&MissionDefinition, EngineError> {
        let id = state
            .active_mission_id
            .as_deref()
            .ok_or(EngineError::NoActiveMission)?;
        self.catalog
            .find(id)
            .ok_or_else(|| EngineError::UnknownMission(id.to_string()))
    }

    /// Compose today's read model. Never mutates anything.
    #[must_use]
    pub fn state(&self) -> EngineView {
        let today = self.clock.today_key();
        if !self.is_enabled() {
            return EngineView {
                enabled: false,
                today,
                current_mission: None,
                active_mission: None,
                mission_state: MissionState::default(),
                should_show_briefing: false,
                should_show_phase2_resume: false,
                needs_reconciliation: false,
            };
        }
        let mission_state = self.states.load();
        let current_mission = self
            .catalog
            .mission_of_the_day(self.clock.today())
            .cloned();
        let active_mission = mission_state
            .active_mission_id
            .as_deref()
            .and_then(|id| self.catalog.find(id))
            .cloned();
        let should_show_briefing = mission_state.phase == MissionPhase::NotStarted
            && !self.states.is_briefing_shown_today(&today);
        EngineView {
            enabled: true,
            should_show_phase2_resume: mission_state.is_phase2_available(&today),
            needs_reconciliation: mission_state.needs_reconciliation(),
            should_show_briefing,
            current_mission,
            active_mission,
            mission_state,
            today,
        }
    }

    /// Latch today's briefing as seen.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine is inert or the latch cannot be written.
    pub fn mark_briefing_shown(&self) -> Result<(), EngineError> {
        self.ensure_active()?;
        self.states.mark_briefing_shown(&self.clock.today_key())?;
        Ok(())
    }

    /// Arm today's mission, from any phase.
    ///
    /// Unconfirmed credits of the previous mission are settled first, since
    /// arming clears the credited flags.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine is inert, pending credits cannot be
    /// settled, the catalog has no mission for today, or the state cannot
    /// be written.
    pub fn start_mission(&self) -> Result<MissionState, EngineError> {
        self.ensure_active()?;
        if self.states.load().needs_reconciliation() {
            self.reconcile()?;
        }
        let today = self.clock.today_key();
        let mission = self
            .catalog
            .mission_of_the_day(self.clock.today())
            .ok_or_else(|| EngineError::NoMissionToday(today.clone()))?;
        Ok(self.states.start_mission(&mission.id, &today)?)
    }

    /// Validate and complete phase 1 of the active mission, then credit it.
    ///
    /// A crediting failure is returned after the phase has advanced; the
    /// state then reports `needs_reconciliation` and [`Self::reconcile`]
    /// finishes the issuance.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine is inert, phase 1 is not active, the
    /// mission was armed on an earlier day, or persistence/crediting fails.
    pub fn complete_phase1(&self, input: &PhaseInput) -> Result<PhaseOutcome, EngineError> {
        self.ensure_active()?;
        let state = self.states.load();
        if state.phase != MissionPhase::Phase1Active {
            return Err(EngineError::WrongPhase {
                expected: MissionPhase::Phase1Active,
                actual: state.phase,
            });
        }
        let today = self.clock.today_key();
        let day_key = match state.day_key.clone() {
            Some(day) if day == today => day,
            other => {
                return Err(EngineError::StaleMission {
                    started: other.map_or_else(|| "an unknown day".to_string(), |d| d.to_string()),
                });
            }
        };
        let mission = self.active_mission(&state)?;
        let outcome = validate_action(&mission.phase1.action, &input.text, |key| {
            self.counters.get(key)
        });
        if !outcome.valid {
            log::debug!("phase 1 of {} rejected: {:?}", mission.id, outcome.error);
            return Ok(PhaseOutcome::Rejected(outcome));
        }

        self.states
            .complete_phase1(input.progress.clone(), self.clock.now())?;
        let reward = mission.reward_split().phase1;
        let newly_credited = self.issue(&mission.id, 1, &day_key, reward)?;
        Ok(PhaseOutcome::Completed(PhaseCompletion {
            mission_id: mission.id.clone(),
            phase: 1,
            reward,
            newly_credited,
        }))
    }

    /// Validate and complete phase 2 of the active mission, then credit it.
    ///
    /// The day-boundary gate is checked here, not left to the caller.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Phase2Locked`] on the start day, and the same
    /// failures as [`Self::complete_phase1`] otherwise.
    pub fn complete_phase2(&self, input: &PhaseInput) -> Result<PhaseOutcome, EngineError> {
        self.ensure_active()?;
        let state = self.states.load();
        if state.phase != MissionPhase::AwaitingPhase2 {
            return Err(EngineError::WrongPhase {
                expected: MissionPhase::AwaitingPhase2,
                actual: state.phase,
            });
        }
        let today = self.clock.today_key();
        if !state.is_phase2_available(&today) {
            return Err(EngineError::Phase2Locked);
        }
        let day_key = state.day_key.clone().ok_or(EngineError::Phase2Locked)?;
        let mission = self.active_mission(&state)?;
        let outcome = validate_action(&mission.phase2.action, &input.text, |key| {
            self.counters.get(key)
        });
        if !outcome.valid {
            log::debug!("phase 2 of {} rejected: {:?}", mission.id, outcome.error);
            return Ok(PhaseOutcome::Rejected(outcome));
        }

        self.states.complete_phase2(&today)?;
        let reward = mission.reward_split().phase2;
        let newly_credited = self.issue(&mission.id, 2, &day_key, reward)?;
        Ok(PhaseOutcome::Completed(PhaseCompletion {
            mission_id: mission.id.clone(),
            phase: 2,
            reward,
            newly_credited,
        }))
    }

    /// Credit any phase that advanced without a confirmed issuance.
    ///
    /// Safe to call repeatedly: the issuing side deduplicates by key.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine is inert or crediting fails again.
    pub fn reconcile(&self) -> Result<Vec<PhaseCompletion>, EngineError> {
        self.ensure_active()?;
        let state = self.states.load();
        if state.phase >= MissionPhase::AwaitingPhase2 && state.phase1_completed_at.is_none() {
            log::warn!(
                "mission is {} with no phase 1 completion recorded; nothing to settle",
                state.phase
            );
            return Ok(Vec::new());
        }
        if !state.needs_reconciliation() {
            return Ok(Vec::new());
        }
        let mission = self.active_mission(&state)?;
        let day_key = state.day_key.clone().ok_or(EngineError::NoActiveMission)?;
        let split = mission.reward_split();
        let mut settled = Vec::new();
        if !state.credited_phase1 {
            let newly_credited = self.issue(&mission.id, 1, &day_key, split.phase1)?;
            settled.push(PhaseCompletion {
                mission_id: mission.id.clone(),
                phase: 1,
                reward: split.phase1,
                newly_credited,
            });
        }
        if state.phase == MissionPhase::Completed && !state.credited_phase2 {
            let newly_credited = self.issue(&mission.id, 2, &day_key, split.phase2)?;
            settled.push(PhaseCompletion {
                mission_id: mission.id.clone(),
                phase: 2,
                reward: split.phase2,
                newly_credited,
            });
        }
        log::info!("reconciled {} phase(s) of {}", settled.len(), mission.id);
        Ok(settled)
    }

    /// Credit one phase and set its credited flag only after success.
    ///
    /// The pending-rewards total is informational and updated best-effort
    /// before the flag, so a failed flag write cannot lose it on retry.
    fn issue(
        &self,
        mission_id: &str,
        phase: u8,
        day_key: &DayKey,
        amount: u32,
    ) -> Result<bool, EngineError> {
        let request = CreditRequest {
            user_id: self.config.user_id.clone(),
            mission_id: mission_id.to_string(),
            phase,
            day_key: day_key.clone(),
            amount,
            reason: format!("daily mission {mission_id} phase {phase}"),
            requested_at: self.clock.now(),
        };
        let outcome = match self.credits.credit(&request) {
            Ok(outcome) => outcome,
            Err(err) => {
                log::warn!(
                    "credit for {} failed; phase left uncredited: {err}",
                    request.idempotency_key()
                );
                return Err(err.into());
            }
        };
        if outcome.is_new()
            && let Err(err) = self.states.add_pending_reward(amount)
        {
            log::warn!(
                "pending rewards not updated for {}: {err}",
                request.idempotency_key()
            );
        }
        if phase == 1 {
            self.states.mark_phase1_credited()?;
        } else {
            self.states.mark_phase2_credited()?;
        }
        Ok(outcome.is_new())
    }

    /// Gameplay hook: advance a counter.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine is inert or the counter cannot be written.
    pub fn record_progress(&self, counter: &str, by: u32) -> Result<i64, EngineError> {
        self.ensure_active()?;
        Ok(self.counters.increment(counter, by)?)
    }

    #[must_use]
    pub fn counter(&self, counter: &str) -> i64 {
        self.counters.get(counter)
    }

    /// Every counter recorded for this user.
    ///
    /// # Errors
    ///
    /// Returns an error if the counters cannot be listed.
    pub fn counters(&self) -> Result<Vec<(String, i64)>, EngineError> {
        Ok(self.counters.all()?)
    }

    /// Wipe the mission state. For testing and rollback only.
    ///
    /// # Errors
    ///
    /// Returns an error if the state keys cannot be removed.
    pub fn reset(&self) -> Result<(), EngineError> {
        self.states.reset()?;
        Ok(())
    }
}
