//! Daily Mission Engine
//!
//! Platform-agnostic core for the two-phase daily mission game mode.
//! A deterministic catalog picks one mission per calendar day, phase 1 is
//! completed on the start day and phase 2 on any later day, and each phase
//! credits half the reward exactly once per `(mission, phase, day)`.

pub mod catalog;
pub mod clock;
pub mod config;
pub mod counters;
pub mod credit;
pub mod engine;
pub mod state;
pub mod storage;
pub mod validation;

// Re-export commonly used types
pub use catalog::{
    CatalogError, CounterSpec, Difficulty, MissionCatalog, MissionDefinition, PhaseAction,
    PhaseSpec, RewardSplit, catalog, day_of_year, split_reward,
};
pub use clock::{Clock, DayKey, ManualClock, SystemClock};
pub use config::{ConfigError, EngineConfig};
pub use counters::CounterStore;
pub use credit::{
    CreditAdapter, CreditBackend, CreditError, CreditMode, CreditOutcome, CreditReceipt,
    CreditRequest, InMemoryCreditBackend, LedgerEntry, LiveCreditAdapter, SafeModeLedger,
    SignedReceipt,
};
pub use engine::{
    EngineError, EngineView, MissionEngine, PhaseCompletion, PhaseInput, PhaseOutcome, Session,
    SessionFlag,
};
pub use state::{
    InvalidPhase, MissionPhase, MissionState, MissionStateStore, ProgressData, ProgressValue,
    StateError,
};
pub use storage::{FileStore, KeyValueStore, Keyspace, MemoryStore, StorageError};
pub use validation::{
    RuleKind, ValidationOutcome, ValidationRule, check_counter, validate, validate_action,
};
