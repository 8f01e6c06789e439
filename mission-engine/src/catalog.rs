//! Mission catalog, mission-of-the-day selection and reward split.
use chrono::{Datelike, NaiveDate};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::OnceLock;
use thiserror::Error;

use crate::validation::ValidationRule;

const DEFAULT_MISSIONS_DATA: &str = include_str!("../data/missions.json");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

/// Counter requirement: `target` is a cumulative total, not a per-phase delta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSpec {
    pub key: String,
    pub target: i64,
}

/// What the player has to do to clear a phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PhaseAction {
    /// Free-text answer, optionally checked against a rule.
    Input {
        #[serde(default)]
        rule: Option<ValidationRule>,
    },
    /// Acknowledge only.
    Confirm,
    /// Reach a gameplay counter target.
    Counter(CounterSpec),
    /// Choose one of the listed map zones.
    SelectZone {
        zones: Vec<String>,
        #[serde(default)]
        error_message: Option<String>,
    },
}

impl PhaseAction {
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Input { .. } => "input",
            Self::Confirm => "confirm",
            Self::Counter(_) => "counter",
            Self::SelectZone { .. } => "select_zone",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseSpec {
    #[serde(default)]
    pub prompt: String,
    #[serde(flatten)]
    pub action: PhaseAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissionDefinition {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub briefing: String,
    #[serde(default)]
    pub description: String,
    pub difficulty: Difficulty,
    pub total_reward: u32,
    pub phase1: PhaseSpec,
    pub phase2: PhaseSpec,
}

impl MissionDefinition {
    #[must_use]
    pub const fn reward_split(&self) -> RewardSplit {
        split_reward(self.total_reward)
    }
}

/// Reward paid out per phase; the two halves always sum to the total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardSplit {
    pub phase1: u32,
    pub phase2: u32,
}

/// Phase 1 gets the floor of half; the odd remainder goes to phase 2.
#[must_use]
pub const fn split_reward(total: u32) -> RewardSplit {
    let phase1 = total / 2;
    RewardSplit {
        phase1,
        phase2: total - phase1,
    }
}

/// 1-based day of the year (January 1st is day 1).
#[must_use]
pub fn day_of_year(date: NaiveDate) -> u32 {
    date.ordinal()
}

/// Problems found when checking a catalog before use.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("mission catalog is empty")]
    Empty,
    #[error("duplicate mission id {0:?}")]
    DuplicateId(String),
    #[error("mission {mission:?} phase {phase}: rule requires a pattern")]
    MissingPattern { mission: String, phase: u8 },
    #[error("mission {mission:?} phase {phase}: invalid pattern: {message}")]
    InvalidPattern {
        mission: String,
        phase: u8,
        message: String,
    },
    #[error("mission {mission:?} phase {phase}: counter needs a key and a positive target")]
    InvalidCounter { mission: String, phase: u8 },
    #[error("mission {mission:?} phase {phase}: zone selection lists no zones")]
    NoZones { mission: String, phase: u8 },
}

/// Ordered, read-only list of missions. Order determines day selection.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MissionCatalog {
    pub missions: Vec<MissionDefinition>,
}

impl MissionCatalog {
    #[must_use]
    pub const fn new(missions: Vec<MissionDefinition>) -> Self {
        Self { missions }
    }

    /// Load a catalog from its JSON form.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON cannot be parsed into mission definitions.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Catalog bundled with the crate.
    #[must_use]
    pub fn load_from_static() -> Self {
        Self::from_json(DEFAULT_MISSIONS_DATA).unwrap_or_else(|err| {
            log::error!("bundled mission catalog failed to parse: {err}");
            Self::default()
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.missions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.missions.is_empty()
    }

    #[must_use]
    pub fn find(&self, mission_id: &str) -> Option<&MissionDefinition> {
        self.missions.iter().find(|mission| mission.id == mission_id)
    }

    /// `catalog[day_of_year(date) mod N]`; the same for every user on `date`.
    #[must_use]
    pub fn mission_of_the_day(&self, date: NaiveDate) -> Option<&MissionDefinition> {
        if self.missions.is_empty() {
            return None;
        }
        let index = day_of_year(date) as usize % self.missions.len();
        self.missions.get(index)
    }

    /// Check structural invariants of every mission.
    ///
    /// # Errors
    ///
    /// Returns the first [`CatalogError`] encountered.
    pub fn validate(&self) -> Result<(), CatalogError> {
        if self.missions.is_empty() {
            return Err(CatalogError::Empty);
        }
        let mut seen = HashSet::new();
        for mission in &self.missions {
            if !seen.insert(mission.id.as_str()) {
                return Err(CatalogError::DuplicateId(mission.id.clone()));
            }
            validate_phase(&mission.id, 1, &mission.phase1.action)?;
            validate_phase(&mission.id, 2, &mission.phase2.action)?;
        }
        Ok(())
    }
}

fn validate_phase(mission: &str, phase: u8, action: &PhaseAction) -> Result<(), CatalogError> {
    match action {
        PhaseAction::Input { rule: Some(rule) } if rule.requires_pattern() => {
            if rule.pattern.is_empty() {
                return Err(CatalogError::MissingPattern {
                    mission: mission.to_string(),
                    phase,
                });
            }
            if matches!(rule.kind, crate::validation::RuleKind::Regex)
                && let Err(err) = Regex::new(&rule.pattern)
            {
                return Err(CatalogError::InvalidPattern {
                    mission: mission.to_string(),
                    phase,
                    message: err.to_string(),
                });
            }
            Ok(())
        }
        PhaseAction::Counter(spec) if spec.key.trim().is_empty() || spec.target <= 0 => {
            Err(CatalogError::InvalidCounter {
                mission: mission.to_string(),
                phase,
            })
        }
        PhaseAction::SelectZone { zones, .. } if zones.is_empty() => Err(CatalogError::NoZones {
            mission: mission.to_string(),
            phase,
        }),
        _ => Ok(()),
    }
}

/// Process-wide bundled catalog.
#[must_use]
pub fn catalog() -> &'static MissionCatalog {
    static CATALOG: OnceLock<MissionCatalog> = OnceLock::new();
    CATALOG.get_or_init(MissionCatalog::load_from_static)
}
