use anyhow::{Context, Result, bail};
use chrono::NaiveDate;
use mission_engine::{
    Clock, CreditAdapter, CreditError, CreditMode, CreditOutcome, CreditRequest, EngineConfig,
    FileStore, LiveCreditAdapter, ManualClock, MissionCatalog, MissionEngine, SafeModeLedger,
    SessionFlag, SystemClock, catalog,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::issuer::LocalIssuer;

/// Optional JSON settings file for the CLI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TesterConfig {
    #[serde(default = "TesterConfig::default_enabled")]
    pub enabled: bool,
    #[serde(default = "TesterConfig::default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub credit_mode: CreditMode,
    /// HMAC key shared with the issuer; required in live mode.
    #[serde(default)]
    pub live_secret: Option<String>,
    /// Mission catalog to use instead of the bundled one.
    #[serde(default)]
    pub catalog_path: Option<PathBuf>,
}

impl Default for TesterConfig {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            namespace: Self::default_namespace(),
            credit_mode: CreditMode::Safe,
            live_secret: None,
            catalog_path: None,
        }
    }
}

impl TesterConfig {
    const fn default_enabled() -> bool {
        true
    }

    fn default_namespace() -> String {
        "daily_mission".to_string()
    }

    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn engine_config(&self, user_id: &str) -> EngineConfig {
        EngineConfig {
            enabled: self.enabled,
            namespace: self.namespace.clone(),
            user_id: user_id.to_string(),
        }
    }

    pub fn catalog(&self) -> Result<MissionCatalog> {
        let Some(path) = &self.catalog_path else {
            return Ok(catalog().clone());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read catalog {}", path.display()))?;
        MissionCatalog::from_json(&raw)
            .with_context(|| format!("invalid catalog {}", path.display()))
    }

    pub fn secret(&self) -> Result<Vec<u8>> {
        match self.live_secret.as_deref() {
            Some(secret) if !secret.is_empty() => Ok(secret.as_bytes().to_vec()),
            _ => bail!("credit_mode \"live\" requires a non-empty live_secret"),
        }
    }
}

/// Credit adapter chosen by [`TesterConfig::credit_mode`].
#[derive(Debug, Clone)]
pub enum TesterCredits {
    Safe(SafeModeLedger<FileStore>),
    Live(LiveCreditAdapter<LocalIssuer<FileStore>>),
}

impl CreditAdapter for TesterCredits {
    fn mode(&self) -> CreditMode {
        match self {
            Self::Safe(ledger) => ledger.mode(),
            Self::Live(adapter) => adapter.mode(),
        }
    }

    fn credit(&self, request: &CreditRequest) -> Result<CreditOutcome, CreditError> {
        match self {
            Self::Safe(ledger) => ledger.credit(request),
            Self::Live(adapter) => adapter.credit(request),
        }
    }
}

pub type TesterEngine = MissionEngine<FileStore, ManualClock, TesterCredits>;

/// Resolve `--today`, falling back to the wall clock.
pub fn tester_clock(today: Option<NaiveDate>) -> ManualClock {
    today.map_or_else(
        || ManualClock::new(SystemClock.now()),
        ManualClock::on_date,
    )
}

pub fn build_engine(
    config: &TesterConfig,
    state_path: &Path,
    user_id: &str,
    today: Option<NaiveDate>,
) -> Result<TesterEngine> {
    let store = FileStore::open(state_path)
        .with_context(|| format!("failed to open state file {}", state_path.display()))?;
    let engine_config = config.engine_config(user_id);
    let credits = match config.credit_mode {
        CreditMode::Safe => {
            TesterCredits::Safe(SafeModeLedger::new(store.clone(), &engine_config.keyspace()))
        }
        CreditMode::Live => {
            let secret = config.secret()?;
            TesterCredits::Live(LiveCreditAdapter::new(
                LocalIssuer::new(store.clone(), &secret),
                &secret,
            ))
        }
    };
    let engine = MissionEngine::new(
        engine_config,
        config.catalog()?,
        store,
        tester_clock(today),
        credits,
        SessionFlag::signed_in(),
    )?;
    Ok(engine)
}
