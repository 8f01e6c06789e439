use chrono::NaiveDate;
use mission_engine::{
    EngineConfig, EngineError, InMemoryCreditBackend, LiveCreditAdapter, ManualClock,
    MemoryStore, MissionEngine, MissionPhase, PhaseInput, PhaseOutcome, ProgressValue,
    SafeModeLedger, SessionFlag, catalog,
};
use mission_engine::{FileStore, KeyValueStore};

const SECRET: &[u8] = b"integration-secret";

fn jan(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 1, day).unwrap()
}

fn safe_engine(
    date: NaiveDate,
) -> (
    MissionEngine<MemoryStore, ManualClock, SafeModeLedger<MemoryStore>>,
    ManualClock,
    SafeModeLedger<MemoryStore>,
) {
    let store = MemoryStore::new();
    let config = EngineConfig::for_user("player-one");
    let ledger = SafeModeLedger::new(store.clone(), &config.keyspace());
    let clock = ManualClock::on_date(date);
    let engine = MissionEngine::new(
        config,
        catalog().clone(),
        store,
        clock.clone(),
        ledger.clone(),
        SessionFlag::signed_in(),
    )
    .unwrap();
    (engine, clock, ledger)
}

#[test]
fn two_day_mission_credits_split_reward() {
    // Day 30 of the year maps back to the first catalog entry.
    let (engine, clock, ledger) = safe_engine(jan(30));
    let view = engine.state();
    assert_eq!(view.current_mission.as_ref().unwrap().id, "eternal-city");
    assert!(view.should_show_briefing);

    engine.mark_briefing_shown().unwrap();
    engine.start_mission().unwrap();
    let answer = PhaseInput::text("  ROMA ")
        .with_progress("answer", ProgressValue::Text("roma".to_string()));
    let PhaseOutcome::Completed(first) = engine.complete_phase1(&answer).unwrap() else {
        panic!("phase 1 should accept the answer");
    };
    assert_eq!(first.reward, 10);
    let amounts: Vec<u32> = ledger.entries().unwrap().iter().map(|e| e.amount).collect();
    assert_eq!(amounts, vec![10]);

    assert!(matches!(
        engine.complete_phase2(&PhaseInput::empty()),
        Err(EngineError::Phase2Locked)
    ));

    clock.advance_days(1);
    let view = engine.state();
    assert!(view.should_show_phase2_resume);
    assert_eq!(view.active_mission.as_ref().unwrap().id, "eternal-city");
    assert_ne!(view.current_mission.as_ref().unwrap().id, "eternal-city");

    let PhaseOutcome::Completed(second) = engine.complete_phase2(&PhaseInput::empty()).unwrap()
    else {
        panic!("confirm phase should always pass");
    };
    assert_eq!(second.reward, 11);

    let entries = ledger.entries().unwrap();
    let amounts: Vec<u32> = entries.iter().map(|e| e.amount).collect();
    assert_eq!(amounts, vec![10, 11]);
    assert_eq!(ledger.total().unwrap(), 21);
    assert_eq!(entries[0].idempotency_key, "eternal-city:1:2026-01-30");
    assert_eq!(entries[1].idempotency_key, "eternal-city:2:2026-01-30");

    let state = engine.state().mission_state;
    assert_eq!(state.phase, MissionPhase::Completed);
    assert_eq!(
        state.progress_data.get("answer"),
        Some(&ProgressValue::Text("roma".to_string()))
    );
    assert_eq!(state.pending_rewards, 21);
}

#[test]
fn phase2_late_by_several_days_is_still_allowed() {
    let (engine, clock, ledger) = safe_engine(jan(30));
    engine.start_mission().unwrap();
    engine.complete_phase1(&PhaseInput::text("roma")).unwrap();
    clock.advance_days(5);
    assert!(engine.state().should_show_phase2_resume);
    engine.complete_phase2(&PhaseInput::empty()).unwrap();
    assert_eq!(ledger.total().unwrap(), 21);
}

#[test]
fn rejected_answer_surfaces_catalog_message() {
    let (engine, _, ledger) = safe_engine(jan(30));
    engine.start_mission().unwrap();
    let PhaseOutcome::Rejected(outcome) = engine.complete_phase1(&PhaseInput::text("milano")).unwrap()
    else {
        panic!("wrong city must be rejected");
    };
    assert!(!outcome.valid);
    assert!(outcome.error.is_some());
    assert_eq!(engine.state().mission_state.phase, MissionPhase::Phase1Active);
    assert!(ledger.entries().unwrap().is_empty());
}

#[test]
fn live_mode_moves_backend_balance_once() {
    let store = MemoryStore::new();
    let backend = InMemoryCreditBackend::new(SECRET);
    let clock = ManualClock::on_date(jan(30));
    let engine = MissionEngine::new(
        EngineConfig::for_user("player-two"),
        catalog().clone(),
        store,
        clock.clone(),
        LiveCreditAdapter::new(backend.clone(), SECRET),
        SessionFlag::signed_in(),
    )
    .unwrap();

    engine.start_mission().unwrap();
    engine.complete_phase1(&PhaseInput::text("Roma")).unwrap();
    engine.start_mission().unwrap();
    let PhaseOutcome::Completed(repeat) = engine.complete_phase1(&PhaseInput::text("Roma")).unwrap()
    else {
        panic!("re-armed phase 1 should still validate");
    };
    assert!(!repeat.newly_credited);
    assert_eq!(backend.balance("player-two"), 10);

    clock.advance_days(1);
    engine.complete_phase2(&PhaseInput::empty()).unwrap();
    assert_eq!(backend.balance("player-two"), 21);
    assert_eq!(backend.issued_count(), 2);
}

#[test]
fn state_survives_reopening_the_file_store() {
    let path = std::env::temp_dir().join(format!(
        "mission-engine-flow-{}.json",
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos()
    ));
    let config = EngineConfig::for_user("persisted");
    let clock = ManualClock::on_date(jan(30));
    {
        let store = FileStore::open(&path).unwrap();
        let ledger = SafeModeLedger::new(store.clone(), &config.keyspace());
        let engine = MissionEngine::new(
            config.clone(),
            catalog().clone(),
            store,
            clock.clone(),
            ledger,
            SessionFlag::signed_in(),
        )
        .unwrap();
        engine.start_mission().unwrap();
        engine.complete_phase1(&PhaseInput::text("roma")).unwrap();
    }

    clock.advance_days(1);
    let store = FileStore::open(&path).unwrap();
    assert!(store.get("daily_mission.persisted.ledger").unwrap().is_some());
    let ledger = SafeModeLedger::new(store.clone(), &config.keyspace());
    let engine = MissionEngine::new(
        config,
        catalog().clone(),
        store,
        clock,
        ledger.clone(),
        SessionFlag::signed_in(),
    )
    .unwrap();
    let view = engine.state();
    assert_eq!(view.mission_state.phase, MissionPhase::AwaitingPhase2);
    assert!(view.should_show_phase2_resume);
    engine.complete_phase2(&PhaseInput::empty()).unwrap();
    assert_eq!(ledger.total().unwrap(), 21);
    let _ = std::fs::remove_file(path);
}

#[test]
fn users_do_not_share_progress() {
    let store = MemoryStore::new();
    let clock = ManualClock::on_date(jan(30));
    let build = |user: &str| {
        let config = EngineConfig::for_user(user);
        let ledger = SafeModeLedger::new(store.clone(), &config.keyspace());
        MissionEngine::new(
            config,
            catalog().clone(),
            store.clone(),
            clock.clone(),
            ledger,
            SessionFlag::signed_in(),
        )
        .unwrap()
    };
    let alice = build("alice");
    let bob = build("bob");
    alice.start_mission().unwrap();
    alice.record_progress("steps", 300).unwrap();
    assert_eq!(bob.state().mission_state.phase, MissionPhase::NotStarted);
    assert_eq!(bob.counter("steps"), 0);
    assert_eq!(alice.counter("steps"), 300);
}
