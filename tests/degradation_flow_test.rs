//! Database outage end to end: writes are deferred while the store is down,
//! reads degrade to fallbacks, and a sweep replays the queue in order once the
//! store answers again.

mod common;

use common::{database_config, ScriptedBackend, ScriptedConnector};
use serde_json::{json, Value};
use std::sync::Arc;
use warden_core::constants::services;
use warden_core::database::{ConnectionManager, Fields, QueryOptions, SequenceRequest, WriteOutcome};
use warden_core::degradation::{DegradationCoordinator, HealthState, ResolutionSource};
use warden_core::WardenError;

async fn setup() -> (Arc<ScriptedBackend>, Arc<DegradationCoordinator>, Arc<ConnectionManager>) {
    let backend = ScriptedBackend::new();
    let coordinator = Arc::new(DegradationCoordinator::in_memory(1));
    let manager = Arc::new(
        ConnectionManager::with_connector(
            database_config(),
            Arc::clone(&coordinator),
            Arc::new(ScriptedConnector(Arc::clone(&backend))),
        )
        .unwrap(),
    );
    manager.initialize().await.unwrap();
    (backend, coordinator, manager)
}

fn warning(user: &str) -> Fields {
    Fields::new()
        .with("guild_id", "123")
        .with("user_id", user)
        .with("reason", "spam")
}

#[tokio::test]
async fn test_outage_defers_writes_and_sweep_replays_in_order() {
    let (backend, coordinator, manager) = setup().await;
    assert!(coordinator.is_healthy(services::DATABASE));

    backend.set_down(true);
    let first = manager.safe_insert("warnings", &warning("1")).await.unwrap();
    assert!(first.is_queued());
    assert_eq!(
        coordinator.state(services::DATABASE),
        Some(HealthState::Unavailable)
    );

    // already unavailable: queued without touching the store
    let second = manager.safe_insert("warnings", &warning("2")).await.unwrap();
    let WriteOutcome::Queued { table, .. } = &second else {
        panic!("expected a queued write, got {second:?}");
    };
    assert_eq!(table, "warnings");
    assert_eq!(coordinator.queue_depth().await.unwrap(), 2);

    backend.set_down(false);
    let sweep = coordinator.run_sweep().await.unwrap();
    assert_eq!(sweep.healed, vec![services::DATABASE.to_string()]);
    assert_eq!(sweep.recovery.replayed, 2);
    assert_eq!(coordinator.queue_depth().await.unwrap(), 0);

    let replayed_users: Vec<Value> = backend
        .writes()
        .into_iter()
        .filter(|e| e.sql.starts_with("INSERT INTO warnings"))
        .map(|e| e.params[1].clone())
        .collect();
    assert_eq!(replayed_users, vec![json!("1"), json!("2")]);
}

#[tokio::test]
async fn test_reads_resolve_to_fallbacks_while_unavailable() {
    let (backend, coordinator, manager) = setup().await;
    coordinator.register_service("guild_settings");

    let settings = coordinator
        .resolve("guild_settings", "guild:123", || async { Ok::<_, WardenError>(json!({"prefix": "!"})) })
        .await
        .unwrap();
    assert_eq!(settings.source, ResolutionSource::Primary);

    backend.set_down(true);
    let err = manager
        .query("SELECT * FROM guild_settings WHERE guild_id = $1", &[json!("123")], QueryOptions::default())
        .await
        .unwrap_err();
    assert!(err.is_temporary());

    let rows = coordinator
        .resolve(services::DATABASE, "mod_cases:123", || async {
            Ok::<_, WardenError>(json!([{"case_id": 1}]))
        })
        .await
        .unwrap();
    assert_eq!(rows.source, ResolutionSource::RegisteredFallback);
    assert_eq!(rows.into_inner(), json!([]));
}

#[tokio::test]
async fn test_disallowed_table_is_rejected_before_the_store() {
    let (backend, _, manager) = setup().await;
    let before = backend.executed().len();

    assert!(manager.validate_table("guild_settings").is_ok());
    assert!(matches!(
        manager.validate_table("users"),
        Err(WardenError::ValidationError(_))
    ));
    assert!(matches!(
        manager
            .safe_insert("users", &Fields::new().with("id", 1))
            .await,
        Err(WardenError::ValidationError(_))
    ));
    assert_eq!(backend.executed().len(), before);
}

#[tokio::test]
async fn test_insert_binds_two_params_and_returns_row() {
    let (backend, _, manager) = setup().await;
    let row = manager
        .insert(
            "guild_settings",
            &Fields::new().with("guild_id", "123").with("prefix", "!"),
        )
        .await
        .unwrap();

    assert_eq!(row.get("prefix"), Some(&json!("!")));
    let insert = backend.writes().pop().unwrap();
    assert!(insert.sql.starts_with("INSERT INTO guild_settings"));
    assert_eq!(insert.params.len(), 2);
}

#[tokio::test]
async fn test_sequence_claim_runs_in_one_transaction() {
    let (backend, _, manager) = setup().await;
    let request = SequenceRequest::new("mod_cases", "guild_id", json!("123"), "case_number")
        .with_fields(Fields::new().with("action", "ban"));
    manager.next_sequence(&request).await.unwrap();

    let statements: Vec<String> = backend
        .writes()
        .into_iter()
        .filter(|e| e.target.is_none())
        .map(|e| e.sql)
        .collect();
    assert!(statements[0].contains("pg_advisory_xact_lock"));
    assert!(statements[1].contains("COALESCE(MAX(case_number), 0) + 1"));
    assert_eq!(backend.commits(), 1);
}
