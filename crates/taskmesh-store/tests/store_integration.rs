#![allow(clippy::unwrap_used, clippy::expect_used)]

use chrono::{Duration, Utc};
use serde_json::json;
use taskmesh_core::TaskState;
use taskmesh_store::{
    CheckpointRow, CheckpointStore, Database, FileKvStore, KvStore, OutcomeRecord, OutcomeStore,
    SqliteCheckpointStore, SqliteOutcomeStore,
};
use uuid::Uuid;

fn checkpoint(dispatched_secs_ago: i64) -> CheckpointRow {
    let now = Utc::now();
    CheckpointRow {
        task_id: Uuid::new_v4(),
        capability: "code-review".into(),
        dispatched_to: "reviewer-a".into(),
        dispatched_at: now - Duration::seconds(dispatched_secs_ago),
        status: TaskState::Dispatched,
        attempts: 1,
        generation: 1,
        timeout_secs: 120,
        priority: 5,
        requested_by: "scheduler".into(),
        created_at: now,
        payload: json!({"diff": "+1"}).as_object().cloned().unwrap(),
    }
}

#[tokio::test]
async fn test_checkpoints_survive_reopen() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("taskmesh.db");

    let kept = checkpoint(90);
    let finished = checkpoint(10);
    {
        let db = Database::open(&path).unwrap();
        let store = SqliteCheckpointStore::new(db.clone());
        store.save(&kept).await.unwrap();
        store.save(&finished).await.unwrap();
        store.delete(finished.task_id).await.unwrap();
        store.close().await.unwrap();
        assert!(db.is_closed());
    }

    // A fresh process opens the same file.
    let store = SqliteCheckpointStore::new(Database::open(&path).unwrap());
    let rows = store.load_all().await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].task_id, kept.task_id);
    assert_eq!(rows[0].payload, kept.payload);

    let remaining = rows[0].remaining(Utc::now());
    assert!(remaining <= std::time::Duration::from_secs(30));
    assert!(remaining >= std::time::Duration::from_secs(29));
}

#[tokio::test]
async fn test_checkpoints_and_outcomes_share_a_file() {
    let tmp = tempfile::tempdir().unwrap();
    let db = Database::open(&tmp.path().join("taskmesh.db")).unwrap();
    let checkpoints = SqliteCheckpointStore::new(db.clone());
    let outcomes = SqliteOutcomeStore::new(db.clone());

    let row = checkpoint(0);
    checkpoints.save(&row).await.unwrap();
    outcomes
        .record(&OutcomeRecord {
            agent_id: "reviewer-a".into(),
            capability: "code-review".into(),
            task_id: row.task_id,
            success: true,
            duration_ms: 420,
            recorded_at: Utc::now(),
        })
        .await
        .unwrap();

    let recent = outcomes.recent("reviewer-a", "code-review", 20).await.unwrap();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].task_id, row.task_id);

    // Closing through one store closes the shared handle.
    checkpoints.close().await.unwrap();
    assert!(outcomes
        .recent("reviewer-a", "code-review", 20)
        .await
        .is_err());
}

#[tokio::test]
async fn test_file_kv_survives_reopen() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("registry");

    let store = FileKvStore::new(dir.clone()).await.unwrap();
    store
        .save("agent:reviewer-a", &json!({"appId": "reviewer-a"}))
        .await
        .unwrap();
    store
        .save("agents:index", &json!(["reviewer-a"]))
        .await
        .unwrap();
    drop(store);

    let reopened = FileKvStore::new(dir).await.unwrap();
    assert_eq!(
        reopened.get("agents:index").await.unwrap(),
        Some(json!(["reviewer-a"]))
    );
    reopened.delete("agent:reviewer-a").await.unwrap();
    assert!(reopened.get("agent:reviewer-a").await.unwrap().is_none());
}
