//! Incidents and approvals survive a restart of the SQLite store.

mod common;

use std::sync::Arc;

use common::*;
use logresponder::action::{ActionName, ProposalSource};
use logresponder::detect::LogLine;
use logresponder::gate::{ApprovalStore, ApprovalToken, Decision, Policy};
use logresponder::incident::IncidentId;
use logresponder::incident::{Outcome, PipelineState};
use logresponder::pipeline::Orchestrator;
use logresponder::storage::{IncidentStore, SqliteStore};
use logresponder::summarize::SummarizerClient;
use tempfile::TempDir;

fn db_path(dir: &TempDir) -> String {
    dir.path().join("incidents.db").to_string_lossy().into_owned()
}

#[tokio::test]
async fn test_pipeline_result_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = db_path(&dir);

    let id = {
        let store = Arc::new(SqliteStore::open(&path).unwrap());
        let orch = Orchestrator::new(
            SummarizerClient::new(FakeBackend::unavailable(), 4096),
            RecordingExecutor::succeeding(),
            store.clone(),
            store,
        );
        orch.process_line(LogLine::new(PORT_80_LINE), "").await.unwrap().id
    };

    let reopened = SqliteStore::open(&path).unwrap();
    let incident = reopened.get_incident(id).await.unwrap().unwrap();
    assert_eq!(incident.state, PipelineState::Escalated);
    assert_eq!(incident.outcome, Outcome::Escalated);
    assert_eq!(incident.log_line, PORT_80_LINE);
    assert!(incident.summary.unwrap().contains("port conflict"));

    let action = incident.action.unwrap();
    assert_eq!(action.name, ActionName::RestartApache);
    assert_eq!(action.source, ProposalSource::Fallback);
    assert_eq!(incident.decision.unwrap().decision, Decision::Escalated);
    assert!(incident.finished_at.is_some());
}

#[tokio::test]
async fn test_normalized_action_keeps_raw_proposal_on_disk() {
    let dir = TempDir::new().unwrap();
    let path = db_path(&dir);
    let store = Arc::new(SqliteStore::open(&path).unwrap());
    let orch = Orchestrator::new(
        SummarizerClient::new(
            FakeBackend::reply(r#"{"summary":"nuke it","action":"DELETE_ALL"}"#),
            4096,
        ),
        RecordingExecutor::succeeding(),
        store.clone(),
        store.clone(),
    );

    let report = orch.process_line(LogLine::new("ERROR: disk full"), "").await.unwrap();
    drop(orch);
    drop(store);

    let reopened = SqliteStore::open(&path).unwrap();
    let stored = reopened.get_incident(report.id).await.unwrap().unwrap();
    let action = stored.action.unwrap();
    assert_eq!(action.name, ActionName::Escalate);
    assert_eq!(action.raw.as_deref(), Some("DELETE_ALL"));
    assert!(action.was_normalized());
}

#[tokio::test]
async fn test_list_recent_orders_newest_first_across_reopen() {
    let dir = TempDir::new().unwrap();
    let path = db_path(&dir);

    {
        let store = Arc::new(SqliteStore::open(&path).unwrap());
        let orch = Orchestrator::new(
            SummarizerClient::new(FakeBackend::unavailable(), 4096),
            RecordingExecutor::succeeding(),
            store.clone(),
            store,
        );
        for line in ["ERROR first", "ERROR second", "ERROR third"] {
            orch.process_line(LogLine::new(line), "").await.unwrap();
        }
    }

    let reopened = SqliteStore::open(&path).unwrap();
    let recent = reopened.list_recent(2).await.unwrap();
    assert_eq!(recent.len(), 2);
    assert_eq!(recent[0].log_line, "ERROR third");
    assert_eq!(recent[1].log_line, "ERROR second");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_incidents_share_one_database() {
    const N: usize = 64;
    let dir = TempDir::new().unwrap();
    let store = Arc::new(SqliteStore::open(&db_path(&dir)).unwrap());
    let exec = RecordingExecutor::succeeding();
    let orch = Arc::new(
        Orchestrator::new(
            SummarizerClient::new(
                FakeBackend::reply(r#"{"summary":"tmp full","action":"CLEAR_TEMP_CACHE"}"#),
                4096,
            ),
            exec.clone(),
            store.clone(),
            store.clone(),
        )
        .with_policy(Policy {
            dry_run: false,
            ..Policy::default()
        }),
    );

    let mut tasks = tokio::task::JoinSet::new();
    for i in 0..N {
        let orch = orch.clone();
        tasks.spawn(async move {
            orch.process_line(LogLine::new(format!("ERROR: /tmp full on worker {i}")), "")
                .await
                .unwrap()
                .id
        });
    }
    let mut ids: Vec<IncidentId> = Vec::with_capacity(N);
    while let Some(id) = tasks.join_next().await {
        ids.push(id.unwrap());
    }
    assert_eq!(exec.calls().len(), N);

    for id in &ids {
        let stored = store.get_incident(*id).await.unwrap().unwrap();
        assert_eq!(stored.state, PipelineState::Executed, "incident {id}");
        assert_eq!(stored.outcome, Outcome::Executed);
        assert_eq!(stored.summary.as_deref(), Some("tmp full"));
        assert_eq!(stored.action.unwrap().name, ActionName::ClearTempCache);
        assert_eq!(stored.decision.unwrap().decision, Decision::Execute);
        assert_eq!(stored.execution.unwrap().exit_code, 0);
        assert!(stored.finished_at.is_some());
    }

    let recent = store.list_recent(N * 2).await.unwrap();
    assert_eq!(recent.len(), N);
    assert!(recent.iter().all(|i| i.state.is_terminal()));
}

#[test]
fn test_approval_grant_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = db_path(&dir);

    tokio_test::block_on(async {
        let store = SqliteStore::open(&path).unwrap();
        store
            .grant(ApprovalToken::new(ActionName::RestartApache, "alice", None))
            .await
            .unwrap();
    });

    tokio_test::block_on(async {
        let store = SqliteStore::open(&path).unwrap();
        let token = store
            .lookup(ActionName::RestartApache, chrono::Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(token.approved_by, "alice");
        assert!(store
            .lookup(ActionName::ClearTempCache, chrono::Utc::now())
            .await
            .unwrap()
            .is_none());
    });
}

#[tokio::test]
async fn test_persisted_approval_unlocks_execution() {
    let dir = TempDir::new().unwrap();
    let path = db_path(&dir);
    SqliteStore::open(&path)
        .unwrap()
        .grant(ApprovalToken::new(
            ActionName::RestartApache,
            "bob",
            Some(chrono::Duration::minutes(5)),
        ))
        .await
        .unwrap();

    let store = Arc::new(SqliteStore::open(&path).unwrap());
    let exec = RecordingExecutor::succeeding();
    let orch = Orchestrator::new(
        SummarizerClient::new(FakeBackend::unavailable(), 4096),
        exec.clone(),
        store.clone(),
        store.clone(),
    )
    .with_policy(Policy {
        dry_run: false,
        require_approval: true,
        ..Policy::default()
    });

    let report = orch.process_line(LogLine::new(PORT_80_LINE), "").await.unwrap();
    assert_eq!(report.outcome, Outcome::Executed);
    assert_eq!(report.decision.unwrap().reason, "approved by bob");
    assert_eq!(exec.calls(), vec![ActionName::RestartApache]);

    let stored = store.get_incident(report.id).await.unwrap().unwrap();
    assert_eq!(stored.execution.unwrap().exit_code, 0);
}

#[tokio::test]
async fn test_expired_grant_does_not_count() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(SqliteStore::open(&db_path(&dir)).unwrap());
    let mut token = ApprovalToken::new(ActionName::RestartApache, "carol", None);
    token.expires_at = Some(chrono::Utc::now() - chrono::Duration::seconds(1));
    store.grant(token).await.unwrap();

    let orch = Orchestrator::new(
        SummarizerClient::new(FakeBackend::unavailable(), 4096),
        RecordingExecutor::succeeding(),
        store.clone(),
        store,
    )
    .with_policy(Policy {
        dry_run: false,
        require_approval: true,
        ..Policy::default()
    });

    let report = orch.process_line(LogLine::new(PORT_80_LINE), "").await.unwrap();
    assert_eq!(report.outcome, Outcome::Escalated);
    assert_eq!(report.decision.unwrap().reason, "awaiting approval");
}
