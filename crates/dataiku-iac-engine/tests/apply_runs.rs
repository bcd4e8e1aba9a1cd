use dataiku_iac_config::RetrySettings;
use dataiku_iac_core::{
    Attributes, GraphBuilder, ParsedConfig, ResourceAddress, ResourceDecl, ResourceGraph,
    TemplateProcessor,
};
use dataiku_iac_engine::{
    ActionType, ApplyError, CancelHandle, ChangeSet, EntryStatus, Executor, ExecutorConfig,
    FailureKind, FileRunStore, MemoryRunStore, PlanError, PlanOptions, RunStore, diff,
    diff_with_options,
};
use dataiku_iac_state::{
    ClientError, FileStateStore, InMemoryLiveClient, LiveOperation, MemoryStateStore, RunState,
    StateSnapshot, StateStore,
};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

const ENV: &str = "dev";

fn graph(decls: Vec<ResourceDecl>) -> ResourceGraph {
    let mut config = ParsedConfig::new("test");
    config.resources = decls;
    let processor = TemplateProcessor::new();
    GraphBuilder::new(&processor).build(&config).unwrap()
}

fn demo() -> Vec<ResourceDecl> {
    vec![
        ResourceDecl::new(ResourceAddress::project("DEMO")).with_attribute("name", json!("Demo")),
        ResourceDecl::new(ResourceAddress::dataset("DEMO", "TEST_DATA"))
            .with_attribute("type", json!("Filesystem")),
    ]
}

/// A project with `n` datasets, all independent of each other
fn project_with_datasets(n: usize) -> Vec<ResourceDecl> {
    let mut decls = vec![ResourceDecl::new(ResourceAddress::project("DEMO"))];
    for i in 0..n {
        decls.push(
            ResourceDecl::new(ResourceAddress::dataset("DEMO", format!("DS_{i}")))
                .with_attribute("path", json!(format!("/data/{i}"))),
        );
    }
    decls
}

fn independent_projects(n: usize) -> Vec<ResourceDecl> {
    (0..n)
        .map(|i| ResourceDecl::new(ResourceAddress::project(format!("P{i}"))))
        .collect()
}

fn config(workers: usize) -> ExecutorConfig {
    ExecutorConfig {
        workers,
        entry_timeout: Duration::from_secs(5),
        retry: RetrySettings {
            max_attempts: 3,
            initial_delay_ms: 1,
            max_delay_ms: 5,
            multiplier: 2.0,
        },
    }
}

struct Harness {
    client: Arc<InMemoryLiveClient>,
    store: Arc<MemoryStateStore>,
    runs: Arc<MemoryRunStore>,
    executor: Executor,
}

fn harness(config: ExecutorConfig) -> Harness {
    harness_with_client(InMemoryLiveClient::new(), config)
}

fn harness_with_client(client: InMemoryLiveClient, config: ExecutorConfig) -> Harness {
    let client = Arc::new(client);
    let store = Arc::new(MemoryStateStore::new());
    let runs = Arc::new(MemoryRunStore::new());
    let executor = Executor::new(client.clone(), store.clone(), runs.clone()).with_config(config);
    Harness {
        client,
        store,
        runs,
        executor,
    }
}

impl Harness {
    async fn plan(&self, decls: Vec<ResourceDecl>) -> (ChangeSet, StateSnapshot) {
        let snapshot = self.store.load(ENV).await.unwrap();
        let change_set = diff(&graph(decls), &snapshot).unwrap();
        (change_set, snapshot)
    }
}

/// Snapshot content without timestamps or remote ids
fn content(snapshot: &StateSnapshot) -> BTreeMap<String, (Attributes, Vec<ResourceAddress>)> {
    snapshot
        .records()
        .map(|r| {
            (
                r.address.to_string(),
                (r.attributes.clone(), r.depends_on.clone()),
            )
        })
        .collect()
}

#[tokio::test]
async fn test_demo_scenario_end_to_end() {
    let h = harness(config(4));
    let (change_set, snapshot) = h.plan(demo()).await;
    let order: Vec<String> = change_set.entries.iter().map(|e| e.to_string()).collect();
    assert_eq!(order, vec!["+ project:DEMO", "+ dataset:DEMO.TEST_DATA"]);

    let result = h.executor.apply(&change_set, snapshot).await.unwrap();
    assert_eq!(result.state, RunState::Completed);
    assert_eq!(result.succeeded(), 2);
    assert!(result.failures.is_empty());

    let persisted = h.store.load(ENV).await.unwrap();
    assert_eq!(persisted.version, 1);
    assert_eq!(persisted.len(), 2);
    assert!(h.client.get(&ResourceAddress::dataset("DEMO", "TEST_DATA")).is_some());

    // Completed runs clean up their checkpoint but keep the run record
    assert!(h.runs.load_checkpoint(ENV, &result.run_id).await.unwrap().is_none());
    let record = h.executor.run_record(&result.run_id).await.unwrap().unwrap();
    assert_eq!(record.state, RunState::Completed);
    assert_eq!(record.completed, vec![0, 1]);

    // Re-planning the same configuration yields nothing to do
    let (again, _) = h.plan(demo()).await;
    assert!(again.is_empty());
    assert_eq!(again.base_version, 1);
}

#[tokio::test]
async fn test_noop_only_apply_keeps_version() {
    let h = harness(config(2));
    assert!(h.store.load(ENV).await.unwrap().last_sync.is_none());

    let (change_set, snapshot) = h.plan(demo()).await;
    h.executor.apply(&change_set, snapshot).await.unwrap();
    let applied = h.store.load(ENV).await.unwrap();
    assert_eq!(applied.version, 1);
    let synced = applied.last_sync.expect("last sync recorded after apply");

    let snapshot = h.store.load(ENV).await.unwrap();
    let options = PlanOptions { include_noop: true };
    let change_set = diff_with_options(&graph(demo()), &snapshot, &options).unwrap();
    assert!(change_set.entries.iter().all(|e| e.action == ActionType::NoOp));
    assert_eq!(change_set.len(), 2);

    let mutations = h.client.mutation_count();
    let result = h.executor.apply(&change_set, snapshot).await.unwrap();
    assert!(result.is_success());
    assert_eq!(h.client.mutation_count(), mutations);

    let after = h.store.load(ENV).await.unwrap();
    assert_eq!(after.version, 1);
    assert_eq!(after.last_sync, Some(synced));
    let record = h.executor.run_record(&result.run_id).await.unwrap().unwrap();
    assert_eq!(record.final_version, Some(1));

    // A plan made before the no-op run is still current
    let (replan, current) = h.plan(demo()).await;
    assert!(replan.is_empty());
    assert_eq!(current.version, 1);
}

#[tokio::test]
async fn test_dependency_only_change_is_recorded() {
    let h = harness(config(2));
    let a = ResourceAddress::dataset("DEMO", "A");
    let b = ResourceAddress::dataset("DEMO", "B");
    let r = ResourceAddress::dataset("DEMO", "R");
    let decls = |input: &ResourceAddress, with_b: bool| {
        let mut decls = vec![
            ResourceDecl::new(ResourceAddress::project("DEMO")),
            ResourceDecl::new(a.clone()).with_attribute("path", json!("/a")),
            ResourceDecl::new(r.clone())
                .with_attribute("path", json!("/r"))
                .with_dependency(input.clone()),
        ];
        if with_b {
            decls.push(ResourceDecl::new(b.clone()).with_attribute("path", json!("/b")));
        }
        decls
    };

    let (change_set, snapshot) = h.plan(decls(&a, true)).await;
    h.executor.apply(&change_set, snapshot).await.unwrap();

    // Same attributes, new input: an update with nothing to send
    let (change_set, snapshot) = h.plan(decls(&b, true)).await;
    assert_eq!(change_set.len(), 1);
    let entry = &change_set.entries[0];
    assert_eq!(entry.action, ActionType::Update);
    assert_eq!(entry.address, r);
    assert!(entry.diff.is_empty());

    let mutations = h.client.mutation_count();
    let run = h.executor.apply(&change_set, snapshot).await.unwrap();
    assert!(run.is_success());
    assert_eq!(h.client.mutation_count(), mutations);
    let persisted = h.store.load(ENV).await.unwrap();
    assert_eq!(persisted.version, 2);
    let recorded = persisted.get(&r).unwrap();
    assert!(recorded.depends_on.contains(&b));
    assert!(!recorded.depends_on.contains(&a));
    assert!(recorded.remote_id.is_some());
    assert!(h.plan(decls(&b, true)).await.0.is_empty());

    // Dropping both: the dependent goes first
    let (change_set, _) = h.plan(vec![
        ResourceDecl::new(ResourceAddress::project("DEMO")),
        ResourceDecl::new(a.clone()).with_attribute("path", json!("/a")),
    ])
    .await;
    let position = |address: &ResourceAddress| {
        change_set
            .entries
            .iter()
            .position(|e| &e.address == address && e.action == ActionType::Delete)
            .unwrap()
    };
    let (delete_r, delete_b) = (position(&r), position(&b));
    assert!(delete_r < delete_b);
    assert!(change_set.entries[delete_b].depends_on.contains(&delete_r));

    // Undoing the refresh restores the old input without touching DSS
    let rollback = h.executor.rollback(&run.run_id).await.unwrap();
    assert_eq!(rollback.rolled_back, vec![0]);
    assert_eq!(h.client.mutation_count(), mutations);
    let restored = h.store.load(ENV).await.unwrap();
    assert!(restored.get(&r).unwrap().depends_on.contains(&a));
}

#[tokio::test]
async fn test_stale_plan_is_rejected_before_mutation() {
    let h = harness(config(4));
    let (change_set, snapshot) = h.plan(demo()).await;
    h.executor.apply(&change_set, snapshot.clone()).await.unwrap();
    let mutations = h.client.mutation_count();

    // Same plan and snapshot again: the store has moved on
    let err = h.executor.apply(&change_set, snapshot).await.unwrap_err();
    assert!(matches!(
        err,
        ApplyError::Plan(PlanError::StalePlan {
            planned: 0,
            current: 1,
            ..
        })
    ));

    // Plan computed against an older snapshot than the one given
    let fresh = h.store.load(ENV).await.unwrap();
    let err = h.executor.apply(&change_set, fresh).await.unwrap_err();
    assert!(matches!(err, ApplyError::Plan(PlanError::StalePlan { .. })));

    assert_eq!(h.client.mutation_count(), mutations);
}

#[tokio::test]
async fn test_transient_errors_are_retried() {
    let h = harness(config(4));
    let demo_addr = ResourceAddress::project("DEMO");
    for _ in 0..2 {
        h.client.fail_next(
            &demo_addr,
            LiveOperation::Create,
            ClientError::Transient("503 Service Unavailable".into()),
        );
    }

    let (change_set, snapshot) = h.plan(demo()).await;
    let result = h.executor.apply(&change_set, snapshot).await.unwrap();
    assert!(result.is_success());
    assert_eq!(result.entries[0].attempts, 3);
    assert_eq!(result.entries[1].attempts, 1);
}

#[tokio::test]
async fn test_retry_limit_fails_entry_as_transient() {
    let h = harness(config(4));
    let demo_addr = ResourceAddress::project("DEMO");
    for _ in 0..3 {
        h.client.fail_next(
            &demo_addr,
            LiveOperation::Create,
            ClientError::Transient("429".into()),
        );
    }

    let (change_set, snapshot) = h.plan(demo()).await;
    let result = h.executor.apply(&change_set, snapshot).await.unwrap();
    assert_eq!(result.state, RunState::PartiallyFailed);
    assert_eq!(result.failures[0].kind, FailureKind::Transient);
    assert_eq!(result.failures[0].attempts, 3);
    // The dependent dataset never started
    assert_eq!(result.entries[1].status, EntryStatus::Skipped);
}

#[tokio::test]
async fn test_permanent_failure_then_resume() {
    let h = harness(config(4));
    let dataset = ResourceAddress::dataset("DEMO", "TEST_DATA");
    h.client.fail_next(
        &dataset,
        LiveOperation::Create,
        ClientError::Permanent("400 invalid connection".into()),
    );

    let (change_set, snapshot) = h.plan(demo()).await;
    let result = h.executor.apply(&change_set, snapshot).await.unwrap();
    assert_eq!(result.state, RunState::PartiallyFailed);
    assert_eq!(result.failures.len(), 1);
    let failure = &result.failures[0];
    assert_eq!(failure.index, 1);
    assert_eq!(failure.address, dataset);
    assert_eq!(failure.kind, FailureKind::Permanent);
    assert_eq!(failure.attempts, 1);
    assert!(failure.to_string().contains("dataset:DEMO.TEST_DATA"));

    // What succeeded is persisted and checkpointed
    let persisted = h.store.load(ENV).await.unwrap();
    assert_eq!(persisted.version, 1);
    assert!(persisted.contains(&ResourceAddress::project("DEMO")));
    let checkpoint = h
        .runs
        .load_checkpoint(ENV, &result.run_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(checkpoint.last_completed, Some(0));
    assert_eq!(checkpoint.run_state, RunState::PartiallyFailed);

    let resumed = h.executor.resume(&result.run_id).await.unwrap();
    assert_eq!(resumed.state, RunState::Completed);
    assert_eq!(resumed.run_id, result.run_id);
    // Only the dataset was created again
    let creates = h
        .client
        .calls()
        .into_iter()
        .filter(|(op, _)| *op == LiveOperation::Create)
        .count();
    assert_eq!(creates, 3);
    assert_eq!(h.store.load(ENV).await.unwrap().len(), 2);

    // A completed run has nothing left to resume
    let err = h.executor.resume(&result.run_id).await.unwrap_err();
    assert!(matches!(
        err,
        ApplyError::NothingToResume {
            state: RunState::Completed,
            ..
        }
    ));
}

#[tokio::test]
async fn test_resume_from_every_failure_point_matches_uninterrupted_run() {
    let decls = project_with_datasets(4);

    let reference = {
        let h = harness(config(1));
        let (change_set, snapshot) = h.plan(decls.clone()).await;
        let result = h.executor.apply(&change_set, snapshot).await.unwrap();
        assert!(result.is_success());
        content(&h.store.load(ENV).await.unwrap())
    };

    for k in 0..5 {
        let h = harness(config(1));
        let (change_set, snapshot) = h.plan(decls.clone()).await;
        let failing = change_set.entries[k].address.clone();
        h.client.fail_next(
            &failing,
            LiveOperation::Create,
            ClientError::Permanent("injected".into()),
        );

        let first = h.executor.apply(&change_set, snapshot).await.unwrap();
        assert_eq!(first.state, RunState::PartiallyFailed, "k = {k}");

        let checkpoint = h
            .runs
            .load_checkpoint(ENV, &first.run_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(checkpoint.last_completed, k.checked_sub(1), "k = {k}");
        assert_eq!(checkpoint.completed, (0..k).collect::<Vec<_>>());

        let resumed = h.executor.resume(&first.run_id).await.unwrap();
        assert!(resumed.is_success(), "k = {k}");
        // Entries before k are never re-applied
        for entry in &resumed.entries[..k] {
            assert_eq!(entry.attempts, 1, "k = {k}");
        }
        assert_eq!(content(&h.store.load(ENV).await.unwrap()), reference, "k = {k}");
    }
}

#[tokio::test]
async fn test_cancel_before_start_aborts_without_mutation() {
    let h = harness(config(2));
    let (change_set, snapshot) = h.plan(demo()).await;

    let cancel = CancelHandle::new();
    cancel.cancel();
    let result = h
        .executor
        .apply_with_cancel(&change_set, snapshot, &cancel)
        .await
        .unwrap();
    assert_eq!(result.state, RunState::Aborted);
    assert_eq!(result.skipped(), 2);
    assert_eq!(h.client.mutation_count(), 0);
    assert_eq!(h.store.load(ENV).await.unwrap().version, 0);

    let resumed = h.executor.resume(&result.run_id).await.unwrap();
    assert!(resumed.is_success());
}

#[tokio::test]
async fn test_cancel_lets_running_entry_finish() {
    let h = harness_with_client(
        InMemoryLiveClient::new().with_latency(Duration::from_millis(150)),
        config(1),
    );
    let (change_set, snapshot) = h.plan(independent_projects(3)).await;

    let cancel = CancelHandle::new();
    let (result, _) = tokio::join!(
        h.executor.apply_with_cancel(&change_set, snapshot, &cancel),
        async {
            tokio::time::sleep(Duration::from_millis(40)).await;
            cancel.cancel();
        }
    );
    let result = result.unwrap();
    assert_eq!(result.state, RunState::Aborted);
    assert_eq!(result.succeeded(), 1);
    assert_eq!(result.skipped(), 2);

    let checkpoint = h
        .runs
        .load_checkpoint(ENV, &result.run_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(checkpoint.run_state, RunState::Aborted);
    assert_eq!(checkpoint.completed, vec![0]);

    h.client.set_latency(None);
    let resumed = h.executor.resume(&result.run_id).await.unwrap();
    assert!(resumed.is_success());
    assert_eq!(h.client.addresses().len(), 3);
}

#[tokio::test]
async fn test_entry_timeout() {
    let h = harness_with_client(
        InMemoryLiveClient::new().with_latency(Duration::from_millis(500)),
        ExecutorConfig {
            entry_timeout: Duration::from_millis(50),
            ..config(1)
        },
    );
    let (change_set, snapshot) = h.plan(independent_projects(1)).await;

    let result = h.executor.apply(&change_set, snapshot).await.unwrap();
    assert_eq!(result.state, RunState::PartiallyFailed);
    assert_eq!(result.failures[0].kind, FailureKind::Timeout);
    assert_eq!(result.entries[0].status, EntryStatus::Failed);
}

#[tokio::test]
async fn test_worker_pool_bounds_concurrency() {
    let h = harness_with_client(
        InMemoryLiveClient::new().with_latency(Duration::from_millis(40)),
        config(2),
    );
    let (change_set, snapshot) = h.plan(independent_projects(6)).await;
    let result = h.executor.apply(&change_set, snapshot).await.unwrap();
    assert!(result.is_success());
    assert_eq!(h.client.peak_concurrency(), 2);
}

#[tokio::test]
async fn test_dependents_wait_for_prerequisites() {
    let h = harness_with_client(
        InMemoryLiveClient::new().with_latency(Duration::from_millis(20)),
        config(8),
    );
    let (change_set, snapshot) = h.plan(project_with_datasets(3)).await;
    let result = h.executor.apply(&change_set, snapshot).await.unwrap();
    assert!(result.is_success());

    let calls = h.client.calls();
    assert_eq!(calls[0].1, ResourceAddress::project("DEMO"));
    // The three datasets ran side by side once the project existed
    assert_eq!(h.client.peak_concurrency(), 3);
}

#[tokio::test]
async fn test_rollback_restores_previous_state() {
    let h = harness(config(2));

    let first = vec![
        ResourceDecl::new(ResourceAddress::project("DEMO")).with_attribute("name", json!("Old")),
        ResourceDecl::new(ResourceAddress::dataset("DEMO", "LEGACY"))
            .with_attribute("type", json!("Filesystem")),
    ];
    let (change_set, snapshot) = h.plan(first).await;
    h.executor.apply(&change_set, snapshot).await.unwrap();
    let before = content(&h.store.load(ENV).await.unwrap());
    let live_before = h.client.addresses();

    let second = vec![
        ResourceDecl::new(ResourceAddress::project("DEMO")).with_attribute("name", json!("New")),
        ResourceDecl::new(ResourceAddress::dataset("DEMO", "FRESH"))
            .with_attribute("type", json!("S3")),
    ];
    let (change_set, snapshot) = h.plan(second).await;
    let actions: Vec<ActionType> = change_set.entries.iter().map(|e| e.action).collect();
    assert_eq!(
        actions,
        vec![ActionType::Update, ActionType::Create, ActionType::Delete]
    );
    let run = h.executor.apply(&change_set, snapshot).await.unwrap();
    assert!(run.is_success());

    let rollback = h.executor.rollback(&run.run_id).await.unwrap();
    assert_eq!(rollback.rolled_back.len(), 3);

    let after = h.store.load(ENV).await.unwrap();
    assert_eq!(content(&after), before);
    assert_eq!(rollback.snapshot_version, after.version);
    assert_eq!(h.client.addresses(), live_before);
    assert_eq!(
        h.client.get(&ResourceAddress::project("DEMO")).unwrap().attributes["name"],
        json!("Old")
    );

    // Rolled-back runs cannot be resumed, and a second rollback is a no-op
    assert!(matches!(
        h.executor.resume(&run.run_id).await,
        Err(ApplyError::NothingToResume { .. })
    ));
    let again = h.executor.rollback(&run.run_id).await.unwrap();
    assert!(again.rolled_back.is_empty());
}

#[tokio::test]
async fn test_partial_rollback_reports_remaining_entries() {
    let h = harness(config(1));
    let (change_set, snapshot) = h.plan(project_with_datasets(2)).await;
    let run = h.executor.apply(&change_set, snapshot).await.unwrap();
    assert!(run.is_success());

    // Undo order is DS_1, DS_0, DEMO; make DS_0 fail
    let ds0 = ResourceAddress::dataset("DEMO", "DS_0");
    h.client
        .fail_next(&ds0, LiveOperation::Delete, ClientError::Permanent("403".into()));

    match h.executor.rollback(&run.run_id).await {
        Err(ApplyError::PartialRollback {
            failure, remaining, ..
        }) => {
            assert_eq!(failure.address, ds0);
            assert_eq!(remaining, vec![1, 0]);
        }
        other => panic!("Expected PartialRollback, got {:?}", other),
    }
    // The first undo stuck
    assert!(h.client.get(&ResourceAddress::dataset("DEMO", "DS_1")).is_none());
    assert_eq!(h.store.load(ENV).await.unwrap().len(), 2);

    let rest = h.executor.rollback(&run.run_id).await.unwrap();
    assert_eq!(rest.rolled_back, vec![1, 0]);
    assert!(h.client.addresses().is_empty());
    assert!(h.store.load(ENV).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_run() {
    let h = harness(config(1));
    assert!(matches!(
        h.executor.resume("nope").await,
        Err(ApplyError::RunNotFound(_))
    ));
    assert!(matches!(
        h.executor.rollback("nope").await,
        Err(ApplyError::RunNotFound(_))
    ));
}

#[tokio::test]
async fn test_resume_across_executors_with_file_stores() {
    let temp_dir = tempfile::tempdir().unwrap();
    let client = Arc::new(InMemoryLiveClient::new());
    let new_executor = || {
        Executor::new(
            client.clone(),
            Arc::new(FileStateStore::new(temp_dir.path())),
            Arc::new(FileRunStore::new(temp_dir.path())),
        )
        .with_config(config(1))
    };

    let store = FileStateStore::new(temp_dir.path());
    let snapshot = store.load(ENV).await.unwrap();
    let change_set = diff(&graph(project_with_datasets(2)), &snapshot).unwrap();

    client.fail_next(
        &ResourceAddress::dataset("DEMO", "DS_1"),
        LiveOperation::Create,
        ClientError::Permanent("injected".into()),
    );
    let first = new_executor().apply(&change_set, snapshot).await.unwrap();
    assert_eq!(first.state, RunState::PartiallyFailed);
    assert!(
        temp_dir
            .path()
            .join(format!("dev/runs/{}/checkpoint.json", first.run_id))
            .exists()
    );

    // A fresh executor finds the run on disk
    let resumed = new_executor().resume(&first.run_id).await.unwrap();
    assert!(resumed.is_success());
    assert_eq!(store.load(ENV).await.unwrap().len(), 3);
    assert!(
        !temp_dir
            .path()
            .join(format!("dev/runs/{}/checkpoint.json", first.run_id))
            .exists()
    );
    assert!(
        FileRunStore::new(temp_dir.path())
            .load_run(&first.run_id)
            .await
            .unwrap()
            .is_some()
    );
}
