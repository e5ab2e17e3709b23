//! End-to-end repository scenarios: linear write/read, concurrent edit
//! merge, crash recovery from a torn log tail, incremental queries over
//! live edits, and signature rejection at the persistence boundary.

use std::sync::Arc;

use goatdb::config::{Context, RepoOptions};
use goatdb::errors::QueryError;
use goatdb::internal::commit::{Commit, CommitContents};
use goatdb::internal::item::Item;
use goatdb::internal::schema::{FieldSpec, Schema, SchemaRegistry};
use goatdb::internal::value::{Value, ValueKind};
use goatdb::query::{Query, QueryContext, QueryDef};
use goatdb::repo::Repository;
use goatdb::trust::{LocalIdentity, TrustPool, now_ms};

const HOUR: i64 = 3_600_000;

fn task_registry() -> Arc<SchemaRegistry> {
    let schemas = Arc::new(SchemaRegistry::new());
    schemas
        .register(
            Schema::new("task", 1)
                .field("text", FieldSpec::new(ValueKind::Str))
                .field(
                    "done",
                    FieldSpec::new(ValueKind::Bool).with_default(Value::Bool(false)),
                ),
        )
        .unwrap();
    schemas
}

fn context() -> Context {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let identity = LocalIdentity::generate(None, HOUR, now_ms()).unwrap();
    Context::new(task_registry(), Arc::new(TrustPool::new(identity)))
}

async fn open(dir: &tempfile::TempDir, ctx: &Context) -> Repository {
    Repository::open(
        dir.path().join("commits.log"),
        RepoOptions::default(),
        ctx.clone(),
    )
    .await
    .unwrap()
}

fn task(ctx: &Context, text: &str, done: bool) -> Item {
    let schema = ctx.schemas.get("task", 1).unwrap();
    let mut item = Item::new(schema);
    item.set("text", Value::Str(text.to_string())).unwrap();
    item.set("done", Value::Bool(done)).unwrap();
    item
}

/// S1: create an item, read it back, head set has one commit.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn linear_write_read() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context();
    let mut repo = open(&dir, &ctx).await;

    let input = task(&ctx, "a", false);
    let head = repo.set_value_for_key("/t/1", &input, None).await.unwrap();

    let (value, value_head) = repo.value_for_key("/t/1").await.unwrap().unwrap();
    assert!(value.equals(&input));
    assert_eq!(value_head, head);
    assert_eq!(repo.graph().leaves("/t/1"), vec![head]);
}

/// S2: two sessions fork from the same head; both edits survive the merge
/// and exactly one synthetic merge commit carries both parents.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_edit_merge() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context();
    let mut repo = open(&dir, &ctx).await;

    let h0 = repo
        .set_value_for_key("/t/1", &task(&ctx, "a", false), None)
        .await
        .unwrap();
    let x = repo
        .set_value_for_key("/t/1", &task(&ctx, "b", false), Some(h0))
        .await
        .unwrap();
    let y = repo
        .set_value_for_key("/t/1", &task(&ctx, "a", true), Some(h0))
        .await
        .unwrap();

    let (merged, head) = repo.value_for_key("/t/1").await.unwrap().unwrap();
    assert_eq!(merged.get("text"), Some(&Value::Str("b".into())));
    assert_eq!(merged.get("done"), Some(&Value::Bool(true)));

    let merge_commit = repo.graph().get(&head).unwrap();
    let mut parents = merge_commit.parents.clone();
    parents.sort();
    let mut expected = vec![x, y];
    expected.sort();
    assert_eq!(parents, expected);
    assert_eq!(repo.graph().leaves("/t/1").len(), 1);
}

/// S4: five commits, the last torn mid-bytes; reopening yields four and the
/// log stays writable and durable.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn log_partial_tail_recovery() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context();
    let log_path = dir.path().join("commits.log");

    {
        let mut repo = open(&dir, &ctx).await;
        for i in 0..5 {
            repo.set_value_for_key(&format!("/t/{i}"), &task(&ctx, &format!("t{i}"), false), None)
                .await
                .unwrap();
        }
        repo.close().await.unwrap();
    }

    // Tear the final record.
    let len = std::fs::metadata(&log_path).unwrap().len();
    let file = std::fs::OpenOptions::new()
        .write(true)
        .open(&log_path)
        .unwrap();
    file.set_len(len - 7).unwrap();

    let mut repo = open(&dir, &ctx).await;
    assert_eq!(repo.stats().commits, 4);
    assert!(repo.value_for_key("/t/4").await.unwrap().is_none());

    // The next append succeeds and survives another reopen.
    repo.set_value_for_key("/t/5", &task(&ctx, "t5", false), None)
        .await
        .unwrap();
    repo.flush().await.unwrap();
    repo.close().await.unwrap();

    let mut reopened = open(&dir, &ctx).await;
    assert_eq!(reopened.stats().commits, 5);
    assert!(reopened.value_for_key("/t/5").await.unwrap().is_some());
}

/// S5: open-task query over live edits; results shrink when a task flips
/// done and the processed age strictly increases.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn query_incremental_over_edits() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context();
    let mut repo = open(&dir, &ctx).await;

    repo.set_value_for_key("/t/1", &task(&ctx, "beta", false), None)
        .await
        .unwrap();
    repo.set_value_for_key("/t/2", &task(&ctx, "alpha", false), None)
        .await
        .unwrap();
    repo.set_value_for_key("/t/3", &task(&ctx, "gamma", true), None)
        .await
        .unwrap();

    let mut query = Query::new(QueryDef {
        namespace: Some("task".to_string()),
        predicate: Box::new(|item, _| item.get("done") == Some(&Value::Bool(false))),
        predicate_source: "done == false".to_string(),
        sort_key: Some(Box::new(|item| {
            item.get("text").cloned().unwrap_or(Value::Null)
        })),
        sort_source: "text".to_string(),
        ctx: QueryContext::default(),
        limit: None,
    });
    query.refresh(&mut repo).await.unwrap();
    let age_after_first = query.last_processed_age();

    let keys: Vec<String> = query.results().into_iter().map(|(k, _)| k).collect();
    assert_eq!(keys, vec!["/t/2".to_string(), "/t/1".to_string()]);

    let head = repo.head_for_key("/t/2").await.unwrap();
    repo.set_value_for_key("/t/2", &task(&ctx, "alpha", true), head)
        .await
        .unwrap();
    query.refresh(&mut repo).await.unwrap();

    let keys: Vec<String> = query.results().into_iter().map(|(k, _)| k).collect();
    assert_eq!(keys, vec!["/t/1".to_string()]);
    assert!(query.last_processed_age() > age_after_first);
}

/// S6: a commit whose signature does not verify leaves graph and log
/// untouched.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn signature_rejection() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context();
    let mut repo = open(&dir, &ctx).await;

    let item = task(&ctx, "a", false);
    let mut commit = Commit::new(
        "/t/1",
        ctx.trust.local().session_id(),
        now_ms(),
        "0.7.0",
        vec![],
        CommitContents::Snapshot(item.to_snapshot().unwrap()),
    );
    ctx.trust.sign_commit(&mut commit);
    // Corrupt the signature bytes.
    if let Some(envelope) = commit.signature.as_mut() {
        envelope.signature = envelope.signature.chars().rev().collect();
    }

    assert_eq!(repo.persist_commits(vec![commit], true).await.unwrap(), 0);
    assert_eq!(repo.stats().commits, 0);
    assert_eq!(repo.stats().log_records, 0);
}

/// A persisted query cache referencing heads a repository never saw is
/// rejected, forcing a clean rescan.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stale_query_cache_forces_rescan() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context();
    let mut repo = open(&dir, &ctx).await;
    repo.set_value_for_key("/t/1", &task(&ctx, "a", false), None)
        .await
        .unwrap();

    let def = || QueryDef {
        namespace: Some("task".to_string()),
        predicate: Box::new(|_, _| true),
        predicate_source: "all".to_string(),
        sort_key: None,
        sort_source: String::new(),
        ctx: QueryContext::default(),
        limit: None,
    };
    let mut query = Query::new(def());
    query.refresh(&mut repo).await.unwrap();
    let cache_path = dir.path().join("query.cache");
    query.save_cache(&cache_path).unwrap();

    let other_dir = tempfile::tempdir().unwrap();
    let other_ctx = context();
    let mut fresh_repo = Repository::open(
        other_dir.path().join("commits.log"),
        RepoOptions::default(),
        other_ctx.clone(),
    )
    .await
    .unwrap();

    let mut resumed = Query::new(def());
    assert!(matches!(
        resumed.load_cache(&cache_path, &fresh_repo),
        Err(QueryError::CacheInvalid(_))
    ));

    // The rescan still works from scratch.
    fresh_repo
        .set_value_for_key("/t/9", &task(&other_ctx, "z", false), None)
        .await
        .unwrap();
    resumed.refresh(&mut fresh_repo).await.unwrap();
    assert_eq!(resumed.results().len(), 1);
}
