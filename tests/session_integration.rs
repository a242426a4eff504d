//! Session integration tests: config → runtime → session channels → SQLite.

use livedoc_core::protocol::apply_patch;
use livedoc_core::session::SessionHandle;
use livedoc_core::state::{BlockDescriptor, BlockRole, Page, PageConfig};
use livedoc_core::{Config, Runtime};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::path::Path;
use tokio_util::sync::CancellationToken;

fn seed_database(path: &Path) {
    let conn = rusqlite::Connection::open(path).unwrap();
    conn.execute_batch(
        "CREATE TABLE tasks (id INTEGER PRIMARY KEY, title TEXT NOT NULL);
         INSERT INTO tasks (id, title) VALUES (1, 'write docs'), (2, 'ship'), (3, 'celebrate');",
    )
    .unwrap();
}

fn config(db: &Path) -> Config {
    let yaml = format!(
        r#"
runtime:
  operator: alice
retry:
  max_retries: 0
sources:
  tasks:
    type: sql
    dsn: "{}"
    query: SELECT id, title FROM tasks ORDER BY id
actions:
  complete:
    kind: sql
    source: tasks
    statement: DELETE FROM tasks WHERE id = :id
    params:
      id:
        required: true
  cleanup:
    kind: exec
    cmd: rm -f /tmp/livedoc-never-runs
"#,
        db.display()
    );
    Config::from_yaml_str(&yaml).unwrap()
}

fn page() -> Page {
    Page {
        title: "Release checklist".into(),
        blocks: vec![
            BlockDescriptor::new("tasks", BlockRole::Interactive)
                .with_attr("kind", "source")
                .with_attr("source", "tasks")
                .with_attr("actions", "complete,cleanup"),
            BlockDescriptor::new("intro", BlockRole::ClientModule),
        ],
        config: PageConfig {
            multi_step: true,
            step_count: 3,
        },
        ..Page::default()
    }
}

async fn recv(handle: &mut SessionHandle) -> Value {
    let text = handle.outbound.recv().await.unwrap();
    serde_json::from_str(&text).unwrap()
}

async fn send(handle: &SessionHandle, message: Value) {
    handle.inbound.send(message.to_string()).await.unwrap();
}

#[tokio::test]
async fn test_source_block_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("tasks.db");
    seed_database(&db);

    let runtime = Runtime::from_config(&config(&db)).unwrap();
    let mut handle = runtime.session(&page()).unwrap().spawn(CancellationToken::new());

    let page_snapshot = recv(&mut handle).await;
    assert_eq!(page_snapshot["blockID"], "_page");
    assert_eq!(page_snapshot["tree"]["full"]["currentStep"], 0);

    let table = recv(&mut handle).await;
    assert_eq!(table["blockID"], "tasks");
    let mut tree = table["tree"]["full"].clone();
    assert_eq!(
        tree["rows"],
        json!([
            {"id": 1, "title": "write docs"},
            {"id": 2, "title": "ship"},
            {"id": 3, "title": "celebrate"}
        ])
    );

    send(&handle, json!({"blockID": "tasks", "action": "complete", "data": {"id": 2}})).await;
    let response = recv(&mut handle).await;
    assert_eq!(response["meta"]["success"], true);
    assert_eq!(response["meta"]["result"], json!({"kind": "sql", "rows_affected": 1}));
    tree = apply_patch(&tree, &response["tree"]).unwrap();
    assert_eq!(
        tree["rows"],
        json!([
            {"id": 1, "title": "write docs"},
            {"id": 3, "title": "celebrate"}
        ])
    );

    send(&handle, json!({"blockID": "tasks", "action": "complete", "data": {"id": ""}})).await;
    let response = recv(&mut handle).await;
    assert_eq!(response["meta"]["success"], false);
    assert_eq!(response["meta"]["error"], "missing required parameter: id");

    send(&handle, json!({"blockID": "tasks", "action": "cleanup"})).await;
    let response = recv(&mut handle).await;
    assert_eq!(response["meta"]["success"], false);
    assert_eq!(response["meta"]["error"], "exec actions disabled (use --allow-exec flag)");
    assert_eq!(response["meta"]["code"], "INVALID_CONFIG");

    drop(handle.inbound);
    let stats = handle.task.await.unwrap();
    assert_eq!(stats.processed, 3);
    assert_eq!(stats.failed, 2);
    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_page_navigation_over_channels() {
    let runtime = Runtime::from_config(&Config::default()).unwrap();
    let page = Page {
        title: "Tutorial".into(),
        config: PageConfig {
            multi_step: true,
            step_count: 2,
        },
        ..Page::default()
    };
    let mut handle = runtime.session(&page).unwrap().spawn(CancellationToken::new());
    let mut tree = recv(&mut handle).await["tree"]["full"].clone();

    for action in ["nextStep", "nextStep", "prevStep", "nextStep"] {
        send(&handle, json!({"blockID": "_page", "action": action})).await;
        let response = recv(&mut handle).await;
        assert_eq!(response["meta"]["success"], true);
        tree = apply_patch(&tree, &response["tree"]).unwrap();
    }
    assert_eq!(tree["currentStep"], 1);
    assert_eq!(tree["completedSteps"], json!([0]));

    send(
        &handle,
        json!({"blockID": "_page", "action": "saveCodeEdit", "data": {"blockID": "editor", "code": "fn main() {}"}}),
    )
    .await;
    let response = recv(&mut handle).await;
    tree = apply_patch(&tree, &response["tree"]).unwrap();
    assert_eq!(tree["codeEdits"], json!({"editor": "fn main() {}"}));
}

#[tokio::test]
async fn test_unknown_block_keeps_session_alive() {
    let runtime = Runtime::from_config(&Config::default()).unwrap();
    let mut handle = runtime
        .session(&Page::default())
        .unwrap()
        .spawn(CancellationToken::new());
    recv(&mut handle).await;

    send(&handle, json!({"blockID": "nope", "action": "refresh"})).await;
    let response = recv(&mut handle).await;
    assert_eq!(response["blockID"], "nope");
    assert_eq!(response["meta"]["error"], "unknown block: nope");
    assert_eq!(response["meta"]["code"], "NOT_FOUND");

    send(&handle, json!({"blockID": "_page", "action": "prevStep"})).await;
    assert_eq!(recv(&mut handle).await["meta"]["success"], true);
}
