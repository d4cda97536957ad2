//! End-to-end lifecycle against real collaborator implementations: a
//! shell stand-in for the engine binary, wiremock for the store's HTTP
//! exec endpoint, and a local TCP sink for the influx-line inserts.

#![cfg(unix)]
#![allow(clippy::unwrap_used)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use monitord_core::engine::tool::EngineCli;
use monitord_core::monitor::{Monitor, MonitorConfig};
use monitord_core::planner::PolicyChangeRequest;
use monitord_core::store::gateway::QuestDbGateway;
use monitord_core::watermark::Barrier;
use monitord_protocol::{DbParams, RawEventDocument};
use tokio::io::AsyncReadExt;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Engine stand-in covering both the one-shot tool modes and the
/// streaming mode.
const FAKE_ENGINE: &str = r###"#!/bin/sh
case "$1" in
  -check) echo "The analyzed formula is monitorable."; exit 0 ;;
  -sql) echo 'create table "P" (x1 long, tp_index long, timestamp timestamp);'; exit 0 ;;
  -sql_drop) echo 'drop table "P";'; exit 0 ;;
  -sig_to_json) echo '{"P":["int"]}'; exit 0 ;;
  -get_relative_intervals) echo 'P: [0,60)'; exit 0 ;;
esac
replay=""
while [ $# -gt 0 ]; do
  case "$1" in
    -replay) replay="$2"; shift 2 ;;
    *) shift ;;
  esac
done
if [ -n "$replay" ]; then
  echo "## replay complete, awaiting live input ##"
fi
while IFS= read -r line; do
  case "$line" in
    "> save_and_exit "*)
      p="${line#"> save_and_exit "}"
      p="${p% <}"
      echo "state" > "$p"
      exit 0
      ;;
    *)
      echo "verdict: true"
      echo "## end of response ##"
      ;;
  esac
done
"###;

fn install_fake_engine(dir: &Path) -> PathBuf {
    let path = dir.join("engine");
    std::fs::write(&path, FAKE_ENGINE).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

/// Accepts influx-line connections and collects everything written.
async fn ilp_sink() -> (u16, Arc<Mutex<String>>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let collected = Arc::new(Mutex::new(String::new()));
    let sink = Arc::clone(&collected);
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let sink = Arc::clone(&sink);
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = socket.read_to_string(&mut buf).await;
                sink.lock().unwrap().push_str(&buf);
            });
        }
    });
    (port, collected)
}

async fn mount_exec_mocks(server: &MockServer) {
    let ddl = ResponseTemplate::new(200).set_body_json(serde_json::json!({"ddl": "OK"}));
    for statement in [
        "create table \"P\" (x1 long, tp_index long, timestamp timestamp)",
        "create table if not exists \"timepoint_index\" (idx long, \"timestamp\" timestamp) timestamp(\"timestamp\")",
        "drop table \"P\"",
        "drop table if exists \"timepoint_index\"",
    ] {
        Mock::given(method("GET"))
            .and(path("/exec"))
            .and(query_param("query", statement))
            .respond_with(ddl.clone())
            .mount(server)
            .await;
    }
    // Watermark probe: always caught up at index 2.
    Mock::given(method("GET"))
        .and(path("/exec"))
        .and(query_param(
            "query",
            "select max(idx) from \"timepoint_index\"",
        ))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "columns": [{"name": "max", "type": "LONG"}],
            "dataset": [[2]],
            "count": 1
        })))
        .mount(server)
        .await;
    // Naive replay full select over P: one stored row.
    Mock::given(method("GET"))
        .and(path("/exec"))
        .and(query_param(
            "query",
            "select * from \"P\" order by \"tp_index\"",
        ))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "columns": [
                {"name": "x1", "type": "LONG"},
                {"name": "tp_index", "type": "LONG"},
                {"name": "timestamp", "type": "TIMESTAMP"}
            ],
            "dataset": [[1, 1, "2024-05-01T12:00:00.000000Z"]],
            "count": 1
        })))
        .mount(server)
        .await;
    // Index skeleton: both committed timepoints.
    Mock::given(method("GET"))
        .and(path("/exec"))
        .and(query_param(
            "query",
            "select idx as \"tp_index\", \"timestamp\" from \"timepoint_index\" order by idx",
        ))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "columns": [
                {"name": "tp_index", "type": "LONG"},
                {"name": "timestamp", "type": "TIMESTAMP"}
            ],
            "dataset": [
                [1, "2024-05-01T12:00:00.000000Z"],
                [2, "2024-05-01T12:00:01.000000Z"]
            ],
            "count": 2
        })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn full_lifecycle_with_real_gateway_and_engine_cli() {
    let tmp = tempfile::TempDir::new().unwrap();
    let engine_binary = install_fake_engine(tmp.path());
    let server = MockServer::start().await;
    mount_exec_mocks(&server).await;
    let (ilp_port, ilp_lines) = ilp_sink().await;

    let db = DbParams {
        host: "127.0.0.1".to_string(),
        port_influx: ilp_port,
        ..DbParams::default()
    };
    let config = MonitorConfig {
        data_dir: tmp.path().join("data"),
        engine_binary: engine_binary.clone(),
        db: db.clone(),
        barrier: Barrier {
            attempts: 3,
            delay: Duration::from_millis(5),
        },
    };
    let tool = Box::new(EngineCli::new(&engine_binary));
    let gateway =
        Box::new(QuestDbGateway::new(&db).with_exec_url(format!("{}/exec", server.uri())));
    let mut monitor = Monitor::with_parts(config, tool, gateway).unwrap();

    monitor.set_signature("P(int)").await.unwrap();
    monitor.set_policy("ALWAYS P", false).await.unwrap();
    monitor.start(false).await.unwrap();
    assert_eq!(monitor.status().engine, "running");

    let events = serde_json::from_str::<RawEventDocument>(
        r#"[{"timestamp":"2024-05-01 12:00:00","predicates":[{"name":"P","occurrences":[[1]]}]},
            {"timestamp":"2024-05-01 12:00:01","predicates":[{"name":"P","occurrences":[[2]]}]}]"#,
    )
    .unwrap()
    .into_events();
    let report = monitor.ingest(events).await.unwrap();
    assert_eq!(report.accepted, 2);
    assert_eq!(report.outcomes[1].index, 2);

    // The influx sink eventually sees both predicate rows and both
    // watermark rows.
    let mut seen = String::new();
    for _ in 0..50 {
        seen = ilp_lines.lock().unwrap().clone();
        if seen.lines().count() >= 4 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(seen.contains("P x1=1i,tp_index=1i"), "ilp payload: {seen}");
    assert!(seen.contains("timepoint_index idx=2i"), "ilp payload: {seen}");

    // Naive policy change replays the stored row and keeps running.
    let change = monitor
        .change_policy(PolicyChangeRequest {
            formula: "EVENTUALLY P".to_string(),
            negate: false,
            naive: true,
        })
        .await
        .unwrap();
    assert_eq!(change.plan, "naive");
    // The stored row at index 1 plus the skeleton-only timepoint at 2.
    assert_eq!(change.replayed_timepoints, 2);
    assert_eq!(monitor.status().engine, "running");

    // Saved stop leaves a resumable instance behind.
    monitor.stop(true).await.unwrap();
    let status = monitor.status();
    assert_eq!(status.engine, "stopped");
    assert!(status.resumable);
}
