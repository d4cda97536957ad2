//! Handler-level tests: requests go through the real router via
//! `tower::ServiceExt::oneshot`, with the engine stubbed by a shell
//! script and the store by an in-memory gateway.

#![cfg(unix)]
#![allow(clippy::unwrap_used)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use monitord_core::codec::StoreRow;
use monitord_core::engine::tool::EngineTool;
use monitord_core::monitor::{Monitor, MonitorConfig};
use monitord_core::store::gateway::{QueryOutput, StoreGateway};
use monitord_core::watermark::Barrier;
use monitord_protocol::{DbParams, Monitorability, RelativeInterval};
use monitord_server::{AppState, router};
use tower::ServiceExt;

struct FakeTool {
    monitorable: bool,
}

#[async_trait]
impl EngineTool for FakeTool {
    async fn check(
        &self,
        _sig: &Path,
        _policy: &Path,
        _negate: bool,
    ) -> monitord_core::Result<Monitorability> {
        Ok(Monitorability {
            monitorable: self.monitorable,
            diagnostic: if self.monitorable {
                "The analyzed formula is monitorable.".to_string()
            } else {
                "the formula cannot be monitored".to_string()
            },
        })
    }

    async fn create_sql(&self, _sig: &Path) -> monitord_core::Result<String> {
        Ok("create table \"P\" (x1 long, tp_index long, timestamp timestamp);".to_string())
    }

    async fn drop_sql(&self, _sig: &Path) -> monitord_core::Result<String> {
        Ok("drop table \"P\";".to_string())
    }

    async fn sig_to_json(&self, _sig: &Path) -> monitord_core::Result<String> {
        Ok("{\"P\":[\"int\"]}".to_string())
    }

    async fn relative_intervals(
        &self,
        _sig: &Path,
        _policy: &Path,
    ) -> monitord_core::Result<Vec<RelativeInterval>> {
        Ok(vec![])
    }
}

struct AckGateway;

#[async_trait]
impl StoreGateway for AckGateway {
    async fn execute(&self, sql: &str) -> monitord_core::Result<QueryOutput> {
        if sql.contains("max(idx)") {
            return Ok(QueryOutput::Rows {
                columns: vec!["max".to_string()],
                rows: vec![vec![serde_json::json!(1)]],
            });
        }
        if sql.starts_with("select") {
            return Ok(QueryOutput::Rows {
                columns: vec![
                    "x1".to_string(),
                    "tp_index".to_string(),
                    "timestamp".to_string(),
                ],
                rows: vec![],
            });
        }
        Ok(QueryOutput::Ack)
    }

    async fn insert_rows(&self, _rows: &[StoreRow]) -> monitord_core::Result<()> {
        Ok(())
    }
}

const FAKE_ENGINE: &str = r###"#!/bin/sh
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
      echo "verdict: false"
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

struct Fixture {
    app: Router,
    _tmp: tempfile::TempDir,
}

fn fixture(monitorable: bool) -> Fixture {
    let tmp = tempfile::TempDir::new().unwrap();
    let config = MonitorConfig {
        data_dir: tmp.path().join("data"),
        engine_binary: install_fake_engine(tmp.path()),
        db: DbParams::default(),
        barrier: Barrier {
            attempts: 3,
            delay: Duration::from_millis(1),
        },
    };
    let monitor = Monitor::with_parts(
        config,
        Box::new(FakeTool { monitorable }),
        Box::new(AckGateway),
    )
    .unwrap();
    Fixture {
        app: router(AppState::new(monitor)),
        _tmp: tmp,
    }
}

const BOUNDARY: &str = "monitord-test-boundary";

fn multipart_request(uri: &str, fields: &[(&str, &str)]) -> Request<Body> {
    let mut body = String::new();
    for (name, value) in fields {
        body.push_str(&format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"; \
             filename=\"{name}\"\r\nContent-Type: text/plain\r\n\r\n{value}\r\n"
        ));
    }
    body.push_str(&format!("--{BOUNDARY}--\r\n"));
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn status_reports_stopped_unconfigured() {
    let fx = fixture(true);
    let response = fx.app.oneshot(get("/")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["engine"], "stopped");
    assert_eq!(body["signature_bound"], false);
}

#[tokio::test]
async fn set_signature_then_read_back() {
    let fx = fixture(true);
    let response = fx
        .app
        .clone()
        .oneshot(multipart_request(
            "/set-signature",
            &[("signature", "P(int)")],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = fx.app.oneshot(get("/get-signature")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["signature"], "P(int)\n");
}

#[tokio::test]
async fn missing_multipart_field_is_bad_request() {
    let fx = fixture(true);
    let response = fx
        .app
        .oneshot(multipart_request("/set-signature", &[("other", "x")]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn ingest_before_configuration_is_conflict() {
    let fx = fixture(true);
    let response = fx
        .app
        .oneshot(multipart_request(
            "/log-events",
            &[("events", r#"[{"predicates":[]}]"#)],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn invalid_events_json_is_bad_request() {
    let fx = fixture(true);
    let response = fx
        .app
        .oneshot(multipart_request("/log-events", &[("events", "not json")]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unmonitorable_policy_maps_to_unprocessable() {
    let fx = fixture(false);
    fx.app
        .clone()
        .oneshot(multipart_request(
            "/set-signature",
            &[("signature", "P(int)")],
        ))
        .await
        .unwrap();
    fx.app
        .clone()
        .oneshot(multipart_request("/set-policy", &[("policy", "NONSENSE")]))
        .await
        .unwrap();

    let response = fx.app.oneshot(get("/start-monitor")).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body = json_body(response).await;
    assert!(
        body["diagnostic"]
            .as_str()
            .unwrap()
            .contains("cannot be monitored")
    );
}

#[tokio::test]
async fn full_flow_start_ingest_stop() {
    let fx = fixture(true);
    for request in [
        multipart_request("/set-signature", &[("signature", "P(int)")]),
        multipart_request("/set-policy", &[("policy", "ALWAYS P")]),
    ] {
        let response = fx.app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = fx.app.clone().oneshot(get("/start-monitor")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["engine"], "running");

    let response = fx
        .app
        .clone()
        .oneshot(multipart_request(
            "/log-events",
            &[(
                "events",
                r#"[{"predicates":[{"name":"P","occurrences":[[1]]}]}]"#,
            )],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["accepted"], 1);
    assert_eq!(body["outcomes"][0]["index"], 1);

    let response = fx
        .app
        .clone()
        .oneshot(get("/stop-monitor?save=false"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["stopped"], "killed");
}

#[tokio::test]
async fn stop_defaults_to_a_saved_resumable_state() {
    let fx = fixture(true);
    for request in [
        multipart_request("/set-signature", &[("signature", "P(int)")]),
        multipart_request("/set-policy", &[("policy", "ALWAYS P")]),
    ] {
        let response = fx.app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    let response = fx.app.clone().oneshot(get("/start-monitor")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = fx.app.clone().oneshot(get("/stop-monitor")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["stopped"], "saved");

    let response = fx.app.oneshot(get("/")).await.unwrap();
    let body = json_body(response).await;
    assert_eq!(body["engine"], "stopped");
    assert_eq!(body["resumable"], true);
}

#[tokio::test]
async fn change_policy_requires_running_engine() {
    let fx = fixture(true);
    fx.app
        .clone()
        .oneshot(multipart_request(
            "/set-signature",
            &[("signature", "P(int)")],
        ))
        .await
        .unwrap();

    let response = fx
        .app
        .oneshot(multipart_request("/change-policy", &[("policy", "ALWAYS P")]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn get_events_rejects_unparseable_window() {
    let fx = fixture(true);
    fx.app
        .clone()
        .oneshot(multipart_request(
            "/set-signature",
            &[("signature", "P(int)")],
        ))
        .await
        .unwrap();

    let response = fx
        .app
        .clone()
        .oneshot(get("/get-events?start=yesterday-ish"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = fx
        .app
        .oneshot(get("/get-events?start=2024-05-01%2012:00:00"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert!(body["P"].is_array());
}

#[tokio::test]
async fn reset_returns_to_clean_state() {
    let fx = fixture(true);
    fx.app
        .clone()
        .oneshot(multipart_request(
            "/set-signature",
            &[("signature", "P(int)")],
        ))
        .await
        .unwrap();

    let response = fx
        .app
        .clone()
        .oneshot(get("/reset-everything"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = fx.app.oneshot(get("/")).await.unwrap();
    let body = json_body(response).await;
    assert_eq!(body["signature_bound"], false);
    assert_eq!(body["watermark_index"], 0);
}
