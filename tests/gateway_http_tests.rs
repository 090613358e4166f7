//! HTTP gateway transport tests against a local fake gateway.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::TcpListener;

use docpub::distribution::{
    CompletionStatus, DocumentAction, Gateway, HttpGateway, Prolog, ResponseKind, SendDocument,
};
use docpub::error::PublishError;

#[derive(Clone, Default)]
struct FakeGateway {
    requests: Arc<Mutex<Vec<(String, Value)>>>,
}

async fn handle(
    State(fake): State<FakeGateway>,
    Path(step): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, StatusCode> {
    fake.requests.lock().push((step.clone(), body.clone()));
    match step.as_str() {
        "initiate" => Ok(Json(json!({ "kind": "OK", "message": "ready", "last_job_id": 41 }))),
        "document" if body["doc_id"] == 13 => Ok(Json(json!({
            "kind": "Error",
            "message": "schema violation",
            "fault": "GK-17"
        }))),
        "document" | "prolog" | "complete" => Ok(Json(json!({ "kind": "OK" }))),
        _ => Err(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

async fn start() -> (FakeGateway, String) {
    let fake = FakeGateway::default();
    let app = Router::new()
        .route("/:step", post(handle))
        .with_state(fake.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (fake, format!("http://{}/", addr))
}

fn document(doc_id: i64) -> SendDocument {
    SendDocument {
        job_id: 42,
        sequence: 1,
        action: DocumentAction::Export,
        doctype: "Summary".to_string(),
        doc_id,
        version: 3,
        group: 1,
        content: Some("<Summary/>".to_string()),
    }
}

#[tokio::test]
async fn test_initiate_reports_last_job_id() {
    let (fake, url) = start().await;
    let gateway = HttpGateway::new(&url).unwrap();

    let response = gateway.initiate("Hotfix", "Live").await.unwrap();

    assert!(response.is_ok());
    assert_eq!(response.message, "ready");
    assert_eq!(response.last_job_id, Some(41));
    let requests = fake.requests.lock().clone();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].0, "initiate");
    assert_eq!(requests[0].1, json!({ "push_type": "Hotfix", "target": "Live" }));
}

#[tokio::test]
async fn test_protocol_steps_post_json_bodies() {
    let (fake, url) = start().await;
    let gateway = HttpGateway::new(&url).unwrap();

    let prolog = Prolog {
        job_id: 42,
        push_type: "Export".to_string(),
        target: "Live".to_string(),
        last_job_id: Some(41),
        doc_count: 1,
        description: "weekly".to_string(),
    };
    gateway.send_prolog(&prolog).await.unwrap().check().unwrap();
    gateway
        .send_document(&document(7))
        .await
        .unwrap()
        .check()
        .unwrap();
    gateway
        .send_complete(42, "Export", 1, CompletionStatus::Complete)
        .await
        .unwrap()
        .check()
        .unwrap();

    let requests = fake.requests.lock().clone();
    let steps: Vec<&str> = requests.iter().map(|(s, _)| s.as_str()).collect();
    assert_eq!(steps, vec!["prolog", "document", "complete"]);
    assert_eq!(requests[0].1["last_job_id"], 41);
    assert_eq!(requests[1].1["action"], "Export");
    assert_eq!(requests[1].1["content"], "<Summary/>");
    assert_eq!(
        requests[2].1,
        json!({ "job_id": 42, "push_type": "Export", "count": 1, "status": "complete" })
    );
}

#[tokio::test]
async fn test_error_response_is_a_rejection() {
    let (_fake, url) = start().await;
    let gateway = HttpGateway::new(&url).unwrap();

    let response = gateway.send_document(&document(13)).await.unwrap();
    assert_eq!(response.kind, ResponseKind::Error);

    match response.check() {
        Err(PublishError::GatewayRejected { message, .. }) => {
            assert_eq!(message, "schema violation [GK-17]");
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_http_failure_is_a_transport_error() {
    let (_fake, url) = start().await;
    let gateway = HttpGateway::new(&format!("{}unknown", url)).unwrap();

    let err = gateway.initiate("Export", "Live").await.unwrap_err();
    assert!(matches!(err, PublishError::GatewayTransport(_)));
}
