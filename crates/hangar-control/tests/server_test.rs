// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for the HTTP surface - machine lifecycle, exec, logs, auth.

mod common;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode, header};
use serde_json::json;

use common::{TestContext, body_text};
use hangar_control::gateway::{ExecOutput, MockOperation};

// ============================================================================
// Machines
// ============================================================================

#[tokio::test]
async fn test_create_machine_from_template() {
    let ctx = TestContext::new();
    let machine = ctx
        .create_machine(json!({
            "id": "desk-1",
            "template": "desktop",
            "env": {"LANG": "C"},
            "resources": {"memory": "8Gi"}
        }))
        .await;

    assert_eq!(machine["id"], "desk-1");
    assert_eq!(machine["name"], "machine-desk-1");
    assert_eq!(machine["image"], "hangar/desktop:latest");
    assert_eq!(machine["env"]["DISPLAY"], ":1");
    assert_eq!(machine["env"]["LANG"], "C");
    assert_eq!(machine["resources"]["cpu"], "2");
    assert_eq!(machine["resources"]["memory"], "8Gi");
    assert_eq!(machine["volumeClaim"], "machine-desk-1-data");

    let claim = ctx.gateway.claim("machine-desk-1-data").await.unwrap();
    assert_eq!(claim.size.as_deref(), Some("20Gi"));

    let specs = ctx.gateway.created_specs().await;
    assert_eq!(specs.len(), 1);
    assert_eq!(specs[0].owner, "default");
}

#[tokio::test]
async fn test_create_machine_fills_quota_defaults() {
    let ctx = TestContext::new();
    let machine = ctx
        .create_machine(json!({"id": "m1", "image": "demo:1", "resources": {"cpu": "4"}}))
        .await;

    assert_eq!(machine["resources"]["cpu"], "4");
    assert_eq!(machine["resources"]["memory"], "2Gi");
    assert_eq!(machine["resources"]["disk"], "10Gi");
    assert!(ctx.gateway.claim("machine-m1-data").await.is_some());
}

#[tokio::test]
async fn test_create_machine_validation() {
    let ctx = TestContext::new();

    let (status, body) = ctx.post("/machines", json!({"id": "m1"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("image or template"));

    let (status, _) = ctx
        .post("/machines", json!({"id": "Bad_ID", "image": "demo:1"}))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = ctx
        .post("/machines", json!({"id": "m1", "template": "nope"}))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    assert_eq!(ctx.gateway.mutation_count().await, 0);
}

#[tokio::test]
async fn test_create_machine_conflict() {
    let ctx = TestContext::new();
    ctx.create_machine(json!({"id": "m1", "image": "demo:1"})).await;

    let (status, body) = ctx
        .post("/machines", json!({"id": "m1", "image": "demo:2"}))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].is_string());
    assert_eq!(ctx.gateway.created_specs().await.len(), 1);
}

#[tokio::test]
async fn test_conflict_reported_before_quota() {
    let ctx = TestContext::new();
    ctx.put("/quotas/default", json!({"maxMachines": 1})).await;
    ctx.create_machine(json!({"id": "m1", "image": "demo:1"})).await;

    let (status, _) = ctx
        .post("/machines", json!({"id": "m1", "image": "demo:1"}))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = ctx
        .post("/machines", json!({"id": "m2", "image": "demo:1"}))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_create_requires_json_content_type() {
    let ctx = TestContext::new();
    let request = Request::builder()
        .method(Method::POST)
        .uri("/machines")
        .header(header::CONTENT_TYPE, "text/plain")
        .body(Body::from(r#"{"id":"m1","image":"demo:1"}"#))
        .unwrap();

    let response = ctx.send(request).await;
    assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    assert!(ctx.gateway.created_specs().await.is_empty());
}

#[tokio::test]
async fn test_get_list_and_delete_machine() {
    let ctx = TestContext::new();
    ctx.create_machine(json!({"id": "b", "image": "demo:1"})).await;
    ctx.create_machine(json!({"id": "a", "image": "demo:1"})).await;

    let (status, machines) = ctx.get("/machines").await;
    assert_eq!(status, StatusCode::OK);
    let ids: Vec<&str> = machines
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["a", "b"]);

    let (status, machine) = ctx.get("/machines/a").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(machine["phase"], "Running");

    let (status, body) = ctx.delete("/machines/a").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deleted"], "a");
    assert!(ctx.gateway.claim("machine-a-data").await.is_none());

    let (status, _) = ctx.get("/machines/a").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = ctx.delete("/machines/a").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_delete_survives_claim_failure() {
    let ctx = TestContext::new();
    ctx.create_machine(json!({"id": "m1", "image": "demo:1"})).await;
    ctx.gateway.fail(MockOperation::DeleteClaim).await;

    let (status, _) = ctx.delete("/machines/m1").await;
    assert_eq!(status, StatusCode::OK);
    assert!(ctx.gateway.workload("m1").await.is_none());
}

#[tokio::test]
async fn test_gateway_failure_is_500() {
    let ctx = TestContext::new();
    ctx.gateway.fail(MockOperation::ListAll).await;

    let (status, body) = ctx.get("/machines").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"].as_str().unwrap().contains("mock failure"));
}

// ============================================================================
// Exec
// ============================================================================

#[tokio::test]
async fn test_exec_returns_output() {
    let ctx = TestContext::new();
    ctx.create_machine(json!({"id": "m1", "image": "demo:1"})).await;

    let (status, output) = ctx
        .post("/machines/m1/exec", json!({"command": ["echo", "hi"]}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(output["stdout"], "echo hi\n");
    assert_eq!(output["exitCode"], 0);
}

#[tokio::test]
async fn test_exec_reports_command_failure_in_body() {
    let ctx = TestContext::new();
    ctx.create_machine(json!({"id": "m1", "image": "demo:1"})).await;
    ctx.gateway
        .set_exec_output(ExecOutput {
            stderr: "no such file\n".to_string(),
            exit_code: Some(127),
            ..Default::default()
        })
        .await;

    let (status, output) = ctx
        .post("/machines/m1/exec", json!({"command": ["missing"]}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(output["exitCode"], 127);

    ctx.gateway.fail(MockOperation::Exec).await;
    let (status, output) = ctx
        .post("/machines/m1/exec", json!({"command": ["ls"]}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(output["error"].as_str().unwrap().contains("mock failure"));
}

#[tokio::test]
async fn test_exec_validation() {
    let ctx = TestContext::new();
    ctx.create_machine(json!({"id": "m1", "image": "demo:1"})).await;

    let (status, _) = ctx.post("/machines/m1/exec", json!({"command": []})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = ctx
        .post("/machines/ghost/exec", json!({"command": ["ls"]}))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ============================================================================
// Logs
// ============================================================================

#[tokio::test]
async fn test_logs_plain_text_with_tail() {
    let ctx = TestContext::new();
    ctx.create_machine(json!({"id": "m1", "image": "demo:1"})).await;
    ctx.gateway
        .set_log_lines(vec!["one".into(), "two".into(), "three".into()])
        .await;

    let response = ctx
        .send(
            Request::get("/machines/m1/logs?tail=2")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(
        response.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/plain")
    );
    assert_eq!(body_text(response).await, "two\nthree\n");
}

#[tokio::test]
async fn test_logs_follow_streams_events() {
    let ctx = TestContext::new();
    ctx.create_machine(json!({"id": "m1", "image": "demo:1"})).await;
    ctx.gateway
        .set_log_lines(vec!["booting".into(), "ready".into()])
        .await;

    let response = ctx
        .send(
            Request::get("/machines/m1/logs?follow=true")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(
        response.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/event-stream")
    );
    let body = body_text(response).await;
    assert!(body.contains("data: booting\n\n"));
    assert!(body.contains("data: ready\n\n"));
}

#[tokio::test]
async fn test_logs_missing_machine() {
    let ctx = TestContext::new();
    let (status, _) = ctx.get("/machines/ghost/logs").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ============================================================================
// Templates and version
// ============================================================================

#[tokio::test]
async fn test_template_administration() {
    let ctx = TestContext::new();

    let (status, templates) = ctx.get("/templates").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(templates.as_array().unwrap().len(), 3);

    let (status, template) = ctx
        .put(
            "/templates/gpu",
            json!({"image": "hangar/gpu:1", "resources": {"cpu": "8"}}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(template["name"], "gpu");

    let machine = ctx
        .create_machine(json!({"id": "g1", "template": "gpu"}))
        .await;
    assert_eq!(machine["image"], "hangar/gpu:1");
    assert_eq!(machine["resources"]["cpu"], "8");

    let (status, _) = ctx.delete("/templates/gpu").await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = ctx.get("/templates/gpu").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = ctx.delete("/templates/gpu").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = ctx.put("/templates/empty", json!({"image": " "})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_version() {
    let ctx = TestContext::new();
    let (status, body) = ctx.get("/version").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(body["gateway"], "mock");
}

// ============================================================================
// Authentication
// ============================================================================

#[tokio::test]
async fn test_protected_routes_require_key() {
    let ctx = TestContext::with_keys(&["secret:alice"]);

    let (status, body) = ctx.get("/machines").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["error"].is_string());

    let request = Request::get("/machines")
        .header("x-api-key", "wrong")
        .body(Body::empty())
        .unwrap();
    assert_eq!(ctx.send(request).await.status(), StatusCode::UNAUTHORIZED);

    let request = Request::get("/machines?api_key=secret")
        .body(Body::empty())
        .unwrap();
    assert_eq!(ctx.send(request).await.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_query_key_with_reserved_characters() {
    let ctx = TestContext::with_keys(&["s3cr3t/key+1:alice"]);

    let request = Request::get("/machines")
        .header("x-api-key", "s3cr3t/key+1")
        .body(Body::empty())
        .unwrap();
    assert_eq!(ctx.send(request).await.status(), StatusCode::OK);

    let request = Request::get("/machines?api_key=s3cr3t%2Fkey%2B1")
        .body(Body::empty())
        .unwrap();
    assert_eq!(ctx.send(request).await.status(), StatusCode::OK);

    // '+' in a query string decodes to a space
    let request = Request::get("/machines?api_key=s3cr3t/key+1")
        .body(Body::empty())
        .unwrap();
    assert_eq!(ctx.send(request).await.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_public_routes_skip_auth() {
    let ctx = TestContext::with_keys(&["secret"]);

    let (status, _) = ctx.get("/health").await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = ctx.get("/version").await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = ctx.get("/machines/ghost/health").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_principal_becomes_owner() {
    let mut ctx = TestContext::with_keys(&["secret:alice"]);
    ctx.set_key("secret");
    let machine = ctx
        .create_machine(json!({"id": "m1", "image": "demo:1"}))
        .await;
    assert_eq!(machine["owner"], "alice");
}
