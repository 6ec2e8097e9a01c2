// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for hangar-control integration tests.
//!
//! Provides TestContext: a router over a [`MockGateway`] driven in-process
//! with `tower::ServiceExt::oneshot`.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, Response, StatusCode, header};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use hangar_control::auth::API_KEY_HEADER;
use hangar_control::gateway::MockGateway;
use hangar_control::handlers::SharedState;
use hangar_control::health_monitor::HealthMonitor;
use hangar_control::recovery::PollBudget;
use hangar_control::runtime::ControlPlaneRuntime;
use hangar_control::server;

/// Short polling budget so waits on deletions stay fast.
pub fn fast_budget() -> PollBudget {
    PollBudget {
        interval: Duration::from_millis(5),
        attempts: 3,
    }
}

/// Test context wiring handlers to a mock gateway.
pub struct TestContext {
    pub gateway: MockGateway,
    pub state: SharedState,
    pub health: HealthMonitor,
    pub router: Router,
    api_key: Option<String>,
}

impl TestContext {
    /// Context without authentication.
    pub fn new() -> Self {
        Self::with_keys(&[])
    }

    /// Context with the given `key[:principal]` entries configured.
    pub fn with_keys(keys: &[&str]) -> Self {
        let gateway = MockGateway::new();
        let config = ControlPlaneRuntime::builder()
            .gateway(Arc::new(gateway.clone()))
            .api_keys(keys.iter().map(|k| k.to_string()).collect())
            .recovery_budget(fast_budget())
            .build()
            .expect("Failed to build runtime config");
        let (state, health) = config.state();
        let router = server::router(state.clone(), config.api_keys());
        Self {
            gateway,
            state,
            health,
            router,
            api_key: None,
        }
    }

    /// Send subsequent requests with this API key in the header.
    pub fn set_key(&mut self, key: &str) {
        self.api_key = Some(key.to_string());
    }

    /// Send a raw request through the router.
    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("Router is infallible")
    }

    /// Send a request with an optional JSON body and return status and JSON.
    pub async fn call(&self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(key) = &self.api_key {
            builder = builder.header(API_KEY_HEADER, key);
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        }
        .expect("Failed to build request");

        let response = self.send(request).await;
        let status = response.status();
        (status, body_json(response).await)
    }

    /// GET returning status and JSON.
    pub async fn get(&self, uri: &str) -> (StatusCode, Value) {
        self.call(Method::GET, uri, None).await
    }

    /// POST a JSON body returning status and JSON.
    pub async fn post(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        self.call(Method::POST, uri, Some(body)).await
    }

    /// PUT a JSON body returning status and JSON.
    pub async fn put(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        self.call(Method::PUT, uri, Some(body)).await
    }

    /// DELETE returning status and JSON.
    pub async fn delete(&self, uri: &str) -> (StatusCode, Value) {
        self.call(Method::DELETE, uri, None).await
    }

    /// Create a machine through the API, asserting success.
    pub async fn create_machine(&self, body: Value) -> Value {
        let (status, machine) = self.post("/machines", body).await;
        assert_eq!(status, StatusCode::CREATED, "create failed: {}", machine);
        machine
    }
}

/// Collect a response body as bytes.
pub async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .expect("Failed to read body")
        .to_bytes()
        .to_vec()
}

/// Collect a response body as JSON, or `Null` when empty or not JSON.
pub async fn body_json(response: Response<Body>) -> Value {
    let bytes = body_bytes(response).await;
    serde_json::from_slice(&bytes).unwrap_or(Value::Null)
}

/// Collect a response body as text.
pub async fn body_text(response: Response<Body>) -> String {
    String::from_utf8(body_bytes(response).await).expect("Body is not UTF-8")
}
