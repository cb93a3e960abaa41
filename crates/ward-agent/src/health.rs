// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Health, readiness and metrics endpoints.
//!
//! - `GET /health` - 200 unless the agent has failed, then 503
//! - `GET /ready` - 200 only while rendered files are current
//! - `GET /metrics` - Prometheus text format

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::metrics::Metrics;
use crate::state::AgentState;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
	Healthy,
	Degraded,
	Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
	pub status: HealthStatus,
	pub state: AgentState,
	pub since: String,
	pub secret_version: Option<u64>,
	pub last_render: Option<String>,
	pub render_pending: bool,
	pub failure: Option<String>,
}

#[derive(Clone)]
pub struct HealthState {
	inner: Arc<RwLock<HealthStateInner>>,
}

struct HealthStateInner {
	state: AgentState,
	since: DateTime<Utc>,
	secret_version: Option<u64>,
	last_render: Option<DateTime<Utc>>,
	render_pending: bool,
	failure: Option<String>,
	credential_expires_at: Option<Instant>,
}

impl Default for HealthState {
	fn default() -> Self {
		Self::new()
	}
}

impl HealthState {
	pub fn new() -> Self {
		HealthState {
			inner: Arc::new(RwLock::new(HealthStateInner {
				state: AgentState::Unauthenticated,
				since: Utc::now(),
				secret_version: None,
				last_render: None,
				render_pending: false,
				failure: None,
				credential_expires_at: None,
			})),
		}
	}

	pub async fn set_state(&self, state: AgentState) {
		let mut inner = self.inner.write().await;
		inner.state = state;
		inner.since = Utc::now();
	}

	pub async fn record_render(&self, version: u64) {
		let mut inner = self.inner.write().await;
		inner.secret_version = Some(version);
		inner.last_render = Some(Utc::now());
		inner.render_pending = false;
	}

	/// A render failed but the previous files are still in place.
	pub async fn set_render_pending(&self) {
		self.inner.write().await.render_pending = true;
	}

	pub async fn set_credential_expiry(&self, expires_at: Option<Instant>) {
		self.inner.write().await.credential_expires_at = expires_at;
	}

	pub async fn set_failed(&self, reason: String) {
		let mut inner = self.inner.write().await;
		inner.state = AgentState::Failed;
		inner.since = Utc::now();
		inner.failure = Some(reason);
	}

	pub async fn state(&self) -> AgentState {
		self.inner.read().await.state
	}

	pub async fn is_ready(&self) -> bool {
		let inner = self.inner.read().await;
		inner.state == AgentState::Steady && !inner.render_pending
	}

	async fn credential_remaining(&self) -> Option<std::time::Duration> {
		self
			.inner
			.read()
			.await
			.credential_expires_at
			.map(|at| at.saturating_duration_since(Instant::now()))
	}

	async fn get_health(&self) -> HealthResponse {
		let inner = self.inner.read().await;

		let status = match inner.state {
			AgentState::Failed => HealthStatus::Unhealthy,
			AgentState::Steady if !inner.render_pending => HealthStatus::Healthy,
			_ => HealthStatus::Degraded,
		};

		HealthResponse {
			status,
			state: inner.state,
			since: inner.since.to_rfc3339(),
			secret_version: inner.secret_version,
			last_render: inner.last_render.map(|t| t.to_rfc3339()),
			render_pending: inner.render_pending,
			failure: inner.failure.clone(),
		}
	}
}

#[derive(Clone)]
struct AppState {
	health: HealthState,
	metrics: Arc<Metrics>,
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
	let health = state.health.get_health().await;
	let status_code = match health.status {
		HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
		HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
	};

	(status_code, Json(health))
}

async fn ready_handler(State(state): State<AppState>) -> StatusCode {
	if state.health.is_ready().await {
		StatusCode::OK
	} else {
		StatusCode::SERVICE_UNAVAILABLE
	}
}

async fn metrics_handler(State(state): State<AppState>) -> String {
	let remaining = state.health.credential_remaining().await;
	state.metrics.set_credential_expiry(remaining);
	state.metrics.encode()
}

pub fn health_router(health: HealthState, metrics: Arc<Metrics>) -> Router {
	Router::new()
		.route("/health", get(health_handler))
		.route("/ready", get(ready_handler))
		.route("/metrics", get(metrics_handler))
		.with_state(AppState { health, metrics })
}

#[cfg(test)]
mod tests {
	use super::*;
	use axum::body::{to_bytes, Body};
	use axum::http::Request;
	use tower::ServiceExt;

	async fn get(router: Router, uri: &str) -> (StatusCode, String) {
		let response = router
			.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
			.await
			.unwrap();
		let status = response.status();
		let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
		(status, String::from_utf8(body.to_vec()).unwrap())
	}

	#[tokio::test]
	async fn starting_agent_is_live_but_not_ready() {
		let health = HealthState::new();
		let router = health_router(health, Arc::new(Metrics::new()));
		assert_eq!(get(router.clone(), "/health").await.0, StatusCode::OK);
		assert_eq!(get(router, "/ready").await.0, StatusCode::SERVICE_UNAVAILABLE);
	}

	#[tokio::test]
	async fn steady_agent_is_ready() {
		let health = HealthState::new();
		health.set_state(AgentState::Steady).await;
		health.record_render(3).await;
		let router = health_router(health.clone(), Arc::new(Metrics::new()));
		assert_eq!(get(router.clone(), "/ready").await.0, StatusCode::OK);

		let (status, body) = get(router.clone(), "/health").await;
		assert_eq!(status, StatusCode::OK);
		assert!(body.contains("\"secret_version\":3"));

		health.set_render_pending().await;
		assert_eq!(get(router, "/ready").await.0, StatusCode::SERVICE_UNAVAILABLE);
	}

	#[tokio::test]
	async fn failed_agent_reports_503() {
		let health = HealthState::new();
		health.set_failed("permission denied reading certs/hello-world".into()).await;
		let router = health_router(health, Arc::new(Metrics::new()));
		let (status, body) = get(router, "/health").await;
		assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
		assert!(body.contains("\"state\":\"failed\""));
		assert!(body.contains("permission denied"));
	}

	#[tokio::test]
	async fn metrics_include_credential_expiry() {
		let health = HealthState::new();
		health
			.set_credential_expiry(Some(Instant::now() + std::time::Duration::from_secs(600)))
			.await;
		let (status, body) = get(health_router(health, Arc::new(Metrics::new())), "/metrics").await;
		assert_eq!(status, StatusCode::OK);
		assert!(body.contains("ward_agent_credential_expiry_seconds"));
	}
}
