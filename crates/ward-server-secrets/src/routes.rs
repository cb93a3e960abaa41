// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! Broker HTTP handlers.
//!
//! - `POST /v1/auth/login` - Exchange an identity token for a session
//! - `POST /v1/auth/renew-self` - Extend the caller's session
//! - `POST /v1/auth/revoke-self` - Revoke the caller's session
//! - `GET /v1/secret/{path}` - Read the latest version of a secret
//! - `PUT /v1/secret/{path}` - Write a new version (admin token required)
//! - `GET /health` - Liveness

use std::sync::Arc;

use axum::{
	extract::{Path, State},
	http::{header, HeaderMap, HeaderValue, StatusCode},
	response::{IntoResponse, Response},
	routing::{get, post},
	Json, Router,
};
use tracing::{error, warn};

use crate::error::BrokerError;
use crate::service::Broker;
use crate::types::{
	AuthResponse, ErrorBody, LoginRequest, SecretResponse, WriteSecretRequest, WriteSecretResponse,
};

/// Header carrying the session token on authenticated requests.
pub const TOKEN_HEADER: &str = "x-ward-token";

impl IntoResponse for BrokerError {
	fn into_response(self) -> Response {
		if self.is_internal() {
			error!(error = %self, "broker internal error");
		}
		let status =
			StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
		let body = ErrorBody {
			error: self.code().to_string(),
			message: self.to_string(),
		};
		let mut response = (status, Json(body)).into_response();
		if let BrokerError::RateLimited { retry_after_secs } = self {
			response
				.headers_mut()
				.insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs));
		}
		response
	}
}

fn session_token(headers: &HeaderMap) -> Result<&str, BrokerError> {
	headers
		.get(TOKEN_HEADER)
		.and_then(|value| value.to_str().ok())
		.filter(|value| !value.is_empty())
		.ok_or(BrokerError::InvalidSessionToken)
}

fn serve_fault(broker: &Broker) -> Result<(), BrokerError> {
	match broker.take_fault() {
		Some(fault) => {
			warn!(?fault, "serving injected fault");
			Err(fault.into())
		}
		None => Ok(()),
	}
}

pub fn router(broker: Arc<Broker>) -> Router {
	Router::new()
		.route("/health", get(health))
		.route("/v1/auth/login", post(login))
		.route("/v1/auth/renew-self", post(renew_self))
		.route("/v1/auth/revoke-self", post(revoke_self))
		.route("/v1/secret/*path", get(read_secret).put(write_secret))
		.with_state(broker)
}

async fn health() -> StatusCode {
	StatusCode::OK
}

async fn login(
	State(broker): State<Arc<Broker>>,
	Json(request): Json<LoginRequest>,
) -> Result<Json<AuthResponse>, BrokerError> {
	serve_fault(&broker)?;
	let auth = broker.login(&request.role, &request.jwt).await?;
	Ok(Json(AuthResponse { auth }))
}

async fn renew_self(
	State(broker): State<Arc<Broker>>,
	headers: HeaderMap,
) -> Result<Json<AuthResponse>, BrokerError> {
	serve_fault(&broker)?;
	let auth = broker.renew_self(session_token(&headers)?).await?;
	Ok(Json(AuthResponse { auth }))
}

async fn revoke_self(
	State(broker): State<Arc<Broker>>,
	headers: HeaderMap,
) -> Result<StatusCode, BrokerError> {
	serve_fault(&broker)?;
	broker.revoke_self(session_token(&headers)?).await?;
	Ok(StatusCode::NO_CONTENT)
}

async fn read_secret(
	State(broker): State<Arc<Broker>>,
	Path(path): Path<String>,
	headers: HeaderMap,
) -> Result<Json<SecretResponse>, BrokerError> {
	serve_fault(&broker)?;
	let secret = broker.read_secret(session_token(&headers)?, &path).await?;
	Ok(Json(secret))
}

async fn write_secret(
	State(broker): State<Arc<Broker>>,
	Path(path): Path<String>,
	headers: HeaderMap,
	Json(request): Json<WriteSecretRequest>,
) -> Result<Json<WriteSecretResponse>, BrokerError> {
	broker.check_admin(session_token(&headers).ok())?;
	let version = broker
		.write_secret(&path, request.data, request.lease_duration)
		.await?;
	Ok(Json(WriteSecretResponse { version }))
}
