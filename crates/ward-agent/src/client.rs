// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! HTTP client for the broker API.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, instrument, warn};
use ward_common_secret::{SecretBytes, SecretString};

use crate::auth::AuthClient;
use crate::error::{AuthError, ConfigError, FetchError};
use crate::fetch::SecretFetcher;
use crate::identity::ensure_token_fresh;
use crate::lease::Lease;
use crate::types::{SecretRecord, SessionCredential};

/// Header carrying the session credential.
pub const TOKEN_HEADER: &str = "X-Ward-Token";

pub struct ClientConfig {
	pub server_url: String,
	/// Allow plain HTTP (in-cluster or local development only).
	pub allow_insecure: bool,
	pub request_timeout: Duration,
}

#[derive(Serialize)]
struct LoginRequest<'a> {
	role: &'a str,
	jwt: &'a str,
}

#[derive(Deserialize)]
struct AuthResponse {
	auth: AuthInfo,
}

#[derive(Deserialize)]
struct AuthInfo {
	client_token: SecretString,
	accessor: String,
	#[serde(default)]
	policies: BTreeSet<String>,
	lease_duration: u64,
	#[serde(default)]
	renewable: bool,
}

impl AuthInfo {
	fn into_credential(self, issued_at: Instant) -> SessionCredential {
		SessionCredential {
			token: self.client_token,
			accessor: self.accessor,
			policies: self.policies,
			lease: Lease::new(
				issued_at,
				Duration::from_secs(self.lease_duration),
				self.renewable,
			),
		}
	}
}

#[derive(Deserialize)]
struct SecretResponse {
	path: String,
	version: u64,
	data: BTreeMap<String, String>,
	#[serde(default)]
	lease_duration: Option<u64>,
	#[serde(default)]
	renewable: bool,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
	error: String,
	message: Option<String>,
}

/// Non-success response from the broker.
#[derive(Debug)]
struct Failure {
	status: StatusCode,
	code: String,
	message: String,
	retry_after: Option<Duration>,
}

impl Failure {
	async fn read(response: reqwest::Response) -> Self {
		let status = response.status();
		let retry_after = response
			.headers()
			.get(RETRY_AFTER)
			.and_then(|v| v.to_str().ok())
			.and_then(|v| v.trim().parse::<u64>().ok())
			.map(Duration::from_secs);
		let body = response.text().await.unwrap_or_default();
		let (code, message) = match serde_json::from_str::<ErrorResponse>(&body) {
			Ok(parsed) => (parsed.error, parsed.message.unwrap_or_default()),
			Err(_) => (String::new(), sanitize_body_for_error(&body, 200)),
		};
		Self {
			status,
			code,
			message,
			retry_after,
		}
	}

	fn describe(&self) -> String {
		if self.code.is_empty() {
			format!("HTTP {}: {}", self.status, self.message)
		} else {
			format!("HTTP {} {}: {}", self.status, self.code, self.message)
		}
	}

	fn into_auth_error(self) -> AuthError {
		match self.status.as_u16() {
			401 => AuthError::InvalidToken(self.describe()),
			403 => AuthError::RoleNotBound(self.describe()),
			400 if self.code == "not_renewable" => AuthError::NotRenewable,
			429 => AuthError::RateLimited {
				retry_after: self.retry_after,
			},
			408 | 500..=599 => AuthError::Unreachable(self.describe()),
			_ => AuthError::Rejected(self.describe()),
		}
	}

	fn into_fetch_error(self, path: &str) -> FetchError {
		match self.status.as_u16() {
			401 => FetchError::CredentialExpired,
			403 => FetchError::Forbidden(path.to_string()),
			404 => FetchError::NotFound(path.to_string()),
			429 => FetchError::RateLimited {
				retry_after: self.retry_after,
			},
			408 | 500..=599 => FetchError::Unreachable(self.describe()),
			_ => FetchError::Rejected(self.describe()),
		}
	}
}

/// Broker client implementing both [`AuthClient`] and [`SecretFetcher`].
pub struct HttpBrokerClient {
	http_client: reqwest::Client,
	server_url: String,
}

impl HttpBrokerClient {
	pub fn with_config(config: ClientConfig) -> Result<Self, ConfigError> {
		if !config.allow_insecure && !config.server_url.starts_with("https://") {
			return Err(ConfigError::invalid(
				"server_url",
				"must use HTTPS (set allow_insecure_http=true for in-cluster HTTP)",
			));
		}

		let http_client = ward_common_http::builder()
			.timeout(config.request_timeout)
			.build()
			.map_err(|e| ConfigError::invalid("server_url", format!("failed to create HTTP client: {e}")))?;

		Ok(Self {
			http_client,
			server_url: config.server_url.trim_end_matches('/').to_string(),
		})
	}

	pub fn server_url(&self) -> &str {
		&self.server_url
	}

	fn url(&self, path: &str) -> String {
		format!("{}{}", self.server_url, path)
	}

	async fn session_call(
		&self,
		endpoint: &str,
		credential: &SessionCredential,
	) -> Result<reqwest::Response, AuthError> {
		let response = self
			.http_client
			.post(self.url(endpoint))
			.header(TOKEN_HEADER, credential.token.expose())
			.send()
			.await
			.map_err(|e| AuthError::Unreachable(e.to_string()))?;

		if response.status().is_success() {
			Ok(response)
		} else {
			Err(Failure::read(response).await.into_auth_error())
		}
	}
}

#[async_trait]
impl AuthClient for HttpBrokerClient {
	#[instrument(skip(self, identity_token), fields(role = %role))]
	async fn authenticate(
		&self,
		role: &str,
		identity_token: &SecretString,
	) -> Result<SessionCredential, AuthError> {
		if role.is_empty() {
			return Err(AuthError::EmptyRole);
		}
		ensure_token_fresh(identity_token, chrono::Utc::now().timestamp())?;

		debug!("authenticating with broker");
		let response = self
			.http_client
			.post(self.url("/v1/auth/login"))
			.json(&LoginRequest {
				role,
				jwt: identity_token.expose(),
			})
			.send()
			.await
			.map_err(|e| AuthError::Unreachable(e.to_string()))?;

		if !response.status().is_success() {
			let failure = Failure::read(response).await;
			warn!(status = %failure.status, code = %failure.code, "login rejected");
			return Err(failure.into_auth_error());
		}

		let issued_at = Instant::now();
		let body: AuthResponse = response
			.json()
			.await
			.map_err(|e| AuthError::InvalidResponse(e.to_string()))?;
		Ok(body.auth.into_credential(issued_at))
	}

	#[instrument(skip(self, credential), fields(accessor = %credential.accessor))]
	async fn renew(&self, credential: &SessionCredential) -> Result<SessionCredential, AuthError> {
		let response = self.session_call("/v1/auth/renew-self", credential).await?;
		let issued_at = Instant::now();
		let body: AuthResponse = response
			.json()
			.await
			.map_err(|e| AuthError::InvalidResponse(e.to_string()))?;
		Ok(body.auth.into_credential(issued_at))
	}

	#[instrument(skip(self, credential), fields(accessor = %credential.accessor))]
	async fn revoke(&self, credential: &SessionCredential) -> Result<(), AuthError> {
		self.session_call("/v1/auth/revoke-self", credential).await?;
		Ok(())
	}
}

#[async_trait]
impl SecretFetcher for HttpBrokerClient {
	#[instrument(skip(self, credential), fields(path = %path, accessor = %credential.accessor))]
	async fn fetch(&self, credential: &SessionCredential, path: &str) -> Result<SecretRecord, FetchError> {
		let response = self
			.http_client
			.get(self.url(&format!("/v1/secret/{path}")))
			.header(TOKEN_HEADER, credential.token.expose())
			.send()
			.await
			.map_err(|e| FetchError::Unreachable(e.to_string()))?;

		if !response.status().is_success() {
			return Err(Failure::read(response).await.into_fetch_error(path));
		}

		let fetched_at = Instant::now();
		let body: SecretResponse = response
			.json()
			.await
			.map_err(|e| FetchError::InvalidResponse(e.to_string()))?;

		debug!(version = body.version, fields = body.data.len(), "fetched secret");
		Ok(SecretRecord {
			path: body.path,
			version: body.version,
			data: body
				.data
				.into_iter()
				.map(|(field, value)| (field, SecretBytes::from(value.into_bytes())))
				.collect(),
			lease: body
				.lease_duration
				.map(|secs| Lease::new(fetched_at, Duration::from_secs(secs), body.renewable)),
		})
	}
}

impl std::fmt::Debug for HttpBrokerClient {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("HttpBrokerClient")
			.field("server_url", &self.server_url)
			.finish()
	}
}

fn sanitize_body_for_error(body: &str, max_len: usize) -> String {
	let sanitized: String = body
		.chars()
		.filter(|c| !c.is_control() || *c == ' ')
		.take(max_len)
		.collect();
	if body.chars().count() > max_len {
		format!("{sanitized}...")
	} else {
		sanitized
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn failure(status: u16, code: &str) -> Failure {
		Failure {
			status: StatusCode::from_u16(status).unwrap(),
			code: code.to_string(),
			message: "msg".to_string(),
			retry_after: Some(Duration::from_secs(2)),
		}
	}

	fn config(url: &str, allow_insecure: bool) -> ClientConfig {
		ClientConfig {
			server_url: url.to_string(),
			allow_insecure,
			request_timeout: Duration::from_secs(5),
		}
	}

	#[test]
	fn rejects_http_without_allow_insecure() {
		let err = HttpBrokerClient::with_config(config("http://localhost:8200", false)).unwrap_err();
		assert!(matches!(err, ConfigError::InvalidValue { .. }));
		assert!(HttpBrokerClient::with_config(config("https://broker:8200", false)).is_ok());
		assert!(HttpBrokerClient::with_config(config("http://localhost:8200", true)).is_ok());
	}

	#[test]
	fn trailing_slash_is_dropped() {
		let client = HttpBrokerClient::with_config(config("https://broker:8200/", false)).unwrap();
		assert_eq!(client.url("/v1/auth/login"), "https://broker:8200/v1/auth/login");
	}

	#[test]
	fn debug_does_not_leak_anything_secret() {
		let client = HttpBrokerClient::with_config(config("https://broker:8200", false)).unwrap();
		let debug = format!("{client:?}");
		assert!(debug.contains("broker:8200"));
		assert!(!debug.contains("token"));
	}

	#[test]
	fn auth_status_mapping() {
		assert!(matches!(failure(401, "invalid_token").into_auth_error(), AuthError::InvalidToken(_)));
		assert!(matches!(failure(403, "role_not_bound").into_auth_error(), AuthError::RoleNotBound(_)));
		assert!(matches!(failure(400, "not_renewable").into_auth_error(), AuthError::NotRenewable));
		assert!(matches!(failure(400, "invalid_request").into_auth_error(), AuthError::Rejected(_)));
		assert!(matches!(failure(503, "unavailable").into_auth_error(), AuthError::Unreachable(_)));
		assert!(matches!(
			failure(429, "rate_limited").into_auth_error(),
			AuthError::RateLimited { retry_after: Some(d) } if d == Duration::from_secs(2)
		));
	}

	#[test]
	fn fetch_status_mapping() {
		assert!(matches!(failure(401, "invalid_token").into_fetch_error("p"), FetchError::CredentialExpired));
		assert!(matches!(failure(403, "permission_denied").into_fetch_error("p"), FetchError::Forbidden(_)));
		assert!(matches!(failure(404, "not_found").into_fetch_error("p"), FetchError::NotFound(_)));
		assert!(matches!(failure(502, "").into_fetch_error("p"), FetchError::Unreachable(_)));
	}

	#[test]
	fn sanitize_truncates_and_strips_control_chars() {
		assert_eq!(sanitize_body_for_error("a\nb\u{7}c", 10), "abc");
		assert_eq!(sanitize_body_for_error("abcdef", 3), "abc...");
	}

	#[test]
	fn auth_info_never_debug_prints_token() {
		let info: AuthResponse = serde_json::from_str(
			r#"{"auth":{"client_token":"ws.secret","accessor":"acc","policies":["p"],"lease_duration":60,"renewable":true}}"#,
		)
		.unwrap();
		let credential = info.auth.into_credential(Instant::now());
		assert_eq!(credential.token.expose(), "ws.secret");
		assert!(!format!("{credential:?}").contains("ws.secret"));
		assert_eq!(credential.lease.duration, Duration::from_secs(60));
	}
}
