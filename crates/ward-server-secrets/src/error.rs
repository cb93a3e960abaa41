// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Error types for the reference broker.

use thiserror::Error;

/// Result type alias for broker operations.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Errors surfaced by the broker. Each maps to a stable wire code.
#[derive(Debug, Error)]
pub enum BrokerError {
	// =========================================================================
	// Authentication
	// =========================================================================
	#[error("invalid identity token: {0}")]
	InvalidIdentityToken(String),

	#[error("invalid or expired session token")]
	InvalidSessionToken,

	#[error("role {role} is not bound to {namespace}/{service_account}")]
	RoleNotBound {
		role: String,
		namespace: String,
		service_account: String,
	},

	#[error("unknown role: {0}")]
	UnknownRole(String),

	#[error("session token is not renewable")]
	NotRenewable,

	// =========================================================================
	// Secret access
	// =========================================================================
	#[error("permission denied on {0}")]
	PermissionDenied(String),

	#[error("secret not found: {0}")]
	SecretNotFound(String),

	#[error("invalid secret path: {0}")]
	InvalidPath(String),

	#[error("invalid request: {0}")]
	InvalidRequest(String),

	// =========================================================================
	// Injected faults and infrastructure
	// =========================================================================
	#[error("rate limited")]
	RateLimited { retry_after_secs: u64 },

	#[error("service unavailable")]
	Unavailable,

	#[error("configuration error: {0}")]
	Configuration(String),

	#[error("internal error: {0}")]
	Internal(String),
}

impl BrokerError {
	/// Returns the HTTP status code for this error.
	pub fn status_code(&self) -> u16 {
		match self {
			BrokerError::InvalidIdentityToken(_) | BrokerError::InvalidSessionToken => 401,

			// Unknown roles are a binding problem from the caller's point of view.
			BrokerError::RoleNotBound { .. }
			| BrokerError::UnknownRole(_)
			| BrokerError::PermissionDenied(_) => 403,

			BrokerError::SecretNotFound(_) => 404,

			BrokerError::NotRenewable
			| BrokerError::InvalidPath(_)
			| BrokerError::InvalidRequest(_) => 400,

			BrokerError::RateLimited { .. } => 429,

			BrokerError::Unavailable => 503,

			BrokerError::Configuration(_) | BrokerError::Internal(_) => 500,
		}
	}

	/// Stable machine-readable code carried in the error body.
	pub fn code(&self) -> &'static str {
		match self {
			BrokerError::InvalidIdentityToken(_) | BrokerError::InvalidSessionToken => "invalid_token",
			BrokerError::RoleNotBound { .. } | BrokerError::UnknownRole(_) => "role_not_bound",
			BrokerError::NotRenewable => "not_renewable",
			BrokerError::PermissionDenied(_) => "permission_denied",
			BrokerError::SecretNotFound(_) => "not_found",
			BrokerError::InvalidPath(_) | BrokerError::InvalidRequest(_) => "invalid_request",
			BrokerError::RateLimited { .. } => "rate_limited",
			BrokerError::Unavailable => "unavailable",
			BrokerError::Configuration(_) | BrokerError::Internal(_) => "internal",
		}
	}

	/// Returns true if this error should be logged at error level.
	pub fn is_internal(&self) -> bool {
		matches!(
			self,
			BrokerError::Configuration(_) | BrokerError::Internal(_)
		)
	}
}
