// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Error types for the agent.
//!
//! Every error carries an [`ErrorClass`] that decides how the scheduler
//! reacts: configuration errors fail immediately, transient errors are retried
//! with backoff, integrity errors keep previously rendered files and retry
//! later, credential errors lead to re-authentication.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use ward_common_http::RetryableError;

use crate::state::Operation;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
	Configuration,
	Transient { retry_after: Option<Duration> },
	Integrity,
	Credential,
}

impl ErrorClass {
	/// Metric label for this class.
	pub fn label(&self) -> &'static str {
		match self {
			ErrorClass::Configuration => "configuration",
			ErrorClass::Transient { .. } => "transient",
			ErrorClass::Integrity => "integrity",
			ErrorClass::Credential => "credential",
		}
	}

	pub fn is_transient(&self) -> bool {
		matches!(self, ErrorClass::Transient { .. })
	}
}

pub trait Classified {
	fn class(&self) -> ErrorClass;
}

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("missing required setting: {0}")]
	Missing(String),

	#[error("invalid value for {key}: {message}")]
	InvalidValue { key: String, message: String },

	#[error("failed to parse TOML config at {path}: {source}")]
	TomlParse {
		path: PathBuf,
		#[source]
		source: toml::de::Error,
	},

	#[error("failed to read config file {path}: {source}")]
	FileRead {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("validation error: {0}")]
	Validation(String),
}

impl ConfigError {
	pub fn invalid(key: impl Into<String>, message: impl Into<String>) -> Self {
		ConfigError::InvalidValue {
			key: key.into(),
			message: message.into(),
		}
	}
}

// =============================================================================
// Authentication
// =============================================================================

#[derive(Debug, Error)]
pub enum AuthError {
	#[error("role name must not be empty")]
	EmptyRole,

	#[error("identity token unavailable: {0}")]
	TokenUnavailable(String),

	#[error("identity token expired at {expired_at}")]
	TokenExpired { expired_at: i64 },

	#[error("token rejected by broker: {0}")]
	InvalidToken(String),

	#[error("role not bound to this identity: {0}")]
	RoleNotBound(String),

	#[error("credential is not renewable")]
	NotRenewable,

	#[error("request rejected: {0}")]
	Rejected(String),

	#[error("broker unreachable: {0}")]
	Unreachable(String),

	#[error("rate limited by broker")]
	RateLimited { retry_after: Option<Duration> },

	#[error("invalid response from broker: {0}")]
	InvalidResponse(String),
}

impl Classified for AuthError {
	fn class(&self) -> ErrorClass {
		match self {
			AuthError::EmptyRole | AuthError::RoleNotBound(_) | AuthError::Rejected(_) => {
				ErrorClass::Configuration
			}
			AuthError::TokenExpired { .. } | AuthError::InvalidToken(_) | AuthError::NotRenewable => {
				ErrorClass::Credential
			}
			AuthError::RateLimited { retry_after } => ErrorClass::Transient {
				retry_after: *retry_after,
			},
			// A projected token may not be mounted yet.
			AuthError::TokenUnavailable(_)
			| AuthError::Unreachable(_)
			| AuthError::InvalidResponse(_) => ErrorClass::Transient { retry_after: None },
		}
	}
}

impl RetryableError for AuthError {
	fn is_retryable(&self) -> bool {
		self.class().is_transient()
	}

	fn retry_after(&self) -> Option<Duration> {
		match self {
			AuthError::RateLimited { retry_after } => *retry_after,
			_ => None,
		}
	}
}

// =============================================================================
// Secret fetch
// =============================================================================

#[derive(Debug, Error)]
pub enum FetchError {
	#[error("permission denied reading {0}")]
	Forbidden(String),

	#[error("secret not found: {0}")]
	NotFound(String),

	#[error("session credential expired or revoked")]
	CredentialExpired,

	#[error("request rejected: {0}")]
	Rejected(String),

	#[error("secret store unreachable: {0}")]
	Unreachable(String),

	#[error("rate limited by secret store")]
	RateLimited { retry_after: Option<Duration> },

	#[error("invalid response from secret store: {0}")]
	InvalidResponse(String),
}

impl Classified for FetchError {
	fn class(&self) -> ErrorClass {
		match self {
			// NotFound is only polled when a wait deadline is configured.
			FetchError::Forbidden(_) | FetchError::NotFound(_) | FetchError::Rejected(_) => {
				ErrorClass::Configuration
			}
			FetchError::CredentialExpired => ErrorClass::Credential,
			FetchError::RateLimited { retry_after } => ErrorClass::Transient {
				retry_after: *retry_after,
			},
			FetchError::Unreachable(_) | FetchError::InvalidResponse(_) => {
				ErrorClass::Transient { retry_after: None }
			}
		}
	}
}

impl RetryableError for FetchError {
	fn is_retryable(&self) -> bool {
		self.class().is_transient()
	}

	fn retry_after(&self) -> Option<Duration> {
		match self {
			FetchError::RateLimited { retry_after } => *retry_after,
			_ => None,
		}
	}
}

// =============================================================================
// Rendering
// =============================================================================

#[derive(Debug, Error)]
pub enum RenderError {
	#[error("secret has no field {0:?}")]
	MissingField(String),

	#[error("invalid file name {0:?}: must be a plain name")]
	InvalidFileName(String),

	#[error("failed to write {path}: {source}")]
	WriteFailed {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},
}

impl RenderError {
	pub(crate) fn write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
		RenderError::WriteFailed {
			path: path.into(),
			source,
		}
	}
}

impl Classified for RenderError {
	fn class(&self) -> ErrorClass {
		match self {
			RenderError::MissingField(_) | RenderError::InvalidFileName(_) => ErrorClass::Configuration,
			RenderError::WriteFailed { .. } => ErrorClass::Integrity,
		}
	}
}

// =============================================================================
// Agent
// =============================================================================

/// Reason the agent entered `Failed`.
#[derive(Debug, Error)]
pub enum AgentError {
	#[error(transparent)]
	Config(#[from] ConfigError),

	#[error(transparent)]
	Auth(#[from] AuthError),

	#[error(transparent)]
	Fetch(#[from] FetchError),

	#[error(transparent)]
	Render(#[from] RenderError),

	#[error("{operation} kept failing for {elapsed:?}: {last_error}")]
	RetryExhausted {
		operation: Operation,
		elapsed: Duration,
		last_error: String,
	},

	#[error("identity token rejected {attempts} times: {source}")]
	TokenRejected {
		attempts: u32,
		#[source]
		source: AuthError,
	},

	#[error("fresh credentials rejected by the secret store {attempts} times")]
	CredentialRejected { attempts: u32 },
}

impl Classified for AgentError {
	fn class(&self) -> ErrorClass {
		match self {
			AgentError::Config(_) => ErrorClass::Configuration,
			AgentError::Auth(e) => e.class(),
			AgentError::Fetch(e) => e.class(),
			AgentError::Render(e) => e.class(),
			AgentError::RetryExhausted { .. } => ErrorClass::Transient { retry_after: None },
			AgentError::TokenRejected { .. } | AgentError::CredentialRejected { .. } => {
				ErrorClass::Credential
			}
		}
	}
}
