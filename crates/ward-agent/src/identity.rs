// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Workload identity token sourcing.

use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;
use ward_common_identity::decode_unverified;
use ward_common_secret::SecretString;

use crate::error::AuthError;

/// Default path of the projected service account token.
pub const SA_TOKEN_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";

#[async_trait]
pub trait TokenSource: Send + Sync {
	/// Read the current identity token. Called before every authentication.
	async fn read_token(&self) -> Result<SecretString, AuthError>;
}

/// Reads the token from a file the hosting environment keeps fresh.
#[derive(Debug, Clone)]
pub struct FileTokenSource {
	path: PathBuf,
}

impl FileTokenSource {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self { path: path.into() }
	}
}

impl Default for FileTokenSource {
	fn default() -> Self {
		Self::new(SA_TOKEN_PATH)
	}
}

#[async_trait]
impl TokenSource for FileTokenSource {
	async fn read_token(&self) -> Result<SecretString, AuthError> {
		let raw = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
			AuthError::TokenUnavailable(format!("failed to read {}: {e}", self.path.display()))
		})?;
		let token = raw.trim();
		if token.is_empty() {
			return Err(AuthError::TokenUnavailable(format!(
				"{} is empty",
				self.path.display()
			)));
		}
		debug!(path = %self.path.display(), "read identity token");
		Ok(SecretString::new(token.to_string()))
	}
}

/// Hands out a fixed sequence of tokens; the last one repeats.
#[derive(Debug)]
pub struct StaticTokenSource {
	tokens: Mutex<Vec<SecretString>>,
}

impl StaticTokenSource {
	pub fn new(token: impl Into<String>) -> Self {
		Self::sequence([token])
	}

	pub fn sequence<I, S>(tokens: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		let mut tokens: Vec<SecretString> = tokens
			.into_iter()
			.map(|t| SecretString::new(t.into()))
			.collect();
		tokens.reverse();
		Self {
			tokens: Mutex::new(tokens),
		}
	}
}

#[async_trait]
impl TokenSource for StaticTokenSource {
	async fn read_token(&self) -> Result<SecretString, AuthError> {
		let mut tokens = self
			.tokens
			.lock()
			.map_err(|_| AuthError::TokenUnavailable("token source poisoned".into()))?;
		match tokens.len() {
			0 => Err(AuthError::TokenUnavailable("no token configured".into())),
			1 => Ok(tokens[0].clone()),
			_ => tokens
				.pop()
				.ok_or_else(|| AuthError::TokenUnavailable("no token configured".into())),
		}
	}
}

/// Fail fast on a token whose `exp` claim has passed. Tokens whose payload
/// does not decode are treated as opaque and pass.
pub fn ensure_token_fresh(token: &SecretString, now: i64) -> Result<(), AuthError> {
	match decode_unverified(token.expose()) {
		Ok(claims) if claims.is_expired_at(now) => Err(AuthError::TokenExpired {
			expired_at: claims.exp,
		}),
		Ok(_) => Ok(()),
		Err(e) => {
			debug!(reason = %e, "identity token is opaque, skipping local expiry check");
			Ok(())
		}
	}
}
