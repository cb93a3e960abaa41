// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! Identity token review: the broker's trust anchor.
//!
//! A reviewer turns a presented identity token into a [`ReviewedIdentity`] or
//! a rejection reason. The reference implementation verifies HS256 tokens
//! against a shared key; [`StaticTokenReviewer`] returns canned identities for
//! tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use ward_common_identity::{verify_hs256, VerifyOptions};
use ward_common_secret::SecretBytes;

/// Identity established by a successful review.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewedIdentity {
	pub namespace: String,
	pub service_account: String,
	/// Unix seconds at which the presented token expires.
	pub expires_at: i64,
}

/// Outcome of a review. Rejections carry a human-readable reason.
pub type ReviewResult = Result<ReviewedIdentity, String>;

#[async_trait]
pub trait TokenReviewer: Send + Sync {
	async fn review(&self, token: &str) -> ReviewResult;
}

/// Verifies HS256-signed identity tokens.
pub struct Hs256TokenReviewer {
	key: SecretBytes,
	audience: String,
	issuer: Option<String>,
	leeway_secs: i64,
}

impl Hs256TokenReviewer {
	pub fn new(key: SecretBytes, audience: impl Into<String>, issuer: Option<String>) -> Self {
		Self {
			key,
			audience: audience.into(),
			issuer,
			leeway_secs: 0,
		}
	}

	pub fn with_leeway(mut self, leeway_secs: i64) -> Self {
		self.leeway_secs = leeway_secs;
		self
	}
}

impl std::fmt::Debug for Hs256TokenReviewer {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Hs256TokenReviewer")
			.field("audience", &self.audience)
			.field("issuer", &self.issuer)
			.finish_non_exhaustive()
	}
}

#[async_trait]
impl TokenReviewer for Hs256TokenReviewer {
	async fn review(&self, token: &str) -> ReviewResult {
		let options = VerifyOptions {
			audience: &self.audience,
			issuer: self.issuer.as_deref(),
			now: chrono::Utc::now().timestamp(),
			leeway: self.leeway_secs,
		};
		let claims = verify_hs256(token, self.key.expose(), &options).map_err(|e| e.to_string())?;

		let namespace = claims
			.namespace()
			.ok_or_else(|| "token carries no namespace".to_string())?
			.to_string();
		let service_account = claims
			.service_account_name()
			.ok_or_else(|| "token carries no service account".to_string())?
			.to_string();

		Ok(ReviewedIdentity {
			namespace,
			service_account,
			expires_at: claims.exp,
		})
	}
}

/// Maps literal token strings to identities. Unknown tokens are rejected.
#[derive(Debug, Default)]
pub struct StaticTokenReviewer {
	identities: Mutex<HashMap<String, ReviewedIdentity>>,
}

impl StaticTokenReviewer {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn insert(&self, token: impl Into<String>, identity: ReviewedIdentity) {
		if let Ok(mut identities) = self.identities.lock() {
			identities.insert(token.into(), identity);
		}
	}

	pub fn remove(&self, token: &str) {
		if let Ok(mut identities) = self.identities.lock() {
			identities.remove(token);
		}
	}
}

#[async_trait]
impl TokenReviewer for StaticTokenReviewer {
	async fn review(&self, token: &str) -> ReviewResult {
		let identities = self
			.identities
			.lock()
			.map_err(|_| "reviewer state poisoned".to_string())?;
		identities
			.get(token)
			.cloned()
			.ok_or_else(|| "token not recognised".to_string())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use ward_common_identity::{sign_hs256, IdentityClaims};

	const KEY: &[u8] = b"cluster-signing-key";

	fn reviewer() -> Hs256TokenReviewer {
		Hs256TokenReviewer::new(
			SecretBytes::new(KEY.to_vec()),
			"ward",
			Some("https://kubernetes.default.svc".into()),
		)
	}

	fn token(namespace: &str, account: &str, ttl: i64) -> String {
		let claims = IdentityClaims::service_account(
			"https://kubernetes.default.svc",
			"ward",
			namespace,
			account,
			chrono::Utc::now().timestamp(),
			ttl,
		);
		sign_hs256(&claims, KEY).unwrap()
	}

	#[tokio::test]
	async fn valid_token_yields_identity() {
		let identity = reviewer().review(&token("vaultdemo", "app", 600)).await.unwrap();
		assert_eq!(identity.namespace, "vaultdemo");
		assert_eq!(identity.service_account, "app");
	}

	#[tokio::test]
	async fn expired_token_is_rejected() {
		let reason = reviewer()
			.review(&token("vaultdemo", "app", -10))
			.await
			.unwrap_err();
		assert!(reason.contains("expired"));
	}

	#[tokio::test]
	async fn garbage_is_rejected() {
		assert!(reviewer().review("not-a-jwt").await.is_err());
	}

	#[tokio::test]
	async fn static_reviewer_answers_known_tokens() {
		let reviewer = StaticTokenReviewer::new();
		reviewer.insert(
			"token-a",
			ReviewedIdentity {
				namespace: "vaultdemo".into(),
				service_account: "app".into(),
				expires_at: i64::MAX,
			},
		);
		assert!(reviewer.review("token-a").await.is_ok());
		assert!(reviewer.review("token-b").await.is_err());

		reviewer.remove("token-a");
		assert!(reviewer.review("token-a").await.is_err());
	}

	#[test]
	fn debug_hides_key() {
		let debug = format!("{:?}", reviewer());
		assert!(!debug.contains("cluster-signing-key"));
	}
}
