// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// `aud` may be a single string or an array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
	One(String),
	Many(Vec<String>),
}

impl Audience {
	pub fn contains(&self, audience: &str) -> bool {
		match self {
			Audience::One(a) => a == audience,
			Audience::Many(all) => all.iter().any(|a| a == audience),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedRef {
	pub name: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub uid: Option<String>,
}

/// The `kubernetes.io` claim carried by projected service account tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubernetesClaims {
	pub namespace: String,
	pub serviceaccount: NamedRef,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub pod: Option<NamedRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityClaims {
	pub iss: String,
	/// `system:serviceaccount:{namespace}:{name}` for Kubernetes tokens.
	pub sub: String,
	pub aud: Audience,
	pub exp: i64,
	pub iat: i64,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub nbf: Option<i64>,
	#[serde(
		rename = "kubernetes.io",
		default,
		skip_serializing_if = "Option::is_none"
	)]
	pub kubernetes: Option<KubernetesClaims>,
}

impl IdentityClaims {
	/// Claims for a service account token valid for `ttl_seconds` from `now`.
	pub fn service_account(
		issuer: &str,
		audience: &str,
		namespace: &str,
		service_account: &str,
		now: i64,
		ttl_seconds: i64,
	) -> Self {
		Self {
			iss: issuer.to_string(),
			sub: format!("system:serviceaccount:{namespace}:{service_account}"),
			aud: Audience::Many(vec![audience.to_string()]),
			exp: now + ttl_seconds,
			iat: now,
			nbf: Some(now),
			kubernetes: Some(KubernetesClaims {
				namespace: namespace.to_string(),
				serviceaccount: NamedRef {
					name: service_account.to_string(),
					uid: None,
				},
				pod: None,
			}),
		}
	}

	pub fn is_expired_at(&self, now: i64) -> bool {
		now >= self.exp
	}

	pub fn expires_at(&self) -> Option<DateTime<Utc>> {
		Utc.timestamp_opt(self.exp, 0).single()
	}

	/// Namespace from the `kubernetes.io` claim, falling back to the subject.
	pub fn namespace(&self) -> Option<&str> {
		if let Some(k8s) = &self.kubernetes {
			return Some(k8s.namespace.as_str());
		}
		self.subject_part(2)
	}

	/// Service account name from the `kubernetes.io` claim, falling back to the subject.
	pub fn service_account_name(&self) -> Option<&str> {
		if let Some(k8s) = &self.kubernetes {
			return Some(k8s.serviceaccount.name.as_str());
		}
		self.subject_part(3)
	}

	fn subject_part(&self, index: usize) -> Option<&str> {
		let parts: Vec<&str> = self.sub.split(':').collect();
		if parts.len() == 4 && parts[0] == "system" && parts[1] == "serviceaccount" {
			Some(parts[index])
		} else {
			None
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn service_account_claims_carry_identity() {
		let claims = IdentityClaims::service_account(
			"https://kubernetes.default.svc",
			"ward",
			"vaultdemo",
			"app",
			1_000,
			600,
		);
		assert_eq!(claims.sub, "system:serviceaccount:vaultdemo:app");
		assert_eq!(claims.namespace(), Some("vaultdemo"));
		assert_eq!(claims.service_account_name(), Some("app"));
		assert!(!claims.is_expired_at(1_599));
		assert!(claims.is_expired_at(1_600));
	}

	#[test]
	fn identity_falls_back_to_subject() {
		let mut claims =
			IdentityClaims::service_account("iss", "ward", "ignored", "ignored", 0, 60);
		claims.kubernetes = None;
		claims.sub = "system:serviceaccount:payments:api".to_string();
		assert_eq!(claims.namespace(), Some("payments"));
		assert_eq!(claims.service_account_name(), Some("api"));

		claims.sub = "admin".to_string();
		assert_eq!(claims.namespace(), None);
	}

	#[test]
	fn audience_accepts_string_or_array() {
		let one: Audience = serde_json::from_str("\"ward\"").unwrap();
		let many: Audience = serde_json::from_str("[\"api\",\"ward\"]").unwrap();
		assert!(one.contains("ward"));
		assert!(many.contains("ward"));
		assert!(!many.contains("other"));
	}
}
