// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Broker domain types and the JSON shapes exchanged with agents.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Capability granted (or refused) by a policy rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
	Read,
	List,
	Deny,
}

/// A single path rule. A pattern ending in `*` matches by prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathRule {
	pub path: String,
	pub capabilities: BTreeSet<Capability>,
}

/// A named set of path rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
	pub name: String,
	#[serde(default)]
	pub rules: Vec<PathRule>,
}

/// Binds workload identities to a set of policies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
	pub name: String,
	/// `*` matches any namespace.
	pub bound_namespaces: Vec<String>,
	/// `*` matches any service account.
	pub bound_service_accounts: Vec<String>,
	pub policies: BTreeSet<String>,
	#[serde(default = "default_token_ttl")]
	pub token_ttl_secs: u64,
	#[serde(default = "default_token_max_ttl")]
	pub token_max_ttl_secs: u64,
	#[serde(default = "default_renewable")]
	pub renewable: bool,
}

/// Longest session TTL a role may grant.
pub const MAX_TOKEN_TTL_SECS: u64 = 10 * 365 * 24 * 60 * 60;

fn default_token_ttl() -> u64 {
	24 * 60 * 60
}

fn default_token_max_ttl() -> u64 {
	32 * 24 * 60 * 60
}

fn default_renewable() -> bool {
	true
}

impl Role {
	pub fn binds(&self, namespace: &str, service_account: &str) -> bool {
		let ns_ok = self
			.bound_namespaces
			.iter()
			.any(|ns| ns == "*" || ns == namespace);
		let sa_ok = self
			.bound_service_accounts
			.iter()
			.any(|sa| sa == "*" || sa == service_account);
		ns_ok && sa_ok
	}

	/// Both TTLs must lie in `1..=MAX_TOKEN_TTL_SECS`.
	pub fn check_ttls(&self) -> Result<(), String> {
		for (key, secs) in [
			("token_ttl_secs", self.token_ttl_secs),
			("token_max_ttl_secs", self.token_max_ttl_secs),
		] {
			if secs == 0 || secs > MAX_TOKEN_TTL_SECS {
				return Err(format!(
					"role {}: {key} must be between 1 and {MAX_TOKEN_TTL_SECS}, got {secs}",
					self.name
				));
			}
		}
		Ok(())
	}
}

/// One stored version of a secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretVersion {
	pub version: u64,
	pub data: BTreeMap<String, String>,
	/// Set for dynamic secrets; static secrets have no lease.
	pub lease_duration_secs: Option<u64>,
	pub renewable: bool,
}

// =============================================================================
// Wire types
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
	pub role: String,
	pub jwt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthInfo {
	pub client_token: String,
	pub accessor: String,
	pub policies: BTreeSet<String>,
	pub lease_duration: u64,
	pub renewable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResponse {
	pub auth: AuthInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretResponse {
	pub path: String,
	pub version: u64,
	pub data: BTreeMap<String, String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub lease_duration: Option<u64>,
	#[serde(default)]
	pub renewable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteSecretRequest {
	pub data: BTreeMap<String, String>,
	#[serde(default)]
	pub lease_duration: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteSecretResponse {
	pub version: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
	pub error: String,
	pub message: String,
}

#[cfg(test)]
mod tests {
	use super::*;

	fn role(namespaces: &[&str], accounts: &[&str]) -> Role {
		Role {
			name: "hello-world".into(),
			bound_namespaces: namespaces.iter().map(|s| s.to_string()).collect(),
			bound_service_accounts: accounts.iter().map(|s| s.to_string()).collect(),
			policies: BTreeSet::from(["hello-world".to_string()]),
			token_ttl_secs: default_token_ttl(),
			token_max_ttl_secs: default_token_max_ttl(),
			renewable: true,
		}
	}

	#[test]
	fn role_binds_exact_identity() {
		let r = role(&["vaultdemo"], &["app"]);
		assert!(r.binds("vaultdemo", "app"));
		assert!(!r.binds("default", "app"));
		assert!(!r.binds("vaultdemo", "default"));
	}

	#[test]
	fn role_wildcards_match_anything() {
		let r = role(&["*"], &["app"]);
		assert!(r.binds("anything", "app"));
		assert!(!r.binds("anything", "other"));
	}

	#[test]
	fn role_defaults_from_toml() {
		let r: Role = toml::from_str(
			r#"
			name = "hello-world"
			bound_namespaces = ["vaultdemo"]
			bound_service_accounts = ["app"]
			policies = ["hello-world"]
			"#,
		)
		.unwrap();
		assert_eq!(r.token_ttl_secs, 86_400);
		assert!(r.renewable);
	}

	#[test]
	fn secret_response_omits_missing_lease() {
		let body = SecretResponse {
			path: "certs/hello-world".into(),
			version: 1,
			data: BTreeMap::new(),
			lease_duration: None,
			renewable: false,
		};
		let json = serde_json::to_string(&body).unwrap();
		assert!(!json.contains("lease_duration"));
	}
}
