// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Seed file for the development broker.
//!
//! ```toml
//! listen_addr = "127.0.0.1:8200"
//! audience = "ward"
//! signing_key = "cluster-signing-key"
//! admin_token = "root"
//!
//! [[policies]]
//! name = "hello-world"
//! rules = [{ path = "certs/hello-world", capabilities = ["read"] }]
//!
//! [[roles]]
//! name = "hello-world"
//! bound_namespaces = ["vaultdemo"]
//! bound_service_accounts = ["app"]
//! policies = ["hello-world"]
//!
//! [[secrets]]
//! path = "certs/hello-world"
//! data = { "tls.crt" = "...", "tls.key" = "..." }
//! ```

use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use ward_common_secret::{SecretBytes, SecretString};

use crate::error::{BrokerError, BrokerResult};
use crate::service::Broker;
use crate::store::{MemorySecretStore, SecretStore};
use crate::token_review::Hs256TokenReviewer;
use crate::types::{Policy, Role};

#[derive(Debug, Clone, Deserialize)]
pub struct SeedSecret {
	pub path: String,
	pub data: BTreeMap<String, String>,
	#[serde(default)]
	pub lease_duration: Option<u64>,
}

#[derive(Deserialize)]
pub struct DevServerConfig {
	#[serde(default = "default_listen_addr")]
	pub listen_addr: SocketAddr,
	#[serde(default = "default_audience")]
	pub audience: String,
	#[serde(default)]
	pub issuer: Option<String>,
	signing_key: String,
	#[serde(default)]
	admin_token: Option<String>,
	#[serde(default = "default_leeway")]
	pub leeway_secs: i64,
	#[serde(default)]
	pub policies: Vec<Policy>,
	#[serde(default)]
	pub roles: Vec<Role>,
	#[serde(default)]
	pub secrets: Vec<SeedSecret>,
}

fn default_listen_addr() -> SocketAddr {
	SocketAddr::from(([127, 0, 0, 1], 8200))
}

fn default_audience() -> String {
	"ward".to_string()
}

fn default_leeway() -> i64 {
	30
}

impl std::fmt::Debug for DevServerConfig {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("DevServerConfig")
			.field("listen_addr", &self.listen_addr)
			.field("audience", &self.audience)
			.field("issuer", &self.issuer)
			.field("policies", &self.policies.len())
			.field("roles", &self.roles.len())
			.field("secrets", &self.secrets.len())
			.finish_non_exhaustive()
	}
}

impl DevServerConfig {
	pub fn from_toml(contents: &str) -> BrokerResult<Self> {
		let config: Self = toml::from_str(contents)
			.map_err(|e| BrokerError::Configuration(format!("invalid seed file: {e}")))?;
		config.validate()?;
		Ok(config)
	}

	pub fn load(path: &Path) -> BrokerResult<Self> {
		let contents = std::fs::read_to_string(path).map_err(|e| {
			BrokerError::Configuration(format!("failed to read {}: {e}", path.display()))
		})?;
		Self::from_toml(&contents)
	}

	fn validate(&self) -> BrokerResult<()> {
		if self.signing_key.is_empty() {
			return Err(BrokerError::Configuration("signing_key must not be empty".into()));
		}
		let known: HashSet<&str> = self.policies.iter().map(|p| p.name.as_str()).collect();
		for role in &self.roles {
			role.check_ttls().map_err(BrokerError::Configuration)?;
			if let Some(missing) = role.policies.iter().find(|p| !known.contains(p.as_str())) {
				return Err(BrokerError::Configuration(format!(
					"role {} references unknown policy {missing}",
					role.name
				)));
			}
		}
		Ok(())
	}

	/// Build a broker with the seeded policies, roles and secrets.
	pub async fn build_broker(&self) -> BrokerResult<Broker> {
		let reviewer = Hs256TokenReviewer::new(
			SecretBytes::from_text(&self.signing_key),
			self.audience.clone(),
			self.issuer.clone(),
		)
		.with_leeway(self.leeway_secs);

		let store: Arc<dyn SecretStore> = Arc::new(MemorySecretStore::new());
		for secret in &self.secrets {
			store
				.put(&secret.path, secret.data.clone(), secret.lease_duration)
				.await?;
		}

		let mut broker = Broker::new(Arc::new(reviewer), store);
		if let Some(token) = &self.admin_token {
			broker = broker.with_admin_token(SecretString::new(token.clone()));
		}
		for policy in &self.policies {
			broker.upsert_policy(policy.clone()).await;
		}
		for role in &self.roles {
			broker.upsert_role(role.clone()).await;
		}
		Ok(broker)
	}
}
