// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Versioned secret storage.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{BrokerError, BrokerResult};
use crate::types::SecretVersion;

/// Validate a secret path: relative, `/`-separated, no empty or dot segments.
pub fn validate_path(path: &str) -> BrokerResult<()> {
	if path.is_empty() || path.len() > 512 {
		return Err(BrokerError::InvalidPath("path length must be 1-512".into()));
	}
	for segment in path.split('/') {
		if segment.is_empty() || segment == "." || segment == ".." {
			return Err(BrokerError::InvalidPath(format!(
				"invalid segment in {path:?}"
			)));
		}
		if !segment
			.chars()
			.all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
		{
			return Err(BrokerError::InvalidPath(format!(
				"invalid characters in {path:?}"
			)));
		}
	}
	Ok(())
}

#[async_trait]
pub trait SecretStore: Send + Sync {
	/// Latest version at `path`, if any.
	async fn latest(&self, path: &str) -> BrokerResult<Option<SecretVersion>>;

	/// Write a new version and return its number (first version is 1).
	async fn put(
		&self,
		path: &str,
		data: BTreeMap<String, String>,
		lease_duration_secs: Option<u64>,
	) -> BrokerResult<u64>;

	/// Remove every version at `path`. Returns whether anything was removed.
	async fn delete(&self, path: &str) -> BrokerResult<bool>;
}

/// In-memory store keeping the full version history per path.
#[derive(Debug, Default)]
pub struct MemorySecretStore {
	secrets: RwLock<HashMap<String, Vec<SecretVersion>>>,
}

impl MemorySecretStore {
	pub fn new() -> Self {
		Self::default()
	}

	/// Number of versions stored at `path`.
	pub async fn version_count(&self, path: &str) -> usize {
		self
			.secrets
			.read()
			.await
			.get(path)
			.map(Vec::len)
			.unwrap_or(0)
	}
}

#[async_trait]
impl SecretStore for MemorySecretStore {
	async fn latest(&self, path: &str) -> BrokerResult<Option<SecretVersion>> {
		validate_path(path)?;
		Ok(self
			.secrets
			.read()
			.await
			.get(path)
			.and_then(|versions| versions.last().cloned()))
	}

	async fn put(
		&self,
		path: &str,
		data: BTreeMap<String, String>,
		lease_duration_secs: Option<u64>,
	) -> BrokerResult<u64> {
		validate_path(path)?;
		if data.is_empty() {
			return Err(BrokerError::InvalidRequest("secret data is empty".into()));
		}

		let mut secrets = self.secrets.write().await;
		let versions = secrets.entry(path.to_string()).or_default();
		let version = versions.last().map(|v| v.version + 1).unwrap_or(1);
		versions.push(SecretVersion {
			version,
			data,
			lease_duration_secs,
			renewable: false,
		});

		debug!(path = %path, version, "stored secret version");
		Ok(version)
	}

	async fn delete(&self, path: &str) -> BrokerResult<bool> {
		validate_path(path)?;
		Ok(self.secrets.write().await.remove(path).is_some())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn cert(body: &str) -> BTreeMap<String, String> {
		BTreeMap::from([
			("tls.crt".to_string(), format!("CERT {body}")),
			("tls.key".to_string(), format!("KEY {body}")),
		])
	}

	#[tokio::test]
	async fn versions_increase_per_write() {
		let store = MemorySecretStore::new();
		assert_eq!(store.put("certs/hello-world", cert("a"), None).await.unwrap(), 1);
		assert_eq!(store.put("certs/hello-world", cert("b"), Some(60)).await.unwrap(), 2);

		let latest = store.latest("certs/hello-world").await.unwrap().unwrap();
		assert_eq!(latest.version, 2);
		assert_eq!(latest.data["tls.crt"], "CERT b");
		assert_eq!(latest.lease_duration_secs, Some(60));
		assert_eq!(store.version_count("certs/hello-world").await, 2);
	}

	#[tokio::test]
	async fn missing_path_is_none() {
		let store = MemorySecretStore::new();
		assert!(store.latest("certs/absent").await.unwrap().is_none());
	}

	#[tokio::test]
	async fn delete_removes_history() {
		let store = MemorySecretStore::new();
		store.put("certs/x", cert("a"), None).await.unwrap();
		assert!(store.delete("certs/x").await.unwrap());
		assert!(!store.delete("certs/x").await.unwrap());
		assert!(store.latest("certs/x").await.unwrap().is_none());
	}

	#[tokio::test]
	async fn empty_data_is_rejected() {
		let store = MemorySecretStore::new();
		assert!(matches!(
			store.put("certs/x", BTreeMap::new(), None).await,
			Err(BrokerError::InvalidRequest(_))
		));
	}

	#[test]
	fn path_validation() {
		assert!(validate_path("certs/hello-world").is_ok());
		assert!(validate_path("certs/v1.2/app_cert").is_ok());
		assert!(validate_path("").is_err());
		assert!(validate_path("/certs").is_err());
		assert!(validate_path("certs/").is_err());
		assert!(validate_path("certs/../root").is_err());
		assert!(validate_path("certs/a b").is_err());
	}
}
