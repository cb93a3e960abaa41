// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The broker service: login, session renewal/revocation and policy-checked
//! secret reads.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};
use ward_common_secret::SecretString;

use crate::error::{BrokerError, BrokerResult};
use crate::policy::PolicyEngine;
use crate::store::{validate_path, SecretStore};
use crate::token_review::TokenReviewer;
use crate::types::{AuthInfo, Capability, Policy, Role, SecretResponse, MAX_TOKEN_TTL_SECS};

/// Prefix of issued session tokens.
pub const SESSION_TOKEN_PREFIX: &str = "ws.";

/// Failure the broker should report instead of serving the next request(s).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
	Unavailable,
	RateLimited { retry_after_secs: u64 },
}

impl From<Fault> for BrokerError {
	fn from(fault: Fault) -> Self {
		match fault {
			Fault::Unavailable => BrokerError::Unavailable,
			Fault::RateLimited { retry_after_secs } => BrokerError::RateLimited { retry_after_secs },
		}
	}
}

#[derive(Debug, Clone)]
struct Session {
	accessor: String,
	role: String,
	policies: BTreeSet<String>,
	ttl_secs: u64,
	renewable: bool,
	expires_at: DateTime<Utc>,
	max_expires_at: DateTime<Utc>,
}

impl Session {
	fn lease_secs(&self, now: DateTime<Utc>) -> u64 {
		(self.expires_at - now).num_seconds().max(0) as u64
	}

	fn auth_info(&self, client_token: String, now: DateTime<Utc>) -> AuthInfo {
		AuthInfo {
			client_token,
			accessor: self.accessor.clone(),
			policies: self.policies.clone(),
			lease_duration: self.lease_secs(now),
			renewable: self.renewable,
		}
	}
}

/// Request counters, mostly for tests and the dev server's shutdown summary.
#[derive(Debug, Default)]
pub struct BrokerStats {
	pub logins: AtomicU64,
	pub renewals: AtomicU64,
	pub revocations: AtomicU64,
	pub reads: AtomicU64,
	pub faults_served: AtomicU64,
}

impl BrokerStats {
	pub fn logins(&self) -> u64 {
		self.logins.load(Ordering::SeqCst)
	}

	pub fn renewals(&self) -> u64 {
		self.renewals.load(Ordering::SeqCst)
	}

	pub fn revocations(&self) -> u64 {
		self.revocations.load(Ordering::SeqCst)
	}

	pub fn reads(&self) -> u64 {
		self.reads.load(Ordering::SeqCst)
	}
}

fn token_digest(token: &str) -> String {
	hex::encode(Sha256::digest(token.as_bytes()))
}

fn ttl(secs: u64) -> Duration {
	Duration::seconds(secs.min(MAX_TOKEN_TTL_SECS) as i64)
}

fn random_hex(len: usize) -> String {
	let mut bytes = vec![0u8; len];
	rand::thread_rng().fill_bytes(&mut bytes);
	hex::encode(bytes)
}

pub struct Broker {
	reviewer: Arc<dyn TokenReviewer>,
	store: Arc<dyn SecretStore>,
	roles: RwLock<HashMap<String, Role>>,
	policies: RwLock<PolicyEngine>,
	/// Keyed by SHA-256 of the client token; plaintext tokens are never kept.
	sessions: RwLock<HashMap<String, Session>>,
	faults: Mutex<VecDeque<Fault>>,
	admin_token: Option<SecretString>,
	stats: BrokerStats,
}

impl Broker {
	pub fn new(reviewer: Arc<dyn TokenReviewer>, store: Arc<dyn SecretStore>) -> Self {
		Self {
			reviewer,
			store,
			roles: RwLock::new(HashMap::new()),
			policies: RwLock::new(PolicyEngine::new()),
			sessions: RwLock::new(HashMap::new()),
			faults: Mutex::new(VecDeque::new()),
			admin_token: None,
			stats: BrokerStats::default(),
		}
	}

	/// Enable writes through the HTTP API for holders of `token`.
	pub fn with_admin_token(mut self, token: SecretString) -> Self {
		self.admin_token = Some(token);
		self
	}

	pub fn store(&self) -> &Arc<dyn SecretStore> {
		&self.store
	}

	pub fn stats(&self) -> &BrokerStats {
		&self.stats
	}

	pub async fn upsert_role(&self, role: Role) {
		info!(role = %role.name, policies = ?role.policies, "registered role");
		self.roles.write().await.insert(role.name.clone(), role);
	}

	pub async fn upsert_policy(&self, policy: Policy) {
		info!(policy = %policy.name, rules = policy.rules.len(), "registered policy");
		self.policies.write().await.insert(policy);
	}

	/// Queue `count` copies of `fault`; each is served instead of one request.
	pub fn inject_fault(&self, fault: Fault, count: usize) {
		if let Ok(mut faults) = self.faults.lock() {
			faults.extend(std::iter::repeat(fault).take(count));
		}
	}

	/// Pop the next queued fault, if any.
	pub fn take_fault(&self) -> Option<Fault> {
		let fault = self.faults.lock().ok()?.pop_front();
		if fault.is_some() {
			self.stats.faults_served.fetch_add(1, Ordering::SeqCst);
		}
		fault
	}

	pub fn check_admin(&self, presented: Option<&str>) -> BrokerResult<()> {
		match (&self.admin_token, presented) {
			(Some(expected), Some(presented)) if expected.expose() == presented => Ok(()),
			_ => Err(BrokerError::InvalidSessionToken),
		}
	}

	/// Exchange an identity token for a session credential bound to `role`.
	#[instrument(skip(self, jwt), fields(role = %role))]
	pub async fn login(&self, role: &str, jwt: &str) -> BrokerResult<AuthInfo> {
		self.stats.logins.fetch_add(1, Ordering::SeqCst);

		if role.is_empty() {
			return Err(BrokerError::InvalidRequest("role is required".into()));
		}

		let identity = self.reviewer.review(jwt).await.map_err(|reason| {
			warn!(reason = %reason, "identity token rejected");
			BrokerError::InvalidIdentityToken(reason)
		})?;

		let role = self
			.roles
			.read()
			.await
			.get(role)
			.cloned()
			.ok_or_else(|| BrokerError::UnknownRole(role.to_string()))?;

		if !role.binds(&identity.namespace, &identity.service_account) {
			warn!(
				namespace = %identity.namespace,
				service_account = %identity.service_account,
				"identity not bound to role"
			);
			return Err(BrokerError::RoleNotBound {
				role: role.name.clone(),
				namespace: identity.namespace,
				service_account: identity.service_account,
			});
		}

		let now = Utc::now();
		let max_expires_at = now + ttl(role.token_max_ttl_secs);
		let expires_at = (now + ttl(role.token_ttl_secs)).min(max_expires_at);
		let session = Session {
			accessor: random_hex(12),
			role: role.name.clone(),
			policies: role.policies.clone(),
			ttl_secs: role.token_ttl_secs,
			renewable: role.renewable,
			expires_at,
			max_expires_at,
		};

		let client_token = format!("{SESSION_TOKEN_PREFIX}{}", random_hex(32));
		let auth = session.auth_info(client_token.clone(), now);
		{
			let mut sessions = self.sessions.write().await;
			let before = sessions.len();
			sessions.retain(|_, s| s.expires_at > now);
			if sessions.len() < before {
				debug!(purged = before - sessions.len(), "dropped expired sessions");
			}
			sessions.insert(token_digest(&client_token), session);
		}

		info!(
			accessor = %auth.accessor,
			namespace = %identity.namespace,
			service_account = %identity.service_account,
			lease_secs = auth.lease_duration,
			"issued session credential"
		);
		Ok(auth)
	}

	async fn live_session(&self, token: &str, now: DateTime<Utc>) -> BrokerResult<Session> {
		let digest = token_digest(token);
		let session = self.sessions.read().await.get(&digest).cloned();
		match session {
			Some(session) if session.expires_at > now => Ok(session),
			Some(_) => {
				self.sessions.write().await.remove(&digest);
				Err(BrokerError::InvalidSessionToken)
			}
			None => Err(BrokerError::InvalidSessionToken),
		}
	}

	/// Extend the caller's session by its role TTL, bounded by the max TTL.
	#[instrument(skip(self, token))]
	pub async fn renew_self(&self, token: &str) -> BrokerResult<AuthInfo> {
		self.stats.renewals.fetch_add(1, Ordering::SeqCst);
		let now = Utc::now();
		let session = self.live_session(token, now).await?;
		if !session.renewable {
			return Err(BrokerError::NotRenewable);
		}

		let mut sessions = self.sessions.write().await;
		let session = sessions
			.get_mut(&token_digest(token))
			.ok_or(BrokerError::InvalidSessionToken)?;
		session.expires_at = (now + ttl(session.ttl_secs)).min(session.max_expires_at);

		debug!(accessor = %session.accessor, role = %session.role, "renewed session");
		Ok(session.auth_info(token.to_string(), now))
	}

	#[instrument(skip(self, token))]
	pub async fn revoke_self(&self, token: &str) -> BrokerResult<()> {
		self.stats.revocations.fetch_add(1, Ordering::SeqCst);
		let removed = self.sessions.write().await.remove(&token_digest(token));
		match removed {
			Some(session) => {
				info!(accessor = %session.accessor, "revoked session");
				Ok(())
			}
			None => Err(BrokerError::InvalidSessionToken),
		}
	}

	/// Read the latest version of `path` if the session's policies allow it.
	#[instrument(skip(self, token), fields(path = %path))]
	pub async fn read_secret(&self, token: &str, path: &str) -> BrokerResult<SecretResponse> {
		self.stats.reads.fetch_add(1, Ordering::SeqCst);
		validate_path(path)?;
		let session = self.live_session(token, Utc::now()).await?;

		let allowed = self
			.policies
			.read()
			.await
			.is_allowed(&session.policies, path, Capability::Read);
		if !allowed {
			warn!(accessor = %session.accessor, "policy denied read");
			return Err(BrokerError::PermissionDenied(path.to_string()));
		}

		let secret = self
			.store
			.latest(path)
			.await?
			.ok_or_else(|| BrokerError::SecretNotFound(path.to_string()))?;

		Ok(SecretResponse {
			path: path.to_string(),
			version: secret.version,
			data: secret.data,
			lease_duration: secret.lease_duration_secs,
			renewable: secret.renewable,
		})
	}

	pub async fn write_secret(
		&self,
		path: &str,
		data: BTreeMap<String, String>,
		lease_duration_secs: Option<u64>,
	) -> BrokerResult<u64> {
		self.store.put(path, data, lease_duration_secs).await
	}

	/// Number of live sessions; expired ones are counted until touched.
	pub async fn session_count(&self) -> usize {
		self.sessions.read().await.len()
	}
}

impl std::fmt::Debug for Broker {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Broker")
			.field("has_admin_token", &self.admin_token.is_some())
			.field("stats", &self.stats)
			.finish_non_exhaustive()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::store::MemorySecretStore;
	use crate::token_review::{ReviewedIdentity, StaticTokenReviewer};
	use crate::types::PathRule;

	async fn broker(ttl: u64, max_ttl: u64, renewable: bool) -> Broker {
		let reviewer = StaticTokenReviewer::new();
		reviewer.insert(
			"app-token",
			ReviewedIdentity {
				namespace: "vaultdemo".into(),
				service_account: "app".into(),
				expires_at: i64::MAX,
			},
		);
		reviewer.insert(
			"default-token",
			ReviewedIdentity {
				namespace: "default".into(),
				service_account: "default".into(),
				expires_at: i64::MAX,
			},
		);

		let broker = Broker::new(Arc::new(reviewer), Arc::new(MemorySecretStore::new()));
		broker
			.upsert_policy(Policy {
				name: "hello-world".into(),
				rules: vec![PathRule {
					path: "certs/hello-world".into(),
					capabilities: BTreeSet::from([Capability::Read]),
				}],
			})
			.await;
		broker
			.upsert_role(Role {
				name: "hello-world".into(),
				bound_namespaces: vec!["vaultdemo".into()],
				bound_service_accounts: vec!["app".into()],
				policies: BTreeSet::from(["hello-world".to_string()]),
				token_ttl_secs: ttl,
				token_max_ttl_secs: max_ttl,
				renewable,
			})
			.await;
		broker
			.write_secret(
				"certs/hello-world",
				BTreeMap::from([
					("tls.crt".to_string(), "CERT".to_string()),
					("tls.key".to_string(), "KEY".to_string()),
				]),
				None,
			)
			.await
			.unwrap();
		broker
	}

	#[tokio::test]
	async fn login_issues_scoped_credential() {
		let broker = broker(86_400, 86_400 * 32, true).await;
		let auth = broker.login("hello-world", "app-token").await.unwrap();
		assert!(auth.client_token.starts_with(SESSION_TOKEN_PREFIX));
		assert_eq!(auth.policies, BTreeSet::from(["hello-world".to_string()]));
		assert!(auth.lease_duration >= 86_399);
		assert!(auth.renewable);
		assert_eq!(broker.session_count().await, 1);
	}

	#[tokio::test]
	async fn unbound_identity_is_refused() {
		let broker = broker(60, 120, true).await;
		let err = broker.login("hello-world", "default-token").await.unwrap_err();
		assert!(matches!(err, BrokerError::RoleNotBound { .. }));
		assert_eq!(broker.session_count().await, 0);
	}

	#[tokio::test]
	async fn unknown_identity_and_role_are_refused() {
		let broker = broker(60, 120, true).await;
		assert!(matches!(
			broker.login("hello-world", "forged").await,
			Err(BrokerError::InvalidIdentityToken(_))
		));
		assert!(matches!(
			broker.login("missing", "app-token").await,
			Err(BrokerError::UnknownRole(_))
		));
	}

	#[tokio::test]
	async fn read_respects_policy() {
		let broker = broker(60, 120, true).await;
		broker
			.write_secret(
				"certs/other",
				BTreeMap::from([("tls.crt".to_string(), "X".to_string())]),
				None,
			)
			.await
			.unwrap();
		let auth = broker.login("hello-world", "app-token").await.unwrap();

		let secret = broker
			.read_secret(&auth.client_token, "certs/hello-world")
			.await
			.unwrap();
		assert_eq!(secret.version, 1);
		assert_eq!(secret.data["tls.key"], "KEY");

		assert!(matches!(
			broker.read_secret(&auth.client_token, "certs/other").await,
			Err(BrokerError::PermissionDenied(_))
		));
		assert!(matches!(
			broker.read_secret("ws.bogus", "certs/hello-world").await,
			Err(BrokerError::InvalidSessionToken)
		));
	}

	#[tokio::test]
	async fn allowed_but_absent_secret_is_not_found() {
		let broker = broker(60, 120, true).await;
		broker.store().delete("certs/hello-world").await.unwrap();
		let auth = broker.login("hello-world", "app-token").await.unwrap();
		assert!(matches!(
			broker.read_secret(&auth.client_token, "certs/hello-world").await,
			Err(BrokerError::SecretNotFound(_))
		));
	}

	#[tokio::test]
	async fn renewal_is_capped_by_max_ttl() {
		let broker = broker(60, 90, true).await;
		let auth = broker.login("hello-world", "app-token").await.unwrap();
		let renewed = broker.renew_self(&auth.client_token).await.unwrap();
		assert_eq!(renewed.accessor, auth.accessor);
		assert!(renewed.lease_duration <= 60);
	}

	#[tokio::test]
	async fn oversized_ttl_is_clamped() {
		let broker = broker(u64::MAX, u64::MAX, true).await;
		let auth = broker.login("hello-world", "app-token").await.unwrap();
		assert!(auth.lease_duration <= MAX_TOKEN_TTL_SECS);
		assert!(auth.lease_duration > MAX_TOKEN_TTL_SECS - 5);
	}

	#[tokio::test]
	async fn login_drops_expired_sessions() {
		let broker = broker(60, 120, true).await;
		broker.login("hello-world", "app-token").await.unwrap();
		broker.login("hello-world", "app-token").await.unwrap();
		let past = Utc::now() - Duration::seconds(1);
		for session in broker.sessions.write().await.values_mut() {
			session.expires_at = past;
		}

		let auth = broker.login("hello-world", "app-token").await.unwrap();

		assert_eq!(broker.session_count().await, 1);
		assert!(broker
			.read_secret(&auth.client_token, "certs/hello-world")
			.await
			.is_ok());
	}

	#[tokio::test]
	async fn non_renewable_sessions_refuse_renewal() {
		let broker = broker(60, 120, false).await;
		let auth = broker.login("hello-world", "app-token").await.unwrap();
		assert!(!auth.renewable);
		assert!(matches!(
			broker.renew_self(&auth.client_token).await,
			Err(BrokerError::NotRenewable)
		));
	}

	#[tokio::test]
	async fn revoked_session_cannot_read() {
		let broker = broker(60, 120, true).await;
		let auth = broker.login("hello-world", "app-token").await.unwrap();
		broker.revoke_self(&auth.client_token).await.unwrap();
		assert!(matches!(
			broker.read_secret(&auth.client_token, "certs/hello-world").await,
			Err(BrokerError::InvalidSessionToken)
		));
		assert_eq!(broker.stats().revocations(), 1);
	}

	#[tokio::test]
	async fn zero_ttl_session_is_immediately_invalid() {
		let broker = broker(0, 0, true).await;
		let auth = broker.login("hello-world", "app-token").await.unwrap();
		assert_eq!(auth.lease_duration, 0);
		assert!(broker
			.read_secret(&auth.client_token, "certs/hello-world")
			.await
			.is_err());
	}

	#[test]
	fn faults_are_served_in_order() {
		let reviewer = StaticTokenReviewer::new();
		let broker = Broker::new(Arc::new(reviewer), Arc::new(MemorySecretStore::new()));
		broker.inject_fault(Fault::Unavailable, 2);
		broker.inject_fault(Fault::RateLimited { retry_after_secs: 3 }, 1);
		assert_eq!(broker.take_fault(), Some(Fault::Unavailable));
		assert_eq!(broker.take_fault(), Some(Fault::Unavailable));
		assert_eq!(
			broker.take_fault(),
			Some(Fault::RateLimited { retry_after_secs: 3 })
		);
		assert_eq!(broker.take_fault(), None);
	}

	#[test]
	fn admin_check_requires_configured_token() {
		let reviewer = StaticTokenReviewer::new();
		let broker = Broker::new(Arc::new(reviewer), Arc::new(MemorySecretStore::new()));
		assert!(broker.check_admin(Some("anything")).is_err());

		let broker = broker.with_admin_token(SecretString::new("root".into()));
		assert!(broker.check_admin(Some("root")).is_ok());
		assert!(broker.check_admin(Some("nope")).is_err());
		assert!(broker.check_admin(None).is_err());
	}
}
