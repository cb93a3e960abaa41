// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The agent state machine.
//!
//! ```text
//! Unauthenticated -> Authenticated -> SecretFetched -> Rendering -> Steady
//!                         ^    |                                     |
//!                         |    v                                     v
//!                    ReAuthenticating <------------------------- Renewing
//! ```
//!
//! A single task drives every transition. Network calls and sleeps are raced
//! against shutdown; a step abandoned because of shutdown commits no
//! transition. Renders are never abandoned once started.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use ward_common_http::{Backoff, BackoffConfig};

use crate::auth::AuthClient;
use crate::config::{self, AgentConfig};
use crate::error::{
	AgentError, AuthError, Classified, ErrorClass, FetchError, RenderError,
};
use crate::fetch::SecretFetcher;
use crate::health::HealthState;
use crate::identity::TokenSource;
use crate::metrics::Metrics;
use crate::render::Renderer;
use crate::state::{AgentState, Operation, StateHistory, Transition};
use crate::types::{SecretRecord, SessionCredential};

/// A renewal must push expiry out by more than this to count as an extension.
const MIN_RENEWAL_EXTENSION: Duration = Duration::from_secs(1);

/// Upper bound on best-effort revocation at shutdown.
const REVOKE_BUDGET: Duration = Duration::from_secs(5);

/// Behavioural settings for [`Agent`].
#[derive(Debug, Clone)]
pub struct AgentSettings {
	pub role: String,
	pub secret_path: String,
	pub renewal_fraction: f64,
	pub renewal_jitter: f64,
	pub static_secret_poll: Duration,
	pub backoff: BackoffConfig,
	pub wait_for_secret: Duration,
	pub token_resource_attempts: u32,
	pub exit_after_render: bool,
	pub revoke_on_shutdown: bool,
}

impl AgentSettings {
	pub fn new(role: impl Into<String>, secret_path: impl Into<String>) -> Self {
		Self {
			role: role.into(),
			secret_path: secret_path.into(),
			renewal_fraction: config::DEFAULT_RENEWAL_FRACTION,
			renewal_jitter: config::DEFAULT_RENEWAL_JITTER,
			static_secret_poll: Duration::from_secs(config::DEFAULT_STATIC_POLL_SECS),
			backoff: BackoffConfig {
				initial_interval: Duration::from_millis(config::DEFAULT_BACKOFF_INITIAL_MS),
				max_interval: Duration::from_millis(config::DEFAULT_BACKOFF_MAX_MS),
				multiplier: config::DEFAULT_BACKOFF_MULTIPLIER,
				max_elapsed: Duration::from_secs(config::DEFAULT_BACKOFF_MAX_ELAPSED_SECS),
				..BackoffConfig::default()
			},
			wait_for_secret: Duration::ZERO,
			token_resource_attempts: config::DEFAULT_TOKEN_RESOURCE_ATTEMPTS,
			exit_after_render: false,
			revoke_on_shutdown: true,
		}
	}
}

impl From<&AgentConfig> for AgentSettings {
	fn from(config: &AgentConfig) -> Self {
		Self {
			role: config.role.clone(),
			secret_path: config.secret_path.clone(),
			renewal_fraction: config.renewal_fraction,
			renewal_jitter: config.renewal_jitter,
			static_secret_poll: config.static_secret_poll,
			backoff: config.backoff.clone(),
			wait_for_secret: config.wait_for_secret,
			token_resource_attempts: config.token_resource_attempts,
			exit_after_render: config.exit_after_render,
			revoke_on_shutdown: config.revoke_on_shutdown,
		}
	}
}

/// How a run that did not fail ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentExit {
	/// Shutdown was requested.
	Shutdown,
	/// Init-container mode: the first render completed.
	Rendered,
}

/// Why the driving loop stopped.
enum Halt {
	Shutdown,
	Failed(AgentError),
}

impl From<AgentError> for Halt {
	fn from(err: AgentError) -> Self {
		Halt::Failed(err)
	}
}

impl From<AuthError> for Halt {
	fn from(err: AuthError) -> Self {
		Halt::Failed(err.into())
	}
}

impl From<FetchError> for Halt {
	fn from(err: FetchError) -> Self {
		Halt::Failed(err.into())
	}
}

impl From<RenderError> for Halt {
	fn from(err: RenderError) -> Self {
		Halt::Failed(err.into())
	}
}

/// Upcoming deadlines. The earliest one wakes the agent from `Steady`.
#[derive(Debug, Default, Clone, Copy)]
struct Schedule {
	credential_at: Option<Instant>,
	secret_at: Option<Instant>,
	render_retry_at: Option<Instant>,
}

impl Schedule {
	fn next(&self) -> Option<Instant> {
		[self.credential_at, self.secret_at, self.render_retry_at]
			.into_iter()
			.flatten()
			.min()
	}
}

pub struct Agent {
	settings: AgentSettings,
	tokens: Arc<dyn TokenSource>,
	auth: Arc<dyn AuthClient>,
	fetcher: Arc<dyn SecretFetcher>,
	renderer: Renderer,
	metrics: Arc<Metrics>,
	health: HealthState,

	state: AgentState,
	history: StateHistory,
	state_tx: watch::Sender<AgentState>,
	shutdown: watch::Receiver<bool>,

	credential: Option<SessionCredential>,
	record: Option<SecretRecord>,
	/// Fetched but not yet on disk; retried at `render_retry_at`.
	pending: Option<SecretRecord>,
	schedule: Schedule,
	render_backoff: Backoff,
	rendered_once: bool,
}

impl Agent {
	pub fn new(
		settings: AgentSettings,
		tokens: Arc<dyn TokenSource>,
		auth: Arc<dyn AuthClient>,
		fetcher: Arc<dyn SecretFetcher>,
		renderer: Renderer,
		shutdown: watch::Receiver<bool>,
	) -> Self {
		let (state_tx, _) = watch::channel(AgentState::Unauthenticated);
		let render_backoff = Backoff::new(settings.backoff.clone());
		Self {
			settings,
			tokens,
			auth,
			fetcher,
			renderer,
			metrics: Arc::new(Metrics::new()),
			health: HealthState::new(),
			state: AgentState::Unauthenticated,
			history: StateHistory::default(),
			state_tx,
			shutdown,
			credential: None,
			record: None,
			pending: None,
			schedule: Schedule::default(),
			render_backoff,
			rendered_once: false,
		}
	}

	pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
		metrics.set_state(self.state);
		self.metrics = metrics;
		self
	}

	pub fn with_health(mut self, health: HealthState) -> Self {
		self.health = health;
		self
	}

	pub fn state(&self) -> AgentState {
		self.state
	}

	pub fn history(&self) -> &StateHistory {
		&self.history
	}

	/// Receive every state the agent enters.
	pub fn subscribe(&self) -> watch::Receiver<AgentState> {
		self.state_tx.subscribe()
	}

	/// The most recently rendered secret version.
	pub fn secret_version(&self) -> Option<u64> {
		self.record.as_ref().map(|r| r.version)
	}

	/// Drive the agent until shutdown, the first render in init-container
	/// mode, or a fatal error. A fatal error leaves the agent in `Failed`.
	pub async fn run(&mut self) -> Result<AgentExit, AgentError> {
		info!(
			role = %self.settings.role,
			secret_path = %self.settings.secret_path,
			target_dir = %self.renderer.target_dir().display(),
			"agent starting"
		);

		let outcome = match self.drive().await {
			Ok(exit) => Ok(exit),
			Err(Halt::Shutdown) => {
				info!(state = %self.state, "shutdown requested");
				Ok(AgentExit::Shutdown)
			}
			Err(Halt::Failed(err)) => {
				self.fail(&err).await;
				Err(err)
			}
		};

		// Dynamic secrets handed to an init container must outlive the agent.
		if outcome.as_ref().ok() != Some(&AgentExit::Rendered) {
			self.revoke().await;
		}
		outcome
	}

	async fn drive(&mut self) -> Result<AgentExit, Halt> {
		self.authenticate().await?;
		self.refresh_secret().await?;

		if self.settings.exit_after_render {
			info!("secret rendered, exiting");
			return Ok(AgentExit::Rendered);
		}

		loop {
			self.wait_for_next_cycle().await?;
			self.transition(AgentState::Renewing).await;
			self.renew_cycle().await?;
		}
	}

	async fn renew_cycle(&mut self) -> Result<(), Halt> {
		let now = Instant::now();
		let due = |at: Option<Instant>| at.is_some_and(|at| at <= now);
		let credential_due = due(self.schedule.credential_at);
		let secret_due = due(self.schedule.secret_at);
		let render_due = due(self.schedule.render_retry_at);
		debug!(credential_due, secret_due, render_due, "renewal cycle");

		if credential_due && !self.renew_credential().await? {
			self.reauthenticate().await?;
			return self.refresh_secret().await;
		}

		if secret_due {
			return self.refresh_secret().await;
		}
		if render_due {
			return match self.pending.take() {
				Some(record) => self.render(record).await,
				None => self.refresh_secret().await,
			};
		}
		self.transition(AgentState::Steady).await;
		Ok(())
	}

	// =========================================================================
	// Authentication
	// =========================================================================

	async fn authenticate(&mut self) -> Result<(), Halt> {
		let mut rejected = 0;
		loop {
			let tokens = self.tokens.clone();
			let auth = self.auth.clone();
			let role = self.settings.role.clone();
			let result = self
				.with_retry(Operation::Authenticate, || {
					let (tokens, auth, role) = (tokens.clone(), auth.clone(), role.clone());
					async move {
						let token = tokens.read_token().await?;
						auth.authenticate(&role, &token).await
					}
				})
				.await?;

			match result {
				Ok(credential) => {
					info!(
						accessor = %credential.accessor,
						policies = ?credential.policies,
						lease_secs = credential.lease.duration.as_secs(),
						renewable = credential.lease.renewable,
						"authenticated"
					);
					self.install_credential(credential).await;
					self.transition(AgentState::Authenticated).await;
					return Ok(());
				}
				Err(err) if err.class() == ErrorClass::Credential => {
					rejected += 1;
					if rejected >= self.settings.token_resource_attempts {
						return Err(Halt::Failed(AgentError::TokenRejected {
							attempts: rejected,
							source: err,
						}));
					}
					warn!(error = %err, attempt = rejected, "identity token rejected, re-reading token");
					self.sleep(self.settings.backoff.initial_interval).await?;
				}
				Err(err) => return Err(err.into()),
			}
		}
	}

	async fn reauthenticate(&mut self) -> Result<(), Halt> {
		self.transition(AgentState::ReAuthenticating).await;
		self.credential = None;
		self.schedule.credential_at = None;
		self.health.set_credential_expiry(None).await;
		self.authenticate().await
	}

	/// Renew the current credential. `false` means re-authentication is
	/// needed instead.
	async fn renew_credential(&mut self) -> Result<bool, Halt> {
		let Some(current) = self.credential.clone() else {
			return Ok(false);
		};
		if !current.lease.renewable {
			info!(accessor = %current.accessor, "credential is not renewable, re-authenticating");
			return Ok(false);
		}

		let auth = self.auth.clone();
		let result = self
			.with_retry(Operation::Renew, || {
				let (auth, current) = (auth.clone(), current.clone());
				async move { auth.renew(&current).await }
			})
			.await?;

		match result {
			Ok(renewed) => {
				if renewed.lease.expires_at() <= current.lease.expires_at() + MIN_RENEWAL_EXTENSION {
					info!(
						accessor = %current.accessor,
						"credential reached its maximum lifetime, re-authenticating"
					);
					return Ok(false);
				}
				info!(
					accessor = %renewed.accessor,
					lease_secs = renewed.lease.duration.as_secs(),
					"credential renewed"
				);
				self.install_credential(renewed).await;
				Ok(true)
			}
			Err(err) if err.class() == ErrorClass::Credential => {
				warn!(error = %err, "credential renewal rejected, re-authenticating");
				Ok(false)
			}
			Err(err) => Err(err.into()),
		}
	}

	async fn install_credential(&mut self, credential: SessionCredential) {
		let lease = credential.lease;
		self.schedule.credential_at = lease.schedule(
			self.settings.renewal_fraction,
			self.settings.renewal_jitter,
			fastrand::f64(),
		);
		let expires_at = (!lease.is_indefinite()).then(|| lease.expires_at());
		self.health.set_credential_expiry(expires_at).await;
		self.credential = Some(credential);
	}

	// =========================================================================
	// Fetch and render
	// =========================================================================

	/// Fetch the secret with the current credential and render it, ending in
	/// `Steady`.
	async fn refresh_secret(&mut self) -> Result<(), Halt> {
		let record = self.fetch_secret().await?;
		info!(
			path = %record.path,
			version = record.version,
			fields = record.data.len(),
			"secret fetched"
		);
		self.transition(AgentState::SecretFetched).await;
		self.render(record).await
	}

	async fn fetch_secret(&mut self) -> Result<SecretRecord, Halt> {
		let mut reauthentications = 0;
		let mut waiting: Option<Backoff> = None;

		loop {
			let Some(credential) = self.credential.clone() else {
				self.reauthenticate().await?;
				continue;
			};

			let fetcher = self.fetcher.clone();
			let path = self.settings.secret_path.clone();
			let result = self
				.with_retry(Operation::Fetch, || {
					let (fetcher, credential, path) = (fetcher.clone(), credential.clone(), path.clone());
					async move { fetcher.fetch(&credential, &path).await }
				})
				.await?;

			match result {
				Ok(record) => return Ok(record),
				Err(FetchError::NotFound(path)) if !self.settings.wait_for_secret.is_zero() => {
					let backoff = waiting.get_or_insert_with(|| {
						Backoff::new(BackoffConfig {
							max_elapsed: self.settings.wait_for_secret,
							..self.settings.backoff.clone()
						})
					});
					let Some(delay) = backoff.next_delay(None) else {
						return Err(FetchError::NotFound(path).into());
					};
					info!(%path, delay_ms = delay.as_millis() as u64, "secret not found yet, waiting");
					self.sleep(delay).await?;
				}
				Err(err) if err.class() == ErrorClass::Credential => {
					reauthentications += 1;
					if reauthentications > self.settings.token_resource_attempts {
						return Err(Halt::Failed(AgentError::CredentialRejected {
							attempts: self.settings.token_resource_attempts,
						}));
					}
					warn!(error = %err, "credential rejected while fetching, re-authenticating");
					self.reauthenticate().await?;
				}
				Err(err) => return Err(err.into()),
			}
		}
	}

	async fn render(&mut self, record: SecretRecord) -> Result<(), Halt> {
		self.transition(AgentState::Rendering).await;

		loop {
			let err = match self.renderer.render(&record).await {
				Ok(_) => {
					self.metrics.record(Operation::Render, "success");
					self.render_backoff.reset();
					self.schedule.render_retry_at = None;
					self.schedule.secret_at = Some(self.secret_deadline(&record));
					self.health.record_render(record.version).await;
					self.rendered_once = true;
					self.pending = None;
					self.record = Some(record);
					self.transition(AgentState::Steady).await;
					return Ok(());
				}
				Err(err) => err,
			};

			let class = err.class();
			self.metrics.record(Operation::Render, class.label());
			if class != ErrorClass::Integrity {
				return Err(err.into());
			}

			if self.rendered_once {
				// Previous files stay in place. Only the render is retried; the
				// record is not fetched again until it has reached disk.
				let delay = self
					.render_backoff
					.next_delay(None)
					.unwrap_or(self.settings.backoff.max_interval);
				warn!(
					error = %err,
					retry_in_ms = delay.as_millis() as u64,
					"render failed, keeping previously rendered files"
				);
				self.schedule.render_retry_at = Some(Instant::now() + delay);
				self.schedule.secret_at = None;
				self.pending = Some(record);
				self.health.set_render_pending().await;
				self.transition(AgentState::Steady).await;
				return Ok(());
			}

			let Some(delay) = self.render_backoff.next_delay(None) else {
				return Err(Halt::Failed(AgentError::RetryExhausted {
					operation: Operation::Render,
					elapsed: self.render_backoff.elapsed(),
					last_error: err.to_string(),
				}));
			};
			warn!(
				error = %err,
				attempt = self.render_backoff.attempts(),
				delay_ms = delay.as_millis() as u64,
				"initial render failed, retrying"
			);
			self.sleep(delay).await?;
		}
	}

	/// When the rendered secret should be fetched again.
	fn secret_deadline(&self, record: &SecretRecord) -> Instant {
		record
			.lease
			.and_then(|lease| {
				lease.schedule(
					self.settings.renewal_fraction,
					self.settings.renewal_jitter,
					fastrand::f64(),
				)
			})
			.unwrap_or_else(|| Instant::now() + self.settings.static_secret_poll)
	}

	// =========================================================================
	// Plumbing
	// =========================================================================

	/// Retry `attempt` while it fails transiently. Non-transient errors are
	/// handed back to the caller.
	async fn with_retry<T, E, F, Fut>(
		&self,
		operation: Operation,
		mut attempt: F,
	) -> Result<Result<T, E>, Halt>
	where
		F: FnMut() -> Fut,
		Fut: Future<Output = Result<T, E>>,
		E: Classified + std::fmt::Display,
	{
		let mut backoff = Backoff::new(self.settings.backoff.clone());
		let mut shutdown = self.shutdown.clone();

		loop {
			let result = tokio::select! {
				biased;
				_ = shutdown_requested(&mut shutdown) => return Err(Halt::Shutdown),
				result = attempt() => result,
			};

			let err = match result {
				Ok(value) => {
					self.metrics.record(operation, "success");
					return Ok(Ok(value));
				}
				Err(err) => err,
			};

			let class = err.class();
			self.metrics.record(operation, class.label());
			let ErrorClass::Transient { retry_after } = class else {
				return Ok(Err(err));
			};

			let Some(delay) = backoff.next_delay(retry_after) else {
				return Err(Halt::Failed(AgentError::RetryExhausted {
					operation,
					elapsed: backoff.elapsed(),
					last_error: err.to_string(),
				}));
			};

			warn!(
				%operation,
				error = %err,
				attempt = backoff.attempts(),
				delay_ms = delay.as_millis() as u64,
				"retrying after transient error"
			);

			tokio::select! {
				biased;
				_ = shutdown_requested(&mut shutdown) => return Err(Halt::Shutdown),
				_ = tokio::time::sleep(delay) => {}
			}
		}
	}

	async fn sleep(&self, duration: Duration) -> Result<(), Halt> {
		let mut shutdown = self.shutdown.clone();
		tokio::select! {
			biased;
			_ = shutdown_requested(&mut shutdown) => Err(Halt::Shutdown),
			_ = tokio::time::sleep(duration) => Ok(()),
		}
	}

	async fn wait_for_next_cycle(&self) -> Result<(), Halt> {
		let mut shutdown = self.shutdown.clone();
		let Some(at) = self.schedule.next() else {
			shutdown_requested(&mut shutdown).await;
			return Err(Halt::Shutdown);
		};

		debug!(
			wake_in_ms = at.saturating_duration_since(Instant::now()).as_millis() as u64,
			"waiting for next renewal"
		);
		tokio::select! {
			biased;
			_ = shutdown_requested(&mut shutdown) => Err(Halt::Shutdown),
			_ = tokio::time::sleep_until(at) => Ok(()),
		}
	}

	async fn transition(&mut self, next: AgentState) {
		let from = self.state;
		debug_assert!(
			from.can_transition_to(next),
			"illegal transition {from} -> {next}"
		);
		info!(%from, to = %next, "state transition");

		self.state = next;
		self.history.push(Transition {
			from,
			to: next,
			at: Utc::now(),
		});
		self.state_tx.send_replace(next);
		self.metrics.set_state(next);
		self.health.set_state(next).await;
	}

	async fn fail(&mut self, err: &AgentError) {
		error!(
			error = %err,
			class = err.class().label(),
			state = %self.state,
			"agent failed"
		);
		self.transition(AgentState::Failed).await;
		self.health.set_failed(err.to_string()).await;
	}

	async fn revoke(&mut self) {
		let Some(credential) = self.credential.take() else {
			return;
		};
		self.health.set_credential_expiry(None).await;
		if !self.settings.revoke_on_shutdown {
			return;
		}

		let cfg = BackoffConfig {
			max_elapsed: REVOKE_BUDGET,
			..self.settings.backoff.clone()
		};
		let auth = self.auth.clone();
		let result = ward_common_http::retry(&cfg, || {
			let (auth, credential) = (auth.clone(), credential.clone());
			async move { auth.revoke(&credential).await }
		})
		.await;

		match result {
			Ok(()) => info!(accessor = %credential.accessor, "credential revoked"),
			Err(e) => warn!(accessor = %credential.accessor, error = %e, "failed to revoke credential"),
		}
	}
}

/// Resolves once shutdown is requested. Never resolves if the sender is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
	let closed = shutdown.wait_for(|stop| *stop).await.is_err();
	if closed {
		std::future::pending::<()>().await;
	}
}
