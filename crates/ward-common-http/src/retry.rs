// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! Capped exponential backoff with jitter, bounded by a maximum elapsed time.
//!
//! Successive delays handed out by one [`Backoff`] never decrease and never
//! exceed `max_interval` (a server-provided retry-after hint may exceed it for
//! that single delay). Once more than `max_elapsed` has passed since the first
//! failure, [`Backoff::next_delay`] returns `None` and the caller gives up.

use reqwest::StatusCode;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct BackoffConfig {
	pub initial_interval: Duration,
	pub max_interval: Duration,
	pub multiplier: f64,
	pub max_elapsed: Duration,
	/// Fraction of each delay that may be shaved off at random, in `[0, 1)`.
	pub jitter: f64,
}

impl Default for BackoffConfig {
	fn default() -> Self {
		Self {
			initial_interval: Duration::from_millis(500),
			max_interval: Duration::from_secs(30),
			multiplier: 2.0,
			max_elapsed: Duration::from_secs(300),
			jitter: 0.5,
		}
	}
}

pub trait RetryableError {
	fn is_retryable(&self) -> bool;

	/// Minimum wait requested by the server, if any.
	fn retry_after(&self) -> Option<Duration> {
		None
	}
}

impl RetryableError for reqwest::Error {
	fn is_retryable(&self) -> bool {
		if self.is_timeout() || self.is_connect() {
			return true;
		}

		if let Some(status) = self.status() {
			let retryable_statuses = [
				StatusCode::TOO_MANY_REQUESTS,
				StatusCode::REQUEST_TIMEOUT,
				StatusCode::INTERNAL_SERVER_ERROR,
				StatusCode::BAD_GATEWAY,
				StatusCode::SERVICE_UNAVAILABLE,
				StatusCode::GATEWAY_TIMEOUT,
			];
			return retryable_statuses.contains(&status);
		}

		false
	}
}

/// Backoff state for one run of consecutive failures.
#[derive(Debug, Clone)]
pub struct Backoff {
	cfg: BackoffConfig,
	started: Option<Instant>,
	attempt: u32,
	last: Duration,
}

impl Backoff {
	pub fn new(cfg: BackoffConfig) -> Self {
		Self {
			cfg,
			started: None,
			attempt: 0,
			last: Duration::ZERO,
		}
	}

	pub fn config(&self) -> &BackoffConfig {
		&self.cfg
	}

	/// Failures recorded since the last reset.
	pub fn attempts(&self) -> u32 {
		self.attempt
	}

	/// Time since the first failure of the current run.
	pub fn elapsed(&self) -> Duration {
		self
			.started
			.map(|s| s.elapsed())
			.unwrap_or(Duration::ZERO)
	}

	/// Forget the current run; the next failure starts from `initial_interval`.
	pub fn reset(&mut self) {
		self.started = None;
		self.attempt = 0;
		self.last = Duration::ZERO;
	}

	/// Record a failure and return how long to wait before the next attempt,
	/// or `None` once the maximum elapsed time has been exceeded.
	pub fn next_delay(&mut self, hint: Option<Duration>) -> Option<Duration> {
		let started = *self.started.get_or_insert_with(Instant::now);
		if started.elapsed() > self.cfg.max_elapsed {
			return None;
		}

		let base = self.base_delay(self.attempt);
		self.attempt = self.attempt.saturating_add(1);

		let jitter = self.cfg.jitter.clamp(0.0, 0.999);
		let jittered = base.mul_f64(1.0 - jitter * fastrand::f64());
		let delay = jittered.max(self.last).min(self.cfg.max_interval);
		self.last = delay;

		Some(match hint {
			Some(hint) if hint > delay => hint,
			_ => delay,
		})
	}

	fn base_delay(&self, attempt: u32) -> Duration {
		let exponent = attempt.min(64) as i32;
		let secs = self.cfg.initial_interval.as_secs_f64() * self.cfg.multiplier.max(1.0).powi(exponent);
		let capped = secs.min(self.cfg.max_interval.as_secs_f64());
		if capped.is_finite() {
			Duration::from_secs_f64(capped)
		} else {
			self.cfg.max_interval
		}
	}
}

/// Run `f` until it succeeds, fails with a non-retryable error, or the
/// backoff gives up.
pub async fn retry<F, Fut, T, E>(cfg: &BackoffConfig, mut f: F) -> Result<T, E>
where
	F: FnMut() -> Fut,
	Fut: std::future::Future<Output = Result<T, E>>,
	E: RetryableError + std::fmt::Debug,
{
	let mut backoff = Backoff::new(cfg.clone());

	loop {
		match f().await {
			Ok(result) => return Ok(result),
			Err(err) => {
				if !err.is_retryable() {
					warn!(
						error = ?err,
						attempt = backoff.attempts() + 1,
						"non-retryable error encountered"
					);
					return Err(err);
				}

				let Some(delay) = backoff.next_delay(err.retry_after()) else {
					warn!(
						error = ?err,
						attempt = backoff.attempts() + 1,
						elapsed_ms = backoff.elapsed().as_millis(),
						"retry budget exhausted"
					);
					return Err(err);
				};

				warn!(
					error = ?err,
					attempt = backoff.attempts(),
					delay_ms = delay.as_millis(),
					"retrying after error"
				);

				tokio::time::sleep(delay).await;
			}
		}
	}
}
