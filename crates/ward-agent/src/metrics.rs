// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::time::Duration;

use prometheus::{Encoder, Gauge, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};

use crate::state::{AgentState, Operation};

pub struct Metrics {
	registry: Registry,

	pub auth_attempts: IntCounterVec,
	pub renewals: IntCounterVec,
	pub fetches: IntCounterVec,
	pub renders: IntCounterVec,
	pub state: IntGaugeVec,
	pub credential_expiry_seconds: Gauge,
}

impl Default for Metrics {
	fn default() -> Self {
		Self::new()
	}
}

impl Metrics {
	pub fn new() -> Self {
		let registry = Registry::new();

		let auth_attempts = IntCounterVec::new(
			Opts::new("ward_agent_auth_attempts_total", "Authentication attempts by outcome"),
			&["outcome"],
		)
		.unwrap();
		registry.register(Box::new(auth_attempts.clone())).unwrap();

		let renewals = IntCounterVec::new(
			Opts::new("ward_agent_renewals_total", "Credential renewals by outcome"),
			&["outcome"],
		)
		.unwrap();
		registry.register(Box::new(renewals.clone())).unwrap();

		let fetches = IntCounterVec::new(
			Opts::new("ward_agent_fetches_total", "Secret fetches by outcome"),
			&["outcome"],
		)
		.unwrap();
		registry.register(Box::new(fetches.clone())).unwrap();

		let renders = IntCounterVec::new(
			Opts::new("ward_agent_renders_total", "Secret renders by outcome"),
			&["outcome"],
		)
		.unwrap();
		registry.register(Box::new(renders.clone())).unwrap();

		let state = IntGaugeVec::new(
			Opts::new("ward_agent_state", "1 for the agent's current state, 0 otherwise"),
			&["state"],
		)
		.unwrap();
		registry.register(Box::new(state.clone())).unwrap();

		let credential_expiry_seconds = Gauge::new(
			"ward_agent_credential_expiry_seconds",
			"Seconds until the session credential expires",
		)
		.unwrap();
		registry
			.register(Box::new(credential_expiry_seconds.clone()))
			.unwrap();

		let metrics = Self {
			registry,
			auth_attempts,
			renewals,
			fetches,
			renders,
			state,
			credential_expiry_seconds,
		};
		metrics.set_state(AgentState::Unauthenticated);
		metrics
	}

	pub fn record(&self, operation: Operation, outcome: &str) {
		let counter = match operation {
			Operation::Authenticate => &self.auth_attempts,
			Operation::Renew => &self.renewals,
			Operation::Fetch => &self.fetches,
			Operation::Render => &self.renders,
		};
		counter.with_label_values(&[outcome]).inc();
	}

	pub fn set_state(&self, current: AgentState) {
		for state in AgentState::ALL {
			self
				.state
				.with_label_values(&[state.as_str()])
				.set(i64::from(state == current));
		}
	}

	pub fn set_credential_expiry(&self, remaining: Option<Duration>) {
		self
			.credential_expiry_seconds
			.set(remaining.map(|d| d.as_secs_f64()).unwrap_or(0.0));
	}

	pub fn encode(&self) -> String {
		let encoder = TextEncoder::new();
		let metric_families = self.registry.gather();
		let mut buffer = Vec::new();
		encoder.encode(&metric_families, &mut buffer).unwrap_or_default();
		String::from_utf8(buffer).unwrap_or_default()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn state_gauge_is_one_hot() {
		let metrics = Metrics::new();
		metrics.set_state(AgentState::Steady);
		let text = metrics.encode();
		assert!(text.contains("ward_agent_state{state=\"steady\"} 1"));
		assert!(text.contains("ward_agent_state{state=\"unauthenticated\"} 0"));
	}

	#[test]
	fn outcomes_are_counted_per_operation() {
		let metrics = Metrics::new();
		metrics.record(Operation::Authenticate, "transient");
		metrics.record(Operation::Authenticate, "success");
		metrics.record(Operation::Fetch, "success");
		assert_eq!(metrics.auth_attempts.with_label_values(&["transient"]).get(), 1);
		assert_eq!(metrics.fetches.with_label_values(&["success"]).get(), 1);
		assert!(metrics.encode().contains("ward_agent_auth_attempts_total"));
	}

	#[test]
	fn credential_expiry_gauge() {
		let metrics = Metrics::new();
		metrics.set_credential_expiry(Some(Duration::from_secs(90)));
		assert_eq!(metrics.credential_expiry_seconds.get(), 90.0);
		metrics.set_credential_expiry(None);
		assert_eq!(metrics.credential_expiry_seconds.get(), 0.0);
	}
}
