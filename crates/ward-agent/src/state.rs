// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Agent lifecycle states and the transitions between them.

use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
	Unauthenticated,
	Authenticated,
	SecretFetched,
	Rendering,
	Steady,
	Renewing,
	ReAuthenticating,
	Failed,
}

impl AgentState {
	pub const ALL: [AgentState; 8] = [
		AgentState::Unauthenticated,
		AgentState::Authenticated,
		AgentState::SecretFetched,
		AgentState::Rendering,
		AgentState::Steady,
		AgentState::Renewing,
		AgentState::ReAuthenticating,
		AgentState::Failed,
	];

	pub fn as_str(&self) -> &'static str {
		match self {
			AgentState::Unauthenticated => "unauthenticated",
			AgentState::Authenticated => "authenticated",
			AgentState::SecretFetched => "secret_fetched",
			AgentState::Rendering => "rendering",
			AgentState::Steady => "steady",
			AgentState::Renewing => "renewing",
			AgentState::ReAuthenticating => "re_authenticating",
			AgentState::Failed => "failed",
		}
	}

	pub fn is_terminal(&self) -> bool {
		matches!(self, AgentState::Failed)
	}

	/// Whether the state machine may move from `self` to `next`.
	pub fn can_transition_to(&self, next: AgentState) -> bool {
		use AgentState::*;

		match (self, next) {
			(Failed, _) => false,
			(_, Failed) => true,
			(Unauthenticated, Authenticated)
			| (Authenticated, SecretFetched)
			| (Authenticated, ReAuthenticating)
			| (SecretFetched, Rendering)
			| (Rendering, Steady)
			| (Steady, Renewing)
			| (Renewing, Steady)
			| (Renewing, SecretFetched)
			| (Renewing, Rendering)
			| (Renewing, ReAuthenticating)
			| (ReAuthenticating, Authenticated) => true,
			_ => false,
		}
	}
}

impl fmt::Display for AgentState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Network operation retried by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
	Authenticate,
	Renew,
	Fetch,
	Render,
}

impl Operation {
	pub fn as_str(&self) -> &'static str {
		match self {
			Operation::Authenticate => "authenticate",
			Operation::Renew => "renew",
			Operation::Fetch => "fetch",
			Operation::Render => "render",
		}
	}
}

impl fmt::Display for Operation {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transition {
	pub from: AgentState,
	pub to: AgentState,
	pub at: DateTime<Utc>,
}

/// Most recent transitions, oldest first.
#[derive(Debug, Clone)]
pub struct StateHistory {
	entries: VecDeque<Transition>,
	capacity: usize,
}

impl StateHistory {
	pub const DEFAULT_CAPACITY: usize = 64;

	pub fn new(capacity: usize) -> Self {
		Self {
			entries: VecDeque::with_capacity(capacity),
			capacity: capacity.max(1),
		}
	}

	pub fn push(&mut self, transition: Transition) {
		if self.entries.len() == self.capacity {
			self.entries.pop_front();
		}
		self.entries.push_back(transition);
	}

	pub fn iter(&self) -> impl Iterator<Item = &Transition> {
		self.entries.iter()
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	/// Target states in order, starting with the first recorded `from`.
	pub fn states(&self) -> Vec<AgentState> {
		let mut states: Vec<AgentState> = self.entries.front().map(|t| t.from).into_iter().collect();
		states.extend(self.entries.iter().map(|t| t.to));
		states
	}
}

impl Default for StateHistory {
	fn default() -> Self {
		Self::new(Self::DEFAULT_CAPACITY)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn happy_path_is_allowed() {
		use AgentState::*;
		let path = [
			Unauthenticated,
			Authenticated,
			SecretFetched,
			Rendering,
			Steady,
			Renewing,
			Steady,
			Renewing,
			Rendering,
			Steady,
		];
		for pair in path.windows(2) {
			assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
		}
	}

	#[test]
	fn states_cannot_be_skipped() {
		use AgentState::*;
		assert!(!Unauthenticated.can_transition_to(Steady));
		assert!(!Authenticated.can_transition_to(Rendering));
		assert!(!SecretFetched.can_transition_to(Steady));
		assert!(!Steady.can_transition_to(SecretFetched));
	}

	#[test]
	fn failed_is_terminal_and_reachable_from_anywhere() {
		for state in AgentState::ALL {
			if state != AgentState::Failed {
				assert!(state.can_transition_to(AgentState::Failed));
			}
			assert!(!AgentState::Failed.can_transition_to(state));
		}
	}

	#[test]
	fn history_is_bounded() {
		let mut history = StateHistory::new(2);
		for (from, to) in [
			(AgentState::Unauthenticated, AgentState::Authenticated),
			(AgentState::Authenticated, AgentState::SecretFetched),
			(AgentState::SecretFetched, AgentState::Rendering),
		] {
			history.push(Transition {
				from,
				to,
				at: Utc::now(),
			});
		}
		assert_eq!(history.len(), 2);
		assert_eq!(
			history.states(),
			vec![AgentState::Authenticated, AgentState::SecretFetched, AgentState::Rendering]
		);
	}

	#[test]
	fn serializes_snake_case() {
		assert_eq!(
			serde_json::to_string(&AgentState::ReAuthenticating).unwrap(),
			"\"re_authenticating\""
		);
	}
}
