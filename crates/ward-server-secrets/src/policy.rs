// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Path-scoped policy evaluation.
//!
//! A request is allowed when at least one attached policy has a rule matching
//! the path that grants the capability. Any matching `deny` refuses the
//! request outright. Otherwise the most specific matching rule (an exact match,
//! then the longest prefix) decides.

use std::collections::{BTreeSet, HashMap};

use crate::types::{Capability, PathRule, Policy};

#[derive(Debug, Clone, Default)]
pub struct PolicyEngine {
	policies: HashMap<String, Policy>,
}

/// How specifically a rule matched a path; higher wins.
fn specificity(rule: &PathRule, path: &str) -> Option<(bool, usize)> {
	if let Some(prefix) = rule.path.strip_suffix('*') {
		path.starts_with(prefix).then_some((false, prefix.len()))
	} else {
		(rule.path == path).then_some((true, rule.path.len()))
	}
}

impl PolicyEngine {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_policies(policies: impl IntoIterator<Item = Policy>) -> Self {
		let mut engine = Self::new();
		for policy in policies {
			engine.insert(policy);
		}
		engine
	}

	pub fn insert(&mut self, policy: Policy) {
		self.policies.insert(policy.name.clone(), policy);
	}

	pub fn contains(&self, name: &str) -> bool {
		self.policies.contains_key(name)
	}

	/// Evaluate `capability` on `path` for a credential carrying `attached`.
	/// Unknown policy names grant nothing.
	pub fn is_allowed(&self, attached: &BTreeSet<String>, path: &str, capability: Capability) -> bool {
		let matching: Vec<(&PathRule, (bool, usize))> = attached
			.iter()
			.filter_map(|name| self.policies.get(name))
			.flat_map(|policy| policy.rules.iter())
			.filter_map(|rule| specificity(rule, path).map(|s| (rule, s)))
			.collect();

		if matching
			.iter()
			.any(|(rule, _)| rule.capabilities.contains(&Capability::Deny))
		{
			return false;
		}

		let Some(best) = matching.iter().map(|(_, s)| *s).max() else {
			return false;
		};

		matching
			.iter()
			.filter(|(_, s)| *s == best)
			.any(|(rule, _)| rule.capabilities.contains(&capability))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use proptest::prelude::*;

	fn rule(path: &str, caps: &[Capability]) -> PathRule {
		PathRule {
			path: path.to_string(),
			capabilities: caps.iter().copied().collect(),
		}
	}

	fn engine() -> PolicyEngine {
		PolicyEngine::with_policies([
			Policy {
				name: "hello-world".into(),
				rules: vec![rule("certs/hello-world", &[Capability::Read])],
			},
			Policy {
				name: "certs-reader".into(),
				rules: vec![
					rule("certs/*", &[Capability::Read, Capability::List]),
					rule("certs/internal/*", &[Capability::List]),
				],
			},
			Policy {
				name: "no-root-ca".into(),
				rules: vec![rule("certs/root-ca", &[Capability::Deny])],
			},
		])
	}

	fn attached(names: &[&str]) -> BTreeSet<String> {
		names.iter().map(|s| s.to_string()).collect()
	}

	#[test]
	fn exact_rule_grants_read() {
		let e = engine();
		assert!(e.is_allowed(&attached(&["hello-world"]), "certs/hello-world", Capability::Read));
		assert!(!e.is_allowed(&attached(&["hello-world"]), "certs/other", Capability::Read));
	}

	#[test]
	fn prefix_rule_matches_children() {
		let e = engine();
		assert!(e.is_allowed(&attached(&["certs-reader"]), "certs/anything", Capability::Read));
		assert!(!e.is_allowed(&attached(&["certs-reader"]), "db/creds", Capability::Read));
	}

	#[test]
	fn longest_prefix_decides() {
		let e = engine();
		assert!(!e.is_allowed(
			&attached(&["certs-reader"]),
			"certs/internal/ca",
			Capability::Read
		));
		assert!(e.is_allowed(
			&attached(&["certs-reader"]),
			"certs/internal/ca",
			Capability::List
		));
	}

	#[test]
	fn deny_wins_across_policies() {
		let e = engine();
		assert!(!e.is_allowed(
			&attached(&["certs-reader", "no-root-ca"]),
			"certs/root-ca",
			Capability::Read
		));
	}

	proptest! {
		#[test]
		fn deny_prefix_refuses_every_child(suffix in "[a-z0-9/-]{0,24}", grant_exact in any::<bool>()) {
			let path = format!("certs/root-ca{suffix}");
			let grant = if grant_exact { path.clone() } else { "certs/*".to_string() };
			let e = PolicyEngine::with_policies([
				Policy {
					name: "reader".into(),
					rules: vec![rule(&grant, &[Capability::Read, Capability::List])],
				},
				Policy {
					name: "deny".into(),
					rules: vec![rule("certs/root-ca*", &[Capability::Deny])],
				},
			]);
			let both = attached(&["reader", "deny"]);
			prop_assert!(!e.is_allowed(&both, &path, Capability::Read));
			prop_assert!(!e.is_allowed(&both, &path, Capability::List));
			prop_assert!(e.is_allowed(&attached(&["reader"]), &path, Capability::Read));
		}
	}

	#[test]
	fn unknown_or_empty_policies_grant_nothing() {
		let e = engine();
		assert!(!e.is_allowed(&attached(&[]), "certs/hello-world", Capability::Read));
		assert!(!e.is_allowed(&attached(&["missing"]), "certs/hello-world", Capability::Read));
	}
}
