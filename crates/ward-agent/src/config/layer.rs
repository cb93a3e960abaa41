// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Partial configuration layers merged from defaults, TOML, env and CLI.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Deserializer};

use crate::error::ConfigError;

/// Permission bits, written as `0o640`/`0640` strings or a TOML integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMode(pub u32);

impl FileMode {
	pub fn parse(key: &str, value: &str) -> Result<Self, ConfigError> {
		let digits = value.trim();
		let digits = digits.strip_prefix("0o").unwrap_or(digits);
		let mode = u32::from_str_radix(digits, 8)
			.map_err(|_| ConfigError::invalid(key, format!("invalid octal mode '{value}'")))?;
		Ok(FileMode(mode))
	}
}

impl<'de> Deserialize<'de> for FileMode {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		#[derive(Deserialize)]
		#[serde(untagged)]
		enum Raw {
			Number(u32),
			Text(String),
		}

		match Raw::deserialize(deserializer)? {
			Raw::Number(mode) => Ok(FileMode(mode)),
			Raw::Text(text) => FileMode::parse("file_mode", &text).map_err(serde::de::Error::custom),
		}
	}
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackoffConfigLayer {
	#[serde(default)]
	pub initial_ms: Option<u64>,
	#[serde(default)]
	pub max_ms: Option<u64>,
	#[serde(default)]
	pub max_elapsed_secs: Option<u64>,
	#[serde(default)]
	pub multiplier: Option<f64>,
}

impl BackoffConfigLayer {
	pub fn merge(&mut self, other: BackoffConfigLayer) {
		if other.initial_ms.is_some() {
			self.initial_ms = other.initial_ms;
		}
		if other.max_ms.is_some() {
			self.max_ms = other.max_ms;
		}
		if other.max_elapsed_secs.is_some() {
			self.max_elapsed_secs = other.max_elapsed_secs;
		}
		if other.multiplier.is_some() {
			self.multiplier = other.multiplier;
		}
	}
}

/// Agent configuration layer - all fields are Option for merging.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfigLayer {
	#[serde(default)]
	pub server_url: Option<String>,
	#[serde(default)]
	pub allow_insecure_http: Option<bool>,
	#[serde(default)]
	pub role: Option<String>,
	#[serde(default)]
	pub secret_path: Option<String>,
	#[serde(default)]
	pub token_path: Option<PathBuf>,
	#[serde(default)]
	pub target_dir: Option<PathBuf>,
	#[serde(default)]
	pub file_mode: Option<FileMode>,
	/// Secret field -> file name. A later layer replaces the whole mapping.
	#[serde(default)]
	pub files: Option<BTreeMap<String, String>>,
	#[serde(default)]
	pub renewal_fraction: Option<f64>,
	#[serde(default)]
	pub renewal_jitter: Option<f64>,
	#[serde(default)]
	pub static_secret_poll_secs: Option<u64>,
	#[serde(default)]
	pub backoff: Option<BackoffConfigLayer>,
	#[serde(default)]
	pub wait_for_secret_secs: Option<u64>,
	#[serde(default)]
	pub token_resource_attempts: Option<u32>,
	#[serde(default)]
	pub exit_after_render: Option<bool>,
	#[serde(default)]
	pub revoke_on_shutdown: Option<bool>,
	#[serde(default)]
	pub health_port: Option<u16>,
	#[serde(default)]
	pub request_timeout_secs: Option<u64>,
}

macro_rules! take_some {
	($self:ident, $other:ident, $($field:ident),+ $(,)?) => {
		$(
			if $other.$field.is_some() {
				$self.$field = $other.$field;
			}
		)+
	};
}

impl AgentConfigLayer {
	/// Merge another layer into this one. Other layer takes precedence.
	pub fn merge(&mut self, other: AgentConfigLayer) {
		take_some!(
			self,
			other,
			server_url,
			allow_insecure_http,
			role,
			secret_path,
			token_path,
			target_dir,
			file_mode,
			files,
			renewal_fraction,
			renewal_jitter,
			static_secret_poll_secs,
			wait_for_secret_secs,
			token_resource_attempts,
			exit_after_render,
			revoke_on_shutdown,
			health_port,
			request_timeout_secs,
		);
		merge_option(&mut self.backoff, other.backoff, BackoffConfigLayer::merge);
	}
}

fn merge_option<T, F>(target: &mut Option<T>, source: Option<T>, merge_fn: F)
where
	F: FnOnce(&mut T, T),
{
	match (target.as_mut(), source) {
		(Some(t), Some(s)) => merge_fn(t, s),
		(None, Some(s)) => *target = Some(s),
		_ => {}
	}
}

/// Parse `field=name,field=name` into a mapping.
pub fn parse_file_list(key: &str, value: &str) -> Result<BTreeMap<String, String>, ConfigError> {
	parse_file_lists(key, [value])
}

/// Parse several `field=name,...` lists (one per repeated flag) into one
/// mapping. A field may be mapped only once across all of them.
pub fn parse_file_lists<'a>(
	key: &str,
	values: impl IntoIterator<Item = &'a str>,
) -> Result<BTreeMap<String, String>, ConfigError> {
	let mut files = BTreeMap::new();
	let entries = values
		.into_iter()
		.flat_map(|value| value.split(','))
		.map(str::trim)
		.filter(|e| !e.is_empty());
	for entry in entries {
		let (field, name) = entry
			.split_once('=')
			.ok_or_else(|| ConfigError::invalid(key, format!("expected field=name, got '{entry}'")))?;
		let (field, name) = (field.trim(), name.trim());
		if field.is_empty() || name.is_empty() {
			return Err(ConfigError::invalid(key, format!("empty field or name in '{entry}'")));
		}
		if files.insert(field.to_string(), name.to_string()).is_some() {
			return Err(ConfigError::invalid(key, format!("field '{field}' mapped twice")));
		}
	}
	Ok(files)
}
