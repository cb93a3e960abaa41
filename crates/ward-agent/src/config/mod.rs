// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Layered agent configuration.
//!
//! Precedence (highest to lowest):
//! 1. Command-line flags
//! 2. Environment variables (`WARD_AGENT_*`)
//! 3. Config file (`--config` / `WARD_AGENT_CONFIG`)
//! 4. Built-in defaults

pub mod layer;
pub mod sources;

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info};
use ward_common_http::BackoffConfig;

pub use layer::{AgentConfigLayer, BackoffConfigLayer, FileMode};
pub use sources::{CliSource, ConfigSource, DefaultsSource, EnvSource, Precedence, TomlSource};

use crate::error::ConfigError;
use crate::render::{is_plain_file_name, FileMapping};

pub const DEFAULT_TARGET_DIR: &str = "/vault/secrets";
pub const DEFAULT_FILE_MODE: u32 = 0o640;
pub const DEFAULT_RENEWAL_FRACTION: f64 = 0.667;
pub const DEFAULT_RENEWAL_JITTER: f64 = 0.1;
pub const DEFAULT_STATIC_POLL_SECS: u64 = 300;
pub const DEFAULT_BACKOFF_INITIAL_MS: u64 = 500;
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 30_000;
pub const DEFAULT_BACKOFF_MAX_ELAPSED_SECS: u64 = 300;
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
pub const DEFAULT_TOKEN_RESOURCE_ATTEMPTS: u32 = 3;
pub const DEFAULT_HEALTH_PORT: u16 = 8099;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Fully resolved agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
	pub server_url: String,
	pub allow_insecure_http: bool,
	pub role: String,
	pub secret_path: String,
	pub token_path: PathBuf,
	pub target_dir: PathBuf,
	pub file_mode: u32,
	/// Ordered by secret field name.
	pub files: Vec<FileMapping>,
	pub renewal_fraction: f64,
	pub renewal_jitter: f64,
	pub static_secret_poll: Duration,
	pub backoff: BackoffConfig,
	/// Zero means a missing secret fails the agent immediately.
	pub wait_for_secret: Duration,
	pub token_resource_attempts: u32,
	pub exit_after_render: bool,
	pub revoke_on_shutdown: bool,
	/// Zero disables the health server.
	pub health_port: u16,
	pub request_timeout: Duration,
}

impl AgentConfig {
	/// Load configuration from all sources with standard precedence.
	pub fn load(
		config_path: Option<&Path>,
		cli: AgentConfigLayer,
	) -> Result<AgentConfig, ConfigError> {
		let mut sources: Vec<Box<dyn ConfigSource>> =
			vec![Box::new(DefaultsSource), Box::new(EnvSource::new()), Box::new(CliSource::new(cli))];
		if let Some(path) = config_path {
			sources.push(Box::new(TomlSource::new(path)));
		}
		Self::from_sources(sources)
	}

	pub fn from_sources(mut sources: Vec<Box<dyn ConfigSource>>) -> Result<AgentConfig, ConfigError> {
		sources.sort_by_key(|s| s.precedence());

		let mut merged = AgentConfigLayer::default();
		for source in sources {
			debug!(source = source.name(), "loading configuration source");
			merged.merge(source.load()?);
		}

		let config = Self::from_layer(merged)?;
		info!(
			server_url = %config.server_url,
			role = %config.role,
			secret_path = %config.secret_path,
			target_dir = %config.target_dir.display(),
			files = config.files.len(),
			"configuration loaded"
		);
		Ok(config)
	}

	/// Resolve a merged layer. Unset optional keys take built-in defaults.
	pub fn from_layer(layer: AgentConfigLayer) -> Result<AgentConfig, ConfigError> {
		let backoff = layer.backoff.unwrap_or_default();
		let config = AgentConfig {
			server_url: layer
				.server_url
				.ok_or_else(|| ConfigError::Missing("server_url".into()))?,
			allow_insecure_http: layer.allow_insecure_http.unwrap_or(false),
			role: layer.role.ok_or_else(|| ConfigError::Missing("role".into()))?,
			secret_path: layer
				.secret_path
				.ok_or_else(|| ConfigError::Missing("secret_path".into()))?,
			token_path: layer
				.token_path
				.unwrap_or_else(|| PathBuf::from(crate::identity::SA_TOKEN_PATH)),
			target_dir: layer
				.target_dir
				.unwrap_or_else(|| PathBuf::from(DEFAULT_TARGET_DIR)),
			file_mode: layer.file_mode.map(|m| m.0).unwrap_or(DEFAULT_FILE_MODE),
			files: layer
				.files
				.ok_or_else(|| ConfigError::Missing("files".into()))?
				.into_iter()
				.map(|(field, name)| FileMapping::new(field, name))
				.collect(),
			renewal_fraction: layer.renewal_fraction.unwrap_or(DEFAULT_RENEWAL_FRACTION),
			renewal_jitter: layer.renewal_jitter.unwrap_or(DEFAULT_RENEWAL_JITTER),
			static_secret_poll: Duration::from_secs(
				layer.static_secret_poll_secs.unwrap_or(DEFAULT_STATIC_POLL_SECS),
			),
			backoff: BackoffConfig {
				initial_interval: Duration::from_millis(
					backoff.initial_ms.unwrap_or(DEFAULT_BACKOFF_INITIAL_MS),
				),
				max_interval: Duration::from_millis(backoff.max_ms.unwrap_or(DEFAULT_BACKOFF_MAX_MS)),
				multiplier: backoff.multiplier.unwrap_or(DEFAULT_BACKOFF_MULTIPLIER),
				max_elapsed: Duration::from_secs(
					backoff
						.max_elapsed_secs
						.unwrap_or(DEFAULT_BACKOFF_MAX_ELAPSED_SECS),
				),
				..BackoffConfig::default()
			},
			wait_for_secret: Duration::from_secs(layer.wait_for_secret_secs.unwrap_or(0)),
			token_resource_attempts: layer
				.token_resource_attempts
				.unwrap_or(DEFAULT_TOKEN_RESOURCE_ATTEMPTS),
			exit_after_render: layer.exit_after_render.unwrap_or(false),
			revoke_on_shutdown: layer.revoke_on_shutdown.unwrap_or(true),
			health_port: layer.health_port.unwrap_or(DEFAULT_HEALTH_PORT),
			request_timeout: Duration::from_secs(
				layer
					.request_timeout_secs
					.unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
			),
		};
		config.validate()?;
		Ok(config)
	}

	pub fn validate(&self) -> Result<(), ConfigError> {
		if !self.server_url.starts_with("https://") && !self.server_url.starts_with("http://") {
			return Err(ConfigError::Validation(format!(
				"server_url: '{}' is not an http(s) URL",
				self.server_url
			)));
		}
		if self.server_url.starts_with("http://") && !self.allow_insecure_http {
			return Err(ConfigError::Validation(
				"server_url: plain http requires allow_insecure_http".into(),
			));
		}

		if self.role.trim().is_empty() {
			return Err(ConfigError::Validation("role: must not be empty".into()));
		}

		if !is_valid_secret_path(&self.secret_path) {
			return Err(ConfigError::Validation(format!(
				"secret_path: '{}' is not a valid path",
				self.secret_path
			)));
		}

		if self.files.is_empty() {
			return Err(ConfigError::Validation(
				"files: at least one field mapping is required".into(),
			));
		}
		for mapping in &self.files {
			if !is_plain_file_name(&mapping.file_name) {
				return Err(ConfigError::Validation(format!(
					"files.{}: '{}' must be a plain file name",
					mapping.field, mapping.file_name
				)));
			}
		}
		let mut names: Vec<&str> = self.files.iter().map(|m| m.file_name.as_str()).collect();
		names.sort_unstable();
		if names.windows(2).any(|w| w[0] == w[1]) {
			return Err(ConfigError::Validation(
				"files: two fields render to the same file".into(),
			));
		}

		if self.file_mode > 0o7777 {
			return Err(ConfigError::Validation(format!(
				"file_mode: {:o} is not a permission mode",
				self.file_mode
			)));
		}

		if !(self.renewal_fraction > 0.0 && self.renewal_fraction < 1.0) {
			return Err(ConfigError::Validation(format!(
				"renewal_fraction: {} must be in (0, 1)",
				self.renewal_fraction
			)));
		}
		if !(0.0..1.0).contains(&self.renewal_jitter) {
			return Err(ConfigError::Validation(format!(
				"renewal_jitter: {} must be in [0, 1)",
				self.renewal_jitter
			)));
		}

		if self.static_secret_poll.is_zero() {
			return Err(ConfigError::Validation(
				"static_secret_poll_secs: must be at least 1".into(),
			));
		}

		if self.backoff.initial_interval.is_zero() {
			return Err(ConfigError::Validation(
				"backoff.initial_ms: must be at least 1".into(),
			));
		}
		if self.backoff.max_interval < self.backoff.initial_interval {
			return Err(ConfigError::Validation(
				"backoff.max_ms: must not be below backoff.initial_ms".into(),
			));
		}
		if !(self.backoff.multiplier >= 1.0) {
			return Err(ConfigError::Validation(format!(
				"backoff.multiplier: {} must be at least 1",
				self.backoff.multiplier
			)));
		}

		if self.token_resource_attempts == 0 {
			return Err(ConfigError::Validation(
				"token_resource_attempts: must be at least 1".into(),
			));
		}

		if self.request_timeout.is_zero() {
			return Err(ConfigError::Validation(
				"request_timeout_secs: must be at least 1".into(),
			));
		}

		Ok(())
	}
}

fn is_valid_secret_path(path: &str) -> bool {
	let trimmed = path.trim_matches('/');
	!trimmed.is_empty()
		&& trimmed
			.split('/')
			.all(|segment| !segment.is_empty() && segment != "." && segment != "..")
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::{BTreeMap, HashMap};

	fn required() -> AgentConfigLayer {
		AgentConfigLayer {
			server_url: Some("https://ward.internal:8200".into()),
			role: Some("hello-world".into()),
			secret_path: Some("certs/hello-world".into()),
			files: Some(BTreeMap::from([
				("tls.crt".to_string(), "tls.crt".to_string()),
				("tls.key".to_string(), "tls.key".to_string()),
			])),
			..Default::default()
		}
	}

	struct Fixed(Precedence, AgentConfigLayer);

	impl ConfigSource for Fixed {
		fn name(&self) -> &'static str {
			"fixed"
		}

		fn precedence(&self) -> Precedence {
			self.0
		}

		fn load(&self) -> Result<AgentConfigLayer, ConfigError> {
			Ok(self.1.clone())
		}
	}

	#[test]
	fn defaults_fill_unset_keys() {
		let config = AgentConfig::from_layer(required()).unwrap();
		assert_eq!(config.target_dir, PathBuf::from("/vault/secrets"));
		assert_eq!(config.file_mode, 0o640);
		assert_eq!(config.renewal_fraction, 0.667);
		assert_eq!(config.static_secret_poll, Duration::from_secs(300));
		assert_eq!(config.backoff.initial_interval, Duration::from_millis(500));
		assert_eq!(config.backoff.max_interval, Duration::from_secs(30));
		assert_eq!(config.backoff.max_elapsed, Duration::from_secs(300));
		assert_eq!(config.token_resource_attempts, 3);
		assert!(config.revoke_on_shutdown);
		assert!(!config.exit_after_render);
		assert_eq!(config.health_port, 8099);
		assert_eq!(config.files[0], FileMapping::new("tls.crt", "tls.crt"));
	}

	#[test]
	fn missing_required_keys() {
		let mut layer = required();
		layer.role = None;
		assert!(matches!(
			AgentConfig::from_layer(layer),
			Err(ConfigError::Missing(key)) if key == "role"
		));

		let mut layer = required();
		layer.files = None;
		assert!(matches!(AgentConfig::from_layer(layer), Err(ConfigError::Missing(_))));
	}

	#[test]
	fn rejects_invalid_values() {
		let cases: Vec<(&str, Box<dyn Fn(&mut AgentConfigLayer)>)> = vec![
			("role", Box::new(|l| l.role = Some("  ".into()))),
			("renewal_fraction", Box::new(|l| l.renewal_fraction = Some(1.0))),
			("renewal_fraction", Box::new(|l| l.renewal_fraction = Some(0.0))),
			("renewal_jitter", Box::new(|l| l.renewal_jitter = Some(1.0))),
			("files", Box::new(|l| l.files = Some(BTreeMap::new()))),
			(
				"files.tls.crt",
				Box::new(|l| {
					l.files = Some(BTreeMap::from([("tls.crt".into(), "../etc/passwd".into())]))
				}),
			),
			("secret_path", Box::new(|l| l.secret_path = Some("certs/../admin".into()))),
			("server_url", Box::new(|l| l.server_url = Some("http://ward:8200".into()))),
			("static_secret_poll_secs", Box::new(|l| l.static_secret_poll_secs = Some(0))),
			("token_resource_attempts", Box::new(|l| l.token_resource_attempts = Some(0))),
		];

		for (key, mutate) in cases {
			let mut layer = required();
			mutate(&mut layer);
			let err = AgentConfig::from_layer(layer).unwrap_err();
			assert!(
				err.to_string().contains(key),
				"expected error mentioning {key}, got {err}"
			);
		}
	}

	#[test]
	fn insecure_http_must_be_opted_into() {
		let mut layer = required();
		layer.server_url = Some("http://127.0.0.1:8200".into());
		layer.allow_insecure_http = Some(true);
		assert!(AgentConfig::from_layer(layer).is_ok());
	}

	#[test]
	fn later_sources_override_earlier_ones() {
		let env: HashMap<&str, &str> = HashMap::from([
			("WARD_AGENT_ROLE", "from-env"),
			("WARD_AGENT_HEALTH_PORT", "9000"),
		]);
		let env = EnvSource::with_lookup(move |name| env.get(name).map(|v| v.to_string()));

		let config = AgentConfig::from_sources(vec![
			Box::new(CliSource::new(AgentConfigLayer {
				role: Some("from-cli".into()),
				..Default::default()
			})),
			Box::new(env),
			Box::new(Fixed(Precedence::ConfigFile, required())),
			Box::new(DefaultsSource),
		])
		.unwrap();

		assert_eq!(config.role, "from-cli");
		assert_eq!(config.health_port, 9000);
		assert_eq!(config.secret_path, "certs/hello-world");
	}
}
