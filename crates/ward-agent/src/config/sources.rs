// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Configuration sources: TOML files and environment variables.

use std::path::PathBuf;

use tracing::{debug, trace};

use crate::config::layer::{parse_file_list, AgentConfigLayer, BackoffConfigLayer, FileMode};
use crate::config::{
	DEFAULT_BACKOFF_INITIAL_MS, DEFAULT_BACKOFF_MAX_ELAPSED_SECS, DEFAULT_BACKOFF_MAX_MS,
	DEFAULT_BACKOFF_MULTIPLIER, DEFAULT_FILE_MODE, DEFAULT_HEALTH_PORT, DEFAULT_RENEWAL_FRACTION,
	DEFAULT_RENEWAL_JITTER, DEFAULT_REQUEST_TIMEOUT_SECS, DEFAULT_STATIC_POLL_SECS,
	DEFAULT_TARGET_DIR, DEFAULT_TOKEN_RESOURCE_ATTEMPTS,
};
use crate::error::ConfigError;
use crate::identity::SA_TOKEN_PATH;

/// Source precedence levels (higher = overrides lower).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Precedence {
	Defaults = 10,
	ConfigFile = 20,
	Environment = 50,
	CommandLine = 60,
}

pub trait ConfigSource: Send + Sync {
	fn name(&self) -> &'static str;
	fn precedence(&self) -> Precedence;
	fn load(&self) -> Result<AgentConfigLayer, ConfigError>;
}

/// Built-in defaults source.
pub struct DefaultsSource;

impl ConfigSource for DefaultsSource {
	fn name(&self) -> &'static str {
		"defaults"
	}

	fn precedence(&self) -> Precedence {
		Precedence::Defaults
	}

	fn load(&self) -> Result<AgentConfigLayer, ConfigError> {
		Ok(AgentConfigLayer {
			allow_insecure_http: Some(false),
			token_path: Some(PathBuf::from(SA_TOKEN_PATH)),
			target_dir: Some(PathBuf::from(DEFAULT_TARGET_DIR)),
			file_mode: Some(FileMode(DEFAULT_FILE_MODE)),
			renewal_fraction: Some(DEFAULT_RENEWAL_FRACTION),
			renewal_jitter: Some(DEFAULT_RENEWAL_JITTER),
			static_secret_poll_secs: Some(DEFAULT_STATIC_POLL_SECS),
			backoff: Some(BackoffConfigLayer {
				initial_ms: Some(DEFAULT_BACKOFF_INITIAL_MS),
				max_ms: Some(DEFAULT_BACKOFF_MAX_MS),
				max_elapsed_secs: Some(DEFAULT_BACKOFF_MAX_ELAPSED_SECS),
				multiplier: Some(DEFAULT_BACKOFF_MULTIPLIER),
			}),
			wait_for_secret_secs: Some(0),
			token_resource_attempts: Some(DEFAULT_TOKEN_RESOURCE_ATTEMPTS),
			exit_after_render: Some(false),
			revoke_on_shutdown: Some(true),
			health_port: Some(DEFAULT_HEALTH_PORT),
			request_timeout_secs: Some(DEFAULT_REQUEST_TIMEOUT_SECS),
			..Default::default()
		})
	}
}

/// TOML file source. An explicitly named file must exist.
pub struct TomlSource {
	path: PathBuf,
}

impl TomlSource {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self { path: path.into() }
	}
}

impl ConfigSource for TomlSource {
	fn name(&self) -> &'static str {
		"toml-config"
	}

	fn precedence(&self) -> Precedence {
		Precedence::ConfigFile
	}

	fn load(&self) -> Result<AgentConfigLayer, ConfigError> {
		debug!(path = %self.path.display(), "loading config file");
		let content = std::fs::read_to_string(&self.path).map_err(|e| ConfigError::FileRead {
			path: self.path.clone(),
			source: e,
		})?;

		let layer: AgentConfigLayer =
			toml::from_str(&content).map_err(|e| ConfigError::TomlParse {
				path: self.path.clone(),
				source: e,
			})?;

		trace!("parsed config layer from TOML");
		Ok(layer)
	}
}

type Lookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Environment variable source.
///
/// Convention: WARD_AGENT_<FIELD>
pub struct EnvSource {
	lookup: Lookup,
}

impl Default for EnvSource {
	fn default() -> Self {
		Self::new()
	}
}

impl EnvSource {
	pub fn new() -> Self {
		Self::with_lookup(|name| std::env::var(name).ok())
	}

	/// Read variables through `lookup` instead of the process environment.
	pub fn with_lookup(lookup: impl Fn(&str) -> Option<String> + Send + Sync + 'static) -> Self {
		Self {
			lookup: Box::new(lookup),
		}
	}

	fn var(&self, name: &str) -> Option<String> {
		(self.lookup)(name).filter(|s| !s.is_empty())
	}

	fn bool(&self, name: &str) -> Option<bool> {
		self
			.var(name)
			.map(|v| v.eq_ignore_ascii_case("true") || v == "1")
	}

	fn parse<T: std::str::FromStr>(&self, name: &str) -> Result<Option<T>, ConfigError>
	where
		T::Err: std::fmt::Display,
	{
		match self.var(name) {
			Some(v) => v
				.parse()
				.map(Some)
				.map_err(|e: T::Err| ConfigError::invalid(name, format!("invalid value '{v}': {e}"))),
			None => Ok(None),
		}
	}

	fn load_backoff(&self) -> Result<Option<BackoffConfigLayer>, ConfigError> {
		let layer = BackoffConfigLayer {
			initial_ms: self.parse("WARD_AGENT_BACKOFF_INITIAL_MS")?,
			max_ms: self.parse("WARD_AGENT_BACKOFF_MAX_MS")?,
			max_elapsed_secs: self.parse("WARD_AGENT_BACKOFF_MAX_ELAPSED_SECS")?,
			multiplier: self.parse("WARD_AGENT_BACKOFF_MULTIPLIER")?,
		};
		Ok((layer != BackoffConfigLayer::default()).then_some(layer))
	}
}

impl ConfigSource for EnvSource {
	fn name(&self) -> &'static str {
		"environment"
	}

	fn precedence(&self) -> Precedence {
		Precedence::Environment
	}

	fn load(&self) -> Result<AgentConfigLayer, ConfigError> {
		debug!("loading environment variables");
		Ok(AgentConfigLayer {
			server_url: self.var("WARD_AGENT_SERVER_URL"),
			allow_insecure_http: self.bool("WARD_AGENT_ALLOW_INSECURE_HTTP"),
			role: self.var("WARD_AGENT_ROLE"),
			secret_path: self.var("WARD_AGENT_SECRET_PATH"),
			token_path: self.var("WARD_AGENT_TOKEN_PATH").map(PathBuf::from),
			target_dir: self.var("WARD_AGENT_TARGET_DIR").map(PathBuf::from),
			file_mode: self
				.var("WARD_AGENT_FILE_MODE")
				.map(|v| FileMode::parse("WARD_AGENT_FILE_MODE", &v))
				.transpose()?,
			files: self
				.var("WARD_AGENT_FILES")
				.map(|v| parse_file_list("WARD_AGENT_FILES", &v))
				.transpose()?,
			renewal_fraction: self.parse("WARD_AGENT_RENEWAL_FRACTION")?,
			renewal_jitter: self.parse("WARD_AGENT_RENEWAL_JITTER")?,
			static_secret_poll_secs: self.parse("WARD_AGENT_STATIC_POLL_SECS")?,
			backoff: self.load_backoff()?,
			wait_for_secret_secs: self.parse("WARD_AGENT_WAIT_FOR_SECRET_SECS")?,
			token_resource_attempts: self.parse("WARD_AGENT_TOKEN_RESOURCE_ATTEMPTS")?,
			exit_after_render: self.bool("WARD_AGENT_EXIT_AFTER_RENDER"),
			revoke_on_shutdown: self.bool("WARD_AGENT_REVOKE_ON_SHUTDOWN"),
			health_port: self.parse("WARD_AGENT_HEALTH_PORT")?,
			request_timeout_secs: self.parse("WARD_AGENT_REQUEST_TIMEOUT_SECS")?,
		})
	}
}

/// Layer built from command-line flags.
pub struct CliSource {
	layer: AgentConfigLayer,
}

impl CliSource {
	pub fn new(layer: AgentConfigLayer) -> Self {
		Self { layer }
	}
}

impl ConfigSource for CliSource {
	fn name(&self) -> &'static str {
		"command-line"
	}

	fn precedence(&self) -> Precedence {
		Precedence::CommandLine
	}

	fn load(&self) -> Result<AgentConfigLayer, ConfigError> {
		Ok(self.layer.clone())
	}
}
