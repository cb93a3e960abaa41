// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Workload secret agent.
//!
//! Runs next to an application, authenticates to the broker with the
//! workload's identity token, fetches one secret and renders its fields into
//! a shared directory, then keeps the credential and secret fresh until
//! shutdown. In init-container mode it exits after the first render.

pub mod agent;
pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod fetch;
pub mod health;
pub mod identity;
pub mod lease;
pub mod metrics;
pub mod render;
pub mod state;
pub mod types;

pub use agent::{Agent, AgentExit, AgentSettings};
pub use auth::AuthClient;
pub use client::{ClientConfig, HttpBrokerClient, TOKEN_HEADER};
pub use config::{AgentConfig, AgentConfigLayer};
pub use error::{
	AgentError, AuthError, Classified, ConfigError, ErrorClass, FetchError, RenderError,
};
pub use fetch::SecretFetcher;
pub use health::{health_router, HealthState};
pub use identity::{FileTokenSource, StaticTokenSource, TokenSource};
pub use lease::Lease;
pub use metrics::Metrics;
pub use render::{FileMapping, RenderedFile, Renderer};
pub use state::{AgentState, Operation, StateHistory, Transition};
pub use types::{SecretRecord, SessionCredential};
