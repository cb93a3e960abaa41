// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Reference auth broker for Ward agents.
//!
//! Verifies workload identity tokens, issues scoped session credentials bound
//! to roles, evaluates path policies and serves versioned secrets over HTTP.
//! Used by `ward-dev-server` and by the agent's integration tests.

pub mod config;
pub mod error;
pub mod policy;
pub mod routes;
pub mod service;
pub mod store;
pub mod token_review;
pub mod types;

pub use config::{DevServerConfig, SeedSecret};
pub use error::{BrokerError, BrokerResult};
pub use policy::PolicyEngine;
pub use routes::{router, TOKEN_HEADER};
pub use service::{Broker, BrokerStats, Fault, SESSION_TOKEN_PREFIX};
pub use store::{validate_path, MemorySecretStore, SecretStore};
pub use token_review::{Hs256TokenReviewer, ReviewResult, ReviewedIdentity, StaticTokenReviewer, TokenReviewer};
pub use types::{
	AuthInfo, AuthResponse, Capability, ErrorBody, LoginRequest, PathRule, Policy, Role,
	SecretResponse, SecretVersion, WriteSecretRequest, WriteSecretResponse,
};
