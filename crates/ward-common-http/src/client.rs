// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! Shared HTTP client builder with consistent User-Agent header.

use reqwest::{Client, ClientBuilder};

/// Creates a new HTTP client builder with the standard Ward User-Agent header.
///
/// Redirects are disabled: a broker that redirects a credential-bearing
/// request somewhere else is treated as misconfigured.
///
/// # Example
/// ```ignore
/// let client = ward_common_http::builder()
///     .timeout(Duration::from_secs(30))
///     .build()?;
/// ```
pub fn builder() -> ClientBuilder {
	builder_with_user_agent(user_agent())
}

/// Creates a new HTTP client builder with a custom User-Agent header.
pub fn builder_with_user_agent(user_agent: impl Into<String>) -> ClientBuilder {
	Client::builder()
		.user_agent(user_agent.into())
		.redirect(reqwest::redirect::Policy::none())
}

/// Returns the standard Ward User-Agent string.
///
/// Format: `ward/{version}/{os}-{arch}`
pub fn user_agent() -> String {
	format!(
		"ward/{}/{}-{}",
		env!("CARGO_PKG_VERSION"),
		std::env::consts::OS,
		std::env::consts::ARCH
	)
}
