// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use async_trait::async_trait;
use ward_common_secret::SecretString;

use crate::error::AuthError;
use crate::types::SessionCredential;

/// Obtains and maintains session credentials from the auth broker.
#[async_trait]
pub trait AuthClient: Send + Sync {
	/// Exchange an identity token for a credential bound to `role`.
	///
	/// Implementations reject an empty role and a locally expired token
	/// before contacting the broker.
	async fn authenticate(
		&self,
		role: &str,
		identity_token: &SecretString,
	) -> Result<SessionCredential, AuthError>;

	/// Extend a renewable credential. `InvalidToken` means it lapsed.
	async fn renew(&self, credential: &SessionCredential) -> Result<SessionCredential, AuthError>;

	/// Revoke a credential. Callers treat failure as non-fatal.
	async fn revoke(&self, credential: &SessionCredential) -> Result<(), AuthError>;
}
