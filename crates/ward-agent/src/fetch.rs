// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use async_trait::async_trait;

use crate::error::FetchError;
use crate::types::{SecretRecord, SessionCredential};

/// Reads secrets from the store, authorized by a session credential.
#[async_trait]
pub trait SecretFetcher: Send + Sync {
	async fn fetch(&self, credential: &SessionCredential, path: &str) -> Result<SecretRecord, FetchError>;
}
