// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::collections::{BTreeMap, BTreeSet};

use ward_common_secret::{SecretBytes, SecretString};

use crate::lease::Lease;

/// Policy-scoped credential issued by the broker. Held only in memory.
#[derive(Debug, Clone)]
pub struct SessionCredential {
	pub token: SecretString,
	/// Non-secret handle, safe to log.
	pub accessor: String,
	pub policies: BTreeSet<String>,
	pub lease: Lease,
}

/// One version of the secret at the configured path.
#[derive(Debug, Clone)]
pub struct SecretRecord {
	pub path: String,
	pub version: u64,
	pub data: BTreeMap<String, SecretBytes>,
	/// `None` for static secrets.
	pub lease: Option<Lease>,
}
