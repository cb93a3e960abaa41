// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Workload identity tokens.
//!
//! Identity tokens are compact JWTs issued by the hosting environment (a
//! projected Kubernetes service account token in production). Two audiences
//! use this crate:
//!
//! - the agent, which only peeks at the payload via [`decode_unverified`] to
//!   fail fast on an expired token before sending it anywhere
//! - the reference broker, which verifies HS256 signatures against its trust
//!   anchor via [`verify_hs256`]

mod claims;
mod jwt;

pub use claims::{Audience, IdentityClaims, KubernetesClaims, NamedRef};
pub use jwt::{decode_unverified, sign_hs256, verify_hs256, VerifyOptions};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
	#[error("token is not a compact JWT")]
	Malformed,

	#[error("token payload could not be decoded: {0}")]
	Payload(String),

	#[error("unsupported signing algorithm: {0}")]
	UnsupportedAlgorithm(String),

	#[error("token signature is invalid")]
	InvalidSignature,

	#[error("token expired at {0}")]
	Expired(i64),

	#[error("token is not valid before {0}")]
	NotYetValid(i64),

	#[error("token audience does not include {0}")]
	AudienceMismatch(String),

	#[error("token issuer {actual} is not {expected}")]
	IssuerMismatch { expected: String, actual: String },

	#[error("signing failed: {0}")]
	Signing(String),
}

pub type IdentityResult<T> = Result<T, IdentityError>;
