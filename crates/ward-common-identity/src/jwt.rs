// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Compact JWT handling, limited to what the handshake needs.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::{IdentityClaims, IdentityError, IdentityResult};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Serialize, Deserialize)]
struct Header {
	alg: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	typ: Option<String>,
}

/// Expectations checked by [`verify_hs256`].
#[derive(Debug, Clone)]
pub struct VerifyOptions<'a> {
	pub audience: &'a str,
	pub issuer: Option<&'a str>,
	/// Unix seconds.
	pub now: i64,
	/// Allowed clock skew in seconds for `exp` and `nbf`.
	pub leeway: i64,
}

fn split(token: &str) -> IdentityResult<(&str, &str, &str)> {
	let mut parts = token.trim().split('.');
	match (parts.next(), parts.next(), parts.next(), parts.next()) {
		(Some(h), Some(p), Some(s), None) if !h.is_empty() && !p.is_empty() => Ok((h, p, s)),
		_ => Err(IdentityError::Malformed),
	}
}

fn decode_segment<T: for<'de> Deserialize<'de>>(segment: &str) -> IdentityResult<T> {
	let bytes = URL_SAFE_NO_PAD
		.decode(segment)
		.map_err(|e| IdentityError::Payload(e.to_string()))?;
	serde_json::from_slice(&bytes).map_err(|e| IdentityError::Payload(e.to_string()))
}

/// Read the claims without checking the signature.
///
/// Only suitable for local hints such as "this token already expired".
pub fn decode_unverified(token: &str) -> IdentityResult<IdentityClaims> {
	let (_, payload, _) = split(token)?;
	decode_segment(payload)
}

pub fn sign_hs256(claims: &IdentityClaims, key: &[u8]) -> IdentityResult<String> {
	let header = Header {
		alg: "HS256".to_string(),
		typ: Some("JWT".to_string()),
	};
	let header = serde_json::to_vec(&header).map_err(|e| IdentityError::Signing(e.to_string()))?;
	let payload = serde_json::to_vec(claims).map_err(|e| IdentityError::Signing(e.to_string()))?;
	let signing_input = format!(
		"{}.{}",
		URL_SAFE_NO_PAD.encode(header),
		URL_SAFE_NO_PAD.encode(payload)
	);

	let mut mac =
		HmacSha256::new_from_slice(key).map_err(|e| IdentityError::Signing(e.to_string()))?;
	mac.update(signing_input.as_bytes());
	let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

	Ok(format!("{signing_input}.{signature}"))
}

/// Verify signature, time window, audience and issuer, returning the claims.
pub fn verify_hs256(
	token: &str,
	key: &[u8],
	options: &VerifyOptions<'_>,
) -> IdentityResult<IdentityClaims> {
	let (header_b64, payload_b64, signature_b64) = split(token)?;

	let header: Header = decode_segment(header_b64)?;
	if header.alg != "HS256" {
		return Err(IdentityError::UnsupportedAlgorithm(header.alg));
	}

	let signature = URL_SAFE_NO_PAD
		.decode(signature_b64)
		.map_err(|_| IdentityError::InvalidSignature)?;
	let mut mac = HmacSha256::new_from_slice(key).map_err(|_| IdentityError::InvalidSignature)?;
	mac.update(header_b64.as_bytes());
	mac.update(b".");
	mac.update(payload_b64.as_bytes());
	mac
		.verify_slice(&signature)
		.map_err(|_| IdentityError::InvalidSignature)?;

	let claims: IdentityClaims = decode_segment(payload_b64)?;

	if claims.is_expired_at(options.now - options.leeway) {
		return Err(IdentityError::Expired(claims.exp));
	}
	if let Some(nbf) = claims.nbf {
		if options.now + options.leeway < nbf {
			return Err(IdentityError::NotYetValid(nbf));
		}
	}
	if !claims.aud.contains(options.audience) {
		return Err(IdentityError::AudienceMismatch(options.audience.to_string()));
	}
	if let Some(expected) = options.issuer {
		if claims.iss != expected {
			return Err(IdentityError::IssuerMismatch {
				expected: expected.to_string(),
				actual: claims.iss,
			});
		}
	}

	Ok(claims)
}
