// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Validity windows for session credentials and dynamic secrets.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
	pub issued_at: Instant,
	pub duration: Duration,
	pub renewable: bool,
}

impl Lease {
	pub fn new(issued_at: Instant, duration: Duration, renewable: bool) -> Self {
		Self {
			issued_at,
			duration,
			renewable,
		}
	}

	/// A zero duration means the lease never expires.
	pub fn is_indefinite(&self) -> bool {
		self.duration.is_zero()
	}

	pub fn expires_at(&self) -> Instant {
		self.issued_at + self.duration
	}

	pub fn remaining(&self, now: Instant) -> Duration {
		self.expires_at().saturating_duration_since(now)
	}

	/// Point at `fraction` of the lease.
	pub fn renew_at(&self, fraction: f64) -> Instant {
		self.issued_at + self.duration.mul_f64(fraction.clamp(0.0, 1.0))
	}

	/// Renewal deadline pulled earlier by up to `jitter` of the renewal
	/// offset. `sample` is drawn from `[0, 1)`. Never later than
	/// [`Lease::renew_at`] and never earlier than `issued_at`. `None` for
	/// indefinite leases.
	pub fn schedule(&self, fraction: f64, jitter: f64, sample: f64) -> Option<Instant> {
		if self.is_indefinite() {
			return None;
		}
		let offset = self.duration.mul_f64(fraction.clamp(0.0, 1.0));
		let pull = offset.mul_f64(jitter.clamp(0.0, 1.0) * sample.clamp(0.0, 1.0));
		Some(self.issued_at + offset.saturating_sub(pull))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use proptest::prelude::*;

	#[test]
	fn expiry_and_remaining() {
		let now = Instant::now();
		let lease = Lease::new(now, Duration::from_secs(60), true);
		assert_eq!(lease.expires_at(), now + Duration::from_secs(60));
		assert_eq!(lease.remaining(now + Duration::from_secs(45)), Duration::from_secs(15));
		assert_eq!(lease.remaining(now + Duration::from_secs(90)), Duration::ZERO);
	}

	#[test]
	fn zero_duration_is_indefinite() {
		let lease = Lease::new(Instant::now(), Duration::ZERO, false);
		assert!(lease.is_indefinite());
		assert_eq!(lease.schedule(0.667, 0.1, 0.5), None);
	}

	#[test]
	fn without_jitter_schedule_matches_fraction() {
		let now = Instant::now();
		let lease = Lease::new(now, Duration::from_secs(24 * 3600), true);
		assert_eq!(lease.schedule(0.5, 0.0, 0.9), Some(now + Duration::from_secs(12 * 3600)));
	}

	proptest! {
		#[test]
		fn renewal_never_later_than_fraction(
			lease_ms in 1u64..10_000_000_000,
			fraction in 0.01f64..0.99,
			jitter in 0.0f64..1.0,
			sample in 0.0f64..1.0,
		) {
			let issued = Instant::now();
			let lease = Lease::new(issued, Duration::from_millis(lease_ms), true);
			let at = lease.schedule(fraction, jitter, sample).unwrap();
			prop_assert!(at <= lease.renew_at(fraction));
			prop_assert!(at >= issued);
			prop_assert!(at < lease.expires_at());
		}
	}
}
