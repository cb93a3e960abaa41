// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! Shared HTTP utilities for Ward.
//!
//! This crate provides:
//! - A pre-configured HTTP client builder with a consistent User-Agent header
//! - Capped exponential backoff with jitter and a maximum elapsed time

mod client;
mod retry;

pub use client::{builder, builder_with_user_agent, user_agent};
pub use retry::{retry, Backoff, BackoffConfig, RetryableError};
