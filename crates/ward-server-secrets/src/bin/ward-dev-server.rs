// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use ward_server_secrets::{router, DevServerConfig};

/// Development auth broker seeded from a TOML file.
#[derive(Debug, Parser)]
#[command(name = "ward-dev-server", version)]
struct Args {
	/// Seed file with signing key, policies, roles and secrets.
	#[arg(long, env = "WARD_DEV_SERVER_CONFIG")]
	config: PathBuf,

	/// Overrides `listen_addr` from the seed file.
	#[arg(long, env = "WARD_DEV_SERVER_LISTEN")]
	listen: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<()> {
	tracing_subscriber::registry()
		.with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
		.with(tracing_subscriber::fmt::layer().json())
		.init();

	let args = Args::parse();
	let config = DevServerConfig::load(&args.config)
		.with_context(|| format!("loading {}", args.config.display()))?;
	let addr = args.listen.unwrap_or(config.listen_addr);

	let broker = Arc::new(config.build_broker().await?);
	info!(
		addr = %addr,
		roles = config.roles.len(),
		policies = config.policies.len(),
		secrets = config.secrets.len(),
		"Starting ward-dev-server"
	);

	let listener = tokio::net::TcpListener::bind(addr)
		.await
		.with_context(|| format!("binding {addr}"))?;
	axum::serve(listener, router(broker.clone()).into_make_service())
		.with_graceful_shutdown(async {
			let _ = tokio::signal::ctrl_c().await;
		})
		.await?;

	let stats = broker.stats();
	info!(
		logins = stats.logins(),
		renewals = stats.renewals(),
		reads = stats.reads(),
		"ward-dev-server stopped"
	);
	Ok(())
}
