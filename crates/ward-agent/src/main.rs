// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use ward_agent::config::layer::parse_file_lists;
use ward_agent::{
	health_router, Agent, AgentConfig, AgentConfigLayer, AgentExit, AgentSettings, ClientConfig,
	FileTokenSource, HealthState, HttpBrokerClient, Metrics, Renderer,
};

/// Authenticate with the workload identity, render one secret and keep it fresh.
#[derive(Debug, Parser)]
#[command(name = "ward-agent", version)]
struct Args {
	/// TOML config file.
	#[arg(long, env = "WARD_AGENT_CONFIG")]
	config: Option<PathBuf>,

	#[arg(long)]
	server_url: Option<String>,

	#[arg(long)]
	role: Option<String>,

	#[arg(long)]
	secret_path: Option<String>,

	#[arg(long)]
	token_path: Option<PathBuf>,

	#[arg(long)]
	target_dir: Option<PathBuf>,

	/// `field=file_name`, repeatable. Replaces the configured mapping.
	#[arg(long = "file", value_name = "FIELD=NAME")]
	files: Vec<String>,

	/// Exit after the first successful render (init-container mode).
	#[arg(long)]
	exit_after_render: bool,

	/// 0 disables the health server.
	#[arg(long)]
	health_port: Option<u16>,
}

impl Args {
	fn into_layer(self) -> Result<(Option<PathBuf>, AgentConfigLayer)> {
		let files = if self.files.is_empty() {
			None
		} else {
			Some(parse_file_lists("--file", self.files.iter().map(String::as_str))?)
		};

		let layer = AgentConfigLayer {
			server_url: self.server_url,
			role: self.role,
			secret_path: self.secret_path,
			token_path: self.token_path,
			target_dir: self.target_dir,
			files,
			exit_after_render: self.exit_after_render.then_some(true),
			health_port: self.health_port,
			..Default::default()
		};
		Ok((self.config, layer))
	}
}

#[tokio::main]
async fn main() -> ExitCode {
	tracing_subscriber::registry()
		.with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
		.with(tracing_subscriber::fmt::layer().json())
		.init();

	match run().await {
		Ok(AgentExit::Shutdown) => {
			info!("ward-agent stopped");
			ExitCode::SUCCESS
		}
		Ok(AgentExit::Rendered) => {
			info!("ward-agent finished rendering");
			ExitCode::SUCCESS
		}
		Err(e) => {
			error!(error = %format!("{e:#}"), "ward-agent exiting with failure");
			ExitCode::FAILURE
		}
	}
}

async fn run() -> Result<AgentExit> {
	let (config_path, cli) = Args::parse().into_layer()?;
	let config = AgentConfig::load(config_path.as_deref(), cli).context("loading configuration")?;

	info!(
		server_url = %config.server_url,
		role = %config.role,
		exit_after_render = config.exit_after_render,
		"Starting ward-agent"
	);

	let client = Arc::new(HttpBrokerClient::with_config(ClientConfig {
		server_url: config.server_url.clone(),
		allow_insecure: config.allow_insecure_http,
		request_timeout: config.request_timeout,
	})?);
	let renderer = Renderer::new(&config.target_dir, config.file_mode, config.files.clone())?;

	let metrics = Arc::new(Metrics::new());
	let health = HealthState::new();

	let (shutdown_tx, shutdown_rx) = watch::channel(false);

	if config.health_port != 0 {
		let addr = SocketAddr::from(([0, 0, 0, 0], config.health_port));
		let listener = tokio::net::TcpListener::bind(addr)
			.await
			.with_context(|| format!("binding health server on {addr}"))?;
		let app = health_router(health.clone(), metrics.clone());
		let mut server_shutdown = shutdown_rx.clone();
		info!(%addr, "Health server listening");
		tokio::spawn(async move {
			let serve = axum::serve(listener, app.into_make_service()).with_graceful_shutdown(
				async move {
					let _ = server_shutdown.wait_for(|stop| *stop).await;
				},
			);
			if let Err(e) = serve.await {
				warn!(error = %e, "Health server error");
			}
		});
	}

	tokio::spawn(async move {
		wait_for_signal().await;
		info!("shutdown signal received");
		let _ = shutdown_tx.send(true);
	});

	let mut agent = Agent::new(
		AgentSettings::from(&config),
		Arc::new(FileTokenSource::new(&config.token_path)),
		client.clone(),
		client,
		renderer,
		shutdown_rx,
	)
	.with_metrics(metrics)
	.with_health(health);

	Ok(agent.run().await?)
}

async fn wait_for_signal() {
	#[cfg(unix)]
	{
		use tokio::signal::unix::{signal, SignalKind};
		match signal(SignalKind::terminate()) {
			Ok(mut sigterm) => {
				tokio::select! {
					_ = tokio::signal::ctrl_c() => {}
					_ = sigterm.recv() => {}
				}
			}
			Err(e) => {
				warn!(error = %e, "failed to install SIGTERM handler");
				let _ = tokio::signal::ctrl_c().await;
			}
		}
	}
	#[cfg(not(unix))]
	{
		let _ = tokio::signal::ctrl_c().await;
	}
}
