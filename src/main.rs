//! RADIUS/LDAP two-factor authentication proxy
use std::{path::Path, process::ExitCode, str::FromStr};

use anyhow::Context;
use auth_proxy::{run, Config};
use tokio::sync::watch;
use tracing::level_filters::LevelFilter;

#[tokio::main]
async fn main() -> ExitCode {
	match read_the_config_and_run().await {
		Ok(()) => ExitCode::SUCCESS,
		Err(e) => {
			tracing::error!("{:#}", e);
			ExitCode::FAILURE
		}
	}
}

/// Load the configuration, set up logging and drive the proxy until a
/// shutdown signal arrives
async fn read_the_config_and_run() -> anyhow::Result<()> {
	let config = Config::from_file(Path::new(
		std::env::var("AUTH_PROXY_CONFIG").unwrap_or("config.yaml".into()).as_str(),
	))?;

	let subscriber = tracing_subscriber::FmtSubscriber::builder()
		.with_max_level(
			config
				.log_level
				.as_ref()
				.map_or(Ok(LevelFilter::INFO), |s| LevelFilter::from_str(s))?,
		)
		.finish();
	tracing::subscriber::set_global_default(subscriber)
		.context("Setting default tracing subscriber failed")?;

	let (shutdown_tx, shutdown_rx) = watch::channel(false);
	tokio::spawn(async move {
		if tokio::signal::ctrl_c().await.is_ok() {
			tracing::info!("Received shutdown signal");
		}
		let _ = shutdown_tx.send(true);
	});

	run(config, shutdown_rx).await
}
