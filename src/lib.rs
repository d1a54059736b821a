//! Two-factor authentication proxy terminating RADIUS and LDAP in
//! front of a directory service and a cloud 2FA API.
use anyhow::{bail, Context, Result};
use tokio::sync::watch;

mod api;
mod config;
mod directory;
mod engine;
mod ldap;
pub mod radius;
mod signing;

pub use config::Config;
use engine::AuthEngine;
use ldap::LdapServer;
use radius::RadiusServer;

/// Run every configured front end until the shutdown signal fires.
///
/// Each RADIUS and LDAP binding gets its own authentication engine
/// (and with it its own cloud HTTP pool), torn down when the binding's
/// server returns.
pub async fn run(config: Config, shutdown: watch::Receiver<bool>) -> Result<()> {
	let mut servers = Vec::new();

	for server_config in &config.radius_servers {
		tracing::info!("Initializing RADIUS server on port {}", server_config.port);

		let engine = AuthEngine::new(
			config.directory_profile(server_config.directory.as_ref()),
			&config.api,
			"VPN Authentication",
			server_config.fail_open,
		)?;
		let server = RadiusServer::bind(server_config, engine).await?;
		servers.push(tokio::spawn(server.run(shutdown.clone())));
	}

	for server_config in &config.ldap_servers {
		tracing::info!("Initializing LDAP server on port {}", server_config.port);

		let profile = config.directory_profile(server_config.directory.as_ref());
		let engine =
			AuthEngine::new(profile.clone(), &config.api, "LDAP Authentication", false)?;
		let server = LdapServer::bind(server_config, profile, engine).await?;
		servers.push(tokio::spawn(server.run(shutdown.clone())));
	}

	if servers.is_empty() {
		bail!("configuration defines no RADIUS or LDAP servers");
	}

	for server in servers {
		server.await.context("server task failed")??;
	}

	tracing::info!("Authentication proxy stopped");
	Ok(())
}
