//! All proxy configuration structs and logic
use std::{collections::HashMap, path::Path};

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use url::Url;

/// Configuration for the authentication proxy
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
	/// Cloud 2FA API credentials
	pub api: ApiConfig,
	/// Directory profiles, keyed by the name bindings reference
	#[serde(default)]
	pub directories: HashMap<String, DirectoryConfig>,
	/// RADIUS front ends to run
	#[serde(default)]
	pub radius_servers: Vec<RadiusServerConfig>,
	/// LDAP front ends to run
	#[serde(default)]
	pub ldap_servers: Vec<LdapServerConfig>,
	/// The proxy log level
	pub log_level: Option<String>,
}

impl Config {
	/// Read the configuration from a YAML file
	pub fn from_file(path: &Path) -> Result<Self> {
		let config: Self = config::Config::builder()
			.add_source(config::File::from(path))
			.build()
			.context("failed to read configuration file")?
			.try_deserialize()
			.context("invalid configuration")?;

		config.validate()?;

		Ok(config)
	}

	/// Cross-check binding references and required fields
	pub fn validate(&self) -> Result<()> {
		if self.api.integration_key.is_empty() {
			bail!("api.integration_key is required");
		}
		if self.api.secret_key.is_empty() {
			bail!("api.secret_key is required");
		}

		for server in &self.radius_servers {
			if server.clients.is_empty() {
				bail!("RADIUS server on port {} has no clients configured", server.port);
			}
			if server.mode == AuthMode::Challenge {
				bail!("RADIUS challenge mode is not supported");
			}
			if let Some(name) = &server.directory {
				if !self.directories.contains_key(name) {
					bail!(
						"RADIUS server on port {} references unknown directory `{}`",
						server.port,
						name
					);
				}
			}
		}

		for server in &self.ldap_servers {
			if let Some(name) = &server.directory {
				if !self.directories.contains_key(name) {
					bail!(
						"LDAP server on port {} references unknown directory `{}`",
						server.port,
						name
					);
				}
			}
		}

		Ok(())
	}

	/// Look up the directory profile a binding references
	pub(crate) fn directory_profile(&self, name: Option<&String>) -> Option<DirectoryConfig> {
		name.and_then(|name| self.directories.get(name)).cloned()
	}
}

/// Cloud 2FA API credentials and endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
	/// The base URL of the cloud 2FA API
	pub endpoint: Url,
	/// Integration key sent with every request
	pub integration_key: String,
	/// Secret key used to sign every request
	pub secret_key: String,
	/// How long to wait for a push approval, in seconds
	#[serde(default = "default_push_timeout")]
	pub push_timeout: u64,
}

/// Default push approval wait
const fn default_push_timeout() -> u64 {
	60
}

/// A back-end directory service used for primary authentication
#[derive(Debug, Clone, Deserialize)]
pub struct DirectoryConfig {
	/// Directory server host
	pub host: String,
	/// Directory server port
	#[serde(default = "default_ldap_port")]
	pub port: u16,
	/// Whether to connect over TLS (`ldaps`)
	#[serde(default)]
	pub use_tls: bool,
	/// The base DN under which users are searched
	pub base_dn: String,
	/// The DN of the service account used for searches
	pub bind_dn: String,
	/// The password of the service account
	pub bind_password: String,
	/// Search filter with a `{username}` placeholder
	#[serde(default = "default_search_filter")]
	pub search_filter: String,
	/// Timeout for directory operations, in seconds
	#[serde(default = "default_directory_timeout")]
	pub timeout: u64,
}

impl DirectoryConfig {
	/// The connection URL for this profile
	pub(crate) fn url(&self) -> String {
		let scheme = if self.use_tls { "ldaps" } else { "ldap" };
		format!("{}://{}:{}", scheme, self.host, self.port)
	}
}

/// Default directory port
const fn default_ldap_port() -> u16 {
	389
}

/// Default user search filter
fn default_search_filter() -> String {
	"(sAMAccountName={username})".to_owned()
}

/// Default directory operation timeout
const fn default_directory_timeout() -> u64 {
	10
}

/// How a binding expects the second factor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
	/// Trigger a push when the password carries no factor suffix
	#[default]
	Auto,
	/// Always push, ignoring the absence of a suffix
	Push,
	/// Require an OTP code appended to the password
	Otp,
	/// Honor a `,push` / `,<otp>` suffix appended to the password
	Concat,
	/// Two-step Access-Challenge exchange; rejected at validation
	Challenge,
}

/// A RADIUS listener binding
#[derive(Debug, Clone, Deserialize)]
pub struct RadiusServerConfig {
	/// UDP port to listen on
	#[serde(default = "default_radius_port")]
	pub port: u16,
	/// Second-factor mode for this binding
	#[serde(default)]
	pub mode: AuthMode,
	/// Accept requests when the cloud service is unreachable
	#[serde(default)]
	pub fail_open: bool,
	/// Directory profile for primary authentication; pass-through if unset
	pub directory: Option<String>,
	/// Known RADIUS clients and their shared secrets
	pub clients: Vec<RadiusClientConfig>,
}

/// Default RADIUS port
const fn default_radius_port() -> u16 {
	1812
}

/// A RADIUS client (NAS) allowed to talk to the proxy
#[derive(Debug, Clone, Deserialize)]
pub struct RadiusClientConfig {
	/// Source IP the client sends from
	pub ip: std::net::IpAddr,
	/// Shared secret for packet authentication
	pub secret: String,
}

/// An LDAP listener binding
#[derive(Debug, Clone, Deserialize)]
pub struct LdapServerConfig {
	/// TCP port to listen on
	#[serde(default = "default_ldap_port")]
	pub port: u16,
	/// Directory profile binds and searches are proxied to
	pub directory: Option<String>,
	/// Treat the first bind of every connection as exempt from 2FA
	#[serde(default)]
	pub exempt_primary_bind: bool,
	/// DNs and OUs whose binds skip 2FA
	#[serde(default)]
	pub exempt_ous: Vec<String>,
}
