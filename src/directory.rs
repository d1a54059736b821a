//! Directory (AD/LDAP) client for primary authentication and proxied reads
use std::time::Duration;

use anyhow::{bail, Context, Result};
use ldap3::{ldap_escape, Ldap, LdapConnAsync, LdapConnSettings, LdapError, Scope, SearchEntry};

use crate::config::DirectoryConfig;

/// Outcome of a directory bind attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BindOutcome {
	/// The bind succeeded
	Ok,
	/// Wrong password or unknown user name
	BadCredentials,
	/// The account is administratively disabled
	Disabled,
	/// The account is locked out
	Locked,
	/// The account has expired
	Expired,
	/// The user could not be resolved to a DN
	UserNotFound,
	/// The directory failed in some other way
	Error,
}

/// Client for one configured directory profile.
///
/// Connections are opened per operation; the directory is free to close
/// idle ones and a bind changes connection identity anyway.
#[derive(Debug, Clone)]
pub(crate) struct DirectoryClient {
	/// The profile this client talks to
	config: DirectoryConfig,
}

impl DirectoryClient {
	/// Create a client for a directory profile
	pub(crate) fn new(config: DirectoryConfig) -> Self {
		Self { config }
	}

	/// Operation timeout from the profile
	fn timeout(&self) -> Duration {
		Duration::from_secs(self.config.timeout)
	}

	/// Open a fresh connection to the directory
	async fn connect(&self) -> Result<Ldap> {
		let settings = LdapConnSettings::new().set_conn_timeout(self.timeout());
		let (conn, ldap) = LdapConnAsync::with_settings(settings, &self.config.url())
			.await
			.with_context(|| format!("failed to connect to directory {}", self.config.host))?;
		ldap3::drive!(conn);

		Ok(ldap)
	}

	/// Open a connection bound with the service credentials
	async fn connect_service(&self) -> Result<Ldap> {
		let mut ldap = self.connect().await?;
		ldap.with_timeout(self.timeout())
			.simple_bind(&self.config.bind_dn, &self.config.bind_password)
			.await
			.context("service bind failed")?
			.success()
			.context("service bind rejected")?;

		Ok(ldap)
	}

	/// The profile's search filter with the username substituted in
	fn user_filter(&self, username: &str) -> String {
		self.config.search_filter.replace("{username}", &ldap_escape(username))
	}

	/// Look up a user's DN via a service-bound subtree search.
	///
	/// Exactly one match is required; zero matches resolve to `None` and
	/// multiple matches are an error.
	pub(crate) async fn resolve_dn(&self, username: &str) -> Result<Option<String>> {
		let mut ldap = self.connect_service().await?;
		let filter = self.user_filter(username);

		let (entries, _) = ldap
			.with_timeout(self.timeout())
			.search(&self.config.base_dn, Scope::Subtree, &filter, &["distinguishedName"])
			.await
			.context("user search failed")?
			.success()
			.context("user search rejected")?;
		let _ = ldap.unbind().await;

		match entries.len() {
			0 => {
				tracing::debug!("User not found: {}", username);
				Ok(None)
			}
			1 => {
				let entry = entries.into_iter().next().map(SearchEntry::construct);
				Ok(entry.map(|entry| entry.dn))
			}
			_ => {
				tracing::warn!("Multiple users found for username: {}", username);
				bail!("ambiguous username: {username}");
			}
		}
	}

	/// Bind as a literal DN and classify the result
	pub(crate) async fn simple_bind(&self, dn: &str, password: &str) -> Result<BindOutcome> {
		let mut ldap = self.connect().await?;
		let bind = ldap.with_timeout(self.timeout()).simple_bind(dn, password).await;
		let result = match bind {
			Ok(result) => result.success(),
			Err(error) => Err(error),
		};
		let _ = ldap.unbind().await;

		match result {
			Ok(_) => Ok(BindOutcome::Ok),
			Err(error) => Ok(classify_bind_error(&error)),
		}
	}

	/// Authenticate a user: resolve the DN, then re-bind with the
	/// supplied password.
	pub(crate) async fn authenticate(
		&self,
		username: &str,
		password: &str,
	) -> (BindOutcome, String) {
		if password.is_empty() {
			return (BindOutcome::BadCredentials, "Password required".to_owned());
		}

		let dn = match self.resolve_dn(username).await {
			Ok(Some(dn)) => dn,
			Ok(None) => {
				tracing::warn!("User not found in directory: {}", username);
				return (BindOutcome::UserNotFound, "User not found".to_owned());
			}
			Err(error) => {
				tracing::error!("Error looking up user {}: {:#}", username, error);
				return (BindOutcome::Error, "Authentication failed".to_owned());
			}
		};

		match self.simple_bind(&dn, password).await {
			Ok(BindOutcome::Ok) => {
				tracing::info!("Primary auth successful for user: {}", username);
				(BindOutcome::Ok, "Authentication successful".to_owned())
			}
			Ok(outcome) => {
				let message = outcome_message(outcome);
				tracing::warn!("Primary auth failed for user {}: {}", username, message);
				(outcome, message.to_owned())
			}
			Err(error) => {
				tracing::error!("Primary auth error for user {}: {:#}", username, error);
				(BindOutcome::Error, "Authentication failed".to_owned())
			}
		}
	}

	/// Service-bound search used by the LDAP proxy path.
	///
	/// Requests all user attributes plus operational ones; entries keep
	/// binary values as raw bytes.
	pub(crate) async fn passthrough_search(
		&self,
		base: &str,
		scope: Scope,
		filter: &str,
	) -> Result<Vec<SearchEntry>> {
		let mut ldap = self.connect_service().await?;

		let (entries, _) = ldap
			.with_timeout(self.timeout())
			.search(base, scope, filter, &["*", "+"])
			.await
			.context("proxied search failed")?
			.success()
			.context("proxied search rejected")?;
		let _ = ldap.unbind().await;

		Ok(entries.into_iter().map(SearchEntry::construct).collect())
	}

	/// Service-bound compare used by the LDAP proxy path
	pub(crate) async fn compare(&self, dn: &str, attr: &str, value: &str) -> Result<bool> {
		let mut ldap = self.connect_service().await?;
		let result = ldap
			.with_timeout(self.timeout())
			.compare(dn, attr, value.as_bytes())
			.await
			.context("proxied compare failed")?;
		let _ = ldap.unbind().await;

		result.equal().context("proxied compare rejected")
	}
}

/// Human-readable message for a failed bind outcome
fn outcome_message(outcome: BindOutcome) -> &'static str {
	match outcome {
		BindOutcome::Ok => "Authentication successful",
		BindOutcome::BadCredentials => "Invalid password",
		BindOutcome::Disabled => "Account disabled",
		BindOutcome::Locked => "Account locked",
		BindOutcome::Expired => "Account expired",
		BindOutcome::UserNotFound => "User not found",
		BindOutcome::Error => "Authentication failed",
	}
}

/// Classify a failed bind from the directory's error string.
///
/// Account-state substrings take precedence; resultCode 49 without one
/// is a plain credential failure.
fn classify_bind_error(error: &LdapError) -> BindOutcome {
	let (rc, text) = match error {
		LdapError::LdapResult { result } => (result.rc, result.text.to_lowercase()),
		_ => (0, error.to_string().to_lowercase()),
	};

	if text.contains("account disabled") {
		BindOutcome::Disabled
	} else if text.contains("account expired") {
		BindOutcome::Expired
	} else if text.contains("account locked") {
		BindOutcome::Locked
	} else if text.contains("user name is invalid") {
		BindOutcome::BadCredentials
	} else if rc == 49 || text.contains("invalidcredentials") {
		BindOutcome::BadCredentials
	} else {
		BindOutcome::Error
	}
}
