//! LDAP front end: intercepts binds for 2FA, proxies directory reads
mod proto;

use std::{
	net::{Ipv4Addr, SocketAddr},
	sync::Arc,
};

use anyhow::{Context, Result};
use ldap3::Scope;
use tokio::{
	io::{AsyncReadExt, AsyncWriteExt},
	net::{TcpListener, TcpStream},
	sync::watch,
};

use crate::{
	config::{AuthMode, DirectoryConfig, LdapServerConfig},
	directory::{BindOutcome, DirectoryClient},
	engine::{AuthEngine, AuthResult},
	ldap::proto::{BindAuth, Filter, LdapMessage, Request},
};

/// Who-Am-I extended operation OID
const OID_WHO_AM_I: &str = "1.3.6.1.4.1.4203.1.11.3";
/// StartTLS extended operation OID
const OID_START_TLS: &str = "1.3.6.1.4.1.1466.20037";

/// Decides which bind DNs skip the second factor
#[derive(Debug)]
struct ExemptPolicy {
	/// Treat the first bind of a connection as the service-account probe
	exempt_primary_bind: bool,
	/// The directory profile's service DN, if any
	service_dn: Option<String>,
	/// Configured exempt DNs and OUs
	exempt_ous: Vec<String>,
}

impl ExemptPolicy {
	/// Whether a bind DN is exempt from 2FA; returns the reason.
	/// The first matching rule wins.
	fn is_exempt(&self, dn: &str, first_bind_done: bool) -> Option<String> {
		let dn_lower = dn.to_lowercase();

		if self.exempt_primary_bind && !first_bind_done {
			return Some("first bind in connection".to_owned());
		}

		if let Some(service_dn) = &self.service_dn {
			let service_lower = service_dn.to_lowercase();
			if dn_lower == service_lower || upn_local_parts_match(&dn_lower, &service_lower) {
				return Some("service account".to_owned());
			}
		}

		for exempt in &self.exempt_ous {
			let exempt_lower = exempt.to_lowercase();
			if dn_lower == exempt_lower
				|| upn_local_parts_match(&dn_lower, &exempt_lower)
				|| dn_lower.ends_with(&format!(",{exempt_lower}"))
			{
				return Some(format!("exempt entry: {exempt}"));
			}
		}

		None
	}
}

/// Whether two UPN-formatted names share a local part
fn upn_local_parts_match(left: &str, right: &str) -> bool {
	match (left.split_once('@'), right.split_once('@')) {
		(Some((left_local, _)), Some((right_local, _))) => left_local == right_local,
		_ => false,
	}
}

/// Extract the login username from a bind DN.
///
/// Handles `CN=user,...`, `uid=user,...`, `user@domain`, and
/// `DOMAIN\user`; anything else passes through verbatim.
fn extract_username(dn: &str) -> &str {
	let lower = dn.to_lowercase();

	if lower.starts_with("cn=") {
		return dn[3..].split(',').next().unwrap_or(dn);
	}
	if lower.starts_with("uid=") {
		return dn[4..].split(',').next().unwrap_or(dn);
	}
	if dn.contains('@') && !dn.contains('=') {
		return dn.split('@').next().unwrap_or(dn);
	}
	if let Some((_, user)) = dn.rsplit_once('\\') {
		return user;
	}

	dn
}

/// State shared by every connection of one listener
#[derive(Debug)]
struct Inner {
	/// The authentication orchestrator, shared across connections
	engine: AuthEngine,
	/// Back-end directory for exempt binds and proxied reads
	directory: Option<DirectoryClient>,
	/// 2FA exemption rules
	policy: ExemptPolicy,
}

/// An LDAP proxy server for one binding
#[derive(Debug)]
pub(crate) struct LdapServer {
	/// The bound TCP listener
	listener: TcpListener,
	/// Shared handler state
	inner: Arc<Inner>,
}

impl LdapServer {
	/// Bind the TCP listener for an LDAP binding
	pub(crate) async fn bind(
		config: &LdapServerConfig,
		directory: Option<DirectoryConfig>,
		engine: AuthEngine,
	) -> Result<Self> {
		let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, config.port))
			.await
			.with_context(|| format!("failed to bind LDAP port {}", config.port))?;

		let policy = ExemptPolicy {
			exempt_primary_bind: config.exempt_primary_bind,
			service_dn: directory.as_ref().map(|directory| directory.bind_dn.clone()),
			exempt_ous: config.exempt_ous.clone(),
		};

		Ok(Self {
			listener,
			inner: Arc::new(Inner {
				engine,
				directory: directory.map(DirectoryClient::new),
				policy,
			}),
		})
	}

	/// The address the server actually bound
	pub(crate) fn local_addr(&self) -> Result<SocketAddr> {
		self.listener.local_addr().context("no local address")
	}

	/// Accept connections until shutdown
	pub(crate) async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
		tracing::info!("LDAP server listening on {}", self.local_addr()?);

		loop {
			tokio::select! {
				accepted = self.listener.accept() => {
					let (stream, peer) = match accepted {
						Ok(accepted) => accepted,
						Err(error) => {
							tracing::error!("LDAP accept failed: {}", error);
							continue;
						}
					};
					tracing::debug!("New LDAP connection from {}", peer);

					let connection = Connection {
						stream,
						peer,
						first_bind_done: false,
						inner: Arc::clone(&self.inner),
					};
					let handler_shutdown = shutdown.clone();
					tokio::spawn(async move {
						if let Err(error) = connection.serve(handler_shutdown).await {
							tracing::debug!("LDAP connection from {} ended: {:#}", peer, error);
						}
					});
				}
				_ = shutdown.changed() => {
					tracing::info!("Stopping LDAP server");
					return Ok(());
				}
			}
		}
	}
}

/// One client connection and its bind state
#[derive(Debug)]
struct Connection {
	/// The client socket
	stream: TcpStream,
	/// The client address
	peer: SocketAddr,
	/// Set once the first non-anonymous bind completes; never reverts
	first_bind_done: bool,
	/// Listener-wide state
	inner: Arc<Inner>,
}

impl Connection {
	/// Read and answer PDUs in arrival order until unbind, EOF, or
	/// shutdown
	async fn serve(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
		let mut buf: Vec<u8> = Vec::new();
		let mut chunk = [0_u8; 8192];

		loop {
			while let Some((message, consumed)) = proto::try_parse(&buf)? {
				buf.drain(..consumed);
				if !self.handle_message(message).await? {
					return Ok(());
				}
			}

			tokio::select! {
				read = self.stream.read(&mut chunk) => {
					let len = read.context("connection read failed")?;
					if len == 0 {
						return Ok(());
					}
					buf.extend_from_slice(&chunk[..len]);
				}
				_ = shutdown.changed() => {
					tracing::debug!("Closing LDAP connection from {} on shutdown", self.peer);
					return Ok(());
				}
			}
		}
	}

	/// Dispatch one PDU; false ends the connection.
	///
	/// Handler failures answer resultCode 1 where the operation has a
	/// response; only socket faults propagate.
	async fn handle_message(&mut self, message: LdapMessage) -> Result<bool> {
		let id = message.id;
		match message.op {
			Request::Bind { dn, auth } => {
				let response = match self.handle_bind(id, &dn, auth).await {
					Ok(response) => response,
					Err(error) => {
						tracing::error!("Error during LDAP bind for {}: {:#}", dn, error);
						proto::op_response(
							id,
							proto::APP_BIND_RESPONSE,
							proto::RC_OPERATIONS_ERROR,
							&format!("{error:#}"),
						)?
					}
				};
				self.stream.write_all(&response).await?;
			}
			Request::Unbind => {
				tracing::debug!("LDAP unbind request");
				return Ok(false);
			}
			Request::Search { base, scope, filter } => {
				for response in self.handle_search(id, &base, scope, &filter).await? {
					self.stream.write_all(&response).await?;
				}
			}
			Request::Compare { dn, attr, value } => {
				let response = self.handle_compare(id, &dn, &attr, &value).await?;
				self.stream.write_all(&response).await?;
			}
			Request::Extended { oid } => {
				let response = extended_answer(id, &oid)?;
				self.stream.write_all(&response).await?;
			}
			Request::Write { op_id } => {
				tracing::debug!("LDAP write request (op {}) - not supported", op_id);
				let response = proto::op_response(
					id,
					op_id + 1,
					proto::RC_UNWILLING_TO_PERFORM,
					write_refusal(op_id),
				)?;
				self.stream.write_all(&response).await?;
			}
			Request::Abandon => {
				tracing::debug!("LDAP abandon request");
			}
			Request::Unknown(op_id) => {
				tracing::warn!("Unsupported LDAP operation {} from {}", op_id, self.peer);
			}
		}

		Ok(true)
	}

	/// Handle a bind request, interleaving 2FA unless the DN is exempt
	async fn handle_bind(&mut self, id: i32, dn: &str, auth: BindAuth) -> Result<Vec<u8>> {
		let BindAuth::Simple(password) = auth else {
			self.first_bind_done = true;
			return proto::op_response(
				id,
				proto::APP_BIND_RESPONSE,
				proto::RC_AUTH_METHOD_NOT_SUPPORTED,
				"only simple binds are supported",
			);
		};

		if dn.is_empty() || password.is_empty() {
			tracing::debug!("Anonymous bind request - allowing");
			return proto::op_response(id, proto::APP_BIND_RESPONSE, proto::RC_SUCCESS, "");
		}

		let username = extract_username(dn);
		tracing::info!("LDAP bind request: dn={}, username={}", dn, username);

		let response = if let Some(reason) = self.inner.policy.is_exempt(dn, self.first_bind_done)
		{
			tracing::info!("2FA exempt for {}: {}", username, reason);
			self.exempt_bind(id, dn, &password).await?
		} else {
			let (result, message) = self
				.inner
				.engine
				.authenticate(
					username,
					&password,
					"LDAP client",
					&self.peer.ip().to_string(),
					AuthMode::Auto,
				)
				.await;

			if result == AuthResult::Success {
				tracing::info!("LDAP bind successful for: {}", username);
				proto::op_response(id, proto::APP_BIND_RESPONSE, proto::RC_SUCCESS, "")?
			} else {
				tracing::warn!("LDAP bind failed for {}: {}", username, message);
				proto::op_response(
					id,
					proto::APP_BIND_RESPONSE,
					proto::RC_INVALID_CREDENTIALS,
					&message,
				)?
			}
		};

		self.first_bind_done = true;
		Ok(response)
	}

	/// Verify only the directory password for an exempt DN
	async fn exempt_bind(&self, id: i32, dn: &str, password: &str) -> Result<Vec<u8>> {
		let Some(directory) = &self.inner.directory else {
			// Pass-through: the system behind the proxy checks passwords
			return proto::op_response(id, proto::APP_BIND_RESPONSE, proto::RC_SUCCESS, "");
		};

		match directory.simple_bind(dn, password).await? {
			BindOutcome::Ok => {
				tracing::info!("LDAP bind successful (exempt) for: {}", dn);
				proto::op_response(id, proto::APP_BIND_RESPONSE, proto::RC_SUCCESS, "")
			}
			_ => {
				tracing::warn!("LDAP bind failed (exempt) for {}: invalid credentials", dn);
				proto::op_response(
					id,
					proto::APP_BIND_RESPONSE,
					proto::RC_INVALID_CREDENTIALS,
					"Invalid credentials",
				)
			}
		}
	}

	/// Proxy a search to the back-end directory under service
	/// credentials; the operation always terminates with
	/// SearchResultDone(0), even when the back end fails.
	async fn handle_search(
		&self,
		id: i32,
		base: &str,
		scope: u64,
		filter: &Filter,
	) -> Result<Vec<Vec<u8>>> {
		let mut responses = Vec::new();

		if let Some(directory) = &self.inner.directory {
			let scope = match scope {
				0 => Scope::Base,
				1 => Scope::OneLevel,
				_ => Scope::Subtree,
			};
			let filter = filter.to_filter_string();
			tracing::debug!("Proxying search: base={}, filter={}, scope={:?}", base, filter, scope);

			match directory.passthrough_search(base, scope, &filter).await {
				Ok(entries) => {
					tracing::debug!("Directory returned {} entries", entries.len());
					for entry in entries {
						let mut attributes: Vec<(String, Vec<Vec<u8>>)> = entry
							.attrs
							.into_iter()
							.map(|(name, values)| {
								(name, values.into_iter().map(String::into_bytes).collect())
							})
							.collect();
						attributes.extend(entry.bin_attrs);

						responses.push(proto::search_entry(id, &entry.dn, attributes)?);
					}
				}
				Err(error) => {
					tracing::error!("Error proxying search to directory: {:#}", error);
				}
			}
		}

		responses.push(proto::op_response(id, proto::APP_SEARCH_DONE, proto::RC_SUCCESS, "")?);
		Ok(responses)
	}

	/// Proxy a compare to the back-end directory
	async fn handle_compare(&self, id: i32, dn: &str, attr: &str, value: &[u8]) -> Result<Vec<u8>> {
		tracing::debug!("LDAP compare request: dn={}, attr={}", dn, attr);

		let result = if let Some(directory) = &self.inner.directory {
			match directory.compare(dn, attr, &String::from_utf8_lossy(value)).await {
				Ok(true) => proto::RC_COMPARE_TRUE,
				Ok(false) => proto::RC_COMPARE_FALSE,
				Err(error) => {
					tracing::error!("Error proxying compare to directory: {:#}", error);
					proto::RC_COMPARE_FALSE
				}
			}
		} else {
			proto::RC_COMPARE_FALSE
		};

		proto::op_response(id, proto::APP_COMPARE_RESPONSE, result, "")
	}
}

/// Answer the extended operations clients actually send
fn extended_answer(id: i32, oid: &str) -> Result<Vec<u8>> {
	tracing::debug!("LDAP extended operation: OID={}", oid);

	match oid {
		// Who-Am-I: an empty authzId is all consumers need
		OID_WHO_AM_I => proto::extended_response(id, proto::RC_SUCCESS, "", Some(oid), Some(b"")),
		OID_START_TLS => proto::extended_response(
			id,
			proto::RC_UNWILLING_TO_PERFORM,
			"StartTLS not supported",
			None,
			None,
		),
		_ => proto::extended_response(id, proto::RC_SUCCESS, "", None, Some(b"")),
	}
}

/// Refusal message for a write operation
fn write_refusal(op_id: u64) -> &'static str {
	match op_id {
		6 => "Modify operations not supported by proxy",
		8 => "Add operations not supported by proxy",
		10 => "Delete operations not supported by proxy",
		_ => "Modify DN operations not supported by proxy",
	}
}

#[cfg(test)]
mod tests {
	#![allow(clippy::expect_used, clippy::unwrap_used)]

	use super::*;

	#[test]
	fn username_extraction_handles_all_forms() {
		assert_eq!(extract_username("CN=alice,OU=Users,DC=corp,DC=com"), "alice");
		assert_eq!(extract_username("uid=bob,ou=users,dc=corp,dc=com"), "bob");
		assert_eq!(extract_username("carol@corp.com"), "carol");
		assert_eq!(extract_username(r"CORP\dave"), "dave");
		assert_eq!(extract_username("just-a-name"), "just-a-name");
	}

	#[test]
	fn username_extraction_is_idempotent() {
		for dn in
			["CN=alice,OU=Users,DC=corp,DC=com", "carol@corp.com", r"CORP\dave", "plain", "cn=x"]
		{
			let once = extract_username(dn);
			assert_eq!(extract_username(once), once);
		}
	}

	#[test]
	fn upn_binds_with_an_equals_sign_stay_dns() {
		// A DN containing both = and @ is not UPN-shaped
		assert_eq!(extract_username("CN=a@b,DC=corp"), "a@b");
	}

	/// A policy with every rule populated
	fn policy() -> ExemptPolicy {
		ExemptPolicy {
			exempt_primary_bind: true,
			service_dn: Some("CN=svc-proxy,OU=Service,DC=corp,DC=local".to_owned()),
			exempt_ous: vec![
				"OU=Robots,DC=corp,DC=local".to_owned(),
				"backup@corp.local".to_owned(),
			],
		}
	}

	#[test]
	fn first_bind_is_exempt_exactly_once() {
		let policy = policy();

		assert!(policy.is_exempt("CN=anyone,DC=corp,DC=local", false).is_some());
		assert!(policy.is_exempt("CN=anyone,DC=corp,DC=local", true).is_none());
	}

	#[test]
	fn service_account_matches_case_insensitively() {
		let policy = policy();

		assert!(policy.is_exempt("cn=SVC-PROXY,ou=service,dc=corp,dc=local", true).is_some());
	}

	#[test]
	fn service_account_matches_by_upn_local_part() {
		let policy = ExemptPolicy {
			exempt_primary_bind: false,
			service_dn: Some("svc-proxy@corp.local".to_owned()),
			exempt_ous: vec![],
		};

		assert!(policy.is_exempt("svc-proxy@CORP.LOCAL", true).is_some());
		assert!(policy.is_exempt("other@corp.local", true).is_none());
	}

	#[test]
	fn exempt_ou_matches_descendants() {
		let policy = policy();

		assert!(policy.is_exempt("CN=r2d2,OU=Robots,DC=corp,DC=local", true).is_some());
		assert!(policy.is_exempt("OU=Robots,DC=corp,DC=local", true).is_some());
		assert!(policy.is_exempt("CN=alice,OU=Users,DC=corp,DC=local", true).is_none());
	}

	#[test]
	fn exempt_list_matches_upn_entries() {
		let policy = policy();

		assert!(policy.is_exempt("backup@CORP.local", true).is_some());
	}

	#[test]
	fn write_refusals_name_the_operation() {
		assert!(write_refusal(6).starts_with("Modify "));
		assert!(write_refusal(8).starts_with("Add"));
		assert!(write_refusal(10).starts_with("Delete"));
		assert!(write_refusal(12).starts_with("Modify DN"));
	}
}
