//! RADIUS front end: UDP listener with duplicate suppression
pub mod packet;

use std::{
	collections::HashMap,
	net::{IpAddr, Ipv4Addr, SocketAddr},
	sync::Arc,
	time::Instant,
};

use anyhow::{Context, Result};
use tokio::{
	net::UdpSocket,
	sync::{watch, Mutex},
};

use crate::{
	config::{AuthMode, RadiusServerConfig},
	engine::{AuthEngine, AuthResult},
	radius::packet::Packet,
};

/// Pending entries older than this are evicted to bound memory
const PENDING_TTL: std::time::Duration = std::time::Duration::from_secs(120);

/// Key identifying one in-flight authentication for duplicate detection
type PendingKey = (IpAddr, u16, u8);

/// State shared between the listener loop and per-packet tasks
#[derive(Debug)]
struct Inner {
	/// The authentication orchestrator for this binding
	engine: AuthEngine,
	/// Second-factor mode for this binding
	mode: AuthMode,
	/// Shared secrets keyed by client source IP
	clients: HashMap<IpAddr, String>,
	/// In-flight requests, for retransmit suppression
	pending: Mutex<HashMap<PendingKey, Instant>>,
}

/// A RADIUS authentication server for one binding
#[derive(Debug)]
pub(crate) struct RadiusServer {
	/// The bound UDP socket
	socket: Arc<UdpSocket>,
	/// Shared handler state
	inner: Arc<Inner>,
}

impl RadiusServer {
	/// Bind the UDP socket for a RADIUS binding
	pub(crate) async fn bind(config: &RadiusServerConfig, engine: AuthEngine) -> Result<Self> {
		let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, config.port))
			.await
			.with_context(|| format!("failed to bind RADIUS port {}", config.port))?;

		let clients: HashMap<IpAddr, String> = config
			.clients
			.iter()
			.map(|client| (client.ip, client.secret.clone()))
			.collect();
		for ip in clients.keys() {
			tracing::info!("RADIUS client configured: {}", ip);
		}

		Ok(Self {
			socket: Arc::new(socket),
			inner: Arc::new(Inner {
				engine,
				mode: config.mode,
				clients,
				pending: Mutex::new(HashMap::new()),
			}),
		})
	}

	/// The address the server actually bound
	pub(crate) fn local_addr(&self) -> Result<SocketAddr> {
		self.socket.local_addr().context("no local address")
	}

	/// Receive datagrams until shutdown, dispatching each one
	/// concurrently so a slow push never delays unrelated requests.
	pub(crate) async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
		tracing::info!("RADIUS server listening on {}", self.local_addr()?);

		let mut buf = [0_u8; 4096];
		loop {
			tokio::select! {
				received = self.socket.recv_from(&mut buf) => {
					// ICMP unreachable from a gone client surfaces here;
					// the listener must outlive it
					let (len, source) = match received {
						Ok(received) => received,
						Err(error) => {
							tracing::error!("Error in receive loop: {}", error);
							continue;
						}
					};
					let data = buf[..len].to_vec();
					let inner = Arc::clone(&self.inner);
					let socket = Arc::clone(&self.socket);
					let mut handler_shutdown = shutdown.clone();
					tokio::spawn(async move {
						tokio::select! {
							() = inner.handle_datagram(socket, data, source) => {}
							_ = handler_shutdown.changed() => {
								tracing::debug!("Dropping in-flight request from {} on shutdown", source);
							}
						}
					});
				}
				_ = shutdown.changed() => {
					tracing::info!("Stopping RADIUS server");
					return Ok(());
				}
			}
		}
	}
}

impl Inner {
	/// Process one datagram and send the reply, if any
	async fn handle_datagram(&self, socket: Arc<UdpSocket>, data: Vec<u8>, source: SocketAddr) {
		let Some(secret) = self.clients.get(&source.ip()) else {
			tracing::warn!("Unknown RADIUS client: {}", source.ip());
			return;
		};

		let request = match Packet::decode(&data) {
			Ok(request) => request,
			Err(error) => {
				tracing::warn!("Failed to parse RADIUS packet from {}: {:#}", source, error);
				return;
			}
		};

		if request.code != packet::ACCESS_REQUEST {
			tracing::warn!("Unsupported RADIUS packet code: {}", request.code);
			return;
		}

		let key: PendingKey = (source.ip(), source.port(), request.identifier);
		if !self.mark_pending(key).await {
			tracing::debug!("Ignoring duplicate request from {}", source);
			return;
		}

		let reply = self.authenticate(&request, secret, source).await;
		self.pending.lock().await.remove(&key);

		if let Some(reply) = reply {
			if let Err(error) = socket.send_to(&reply, source).await {
				tracing::error!("Failed to send reply to {}: {}", source, error);
			}
		}
	}

	/// Insert the dedup key, sweeping stale entries; false if already
	/// in flight
	async fn mark_pending(&self, key: PendingKey) -> bool {
		let now = Instant::now();
		let mut pending = self.pending.lock().await;
		pending.retain(|_, inserted| now.duration_since(*inserted) < PENDING_TTL);

		if pending.contains_key(&key) {
			return false;
		}
		pending.insert(key, now);
		true
	}

	/// Run the engine for a decoded Access-Request and encode the
	/// verdict. `None` suppresses the reply; the client will retransmit.
	async fn authenticate(
		&self,
		request: &Packet,
		secret: &str,
		source: SocketAddr,
	) -> Option<Vec<u8>> {
		let username = request.text_attribute(packet::USER_NAME).unwrap_or_default();
		let password = match request.user_password(secret) {
			Ok(password) => password,
			Err(error) => {
				tracing::warn!("Undecodable password from {}: {:#}", source, error);
				return None;
			}
		};

		let nas = nas_identity(request).unwrap_or_else(|| source.ip().to_string());
		tracing::info!("Access-Request from {}: user={}, nas={}", source.ip(), username, nas);

		let ip_address = request
			.text_attribute(packet::CALLING_STATION_ID)
			.unwrap_or_else(|| source.ip().to_string());

		let (result, message) = self
			.engine
			.authenticate(&username, &password, &format!("NAS: {nas}"), &ip_address, self.mode)
			.await;

		if result == AuthResult::Success {
			tracing::info!("Access-Accept for user: {}", username);
			Some(request.encode_reply(
				packet::ACCESS_ACCEPT,
				secret,
				&[(packet::REPLY_MESSAGE, b"Authentication successful")],
			))
		} else {
			tracing::warn!("Access-Reject for user: {} - {}", username, message);
			Some(request.encode_reply(
				packet::ACCESS_REJECT,
				secret,
				&[(packet::REPLY_MESSAGE, message.as_bytes())],
			))
		}
	}
}

/// Best identity for the NAS: its IP-address attribute, falling back
/// to NAS-Identifier
fn nas_identity(request: &Packet) -> Option<String> {
	if let Some(value) = request.attribute(packet::NAS_IP_ADDRESS) {
		if let [a, b, c, d] = value {
			return Some(Ipv4Addr::new(*a, *b, *c, *d).to_string());
		}
	}

	request.text_attribute(packet::NAS_IDENTIFIER)
}

#[cfg(test)]
mod tests {
	#![allow(clippy::expect_used, clippy::unwrap_used)]

	use super::*;

	#[test]
	fn nas_identity_prefers_the_ip_attribute() {
		let data = Packet::encode_request(
			1,
			[0; 16],
			"s",
			"alice",
			"pw",
			&[
				(packet::NAS_IP_ADDRESS, &[192, 0, 2, 7]),
				(packet::NAS_IDENTIFIER, b"vpn-concentrator"),
			],
		);
		let request = Packet::decode(&data).unwrap();

		assert_eq!(nas_identity(&request).as_deref(), Some("192.0.2.7"));
	}

	#[test]
	fn nas_identity_falls_back_to_identifier() {
		let data = Packet::encode_request(
			1,
			[0; 16],
			"s",
			"alice",
			"pw",
			&[(packet::NAS_IDENTIFIER, b"vpn-concentrator")],
		);
		let request = Packet::decode(&data).unwrap();

		assert_eq!(nas_identity(&request).as_deref(), Some("vpn-concentrator"));
	}
}
