#![allow(clippy::expect_used)]
//! End-to-end scenarios driving the proxy over real sockets against a
//! mock cloud API.

use std::time::Duration;

use auth_proxy::{
	radius::packet::{Packet, ACCESS_ACCEPT, ACCESS_REJECT, CALLING_STATION_ID, REPLY_MESSAGE},
	Config,
};
use indoc::indoc;
use ldap3::{
	exop::{Exop, WhoAmI},
	LdapConnAsync,
};
use serde_json::json;
use test_log::test;
use tokio::{net::UdpSocket, sync::watch, time::timeout};
use url::Url;
use wiremock::{
	matchers::{method, path},
	Mock, MockServer, ResponseTemplate,
};

/// A fixed request authenticator; the proxy only echoes it back through
/// the response authenticator
const AUTHENTICATOR: [u8; 16] = [7_u8; 16];

/// Shared secret every test config uses
const SECRET: &str = "e2e_shared_secret";

/// Parse a YAML config and point it at the mock cloud
fn config_with_endpoint(yaml: &str, server: &MockServer) -> Config {
	let mut config: Config = serde_yaml::from_str(yaml).expect("invalid config");
	config.api.endpoint = Url::parse(&server.uri()).expect("invalid mock URI");
	config
}

/// Start the proxy in the background; dropping the returned sender
/// shuts it down
async fn start_proxy(config: Config) -> watch::Sender<bool> {
	let (shutdown_tx, shutdown_rx) = watch::channel(false);
	tokio::spawn(async move {
		auth_proxy::run(config, shutdown_rx).await.expect("proxy failed");
	});
	tokio::time::sleep(Duration::from_millis(300)).await;
	shutdown_tx
}

/// Mount push send + status mocks yielding the given status
async fn mock_push(server: &MockServer, status: &str, expected_sends: u64) {
	Mock::given(method("POST"))
		.and(path("/v1/push/send"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({ "requestId": "r1" })))
		.expect(expected_sends)
		.mount(server)
		.await;
	Mock::given(method("GET"))
		.and(path("/v1/push/status/r1"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": status })))
		.mount(server)
		.await;
}

/// Send one Access-Request and wait for a reply
async fn radius_exchange(
	socket: &UdpSocket,
	port: u16,
	identifier: u8,
	username: &str,
	password: &str,
	wait: Duration,
) -> Option<Packet> {
	let data = Packet::encode_request(
		identifier,
		AUTHENTICATOR,
		SECRET,
		username,
		password,
		&[(CALLING_STATION_ID, b"198.51.100.7")],
	);
	socket.send_to(&data, ("127.0.0.1", port)).await.expect("send failed");

	let mut buf = [0_u8; 4096];
	match timeout(wait, socket.recv_from(&mut buf)).await {
		Ok(Ok((len, _))) => Some(Packet::decode(&buf[..len]).expect("undecodable reply")),
		_ => None,
	}
}

#[test(tokio::test)]
async fn radius_push_happy_path() {
	let server = MockServer::start().await;
	mock_push(&server, "approved", 1).await;

	let config = config_with_endpoint(
		indoc! {r"
			api:
			  endpoint: http://placeholder.invalid
			  integration_key: mock_integration_key
			  secret_key: mock_secret_key
			  push_timeout: 5
			radius_servers:
			  - port: 18121
			    mode: auto
			    clients:
			      - ip: 127.0.0.1
			        secret: e2e_shared_secret
		"},
		&server,
	);
	let _shutdown = start_proxy(config).await;

	let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind failed");
	let reply = radius_exchange(&socket, 18121, 1, "alice", "pw", Duration::from_secs(5))
		.await
		.expect("no reply");

	assert_eq!(reply.code, ACCESS_ACCEPT);
	assert_eq!(reply.identifier, 1);
	assert_eq!(
		reply.text_attribute(REPLY_MESSAGE).as_deref(),
		Some("Authentication successful")
	);
}

#[test(tokio::test)]
async fn radius_concat_otp() {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/v1/totp/verify"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({ "valid": true })))
		.expect(1)
		.mount(&server)
		.await;

	let config = config_with_endpoint(
		indoc! {r"
			api:
			  endpoint: http://placeholder.invalid
			  integration_key: mock_integration_key
			  secret_key: mock_secret_key
			  push_timeout: 5
			radius_servers:
			  - port: 18122
			    mode: concat
			    clients:
			      - ip: 127.0.0.1
			        secret: e2e_shared_secret
		"},
		&server,
	);
	let _shutdown = start_proxy(config).await;

	let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind failed");
	let reply = radius_exchange(&socket, 18122, 2, "bob", "pw,654321", Duration::from_secs(5))
		.await
		.expect("no reply");

	assert_eq!(reply.code, ACCESS_ACCEPT);
}

#[test(tokio::test)]
async fn radius_retransmits_are_suppressed_during_push() {
	let server = MockServer::start().await;
	// Stay pending for the first two polls so the retransmits land
	// while the push wait is still in flight
	Mock::given(method("POST"))
		.and(path("/v1/push/send"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({ "requestId": "r1" })))
		.expect(1)
		.mount(&server)
		.await;
	Mock::given(method("GET"))
		.and(path("/v1/push/status/r1"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "pending" })))
		.up_to_n_times(2)
		.mount(&server)
		.await;
	Mock::given(method("GET"))
		.and(path("/v1/push/status/r1"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "approved" })))
		.mount(&server)
		.await;

	let config = config_with_endpoint(
		indoc! {r"
			api:
			  endpoint: http://placeholder.invalid
			  integration_key: mock_integration_key
			  secret_key: mock_secret_key
			  push_timeout: 10
			radius_servers:
			  - port: 18123
			    mode: auto
			    clients:
			      - ip: 127.0.0.1
			        secret: e2e_shared_secret
		"},
		&server,
	);
	let _shutdown = start_proxy(config).await;

	let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind failed");
	let data = Packet::encode_request(3, AUTHENTICATOR, SECRET, "alice", "pw", &[]);
	for _ in 0..3 {
		socket.send_to(&data, ("127.0.0.1", 18123_u16)).await.expect("send failed");
		tokio::time::sleep(Duration::from_millis(50)).await;
	}

	let mut buf = [0_u8; 4096];
	let (len, _) = timeout(Duration::from_secs(10), socket.recv_from(&mut buf))
		.await
		.expect("no reply before timeout")
		.expect("socket error");
	let reply = Packet::decode(&buf[..len]).expect("undecodable reply");
	assert_eq!(reply.code, ACCESS_ACCEPT);

	// The two duplicates must not have produced further replies
	assert!(timeout(Duration::from_millis(500), socket.recv_from(&mut buf)).await.is_err());
}

#[test(tokio::test)]
async fn radius_unknown_client_is_ignored() {
	let server = MockServer::start().await;

	let config = config_with_endpoint(
		indoc! {r"
			api:
			  endpoint: http://placeholder.invalid
			  integration_key: mock_integration_key
			  secret_key: mock_secret_key
			radius_servers:
			  - port: 18124
			    mode: auto
			    clients:
			      - ip: 203.0.113.9
			        secret: e2e_shared_secret
		"},
		&server,
	);
	let _shutdown = start_proxy(config).await;

	let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind failed");
	let reply =
		radius_exchange(&socket, 18124, 4, "alice", "pw", Duration::from_millis(700)).await;

	assert!(reply.is_none());
}

#[test(tokio::test)]
async fn radius_push_denied_is_rejected() {
	let server = MockServer::start().await;
	mock_push(&server, "denied", 1).await;

	let config = config_with_endpoint(
		indoc! {r"
			api:
			  endpoint: http://placeholder.invalid
			  integration_key: mock_integration_key
			  secret_key: mock_secret_key
			  push_timeout: 5
			radius_servers:
			  - port: 18125
			    mode: auto
			    clients:
			      - ip: 127.0.0.1
			        secret: e2e_shared_secret
		"},
		&server,
	);
	let _shutdown = start_proxy(config).await;

	let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind failed");
	let reply = radius_exchange(&socket, 18125, 5, "mallory", "pw", Duration::from_secs(5))
		.await
		.expect("no reply");

	assert_eq!(reply.code, ACCESS_REJECT);
	let message = reply.text_attribute(REPLY_MESSAGE).expect("no reply message");
	assert!(message.contains("push_denied"), "unexpected message: {message}");
}

#[test(tokio::test)]
async fn ldap_exempt_first_bind_then_2fa() {
	let server = MockServer::start().await;
	// Only the second bind may reach the cloud
	mock_push(&server, "approved", 1).await;

	let config = config_with_endpoint(
		indoc! {r"
			api:
			  endpoint: http://placeholder.invalid
			  integration_key: mock_integration_key
			  secret_key: mock_secret_key
			  push_timeout: 5
			ldap_servers:
			  - port: 10391
			    exempt_primary_bind: true
		"},
		&server,
	);
	let _shutdown = start_proxy(config).await;

	let (conn, mut ldap) =
		LdapConnAsync::new("ldap://127.0.0.1:10391").await.expect("connect failed");
	ldap3::drive!(conn);

	// First bind: service-account probe, no cloud call
	ldap.simple_bind("svc@corp.local", "service-pw")
		.await
		.expect("bind failed")
		.success()
		.expect("exempt bind rejected");

	// Second bind on the same connection traverses the 2FA path
	ldap.simple_bind("alice@corp.local", "pw")
		.await
		.expect("bind failed")
		.success()
		.expect("2FA bind rejected");

	ldap.unbind().await.expect("unbind failed");
}

#[test(tokio::test)]
async fn ldap_anonymous_bind_succeeds() {
	let server = MockServer::start().await;

	let config = config_with_endpoint(
		indoc! {r"
			api:
			  endpoint: http://placeholder.invalid
			  integration_key: mock_integration_key
			  secret_key: mock_secret_key
			ldap_servers:
			  - port: 10392
		"},
		&server,
	);
	let _shutdown = start_proxy(config).await;

	let (conn, mut ldap) =
		LdapConnAsync::new("ldap://127.0.0.1:10392").await.expect("connect failed");
	ldap3::drive!(conn);

	ldap.simple_bind("", "")
		.await
		.expect("bind failed")
		.success()
		.expect("anonymous bind rejected");

	ldap.unbind().await.expect("unbind failed");
}

#[test(tokio::test)]
async fn ldap_extended_and_write_operations() {
	let server = MockServer::start().await;

	let config = config_with_endpoint(
		indoc! {r"
			api:
			  endpoint: http://placeholder.invalid
			  integration_key: mock_integration_key
			  secret_key: mock_secret_key
			ldap_servers:
			  - port: 10393
		"},
		&server,
	);
	let _shutdown = start_proxy(config).await;

	let (conn, mut ldap) =
		LdapConnAsync::new("ldap://127.0.0.1:10393").await.expect("connect failed");
	ldap3::drive!(conn);

	// Who-Am-I answers success with an empty authzId
	ldap.extended(WhoAmI).await.expect("whoami failed").success().expect("whoami rejected");

	// Unknown extended operations succeed with an empty payload
	ldap.extended(Exop { name: Some("1.3.6.1.4.1.99999.1".to_owned()), val: None })
		.await
		.expect("extended failed")
		.success()
		.expect("unknown exop rejected");

	// Writes are refused with unwillingToPerform
	let result = ldap.delete("CN=thing,DC=corp,DC=local").await.expect("delete failed");
	assert_eq!(result.rc, 53);
	assert!(result.text.contains("not supported by proxy"));

	ldap.unbind().await.expect("unbind failed");
}
