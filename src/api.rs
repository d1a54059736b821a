//! Client for the cloud 2FA API (push and TOTP verification)
use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::{Client, Method};
use serde_json::{json, Value};

use crate::{config::ApiConfig, signing};

/// How often `await_push` polls the push status by default
pub(crate) const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Outcome of a single push status poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PushStatus {
	/// The user has not reacted yet
	Pending,
	/// The user approved the request
	Approved,
	/// The user denied the request
	Denied,
	/// The request expired on the cloud side
	Expired,
	/// The status could not be determined
	Error,
}

impl PushStatus {
	/// Map the API's `status` field, case-insensitively
	fn from_api(status: &str) -> Self {
		match status.to_lowercase().as_str() {
			"pending" => Self::Pending,
			"approved" => Self::Approved,
			"denied" => Self::Denied,
			"expired" => Self::Expired,
			_ => Self::Error,
		}
	}
}

/// Signed HTTP client for the cloud 2FA service
#[derive(Debug, Clone)]
pub(crate) struct ApiClient {
	/// API base URL without a trailing slash
	endpoint: String,
	/// Integration key identifying this proxy
	integration_key: String,
	/// Secret key requests are signed with
	secret_key: String,
	/// Pooled HTTP client
	client: Client,
}

impl ApiClient {
	/// Construct a client from the cloud credentials record
	pub(crate) fn new(config: &ApiConfig) -> Result<Self> {
		let client = Client::builder()
			.timeout(Duration::from_secs(config.push_timeout))
			.build()
			.context("failed to build HTTP client")?;

		Ok(Self {
			endpoint: config.endpoint.as_str().trim_end_matches('/').to_owned(),
			integration_key: config.integration_key.clone(),
			secret_key: config.secret_key.clone(),
			client,
		})
	}

	/// Make a signed request and return the parsed response body.
	///
	/// Every request is signed afresh over the exact bytes transmitted;
	/// bodyless requests sign the literal `{}`.
	async fn request(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value> {
		let url = format!("{}{}", self.endpoint, path);
		let body = match body {
			Some(body) => serde_json::to_string(&body).context("failed to encode request body")?,
			None => "{}".to_owned(),
		};
		let headers = signing::auth_headers(&self.secret_key, &body);

		let response = self
			.client
			.request(method.clone(), &url)
			.header("Content-Type", "application/json")
			.header("X-Integration-Key", &self.integration_key)
			.header("X-Signature", &headers.signature)
			.header("X-Timestamp", headers.timestamp.to_string())
			.header("X-Nonce", &headers.nonce)
			.body(body)
			.send()
			.await
			.with_context(|| format!("request failed: {method} {path}"))?;

		let status = response.status();
		let data: Value = response.json().await.unwrap_or(Value::Null);

		if status.as_u16() >= 300 {
			let diagnostic = data
				.get("error")
				.or_else(|| data.get("message"))
				.and_then(Value::as_str)
				.unwrap_or("no diagnostic");
			bail!("API returned {status}: {diagnostic}");
		}

		Ok(data)
	}

	/// Verify a TOTP code for a user
	pub(crate) async fn verify_totp(&self, username: &str, code: &str) -> bool {
		tracing::debug!("Verifying OTP for user: {}", username);

		let body = json!({ "externalUserId": username, "code": code });
		match self.request(Method::POST, "/v1/totp/verify", Some(body)).await {
			Ok(data) if data.get("valid").and_then(Value::as_bool) == Some(true) => {
				tracing::info!("OTP verified for user: {}", username);
				true
			}
			Ok(_) => {
				tracing::warn!("OTP verification failed for user: {}", username);
				false
			}
			Err(error) => {
				tracing::warn!("OTP verification error for user {}: {:#}", username, error);
				false
			}
		}
	}

	/// Send a push notification; returns the request ID to poll
	pub(crate) async fn send_push(
		&self,
		username: &str,
		service_name: &str,
		device_info: &str,
		ip_address: &str,
	) -> Result<String> {
		tracing::debug!("Sending push to user: {}", username);

		let body = json!({
			"externalUserId": username,
			"serviceName": service_name,
			"deviceInfo": device_info,
			"ipAddress": ip_address,
		});
		let data = self.request(Method::POST, "/v1/push/send", Some(body)).await?;

		let Some(request_id) = data.get("requestId").and_then(Value::as_str) else {
			bail!("push response carried no requestId");
		};

		tracing::info!("Push sent to user {}, requestId: {}", username, request_id);
		Ok(request_id.to_owned())
	}

	/// Poll the status of an outstanding push
	pub(crate) async fn poll_status(&self, request_id: &str) -> PushStatus {
		let path = format!("/v1/push/status/{request_id}");
		match self.request(Method::GET, &path, None).await {
			Ok(data) => {
				let status = data.get("status").and_then(Value::as_str).unwrap_or("");
				PushStatus::from_api(status)
			}
			Err(error) => {
				tracing::warn!("Error checking push {}: {:#}", request_id, error);
				PushStatus::Error
			}
		}
	}

	/// Poll an outstanding push until it reaches a terminal status.
	///
	/// Transient `Error` polls keep the loop going; hitting the deadline
	/// yields `Expired`.
	pub(crate) async fn await_push(
		&self,
		request_id: &str,
		timeout: Duration,
		poll_interval: Duration,
	) -> PushStatus {
		let deadline = tokio::time::Instant::now() + timeout;

		tracing::debug!("Waiting for push {} (timeout: {:?})", request_id, timeout);

		while tokio::time::Instant::now() < deadline {
			match self.poll_status(request_id).await {
				PushStatus::Approved => {
					tracing::info!("Push {} approved", request_id);
					return PushStatus::Approved;
				}
				status @ (PushStatus::Denied | PushStatus::Expired) => {
					tracing::info!("Push {} {:?}", request_id, status);
					return status;
				}
				PushStatus::Pending | PushStatus::Error => {}
			}

			tokio::time::sleep(poll_interval).await;
		}

		tracing::warn!("Push {} timed out after {:?}", request_id, timeout);
		PushStatus::Expired
	}
}

#[cfg(test)]
mod tests {
	#![allow(clippy::expect_used, clippy::unwrap_used)]

	use wiremock::{
		matchers::{body_string_contains, header, method, path},
		Mock, MockServer, ResponseTemplate,
	};

	use super::*;

	/// Build a client pointed at the mock server
	fn api_client(server: &MockServer) -> ApiClient {
		let config = ApiConfig {
			endpoint: url::Url::parse(&server.uri()).expect("invalid mock URI"),
			integration_key: "mock_integration_key".to_owned(),
			secret_key: "mock_secret_key".to_owned(),
			push_timeout: 5,
		};
		ApiClient::new(&config).expect("failed to build client")
	}

	#[tokio::test]
	async fn verify_totp_accepts_valid_code() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/v1/totp/verify"))
			.and(header("X-Integration-Key", "mock_integration_key"))
			.and(header("Content-Type", "application/json"))
			.and(body_string_contains(r#""externalUserId":"alice""#))
			.and(body_string_contains(r#""code":"654321""#))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({ "valid": true })))
			.mount(&server)
			.await;

		assert!(api_client(&server).verify_totp("alice", "654321").await);
	}

	#[tokio::test]
	async fn verify_totp_rejects_invalid_code() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/v1/totp/verify"))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({ "valid": false })))
			.mount(&server)
			.await;

		assert!(!api_client(&server).verify_totp("alice", "000000").await);
	}

	#[tokio::test]
	async fn send_push_returns_request_id() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/v1/push/send"))
			.and(body_string_contains(r#""serviceName":"VPN Authentication""#))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({ "requestId": "r1" })))
			.mount(&server)
			.await;

		let request_id = api_client(&server)
			.send_push("alice", "VPN Authentication", "NAS: 10.0.0.1", "10.1.2.3")
			.await
			.expect("send_push failed");
		assert_eq!(request_id, "r1");
	}

	#[tokio::test]
	async fn send_push_fails_on_server_error() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/v1/push/send"))
			.respond_with(
				ResponseTemplate::new(503).set_body_json(json!({ "error": "maintenance" })),
			)
			.mount(&server)
			.await;

		let result = api_client(&server).send_push("alice", "svc", "", "").await;
		assert!(result.is_err());
		assert!(result.unwrap_err().to_string().contains("maintenance"));
	}

	#[tokio::test]
	async fn send_push_fails_without_request_id() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/v1/push/send"))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({ "queued": true })))
			.mount(&server)
			.await;

		assert!(api_client(&server).send_push("alice", "svc", "", "").await.is_err());
	}

	#[tokio::test]
	async fn poll_status_maps_statuses_case_insensitively() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/v1/push/status/r1"))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "Approved" })))
			.mount(&server)
			.await;
		Mock::given(method("GET"))
			.and(path("/v1/push/status/r2"))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "nonsense" })))
			.mount(&server)
			.await;
		Mock::given(method("GET"))
			.and(path("/v1/push/status/r3"))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
			.mount(&server)
			.await;

		let client = api_client(&server);
		assert_eq!(client.poll_status("r1").await, PushStatus::Approved);
		assert_eq!(client.poll_status("r2").await, PushStatus::Error);
		assert_eq!(client.poll_status("r3").await, PushStatus::Error);
	}

	#[tokio::test]
	async fn await_push_retries_through_transient_errors() {
		let server = MockServer::start().await;
		// First poll fails, second reports pending, third approves
		Mock::given(method("GET"))
			.and(path("/v1/push/status/r1"))
			.respond_with(ResponseTemplate::new(500))
			.up_to_n_times(1)
			.mount(&server)
			.await;
		Mock::given(method("GET"))
			.and(path("/v1/push/status/r1"))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "pending" })))
			.up_to_n_times(1)
			.mount(&server)
			.await;
		Mock::given(method("GET"))
			.and(path("/v1/push/status/r1"))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "approved" })))
			.mount(&server)
			.await;

		let status = api_client(&server)
			.await_push("r1", Duration::from_secs(5), Duration::from_millis(10))
			.await;
		assert_eq!(status, PushStatus::Approved);
	}

	#[tokio::test]
	async fn await_push_returns_denied_verdict() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/v1/push/status/r1"))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "denied" })))
			.mount(&server)
			.await;

		let status = api_client(&server)
			.await_push("r1", Duration::from_secs(5), Duration::from_millis(10))
			.await;
		assert_eq!(status, PushStatus::Denied);
	}

	#[tokio::test]
	async fn await_push_expires_at_the_deadline() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/v1/push/status/r1"))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "pending" })))
			.mount(&server)
			.await;

		let status = api_client(&server)
			.await_push("r1", Duration::from_millis(50), Duration::from_millis(10))
			.await;
		assert_eq!(status, PushStatus::Expired);
	}
}
