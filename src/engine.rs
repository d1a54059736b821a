//! Authentication engine combining primary auth with the cloud second factor
use std::time::Duration;

use anyhow::Result;

use crate::{
	api::{ApiClient, PushStatus, DEFAULT_POLL_INTERVAL},
	config::{ApiConfig, AuthMode, DirectoryConfig},
	directory::{BindOutcome, DirectoryClient},
};

/// Authentication verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AuthResult {
	/// Primary auth and the second factor both passed
	Success,
	/// The directory rejected the password
	PrimaryFailed,
	/// The push could not be issued
	PushFailed,
	/// The user denied the push
	PushDenied,
	/// The push was not approved before the deadline
	PushTimeout,
	/// The OTP code did not verify
	OtpInvalid,
	/// The user does not exist in the directory
	UserNotFound,
	/// Anything else went wrong
	Error,
}

impl AuthResult {
	/// Short tag used in 2FA failure messages
	fn tag(self) -> &'static str {
		match self {
			Self::Success => "success",
			Self::PrimaryFailed => "primary_failed",
			Self::PushFailed => "push_failed",
			Self::PushDenied => "push_denied",
			Self::PushTimeout => "push_timeout",
			Self::OtpInvalid => "otp_invalid",
			Self::UserNotFound => "user_not_found",
			Self::Error => "error",
		}
	}
}

/// Split a password on its last comma into `(password, factor)`.
///
/// An empty factor (trailing comma) counts as no factor at all.
fn parse_password(password: &str) -> (&str, Option<&str>) {
	match password.rsplit_once(',') {
		Some((real, factor)) if !factor.is_empty() => (real, Some(factor)),
		Some((real, _)) => (real, None),
		None => (password, None),
	}
}

/// Whether a factor string looks like an OTP code
fn is_otp_code(factor: &str) -> bool {
	factor.len() >= 6 && factor.chars().all(|c| c.is_ascii_digit())
}

/// Protocol-agnostic authentication orchestrator.
///
/// One engine exists per front-end binding; it owns the cloud client
/// (and its HTTP pool) and an optional directory client.
#[derive(Debug, Clone)]
pub(crate) struct AuthEngine {
	/// Primary auth backend; pass-through when absent
	directory: Option<DirectoryClient>,
	/// Cloud 2FA client
	api: ApiClient,
	/// Deadline for push approval
	push_timeout: Duration,
	/// Service name shown in push prompts
	service_name: String,
	/// Accept on cloud infrastructure faults after primary auth passed
	fail_open: bool,
}

impl AuthEngine {
	/// Build an engine from the cloud credentials and an optional
	/// directory profile
	pub(crate) fn new(
		directory: Option<DirectoryConfig>,
		api_config: &ApiConfig,
		service_name: &str,
		fail_open: bool,
	) -> Result<Self> {
		Ok(Self {
			directory: directory.map(DirectoryClient::new),
			api: ApiClient::new(api_config)?,
			push_timeout: Duration::from_secs(api_config.push_timeout),
			service_name: service_name.to_owned(),
			fail_open,
		})
	}

	/// Verify the password against the directory.
	///
	/// Without a directory profile the proxy runs pass-through: the
	/// system behind it enforces primary auth itself.
	async fn authenticate_primary(&self, username: &str, password: &str) -> (BindOutcome, String) {
		match &self.directory {
			Some(directory) => directory.authenticate(username, password).await,
			None => {
				tracing::debug!("No primary auth configured, skipping");
				(BindOutcome::Ok, "Pass-through".to_owned())
			}
		}
	}

	/// Run the push flow to a terminal verdict
	async fn authenticate_push(
		&self,
		username: &str,
		device_info: &str,
		ip_address: &str,
	) -> AuthResult {
		let request_id =
			match self.api.send_push(username, &self.service_name, device_info, ip_address).await {
				Ok(request_id) => request_id,
				Err(error) => {
					tracing::warn!("Failed to send push to user {}: {:#}", username, error);
					if self.fail_open {
						tracing::warn!(
							"Fail-open: accepting user {} without second factor",
							username
						);
						return AuthResult::Success;
					}
					return AuthResult::PushFailed;
				}
			};

		match self.api.await_push(&request_id, self.push_timeout, DEFAULT_POLL_INTERVAL).await {
			PushStatus::Approved => AuthResult::Success,
			PushStatus::Denied => AuthResult::PushDenied,
			_ => AuthResult::PushTimeout,
		}
	}

	/// Verify an OTP code
	async fn authenticate_otp(&self, username: &str, code: &str) -> AuthResult {
		if self.api.verify_totp(username, code).await {
			AuthResult::Success
		} else {
			AuthResult::OtpInvalid
		}
	}

	/// Complete authentication flow: parse the password, verify it
	/// against the directory, then dispatch the second factor.
	///
	/// No second-factor call is made before primary auth has succeeded.
	pub(crate) async fn authenticate(
		&self,
		username: &str,
		password: &str,
		device_info: &str,
		ip_address: &str,
		mode: AuthMode,
	) -> (AuthResult, String) {
		tracing::info!("Starting authentication for user: {} (mode: {:?})", username, mode);

		let (real_password, factor) = parse_password(password);

		let (primary, primary_message) = self.authenticate_primary(username, real_password).await;
		match primary {
			BindOutcome::Ok => {}
			BindOutcome::UserNotFound => {
				tracing::warn!("Primary auth failed for {}: {}", username, primary_message);
				return (AuthResult::UserNotFound, primary_message);
			}
			BindOutcome::Error => {
				tracing::warn!("Primary auth failed for {}: {}", username, primary_message);
				return (AuthResult::Error, primary_message);
			}
			_ => {
				tracing::warn!("Primary auth failed for {}: {}", username, primary_message);
				return (AuthResult::PrimaryFailed, primary_message);
			}
		}

		tracing::debug!("Primary auth successful for {}", username);

		let result = match factor {
			Some(factor) if factor.eq_ignore_ascii_case("push") => {
				self.authenticate_push(username, device_info, ip_address).await
			}
			Some(factor) if is_otp_code(factor) => self.authenticate_otp(username, factor).await,
			Some(factor) => {
				tracing::warn!("Unknown factor for {}", username);
				return (AuthResult::Error, format!("Unknown factor: {factor}"));
			}
			None => match mode {
				AuthMode::Auto | AuthMode::Push => {
					self.authenticate_push(username, device_info, ip_address).await
				}
				AuthMode::Otp => {
					return (AuthResult::Error, "OTP code required".to_owned());
				}
				AuthMode::Concat | AuthMode::Challenge => {
					return (AuthResult::Error, "Unknown factor: none".to_owned());
				}
			},
		};

		if result == AuthResult::Success {
			tracing::info!("Authentication successful for user: {}", username);
			(result, "Authentication successful".to_owned())
		} else {
			tracing::warn!("2FA failed for {}: {}", username, result.tag());
			(result, format!("2FA failed: {}", result.tag()))
		}
	}
}
