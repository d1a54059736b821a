//! HMAC-SHA256 request signing for the cloud 2FA API
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

/// The MAC the cloud API expects
type HmacSha256 = Hmac<Sha256>;

/// Authenticated header set for one API request
#[derive(Debug)]
pub(crate) struct AuthHeaders {
	/// Unix timestamp the signature covers
	pub timestamp: i64,
	/// Single-use random nonce, hex-encoded
	pub nonce: String,
	/// Lowercase-hex HMAC-SHA256 over `timestamp || nonce || body`
	pub signature: String,
}

/// Generate a fresh 128-bit nonce, hex-encoded
pub(crate) fn generate_nonce() -> String {
	let mut bytes = [0_u8; 16];
	rand::thread_rng().fill_bytes(&mut bytes);
	hex::encode(bytes)
}

/// Sign `timestamp || nonce || body` with the integration secret
pub(crate) fn sign(secret: &str, timestamp: i64, nonce: &str, body: &str) -> String {
	let data = format!("{timestamp}{nonce}{body}");

	// Hmac accepts keys of any length, so new_from_slice cannot fail
	#[allow(clippy::expect_used)]
	let mut mac =
		HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
	mac.update(data.as_bytes());

	hex::encode(mac.finalize().into_bytes())
}

/// Check a signature against the inputs it claims to cover
pub(crate) fn verify(
	secret: &str,
	timestamp: i64,
	nonce: &str,
	body: &str,
	signature: &str,
) -> bool {
	let data = format!("{timestamp}{nonce}{body}");

	#[allow(clippy::expect_used)]
	let mut mac =
		HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
	mac.update(data.as_bytes());

	let Ok(raw) = hex::decode(signature) else {
		return false;
	};

	mac.verify_slice(&raw).is_ok()
}

/// Produce the header values for a request with the given body.
///
/// The body must be the exact bytes that will be transmitted; bodyless
/// requests sign the literal `{}`.
pub(crate) fn auth_headers(secret: &str, body: &str) -> AuthHeaders {
	let timestamp = chrono::Utc::now().timestamp();
	let nonce = generate_nonce();
	let signature = sign(secret, timestamp, &nonce, body);

	AuthHeaders { timestamp, nonce, signature }
}
