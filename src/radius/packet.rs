//! RFC 2865 packet codec: decoding, password hiding, response signing
use anyhow::{bail, Result};
use md5::{Digest, Md5};

/// Access-Request packet code
pub const ACCESS_REQUEST: u8 = 1;
/// Access-Accept packet code
pub const ACCESS_ACCEPT: u8 = 2;
/// Access-Reject packet code
pub const ACCESS_REJECT: u8 = 3;

/// User-Name attribute type
pub const USER_NAME: u8 = 1;
/// User-Password attribute type (hidden per RFC 2865 §5.2)
pub const USER_PASSWORD: u8 = 2;
/// NAS-IP-Address attribute type
pub const NAS_IP_ADDRESS: u8 = 4;
/// NAS-Port attribute type
pub const NAS_PORT: u8 = 5;
/// Service-Type attribute type
pub const SERVICE_TYPE: u8 = 6;
/// Reply-Message attribute type
pub const REPLY_MESSAGE: u8 = 18;
/// State attribute type
pub const STATE: u8 = 24;
/// Class attribute type
pub const CLASS: u8 = 25;
/// Session-Timeout attribute type
pub const SESSION_TIMEOUT: u8 = 27;
/// Calling-Station-Id attribute type
pub const CALLING_STATION_ID: u8 = 31;
/// NAS-Identifier attribute type
pub const NAS_IDENTIFIER: u8 = 32;

/// Fixed header size: code, identifier, length, authenticator
const HEADER_LEN: usize = 20;

/// A decoded RADIUS packet
#[derive(Debug, Clone)]
pub struct Packet {
	/// Packet code
	pub code: u8,
	/// Packet identifier, echoed in the reply
	pub identifier: u8,
	/// Request authenticator
	pub authenticator: [u8; 16],
	/// Attributes in wire order
	pub attributes: Vec<(u8, Vec<u8>)>,
}

impl Packet {
	/// Decode a packet from the wire
	pub fn decode(data: &[u8]) -> Result<Self> {
		if data.len() < HEADER_LEN {
			bail!("packet shorter than the RADIUS header");
		}

		let code = data[0];
		let identifier = data[1];
		let length = usize::from(u16::from_be_bytes([data[2], data[3]]));
		if length < HEADER_LEN || length > data.len() {
			bail!("packet length field {} out of bounds", length);
		}

		let mut authenticator = [0_u8; 16];
		authenticator.copy_from_slice(&data[4..20]);

		let mut attributes = Vec::new();
		let mut offset = HEADER_LEN;
		while offset < length {
			if length - offset < 2 {
				bail!("truncated attribute header");
			}
			let attr_type = data[offset];
			let attr_len = usize::from(data[offset + 1]);
			if attr_len < 2 || offset + attr_len > length {
				bail!("attribute length {} out of bounds", attr_len);
			}
			attributes.push((attr_type, data[offset + 2..offset + attr_len].to_vec()));
			offset += attr_len;
		}

		Ok(Self { code, identifier, authenticator, attributes })
	}

	/// First value of an attribute, if present
	pub fn attribute(&self, attr_type: u8) -> Option<&[u8]> {
		self.attributes
			.iter()
			.find(|(candidate, _)| *candidate == attr_type)
			.map(|(_, value)| value.as_slice())
	}

	/// First value of an attribute as UTF-8 text
	pub fn text_attribute(&self, attr_type: u8) -> Option<String> {
		self.attribute(attr_type).map(|value| String::from_utf8_lossy(value).into_owned())
	}

	/// Recover the User-Password attribute hidden with the shared secret
	pub fn user_password(&self, secret: &str) -> Result<String> {
		let Some(hidden) = self.attribute(USER_PASSWORD) else {
			bail!("packet carries no User-Password");
		};

		let revealed = reveal_password(secret, &self.authenticator, hidden)?;
		Ok(String::from_utf8_lossy(&revealed).into_owned())
	}

	/// Encode a reply to this packet with the standard response
	/// authenticator
	pub fn encode_reply(&self, code: u8, secret: &str, attributes: &[(u8, &[u8])]) -> Vec<u8> {
		let mut body = Vec::new();
		for (attr_type, value) in attributes {
			body.push(*attr_type);
			// attribute values never exceed 253 octets on this path
			body.push((value.len() + 2) as u8);
			body.extend_from_slice(value);
		}

		let length = (HEADER_LEN + body.len()) as u16;

		// ResponseAuth = MD5(Code+ID+Length+RequestAuth+Attributes+Secret)
		let mut hasher = Md5::new();
		hasher.update([code, self.identifier]);
		hasher.update(length.to_be_bytes());
		hasher.update(self.authenticator);
		hasher.update(&body);
		hasher.update(secret.as_bytes());
		let response_auth = hasher.finalize();

		let mut packet = Vec::with_capacity(usize::from(length));
		packet.push(code);
		packet.push(self.identifier);
		packet.extend_from_slice(&length.to_be_bytes());
		packet.extend_from_slice(&response_auth);
		packet.extend_from_slice(&body);
		packet
	}

	/// Encode an Access-Request carrying the given attributes, hiding
	/// the password with the shared secret
	pub fn encode_request(
		identifier: u8,
		authenticator: [u8; 16],
		secret: &str,
		username: &str,
		password: &str,
		extra: &[(u8, &[u8])],
	) -> Vec<u8> {
		let hidden = hide_password(secret, &authenticator, password.as_bytes());

		let mut body = Vec::new();
		for (attr_type, value) in std::iter::once(&(USER_NAME, username.as_bytes()))
			.chain(std::iter::once(&(USER_PASSWORD, hidden.as_slice())))
			.chain(extra)
		{
			body.push(*attr_type);
			body.push((value.len() + 2) as u8);
			body.extend_from_slice(value);
		}

		let length = (HEADER_LEN + body.len()) as u16;
		let mut packet = Vec::with_capacity(usize::from(length));
		packet.push(ACCESS_REQUEST);
		packet.push(identifier);
		packet.extend_from_slice(&length.to_be_bytes());
		packet.extend_from_slice(&authenticator);
		packet.extend_from_slice(&body);
		packet
	}
}

/// One step of the RFC 2865 §5.2 cipher: MD5(secret || chain block)
fn password_block_key(secret: &str, chain: &[u8]) -> [u8; 16] {
	let mut hasher = Md5::new();
	hasher.update(secret.as_bytes());
	hasher.update(chain);
	hasher.finalize().into()
}

/// Hide a password for transmission (RFC 2865 §5.2)
pub fn hide_password(secret: &str, authenticator: &[u8; 16], password: &[u8]) -> Vec<u8> {
	let mut padded = password.to_vec();
	let pad = match padded.len() % 16 {
		0 if !padded.is_empty() => 0,
		remainder => 16 - remainder,
	};
	padded.extend(std::iter::repeat(0).take(pad));

	let mut hidden = Vec::with_capacity(padded.len());
	let mut chain: Vec<u8> = authenticator.to_vec();
	for block in padded.chunks(16) {
		let key = password_block_key(secret, &chain);
		let cipher: Vec<u8> = block.iter().zip(key.iter()).map(|(p, k)| p ^ k).collect();
		chain = cipher.clone();
		hidden.extend_from_slice(&cipher);
	}

	hidden
}

/// Reveal a hidden password (RFC 2865 §5.2), stripping the NUL padding
pub fn reveal_password(secret: &str, authenticator: &[u8; 16], hidden: &[u8]) -> Result<Vec<u8>> {
	if hidden.is_empty() || hidden.len() % 16 != 0 || hidden.len() > 128 {
		bail!("hidden password length {} is invalid", hidden.len());
	}

	let mut revealed = Vec::with_capacity(hidden.len());
	let mut chain: &[u8] = authenticator;
	for block in hidden.chunks(16) {
		let key = password_block_key(secret, chain);
		revealed.extend(block.iter().zip(key.iter()).map(|(c, k)| c ^ k));
		chain = block;
	}

	while revealed.last() == Some(&0) {
		revealed.pop();
	}

	Ok(revealed)
}
