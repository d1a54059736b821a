//! BER message model for the LDAP front end: request parsing, response
//! encoding, and RFC 4515 filter serialization
use anyhow::{bail, Context, Result};
use bytes::BytesMut;
use lber::{
	common::TagClass,
	parse::parse_tag,
	structure::StructureTag,
	structures::{ASNTag, Enumerated, Integer, OctetString, Sequence, Set, Tag},
	universal::Types,
	write,
};
use ldap3::ldap_escape;

/// resultCode: success
pub(crate) const RC_SUCCESS: u32 = 0;
/// resultCode: operationsError
pub(crate) const RC_OPERATIONS_ERROR: u32 = 1;
/// resultCode: compareFalse
pub(crate) const RC_COMPARE_FALSE: u32 = 5;
/// resultCode: compareTrue
pub(crate) const RC_COMPARE_TRUE: u32 = 6;
/// resultCode: authMethodNotSupported
pub(crate) const RC_AUTH_METHOD_NOT_SUPPORTED: u32 = 7;
/// resultCode: invalidCredentials
pub(crate) const RC_INVALID_CREDENTIALS: u32 = 49;
/// resultCode: unwillingToPerform
pub(crate) const RC_UNWILLING_TO_PERFORM: u32 = 53;

/// BindResponse application tag
pub(crate) const APP_BIND_RESPONSE: u64 = 1;
/// SearchResultEntry application tag
pub(crate) const APP_SEARCH_ENTRY: u64 = 4;
/// SearchResultDone application tag
pub(crate) const APP_SEARCH_DONE: u64 = 5;
/// CompareResponse application tag
pub(crate) const APP_COMPARE_RESPONSE: u64 = 15;
/// ExtendedResponse application tag
pub(crate) const APP_EXTENDED_RESPONSE: u64 = 24;

/// Upper bound on one inbound PDU; protects the connection buffer
const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// One decoded LDAP PDU
#[derive(Debug)]
pub(crate) struct LdapMessage {
	/// The message ID replies must echo
	pub id: i32,
	/// The decoded operation
	pub op: Request,
}

/// How a bind request authenticates
#[derive(Debug)]
pub(crate) enum BindAuth {
	/// Simple bind with a password
	Simple(String),
	/// SASL or another unsupported method
	Other,
}

/// A client operation the front end knows how to answer
#[derive(Debug)]
pub(crate) enum Request {
	/// BindRequest
	Bind {
		/// The DN the client binds as
		dn: String,
		/// The authentication choice
		auth: BindAuth,
	},
	/// UnbindRequest; ends the connection
	Unbind,
	/// SearchRequest
	Search {
		/// Search base DN
		base: String,
		/// Numeric scope: 0 base, 1 single level, 2 subtree
		scope: u64,
		/// The typed search filter
		filter: Filter,
	},
	/// CompareRequest
	Compare {
		/// Entry DN
		dn: String,
		/// Attribute description
		attr: String,
		/// Assertion value
		value: Vec<u8>,
	},
	/// ExtendedRequest
	Extended {
		/// The request OID
		oid: String,
	},
	/// AbandonRequest; never answered
	Abandon,
	/// MODIFY / ADD / DELETE / MODIFYDN, all refused
	Write {
		/// The request's application tag
		op_id: u64,
	},
	/// Anything else
	Unknown(u64),
}

/// A typed search filter, mirroring the RFC 4511 choice
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Filter {
	/// `(&(..)(..))`
	And(Vec<Filter>),
	/// `(|(..)(..))`
	Or(Vec<Filter>),
	/// `(!(..))`
	Not(Box<Filter>),
	/// `(attr=*)`
	Present(String),
	/// `(attr=value)`
	Equality(String, String),
	/// `(attr=initial*any*final)`
	Substrings {
		/// Attribute description
		attr: String,
		/// Chunk the value must start with
		initial: Option<String>,
		/// Chunks the value must contain, in order
		any: Vec<String>,
		/// Chunk the value must end with
		last: Option<String>,
	},
	/// `(attr>=value)`
	GreaterOrEqual(String, String),
	/// `(attr<=value)`
	LessOrEqual(String, String),
	/// `(attr~=value)`
	Approx(String, String),
	/// A node the serializer has no text form for
	Unrecognized,
}

impl Filter {
	/// Serialize to RFC 4515 text for the back-end client.
	///
	/// Unrecognized nodes default to `(objectClass=*)`.
	pub(crate) fn to_filter_string(&self) -> String {
		match self {
			Self::And(parts) => {
				format!("(&{})", parts.iter().map(Self::to_filter_string).collect::<String>())
			}
			Self::Or(parts) => {
				format!("(|{})", parts.iter().map(Self::to_filter_string).collect::<String>())
			}
			Self::Not(inner) => format!("(!{})", inner.to_filter_string()),
			Self::Present(attr) => format!("({attr}=*)"),
			Self::Equality(attr, value) => format!("({attr}={})", ldap_escape(value.as_str())),
			Self::Substrings { attr, initial, any, last } => {
				let mut value = initial.as_deref().map(|s| ldap_escape(s).into_owned()).unwrap_or_default();
				value.push('*');
				for chunk in any {
					value.push_str(&ldap_escape(chunk.as_str()));
					value.push('*');
				}
				if let Some(last) = last {
					value.push_str(&ldap_escape(last.as_str()));
				}
				format!("({attr}={value})")
			}
			Self::GreaterOrEqual(attr, value) => {
				format!("({attr}>={})", ldap_escape(value.as_str()))
			}
			Self::LessOrEqual(attr, value) => format!("({attr}<={})", ldap_escape(value.as_str())),
			Self::Approx(attr, value) => format!("({attr}~={})", ldap_escape(value.as_str())),
			Self::Unrecognized => "(objectClass=*)".to_owned(),
		}
	}
}

/// Try to parse one PDU off the front of the buffer.
///
/// `None` means the buffer holds an incomplete message; the consumed
/// byte count accompanies a parsed message so the caller can drain it.
pub(crate) fn try_parse(buf: &[u8]) -> Result<Option<(LdapMessage, usize)>> {
	if buf.is_empty() {
		return Ok(None);
	}

	match parse_tag(buf) {
		Ok((rest, tag)) => {
			let consumed = buf.len() - rest.len();
			Ok(Some((parse_message(tag)?, consumed)))
		}
		Err(error) if error.is_incomplete() => {
			if buf.len() > MAX_MESSAGE_SIZE {
				bail!("client message exceeds {} bytes", MAX_MESSAGE_SIZE);
			}
			Ok(None)
		}
		Err(_) => bail!("malformed BER data from client"),
	}
}

/// Big-endian unsigned integer from BER content octets
fn decode_uint(bytes: &[u8]) -> u64 {
	bytes.iter().fold(0, |acc, byte| (acc << 8) | u64::from(*byte))
}

/// The UTF-8 text of a primitive tag
fn primitive_string(tag: StructureTag) -> Result<String> {
	let bytes = tag.expect_primitive().context("expected a primitive value")?;
	Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// The content octets of a primitive tag
fn primitive_bytes(tag: StructureTag) -> Result<Vec<u8>> {
	tag.expect_primitive().context("expected a primitive value")
}

/// Decode the LDAPMessage envelope into an operation
fn parse_message(tag: StructureTag) -> Result<LdapMessage> {
	let mut children = tag
		.match_class(TagClass::Universal)
		.and_then(|tag| tag.match_id(Types::Sequence as u64))
		.and_then(StructureTag::expect_constructed)
		.context("LDAP message is not a sequence")?
		.into_iter();

	let id_bytes =
		primitive_bytes(children.next().context("LDAP message without a message ID")?)?;
	#[allow(clippy::cast_possible_wrap)]
	let id = decode_uint(&id_bytes) as i32;

	let op_tag = children.next().context("LDAP message without an operation")?;
	if op_tag.class != TagClass::Application {
		bail!("protocol op carries a non-application tag");
	}

	let op = match op_tag.id {
		0 => parse_bind(op_tag)?,
		2 => Request::Unbind,
		3 => parse_search(op_tag)?,
		14 => parse_compare(op_tag)?,
		16 => Request::Abandon,
		23 => parse_extended(op_tag)?,
		op_id @ (6 | 8 | 10 | 12) => Request::Write { op_id },
		other => Request::Unknown(other),
	};

	Ok(LdapMessage { id, op })
}

/// Decode a BindRequest
fn parse_bind(tag: StructureTag) -> Result<Request> {
	let mut parts = tag.expect_constructed().context("bind request is not constructed")?.into_iter();
	let _version = parts.next().context("bind request without a version")?;
	let dn = primitive_string(parts.next().context("bind request without a name")?)?;
	let auth_tag = parts.next().context("bind request without credentials")?;

	let auth = if auth_tag.class == TagClass::Context && auth_tag.id == 0 {
		BindAuth::Simple(primitive_string(auth_tag)?)
	} else {
		BindAuth::Other
	};

	Ok(Request::Bind { dn, auth })
}

/// Decode a SearchRequest down to the parts the proxy forwards
fn parse_search(tag: StructureTag) -> Result<Request> {
	let mut parts =
		tag.expect_constructed().context("search request is not constructed")?.into_iter();

	let base = primitive_string(parts.next().context("search request without a base")?)?;
	let scope = decode_uint(&primitive_bytes(
		parts.next().context("search request without a scope")?,
	)?);
	let _deref_aliases = parts.next();
	let _size_limit = parts.next();
	let _time_limit = parts.next();
	let _types_only = parts.next();
	let filter = parts.next().map_or(Filter::Unrecognized, parse_filter);

	Ok(Request::Search { base, scope, filter })
}

/// Decode a CompareRequest
fn parse_compare(tag: StructureTag) -> Result<Request> {
	let mut parts =
		tag.expect_constructed().context("compare request is not constructed")?.into_iter();

	let dn = primitive_string(parts.next().context("compare request without an entry")?)?;
	let mut ava = parts
		.next()
		.context("compare request without an assertion")?
		.expect_constructed()
		.context("compare assertion is not constructed")?
		.into_iter();
	let attr = primitive_string(ava.next().context("compare assertion without an attribute")?)?;
	let value = primitive_bytes(ava.next().context("compare assertion without a value")?)?;

	Ok(Request::Compare { dn, attr, value })
}

/// Decode an ExtendedRequest's OID; the request value is irrelevant to
/// every operation the proxy answers
fn parse_extended(tag: StructureTag) -> Result<Request> {
	let parts =
		tag.expect_constructed().context("extended request is not constructed")?;

	for part in parts {
		if part.class == TagClass::Context && part.id == 0 {
			return Ok(Request::Extended { oid: primitive_string(part)? });
		}
	}

	bail!("extended request without an OID");
}

/// Decode a filter node; anything unexpected becomes `Unrecognized`
fn parse_filter(tag: StructureTag) -> Filter {
	if tag.class != TagClass::Context {
		return Filter::Unrecognized;
	}

	match tag.id {
		0 | 1 => {
			let id = tag.id;
			let Some(children) = tag.expect_constructed() else {
				return Filter::Unrecognized;
			};
			let parts = children.into_iter().map(parse_filter).collect();
			if id == 0 {
				Filter::And(parts)
			} else {
				Filter::Or(parts)
			}
		}
		2 => tag
			.expect_constructed()
			.and_then(|children| children.into_iter().next())
			.map_or(Filter::Unrecognized, |inner| Filter::Not(Box::new(parse_filter(inner)))),
		id @ (3 | 5 | 6 | 8) => {
			let Some((attr, value)) = attribute_value_pair(tag) else {
				return Filter::Unrecognized;
			};
			match id {
				3 => Filter::Equality(attr, value),
				5 => Filter::GreaterOrEqual(attr, value),
				6 => Filter::LessOrEqual(attr, value),
				_ => Filter::Approx(attr, value),
			}
		}
		4 => parse_substrings(tag),
		7 => tag
			.expect_primitive()
			.map(|bytes| Filter::Present(String::from_utf8_lossy(&bytes).into_owned()))
			.unwrap_or(Filter::Unrecognized),
		_ => Filter::Unrecognized,
	}
}

/// The `(attribute, value)` pair shared by the simple match filters
fn attribute_value_pair(tag: StructureTag) -> Option<(String, String)> {
	let mut parts = tag.expect_constructed()?.into_iter();
	let attr = parts.next()?.expect_primitive()?;
	let value = parts.next()?.expect_primitive()?;

	Some((
		String::from_utf8_lossy(&attr).into_owned(),
		String::from_utf8_lossy(&value).into_owned(),
	))
}

/// Decode a substrings filter node
fn parse_substrings(tag: StructureTag) -> Filter {
	let Some(mut parts) = tag.expect_constructed().map(Vec::into_iter) else {
		return Filter::Unrecognized;
	};

	let Some(attr) = parts.next().and_then(StructureTag::expect_primitive) else {
		return Filter::Unrecognized;
	};
	let attr = String::from_utf8_lossy(&attr).into_owned();

	let Some(chunks) = parts.next().and_then(StructureTag::expect_constructed) else {
		return Filter::Unrecognized;
	};

	let mut initial = None;
	let mut any = Vec::new();
	let mut last = None;
	for chunk in chunks {
		let id = chunk.id;
		let Some(value) = chunk.expect_primitive() else {
			return Filter::Unrecognized;
		};
		let value = String::from_utf8_lossy(&value).into_owned();
		match id {
			0 => initial = Some(value),
			1 => any.push(value),
			2 => last = Some(value),
			_ => return Filter::Unrecognized,
		}
	}

	Filter::Substrings { attr, initial, any, last }
}

/// Wrap an operation in an LDAPMessage envelope and encode it
pub(crate) fn envelope(message_id: i32, op: Tag) -> Result<Vec<u8>> {
	let message = Tag::Sequence(Sequence {
		inner: vec![
			Tag::Integer(Integer { inner: i64::from(message_id), ..Default::default() }),
			op,
		],
		..Default::default()
	});

	let mut buf = BytesMut::new();
	write::encode_into(&mut buf, message.into_structure())
		.context("failed to encode LDAP message")?;
	Ok(buf.to_vec())
}

/// The three LDAPResult components every response starts with
fn result_parts(code: u32, message: &str) -> Vec<Tag> {
	vec![
		Tag::Enumerated(Enumerated { inner: i64::from(code), ..Default::default() }),
		Tag::OctetString(OctetString::default()),
		Tag::OctetString(OctetString { inner: message.as_bytes().to_vec(), ..Default::default() }),
	]
}

/// Encode a response consisting of a bare LDAPResult under the given
/// application tag (bind, search done, compare, write refusals)
pub(crate) fn op_response(message_id: i32, app_id: u64, code: u32, message: &str) -> Result<Vec<u8>> {
	envelope(
		message_id,
		Tag::Sequence(Sequence {
			id: app_id,
			class: TagClass::Application,
			inner: result_parts(code, message),
		}),
	)
}

/// Encode a SearchResultEntry with raw byte values
pub(crate) fn search_entry(
	message_id: i32,
	dn: &str,
	attributes: Vec<(String, Vec<Vec<u8>>)>,
) -> Result<Vec<u8>> {
	let attributes = attributes
		.into_iter()
		.map(|(name, values)| {
			Tag::Sequence(Sequence {
				inner: vec![
					Tag::OctetString(OctetString {
						inner: name.into_bytes(),
						..Default::default()
					}),
					Tag::Set(Set {
						inner: values
							.into_iter()
							.map(|value| {
								Tag::OctetString(OctetString {
									inner: value,
									..Default::default()
								})
							})
							.collect(),
						..Default::default()
					}),
				],
				..Default::default()
			})
		})
		.collect();

	envelope(
		message_id,
		Tag::Sequence(Sequence {
			id: APP_SEARCH_ENTRY,
			class: TagClass::Application,
			inner: vec![
				Tag::OctetString(OctetString {
					inner: dn.as_bytes().to_vec(),
					..Default::default()
				}),
				Tag::Sequence(Sequence { inner: attributes, ..Default::default() }),
			],
		}),
	)
}

/// Encode an ExtendedResponse, optionally naming the response OID and
/// carrying a value
pub(crate) fn extended_response(
	message_id: i32,
	code: u32,
	message: &str,
	name: Option<&str>,
	value: Option<&[u8]>,
) -> Result<Vec<u8>> {
	let mut inner = result_parts(code, message);
	if let Some(name) = name {
		inner.push(Tag::OctetString(OctetString {
			id: 10,
			class: TagClass::Context,
			inner: name.as_bytes().to_vec(),
		}));
	}
	if let Some(value) = value {
		inner.push(Tag::OctetString(OctetString {
			id: 11,
			class: TagClass::Context,
			inner: value.to_vec(),
		}));
	}

	envelope(
		message_id,
		Tag::Sequence(Sequence {
			id: APP_EXTENDED_RESPONSE,
			class: TagClass::Application,
			inner,
		}),
	)
}

/// Encode an UnbindRequest-style null operation; only tests speak the
/// client side, but the envelope helper keeps both directions honest
#[cfg(test)]
fn null_op(app_id: u64) -> Tag {
	Tag::Null(lber::structures::Null { id: app_id, class: TagClass::Application, inner: () })
}
