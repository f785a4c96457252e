//! Application-tagged primitive values: the leaves of every BACnet property value.

use utils::error::*;

use crate::object_id::ObjectId;
use crate::tag::{self, Class, Meaning, Tag};

pub const TAG_NULL: u32 = 0;
pub const TAG_BOOLEAN: u32 = 1;
pub const TAG_UNSIGNED: u32 = 2;
pub const TAG_SIGNED: u32 = 3;
pub const TAG_REAL: u32 = 4;
pub const TAG_DOUBLE: u32 = 5;
pub const TAG_OCTET_STRING: u32 = 6;
pub const TAG_CHARACTER_STRING: u32 = 7;
pub const TAG_BIT_STRING: u32 = 8;
pub const TAG_ENUMERATED: u32 = 9;
pub const TAG_DATE: u32 = 10;
pub const TAG_TIME: u32 = 11;
pub const TAG_OBJECT_ID: u32 = 12;

/// A date with BACnet's wildcard convention: any field may be `0xFF` to mean "don't care".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Date {
	/// Years since 1900, or 0xFF for "any".
	pub year: u8,
	pub month: u8,
	pub day: u8,
	pub weekday: u8,
}

/// A time of day with the same wildcard convention as [`Date`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Time {
	pub hour: u8,
	pub minute: u8,
	pub second: u8,
	pub hundredths: u8,
}

/// A bit string: `unused` counts the padding bits in the final octet of `bits`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitString {
	pub bits: Vec<u8>,
	pub unused: u8,
}

impl BitString {
	pub fn get(&self, i: usize) -> bool {
		let byte = i / 8;
		let bit = 7 - (i % 8);
		self.bits.get(byte).is_some_and(|b| b & (1 << bit) != 0)
	}

	pub fn len(&self) -> usize {
		self.bits.len() * 8 - self.unused as usize
	}
}

#[derive(Debug, Clone, PartialEq)]
pub enum Primitive {
	Null,
	Boolean(bool),
	Unsigned(u64),
	Signed(i64),
	Real(f32),
	Double(f64),
	OctetString(Vec<u8>),
	CharacterString(String),
	BitString(BitString),
	Enumerated(u32),
	Date(Date),
	Time(Time),
	ObjectId(ObjectId),
}

impl Primitive {
	pub fn application_tag_number(&self) -> u32 {
		match self {
			Primitive::Null => TAG_NULL,
			Primitive::Boolean(_) => TAG_BOOLEAN,
			Primitive::Unsigned(_) => TAG_UNSIGNED,
			Primitive::Signed(_) => TAG_SIGNED,
			Primitive::Real(_) => TAG_REAL,
			Primitive::Double(_) => TAG_DOUBLE,
			Primitive::OctetString(_) => TAG_OCTET_STRING,
			Primitive::CharacterString(_) => TAG_CHARACTER_STRING,
			Primitive::BitString(_) => TAG_BIT_STRING,
			Primitive::Enumerated(_) => TAG_ENUMERATED,
			Primitive::Date(_) => TAG_DATE,
			Primitive::Time(_) => TAG_TIME,
			Primitive::ObjectId(_) => TAG_OBJECT_ID,
		}
	}

	/// Encodes with an application-class tag (used for top-level primitive properties, e.g. the
	/// values inside a `Primitive` array).
	pub fn encode_application(&self, out: &mut Vec<u8>) {
		self.encode(out, Class::Application, self.application_tag_number());
	}

	/// Encodes with a context-specific tag `number` (used when the primitive is a positional
	/// member of a SEQUENCE).
	pub fn encode_context(&self, out: &mut Vec<u8>, number: u32) {
		self.encode(out, Class::Context, number);
	}

	fn encode(&self, out: &mut Vec<u8>, class: Class, number: u32) {
		if let Primitive::Boolean(v) = self {
			if class == Class::Application {
				tag::encode_boolean(out, *v);
				return;
			}
		}

		let mut body = Vec::new();
		self.encode_body(&mut body);
		tag::encode_value(out, number, class, body.len());
		out.extend_from_slice(&body);
	}

	fn encode_body(&self, out: &mut Vec<u8>) {
		match self {
			Primitive::Null => {}
			Primitive::Boolean(v) => out.push(*v as u8),
			Primitive::Unsigned(v) => out.extend_from_slice(minimal_unsigned(*v).as_slice()),
			Primitive::Signed(v) => out.extend_from_slice(minimal_signed(*v).as_slice()),
			Primitive::Real(v) => out.extend_from_slice(&v.to_be_bytes()),
			Primitive::Double(v) => out.extend_from_slice(&v.to_be_bytes()),
			Primitive::OctetString(v) => out.extend_from_slice(v),
			Primitive::CharacterString(v) => {
				out.push(0); // charset 0 = UTF-8
				out.extend_from_slice(v.as_bytes());
			}
			Primitive::BitString(v) => {
				out.push(v.unused);
				out.extend_from_slice(&v.bits);
			}
			Primitive::Enumerated(v) => out.extend_from_slice(minimal_unsigned(*v as u64).as_slice()),
			Primitive::Date(d) => out.extend_from_slice(&[d.year, d.month, d.day, d.weekday]),
			Primitive::Time(t) => out.extend_from_slice(&[t.hour, t.minute, t.second, t.hundredths]),
			Primitive::ObjectId(id) => out.extend_from_slice(&id.to_wire().to_be_bytes()),
		}
	}

	/// Decodes a value whose tag has already been read. `class`/`number` identify the tag that
	/// was consumed; `app_type` says which application type to interpret the bytes as (needed for
	/// context-tagged primitives, which carry no type information of their own).
	pub fn decode_body(app_type: u32, body: &[u8]) -> Result<Self> {
		Ok(match app_type {
			TAG_NULL => Primitive::Null,
			TAG_BOOLEAN => Primitive::Boolean(body.first().copied().unwrap_or(0) != 0),
			TAG_UNSIGNED => Primitive::Unsigned(decode_unsigned(body)?),
			TAG_SIGNED => Primitive::Signed(decode_signed(body)?),
			TAG_REAL => Primitive::Real(f32::from_be_bytes(
				body.try_into().map_err(|_| log::debug!("REAL must be exactly 4 bytes"))?,
			)),
			TAG_DOUBLE => Primitive::Double(f64::from_be_bytes(
				body.try_into().map_err(|_| log::debug!("DOUBLE must be exactly 8 bytes"))?,
			)),
			TAG_OCTET_STRING => Primitive::OctetString(body.to_vec()),
			TAG_CHARACTER_STRING => {
				let (&charset, rest) = body.split_first().ok_or_else(|| log::debug!("Empty character string"))?;

				if charset != 0 {
					log::debug!("Non-UTF-8 charset {charset} decoded lossily");
				}

				Primitive::CharacterString(String::from_utf8_lossy(rest).into_owned())
			}
			TAG_BIT_STRING => {
				let (&unused, rest) = body.split_first().ok_or_else(|| log::debug!("Empty bit string"))?;
				Primitive::BitString(BitString { bits: rest.to_vec(), unused })
			}
			TAG_ENUMERATED => Primitive::Enumerated(decode_unsigned(body)? as u32),
			TAG_DATE => {
				let [year, month, day, weekday] = *<&[u8; 4]>::try_from(body).map_err(|_| log::debug!("DATE must be exactly 4 bytes"))?;
				Primitive::Date(Date { year, month, day, weekday })
			}
			TAG_TIME => {
				let [hour, minute, second, hundredths] = *<&[u8; 4]>::try_from(body).map_err(|_| log::debug!("TIME must be exactly 4 bytes"))?;
				Primitive::Time(Time { hour, minute, second, hundredths })
			}
			TAG_OBJECT_ID => Primitive::ObjectId(ObjectId::from_wire(u32::from_be_bytes(
				body.try_into().map_err(|_| log::debug!("Object identifier must be exactly 4 bytes"))?,
			))),
			other => {
				log::debug!("Unknown application tag number {other}");
				return Err(());
			}
		})
	}

	/// Decodes an application-tagged primitive (the tag itself carries the type) at the front of
	/// `buf`, returning the value and bytes consumed.
	pub fn decode_application(buf: &[u8]) -> Result<(Self, usize)> {
		let (tag, hdr) = tag::decode(buf)?;

		if tag.class != Class::Application {
			log::debug!("Expected an application-tagged primitive");
			return Err(());
		}

		if tag.number == TAG_BOOLEAN {
			let Meaning::Length(v) = tag.meaning else { return Err(()) };
			return Ok((Primitive::Boolean(v != 0), hdr));
		}

		let len = tag.len().ok_or_else(|| log::debug!("Expected a primitive-length tag"))?;
		let body = buf.get(hdr..hdr + len).ok_or_else(|| log::debug!("Buffer ended before primitive body"))?;

		Ok((Self::decode_body(tag.number, body)?, hdr + len))
	}
}

fn minimal_unsigned(v: u64) -> Vec<u8> {
	let bytes = v.to_be_bytes();
	let skip = bytes.iter().take_while(|&&b| b == 0).count().min(7);
	bytes[skip..].to_vec()
}

fn minimal_signed(v: i64) -> Vec<u8> {
	let bytes = v.to_be_bytes();

	let mut skip = 0;
	while skip < 7 {
		let msb_matches_sign = (bytes[skip] == 0x00 && bytes[skip + 1] & 0x80 == 0) || (bytes[skip] == 0xFF && bytes[skip + 1] & 0x80 != 0);
		if !msb_matches_sign {
			break;
		}
		skip += 1;
	}

	bytes[skip..].to_vec()
}

pub fn decode_unsigned(body: &[u8]) -> Result<u64> {
	if body.is_empty() || body.len() > 8 {
		log::debug!("Unsigned integer must be 1-8 bytes, got {}", body.len());
		return Err(());
	}

	let mut buf = [0u8; 8];
	buf[8 - body.len()..].copy_from_slice(body);
	Ok(u64::from_be_bytes(buf))
}

pub fn decode_signed(body: &[u8]) -> Result<i64> {
	if body.is_empty() || body.len() > 8 {
		log::debug!("Signed integer must be 1-8 bytes, got {}", body.len());
		return Err(());
	}

	let sign_fill = if body[0] & 0x80 != 0 { 0xFF } else { 0x00 };
	let mut buf = [sign_fill; 8];
	buf[8 - body.len()..].copy_from_slice(body);
	Ok(i64::from_be_bytes(buf))
}

#[cfg(test)]
mod tests {
	use super::*;

	fn roundtrip(p: Primitive) {
		let mut out = Vec::new();
		p.encode_application(&mut out);
		let (decoded, n) = Primitive::decode_application(&out).unwrap();
		assert_eq!(decoded, p);
		assert_eq!(n, out.len());
	}

	#[test]
	fn unsigned_minimal_encoding() {
		roundtrip(Primitive::Unsigned(0));
		roundtrip(Primitive::Unsigned(255));
		roundtrip(Primitive::Unsigned(256));
		roundtrip(Primitive::Unsigned(u64::MAX));
	}

	#[test]
	fn signed_minimal_encoding() {
		roundtrip(Primitive::Signed(-1));
		roundtrip(Primitive::Signed(0));
		roundtrip(Primitive::Signed(-129));
		roundtrip(Primitive::Signed(i64::MIN));
		roundtrip(Primitive::Signed(i64::MAX));
	}

	#[test]
	fn boolean_is_wire_identical() {
		roundtrip(Primitive::Boolean(true));
		roundtrip(Primitive::Boolean(false));
	}

	#[test]
	fn real_and_double() {
		roundtrip(Primitive::Real(72.5));
		roundtrip(Primitive::Double(-0.125));
	}

	#[test]
	fn character_string_utf8() {
		roundtrip(Primitive::CharacterString("hello".into()));
	}

	#[test]
	fn bit_string_unused_bits() {
		roundtrip(Primitive::BitString(BitString { bits: vec![0b1010_0000], unused: 4 }));
	}

	#[test]
	fn object_identifier() {
		roundtrip(Primitive::ObjectId(ObjectId::new(crate::object_id::object_type::ANALOG_INPUT, 12)));
	}

	#[test]
	fn date_and_time_with_wildcards() {
		roundtrip(Primitive::Date(Date { year: 0xFF, month: 1, day: 1, weekday: 0xFF }));
		roundtrip(Primitive::Time(Time { hour: 12, minute: 0, second: 0xFF, hundredths: 0xFF }));
	}
}
