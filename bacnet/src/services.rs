//! Encode/decode for the confirmed and unconfirmed service bodies this crate implements:
//! Who-Is/I-Am, Who-Has/I-Have, (Read|Write)Property(Multiple), SubscribeCOV and its
//! notifications, DeviceCommunicationControl, ReinitializeDevice.

use utils::error::*;

use crate::object_id::ObjectId;
use crate::primitive::Primitive;
use crate::property::PropertyValue;
use crate::tag::{self, Class, Meaning};

fn context_unsigned(buf: &[u8], number: u32) -> Result<Option<(u64, usize)>> {
	let (t, hdr) = tag::decode(buf)?;

	if t.class != Class::Context || t.number != number {
		return Ok(None);
	}

	let len = t.len().ok_or_else(|| log::debug!("Expected a length-carrying context tag"))?;
	let body = buf.get(hdr..hdr + len).ok_or_else(|| log::debug!("Buffer ended before context value"))?;
	Ok(Some((crate::primitive::decode_unsigned(body)?, hdr + len)))
}

fn context_object_id(buf: &[u8], number: u32) -> Result<(ObjectId, usize)> {
	let (t, hdr) = tag::decode(buf)?;

	if t.class != Class::Context || t.number != number {
		log::debug!("Expected context tag {number} for an object identifier");
		return Err(());
	}

	let len = t.len().ok_or_else(|| log::debug!("Expected a length-carrying context tag"))?;
	let body = buf.get(hdr..hdr + len).ok_or_else(|| log::debug!("Buffer ended before object identifier"))?;
	let bytes: [u8; 4] = body.try_into().map_err(|_| log::debug!("Object identifier must be 4 bytes"))?;
	Ok((ObjectId::from_wire(u32::from_be_bytes(bytes)), hdr))
}

fn encode_context_unsigned(out: &mut Vec<u8>, number: u32, value: u64) {
	Primitive::Unsigned(value).encode_context(out, number);
}

fn encode_context_object_id(out: &mut Vec<u8>, number: u32, id: ObjectId) {
	Primitive::ObjectId(id).encode_context(out, number);
}

// ---- Who-Is / I-Am ----

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WhoIs {
	pub low_limit: Option<u32>,
	pub high_limit: Option<u32>,
}

impl WhoIs {
	pub fn encode(&self) -> Vec<u8> {
		let mut out = Vec::new();

		if let (Some(lo), Some(hi)) = (self.low_limit, self.high_limit) {
			encode_context_unsigned(&mut out, 0, u64::from(lo));
			encode_context_unsigned(&mut out, 1, u64::from(hi));
		}

		out
	}

	pub fn decode(buf: &[u8]) -> Result<Self> {
		if buf.is_empty() {
			return Ok(Self::default());
		}

		let (lo, n) = context_unsigned(buf, 0)?.ok_or_else(|| log::debug!("Missing Who-Is low limit"))?;
		let (hi, _) = context_unsigned(&buf[n..], 1)?.ok_or_else(|| log::debug!("Missing Who-Is high limit"))?;
		Ok(Self { low_limit: Some(lo as u32), high_limit: Some(hi as u32) })
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IAm {
	pub device: ObjectId,
	pub max_apdu: u32,
	pub segmentation: u32,
	pub vendor_id: u32,
}

impl IAm {
	pub fn encode(&self) -> Vec<u8> {
		let mut out = Vec::new();
		Primitive::ObjectId(self.device).encode_application(&mut out);
		Primitive::Unsigned(u64::from(self.max_apdu)).encode_application(&mut out);
		Primitive::Enumerated(self.segmentation).encode_application(&mut out);
		Primitive::Unsigned(u64::from(self.vendor_id)).encode_application(&mut out);
		out
	}

	pub fn decode(buf: &[u8]) -> Result<Self> {
		let (device, n1) = decode_app_object_id(buf)?;
		let (max_apdu, n2) = decode_app_unsigned(&buf[n1..])?;
		let (segmentation, n3) = decode_app_enumerated(&buf[n1 + n2..])?;
		let (vendor_id, _) = decode_app_unsigned(&buf[n1 + n2 + n3..])?;
		Ok(Self { device, max_apdu: max_apdu as u32, segmentation, vendor_id: vendor_id as u32 })
	}
}

fn decode_app_object_id(buf: &[u8]) -> Result<(ObjectId, usize)> {
	let (p, n) = Primitive::decode_application(buf)?;
	match p {
		Primitive::ObjectId(id) => Ok((id, n)),
		_ => {
			log::debug!("Expected an application-tagged object identifier");
			Err(())
		}
	}
}

fn decode_app_unsigned(buf: &[u8]) -> Result<(u64, usize)> {
	let (p, n) = Primitive::decode_application(buf)?;
	match p {
		Primitive::Unsigned(v) => Ok((v, n)),
		_ => {
			log::debug!("Expected an application-tagged unsigned integer");
			Err(())
		}
	}
}

fn decode_app_enumerated(buf: &[u8]) -> Result<(u32, usize)> {
	let (p, n) = Primitive::decode_application(buf)?;
	match p {
		Primitive::Enumerated(v) => Ok((v, n)),
		_ => {
			log::debug!("Expected an application-tagged enumerated value");
			Err(())
		}
	}
}

// ---- Who-Has / I-Have ----

#[derive(Debug, Clone, PartialEq)]
pub enum ObjectSelector {
	Id(ObjectId),
	Name(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct WhoHas {
	pub low_limit: Option<u32>,
	pub high_limit: Option<u32>,
	pub object: ObjectSelector,
}

impl WhoHas {
	pub fn decode(buf: &[u8]) -> Result<Self> {
		let mut pos = 0;
		let mut low_limit = None;
		let mut high_limit = None;

		if let Some((lo, n)) = context_unsigned(buf, 0)? {
			low_limit = Some(lo as u32);
			pos += n;
			let (hi, n2) = context_unsigned(&buf[pos..], 1)?.ok_or_else(|| log::debug!("Missing Who-Has high limit"))?;
			high_limit = Some(hi as u32);
			pos += n2;
		}

		let (t, hdr) = tag::decode(&buf[pos..])?;

		let object = match t.number {
			2 => {
				let len = t.len().ok_or_else(|| log::debug!("Expected a length for object identifier"))?;
				let body = buf.get(pos + hdr..pos + hdr + len).ok_or_else(|| log::debug!("Truncated object identifier"))?;
				let bytes: [u8; 4] = body.try_into().map_err(|_| log::debug!("Object identifier must be 4 bytes"))?;
				ObjectSelector::Id(ObjectId::from_wire(u32::from_be_bytes(bytes)))
			}
			3 => {
				let len = t.len().ok_or_else(|| log::debug!("Expected a length for object name"))?;
				let body = buf.get(pos + hdr..pos + hdr + len).ok_or_else(|| log::debug!("Truncated object name"))?;
				let (charset, rest) = body.split_first().ok_or_else(|| log::debug!("Empty object name"))?;

				if *charset != 0 {
					log::debug!("Non-UTF-8 charset {charset} decoded lossily");
				}

				ObjectSelector::Name(String::from_utf8_lossy(rest).into_owned())
			}
			other => {
				log::debug!("Unexpected Who-Has object selector tag {other}");
				return Err(());
			}
		};

		Ok(Self { low_limit, high_limit, object })
	}

	pub fn encode(&self) -> Vec<u8> {
		let mut out = Vec::new();

		if let (Some(lo), Some(hi)) = (self.low_limit, self.high_limit) {
			encode_context_unsigned(&mut out, 0, u64::from(lo));
			encode_context_unsigned(&mut out, 1, u64::from(hi));
		}

		match &self.object {
			ObjectSelector::Id(id) => encode_context_object_id(&mut out, 2, *id),
			ObjectSelector::Name(name) => {
				let mut body = vec![0u8];
				body.extend_from_slice(name.as_bytes());
				tag::encode_value(&mut out, 3, Class::Context, body.len());
				out.extend_from_slice(&body);
			}
		}

		out
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct IHave {
	pub device: ObjectId,
	pub object: ObjectId,
	pub object_name: String,
}

impl IHave {
	pub fn encode(&self) -> Vec<u8> {
		let mut out = Vec::new();
		Primitive::ObjectId(self.device).encode_application(&mut out);
		Primitive::ObjectId(self.object).encode_application(&mut out);
		Primitive::CharacterString(self.object_name.clone()).encode_application(&mut out);
		out
	}

	pub fn decode(buf: &[u8]) -> Result<Self> {
		let (device, n1) = decode_app_object_id(buf)?;
		let (object, n2) = decode_app_object_id(&buf[n1..])?;
		let (name, _) = Primitive::decode_application(&buf[n1 + n2..])?;

		let Primitive::CharacterString(object_name) = name else {
			log::debug!("Expected an application-tagged character string");
			return Err(());
		};

		Ok(Self { device, object, object_name })
	}
}

// ---- ReadProperty ----

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadPropertyRequest {
	pub object: ObjectId,
	pub property: u32,
	pub array_index: Option<u32>,
}

impl ReadPropertyRequest {
	pub fn encode(&self) -> Vec<u8> {
		let mut out = Vec::new();
		encode_context_object_id(&mut out, 0, self.object);
		encode_context_unsigned(&mut out, 1, u64::from(self.property));

		if let Some(i) = self.array_index {
			encode_context_unsigned(&mut out, 2, u64::from(i));
		}

		out
	}

	pub fn decode(buf: &[u8]) -> Result<Self> {
		let (object, n1) = context_object_id(buf, 0)?;
		let (property, n2) = context_unsigned(&buf[n1..], 1)?.ok_or_else(|| log::debug!("Missing property identifier"))?;
		let array_index = context_unsigned(&buf[n1 + n2..], 2)?.map(|(v, _)| v as u32);
		Ok(Self { object, property: property as u32, array_index })
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadPropertyAck {
	pub object: ObjectId,
	pub property: u32,
	pub array_index: Option<u32>,
	pub value: PropertyValue,
}

impl ReadPropertyAck {
	pub fn encode(&self) -> Vec<u8> {
		let mut out = Vec::new();
		encode_context_object_id(&mut out, 0, self.object);
		encode_context_unsigned(&mut out, 1, u64::from(self.property));

		if let Some(i) = self.array_index {
			encode_context_unsigned(&mut out, 2, u64::from(i));
		}

		tag::encode_open(&mut out, 3);

		match &self.value {
			PropertyValue::Single(p) => p.encode_application(&mut out),
			PropertyValue::Array(items) => {
				for p in items {
					p.encode_application(&mut out);
				}
			}
		}

		tag::encode_close(&mut out, 3);
		out
	}

	pub fn decode(buf: &[u8]) -> Result<Self> {
		let (object, n1) = context_object_id(buf, 0)?;
		let (property, n2) = context_unsigned(&buf[n1..], 1)?.ok_or_else(|| log::debug!("Missing property identifier"))?;
		let mut pos = n1 + n2;

		let array_index = context_unsigned(&buf[pos..], 2)?;
		if let Some((_, n)) = array_index {
			pos += n;
		}

		let (open, hdr) = tag::decode(&buf[pos..])?;
		if !open.is_open() || open.number != 3 {
			log::debug!("Expected opening tag 3 for property value");
			return Err(());
		}
		pos += hdr;

		let mut budget = tag::Budget::default();
		budget.enter()?;

		let mut values = Vec::new();
		loop {
			let (peek, _) = tag::decode(&buf[pos..])?;
			if peek.is_close() {
				break;
			}

			budget.count()?;
			let (value, n) = Primitive::decode_application(&buf[pos..])?;
			values.push(value);
			pos += n;
		}

		let (close, hdr) = tag::decode(&buf[pos..])?;
		if !close.is_close() || close.number != 3 {
			log::debug!("Expected closing tag 3 for property value");
			return Err(());
		}
		pos += hdr;
		budget.exit();

		let value = if values.len() == 1 {
			PropertyValue::Single(values.into_iter().next().unwrap())
		} else {
			PropertyValue::Array(values)
		};

		Ok(Self { object, property: property as u32, array_index: array_index.map(|(v, _)| v as u32), value })
	}
}

// ---- WriteProperty ----

#[derive(Debug, Clone, PartialEq)]
pub struct WritePropertyRequest {
	pub object: ObjectId,
	pub property: u32,
	pub array_index: Option<u32>,
	pub value: PropertyValue,
	pub priority: Option<u8>,
}

impl WritePropertyRequest {
	pub fn encode(&self) -> Vec<u8> {
		let mut out = Vec::new();
		encode_context_object_id(&mut out, 0, self.object);
		encode_context_unsigned(&mut out, 1, u64::from(self.property));

		if let Some(i) = self.array_index {
			encode_context_unsigned(&mut out, 2, u64::from(i));
		}

		tag::encode_open(&mut out, 3);
		match &self.value {
			PropertyValue::Single(p) => p.encode_application(&mut out),
			PropertyValue::Array(items) => {
				for p in items {
					p.encode_application(&mut out);
				}
			}
		}
		tag::encode_close(&mut out, 3);

		if let Some(p) = self.priority {
			encode_context_unsigned(&mut out, 4, u64::from(p));
		}

		out
	}

	pub fn decode(buf: &[u8]) -> Result<Self> {
		let (object, n1) = context_object_id(buf, 0)?;
		let (property, n2) = context_unsigned(&buf[n1..], 1)?.ok_or_else(|| log::debug!("Missing property identifier"))?;
		let mut pos = n1 + n2;

		let array_index = context_unsigned(&buf[pos..], 2)?;
		if let Some((_, n)) = array_index {
			pos += n;
		}

		let (open, hdr) = tag::decode(&buf[pos..])?;
		if !open.is_open() || open.number != 3 {
			log::debug!("Expected opening tag 3 for property value");
			return Err(());
		}
		pos += hdr;

		let (value, n) = Primitive::decode_application(&buf[pos..])?;
		pos += n;

		let (close, hdr) = tag::decode(&buf[pos..])?;
		if !close.is_close() || close.number != 3 {
			log::debug!("Expected closing tag 3 for property value");
			return Err(());
		}
		pos += hdr;

		let priority = context_unsigned(&buf[pos..], 4)?.map(|(v, _)| v as u8);

		Ok(Self {
			object,
			property: property as u32,
			array_index: array_index.map(|(v, _)| v as u32),
			value: PropertyValue::Single(value),
			priority,
		})
	}
}

// ---- SubscribeCOV ----

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeCovRequest {
	pub process_id: u32,
	pub monitored_object: ObjectId,
	pub issue_confirmed: Option<bool>,
	pub lifetime_secs: Option<u32>,
}

impl SubscribeCovRequest {
	pub fn decode(buf: &[u8]) -> Result<Self> {
		let (process_id, n1) = context_unsigned(buf, 0)?.ok_or_else(|| log::debug!("Missing subscriber process id"))?;
		let (monitored_object, n2) = context_object_id(&buf[n1..], 1)?;
		let mut pos = n1 + n2;

		let issue_confirmed = match tag::decode(&buf[pos..]) {
			Ok((t, hdr)) if t.class == Class::Context && t.number == 2 => {
				let Meaning::Length(1) = t.meaning else {
					log::debug!("Malformed issueConfirmedNotifications boolean");
					return Err(());
				};
				let v = *buf.get(pos + hdr).ok_or_else(|| log::debug!("Truncated boolean body"))?;
				pos += hdr + 1;
				Some(v != 0)
			}
			_ => None,
		};

		let lifetime_secs = context_unsigned(&buf[pos..], 3)?.map(|(v, _)| v as u32);

		Ok(Self { process_id: process_id as u32, monitored_object, issue_confirmed, lifetime_secs })
	}

	pub fn encode(&self) -> Vec<u8> {
		let mut out = Vec::new();
		encode_context_unsigned(&mut out, 0, u64::from(self.process_id));
		encode_context_object_id(&mut out, 1, self.monitored_object);

		if let Some(v) = self.issue_confirmed {
			tag::encode_value(&mut out, 2, Class::Context, 1);
			out.push(v as u8);
		}

		if let Some(secs) = self.lifetime_secs {
			encode_context_unsigned(&mut out, 3, u64::from(secs));
		}

		out
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct CovNotification {
	pub process_id: u32,
	pub initiating_device: ObjectId,
	pub monitored_object: ObjectId,
	pub time_remaining: u32,
	pub values: Vec<(u32, PropertyValue)>,
}

impl CovNotification {
	pub fn encode(&self) -> Vec<u8> {
		let mut out = Vec::new();
		encode_context_unsigned(&mut out, 0, u64::from(self.process_id));
		encode_context_object_id(&mut out, 1, self.initiating_device);
		encode_context_object_id(&mut out, 2, self.monitored_object);
		encode_context_unsigned(&mut out, 3, u64::from(self.time_remaining));

		tag::encode_open(&mut out, 4);
		for (property, value) in &self.values {
			encode_context_unsigned(&mut out, 0, u64::from(*property));
			tag::encode_open(&mut out, 2);
			match value {
				PropertyValue::Single(p) => p.encode_application(&mut out),
				PropertyValue::Array(items) => {
					for p in items {
						p.encode_application(&mut out);
					}
				}
			}
			tag::encode_close(&mut out, 2);
		}
		tag::encode_close(&mut out, 4);

		out
	}

	pub fn decode(buf: &[u8]) -> Result<Self> {
		let (process_id, n1) = context_unsigned(buf, 0)?.ok_or_else(|| log::debug!("Missing subscriber process id"))?;
		let (initiating_device, n2) = context_object_id(&buf[n1..], 1)?;
		let (monitored_object, n3) = context_object_id(&buf[n1 + n2..], 2)?;
		let mut pos = n1 + n2 + n3;

		let (time_remaining, n4) = context_unsigned(&buf[pos..], 3)?.ok_or_else(|| log::debug!("Missing time remaining"))?;
		pos += n4;

		let (open, hdr) = tag::decode(&buf[pos..])?;
		if !open.is_open() || open.number != 4 {
			log::debug!("Expected opening tag 4 for list of values");
			return Err(());
		}
		pos += hdr;

		let mut budget = tag::Budget::default();
		budget.enter()?;

		let mut values = Vec::new();

		loop {
			let (peek, _) = tag::decode(&buf[pos..])?;
			if peek.is_close() && peek.number == 4 {
				break;
			}

			budget.count()?;
			let (property, n) = context_unsigned(&buf[pos..], 0)?.ok_or_else(|| log::debug!("Missing property identifier"))?;
			pos += n;

			let (vopen, hdr) = tag::decode(&buf[pos..])?;
			if !vopen.is_open() || vopen.number != 2 {
				log::debug!("Expected opening tag 2 for a COV value");
				return Err(());
			}
			pos += hdr;
			budget.enter()?;

			let mut items = Vec::new();
			loop {
				let (peek, _) = tag::decode(&buf[pos..])?;
				if peek.is_close() {
					break;
				}
				budget.count()?;
				let (value, n) = Primitive::decode_application(&buf[pos..])?;
				items.push(value);
				pos += n;
			}

			let (vclose, hdr) = tag::decode(&buf[pos..])?;
			if !vclose.is_close() || vclose.number != 2 {
				log::debug!("Expected closing tag 2 for a COV value");
				return Err(());
			}
			pos += hdr;
			budget.exit();

			let value = if items.len() == 1 { PropertyValue::Single(items.into_iter().next().unwrap()) } else { PropertyValue::Array(items) };
			values.push((property as u32, value));
		}

		let (close, hdr) = tag::decode(&buf[pos..])?;
		if !close.is_close() || close.number != 4 {
			log::debug!("Expected closing tag 4 for list of values");
			return Err(());
		}
		pos += hdr;
		budget.exit();
		let _ = pos;

		Ok(Self { process_id: process_id as u32, initiating_device, monitored_object, time_remaining: time_remaining as u32, values })
	}
}

// ---- ReadPropertyMultiple / WritePropertyMultiple ----

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyReference {
	pub property: u32,
	pub array_index: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadAccessSpecification {
	pub object: ObjectId,
	pub properties: Vec<PropertyReference>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadPropertyMultipleRequest {
	pub specs: Vec<ReadAccessSpecification>,
}

impl ReadPropertyMultipleRequest {
	pub fn decode(buf: &[u8]) -> Result<Self> {
		let mut pos = 0;
		let mut specs = Vec::new();
		let mut budget = tag::Budget::default();

		while pos < buf.len() {
			budget.count()?;
			let (object, n) = context_object_id(&buf[pos..], 0)?;
			pos += n;

			let (open, hdr) = tag::decode(&buf[pos..])?;
			if !open.is_open() || open.number != 1 {
				log::debug!("Expected opening tag 1 for property reference list");
				return Err(());
			}
			pos += hdr;
			budget.enter()?;

			let mut properties = Vec::new();
			loop {
				let (peek, _) = tag::decode(&buf[pos..])?;
				if peek.is_close() {
					break;
				}

				budget.count()?;
				let (property, n) = context_unsigned(&buf[pos..], 0)?.ok_or_else(|| log::debug!("Missing property identifier"))?;
				pos += n;

				let array_index = context_unsigned(&buf[pos..], 1)?;
				if let Some((_, n)) = array_index {
					pos += n;
				}

				properties.push(PropertyReference { property: property as u32, array_index: array_index.map(|(v, _)| v as u32) });
			}

			let (close, hdr) = tag::decode(&buf[pos..])?;
			if !close.is_close() || close.number != 1 {
				log::debug!("Expected closing tag 1 for property reference list");
				return Err(());
			}
			pos += hdr;
			budget.exit();

			specs.push(ReadAccessSpecification { object, properties });
		}

		Ok(Self { specs })
	}

	pub fn encode(&self) -> Vec<u8> {
		let mut out = Vec::new();

		for spec in &self.specs {
			encode_context_object_id(&mut out, 0, spec.object);
			tag::encode_open(&mut out, 1);

			for p in &spec.properties {
				encode_context_unsigned(&mut out, 0, u64::from(p.property));
				if let Some(i) = p.array_index {
					encode_context_unsigned(&mut out, 1, u64::from(i));
				}
			}

			tag::encode_close(&mut out, 1);
		}

		out
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct PropertyResult {
	pub property: u32,
	pub array_index: Option<u32>,
	pub outcome: core::result::Result<PropertyValue, crate::error::BacnetError>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadAccessResult {
	pub object: ObjectId,
	pub results: Vec<PropertyResult>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadPropertyMultipleAck {
	pub results: Vec<ReadAccessResult>,
}

impl ReadPropertyMultipleAck {
	pub fn encode(&self) -> Vec<u8> {
		let mut out = Vec::new();

		for r in &self.results {
			encode_context_object_id(&mut out, 0, r.object);
			tag::encode_open(&mut out, 1);

			for item in &r.results {
				encode_context_unsigned(&mut out, 2, u64::from(item.property));
				if let Some(i) = item.array_index {
					encode_context_unsigned(&mut out, 3, u64::from(i));
				}

				match &item.outcome {
					Ok(value) => {
						tag::encode_open(&mut out, 4);
						match value {
							PropertyValue::Single(p) => p.encode_application(&mut out),
							PropertyValue::Array(items) => {
								for p in items {
									p.encode_application(&mut out);
								}
							}
						}
						tag::encode_close(&mut out, 4);
					}
					Err(e) => {
						tag::encode_open(&mut out, 5);
						Primitive::Enumerated(e.class as u32).encode_application(&mut out);
						Primitive::Enumerated(e.code as u32).encode_application(&mut out);
						tag::encode_close(&mut out, 5);
					}
				}
			}

			tag::encode_close(&mut out, 1);
		}

		out
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct WriteAccessProperty {
	pub property: u32,
	pub array_index: Option<u32>,
	pub value: PropertyValue,
	pub priority: Option<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WritePropertyMultipleRequest {
	pub specs: Vec<(ObjectId, Vec<WriteAccessProperty>)>,
}

impl WritePropertyMultipleRequest {
	pub fn decode(buf: &[u8]) -> Result<Self> {
		let mut pos = 0;
		let mut specs = Vec::new();
		let mut budget = tag::Budget::default();

		while pos < buf.len() {
			budget.count()?;
			let (object, n) = context_object_id(&buf[pos..], 0)?;
			pos += n;

			let (open, hdr) = tag::decode(&buf[pos..])?;
			if !open.is_open() || open.number != 1 {
				log::debug!("Expected opening tag 1 for value list");
				return Err(());
			}
			pos += hdr;
			budget.enter()?;

			let mut properties = Vec::new();
			loop {
				let (peek, _) = tag::decode(&buf[pos..])?;
				if peek.is_close() {
					break;
				}

				budget.count()?;
				let (property, n) = context_unsigned(&buf[pos..], 0)?.ok_or_else(|| log::debug!("Missing property identifier"))?;
				pos += n;

				let array_index = context_unsigned(&buf[pos..], 1)?;
				if let Some((_, n)) = array_index {
					pos += n;
				}

				let (vopen, hdr) = tag::decode(&buf[pos..])?;
				if !vopen.is_open() || vopen.number != 2 {
					log::debug!("Expected opening tag 2 for a value");
					return Err(());
				}
				pos += hdr;
				budget.enter()?;

				let (value, n) = Primitive::decode_application(&buf[pos..])?;
				pos += n;

				let (vclose, hdr) = tag::decode(&buf[pos..])?;
				if !vclose.is_close() || vclose.number != 2 {
					log::debug!("Expected closing tag 2 for a value");
					return Err(());
				}
				pos += hdr;
				budget.exit();

				let priority = context_unsigned(&buf[pos..], 3)?;
				let priority_value = priority.map(|(v, _)| v as u8);
				if let Some((_, n)) = priority {
					pos += n;
				}

				properties.push(WriteAccessProperty {
					property: property as u32,
					array_index: array_index.map(|(v, _)| v as u32),
					value: PropertyValue::Single(value),
					priority: priority_value,
				});
			}

			let (close, hdr) = tag::decode(&buf[pos..])?;
			if !close.is_close() || close.number != 1 {
				log::debug!("Expected closing tag 1 for value list");
				return Err(());
			}
			pos += hdr;
			budget.exit();

			specs.push((object, properties));
		}

		Ok(Self { specs })
	}

	pub fn encode(&self) -> Vec<u8> {
		let mut out = Vec::new();

		for (object, properties) in &self.specs {
			encode_context_object_id(&mut out, 0, *object);
			tag::encode_open(&mut out, 1);

			for p in properties {
				encode_context_unsigned(&mut out, 0, u64::from(p.property));

				if let Some(i) = p.array_index {
					encode_context_unsigned(&mut out, 1, u64::from(i));
				}

				tag::encode_open(&mut out, 2);
				match &p.value {
					PropertyValue::Single(v) => v.encode_application(&mut out),
					PropertyValue::Array(items) => {
						for v in items {
							v.encode_application(&mut out);
						}
					}
				}
				tag::encode_close(&mut out, 2);

				if let Some(prio) = p.priority {
					encode_context_unsigned(&mut out, 3, u64::from(prio));
				}
			}

			tag::encode_close(&mut out, 1);
		}

		out
	}
}

// ---- DeviceCommunicationControl / ReinitializeDevice ----

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceCommunicationControl {
	pub time_duration_minutes: Option<u32>,
	pub enable_disable: u32,
	pub password: Option<String>,
}

impl DeviceCommunicationControl {
	pub fn decode(buf: &[u8]) -> Result<Self> {
		let mut pos = 0;
		let time_duration_minutes = context_unsigned(&buf[pos..], 0)?.map(|(v, n)| {
			pos += n;
			v as u32
		});

		let (enable_disable, n) = context_unsigned(&buf[pos..], 1)?.ok_or_else(|| log::debug!("Missing enable-disable code"))?;
		pos += n;

		let password = match tag::decode(&buf[pos..]) {
			Ok((t, hdr)) if t.class == Class::Context && t.number == 2 => {
				let len = t.len().ok_or_else(|| log::debug!("Expected a length for password"))?;
				let body = buf.get(pos + hdr..pos + hdr + len).ok_or_else(|| log::debug!("Truncated password"))?;
				let (_, rest) = body.split_first().ok_or_else(|| log::debug!("Empty password"))?;
				Some(String::from_utf8_lossy(rest).into_owned())
			}
			_ => None,
		};

		Ok(Self { time_duration_minutes, enable_disable: enable_disable as u32, password })
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReinitializeDevice {
	pub reinitialized_state: u32,
	pub password: Option<String>,
}

impl ReinitializeDevice {
	pub fn decode(buf: &[u8]) -> Result<Self> {
		let (reinitialized_state, n) = context_unsigned(buf, 0)?.ok_or_else(|| log::debug!("Missing reinitializedStateOfDevice"))?;
		let mut pos = n;

		let password = match tag::decode(&buf[pos..]) {
			Ok((t, hdr)) if t.class == Class::Context && t.number == 1 => {
				let len = t.len().ok_or_else(|| log::debug!("Expected a length for password"))?;
				let body = buf.get(pos + hdr..pos + hdr + len).ok_or_else(|| log::debug!("Truncated password"))?;
				let (_, rest) = body.split_first().ok_or_else(|| log::debug!("Empty password"))?;
				pos += hdr + len;
				Some(String::from_utf8_lossy(rest).into_owned())
			}
			_ => None,
		};

		let _ = pos;
		Ok(Self { reinitialized_state: reinitialized_state as u32, password })
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::object_id::object_type;

	#[test]
	fn who_is_global_roundtrip() {
		assert_eq!(WhoIs::decode(&WhoIs::default().encode()).unwrap(), WhoIs::default());
	}

	#[test]
	fn who_is_ranged_roundtrip() {
		let w = WhoIs { low_limit: Some(1), high_limit: Some(100) };
		assert_eq!(WhoIs::decode(&w.encode()).unwrap(), w);
	}

	#[test]
	fn i_am_roundtrip() {
		let i = IAm { device: ObjectId::new(object_type::DEVICE, 99), max_apdu: 1476, segmentation: 0, vendor_id: 999 };
		assert_eq!(IAm::decode(&i.encode()).unwrap(), i);
	}

	#[test]
	fn who_has_by_name_roundtrip() {
		let w = WhoHas { low_limit: None, high_limit: None, object: ObjectSelector::Name("AV1".into()) };
		assert_eq!(WhoHas::decode(&w.encode()).unwrap(), w);
	}

	#[test]
	fn read_property_request_roundtrip() {
		let r = ReadPropertyRequest { object: ObjectId::new(object_type::ANALOG_VALUE, 1), property: 85, array_index: None };
		assert_eq!(ReadPropertyRequest::decode(&r.encode()).unwrap(), r);
	}

	#[test]
	fn read_property_ack_roundtrip() {
		let ack = ReadPropertyAck {
			object: ObjectId::new(object_type::ANALOG_VALUE, 1),
			property: 85,
			array_index: None,
			value: PropertyValue::Single(Primitive::Real(72.5)),
		};
		assert_eq!(ReadPropertyAck::decode(&ack.encode()).unwrap(), ack);
	}

	#[test]
	fn write_property_request_roundtrip() {
		let w = WritePropertyRequest {
			object: ObjectId::new(object_type::ANALOG_VALUE, 1),
			property: 85,
			array_index: None,
			value: PropertyValue::Single(Primitive::Real(1.0)),
			priority: Some(8),
		};
		assert_eq!(WritePropertyRequest::decode(&w.encode()).unwrap(), w);
	}

	#[test]
	fn subscribe_cov_request_roundtrip() {
		let s = SubscribeCovRequest {
			process_id: 1,
			monitored_object: ObjectId::new(object_type::ANALOG_VALUE, 1),
			issue_confirmed: Some(false),
			lifetime_secs: Some(60),
		};
		assert_eq!(SubscribeCovRequest::decode(&s.encode()).unwrap(), s);
	}

	#[test]
	fn read_property_multiple_request_roundtrip() {
		let r = ReadPropertyMultipleRequest {
			specs: vec![ReadAccessSpecification {
				object: ObjectId::new(object_type::ANALOG_VALUE, 1),
				properties: vec![
					PropertyReference { property: 85, array_index: None },
					PropertyReference { property: 76, array_index: None },
				],
			}],
		};
		assert_eq!(ReadPropertyMultipleRequest::decode(&r.encode()).unwrap(), r);
	}

	#[test]
	fn read_property_multiple_ack_encodes_both_outcomes() {
		let ack = ReadPropertyMultipleAck {
			results: vec![ReadAccessResult {
				object: ObjectId::new(object_type::ANALOG_VALUE, 1),
				results: vec![
					PropertyResult { property: 85, array_index: None, outcome: Ok(PropertyValue::Single(Primitive::Real(1.0))) },
					PropertyResult {
						property: 999,
						array_index: None,
						outcome: Err(crate::error::BacnetError::property(crate::error::ErrorCode::UnknownProperty)),
					},
				],
			}],
		};

		// No decoder is provided for the ack (the orchestrator is the only consumer of the request
		// side); just confirm encoding doesn't panic and produces a non-empty frame.
		assert!(!ack.encode().is_empty());
	}

	#[test]
	fn write_property_multiple_request_roundtrip() {
		let w = WritePropertyMultipleRequest {
			specs: vec![(
				ObjectId::new(object_type::ANALOG_VALUE, 1),
				vec![WriteAccessProperty {
					property: 85,
					array_index: None,
					value: PropertyValue::Single(Primitive::Real(2.0)),
					priority: Some(10),
				}],
			)],
		};
		assert_eq!(WritePropertyMultipleRequest::decode(&w.encode()).unwrap(), w);
	}

	#[test]
	fn cov_notification_roundtrip() {
		let n = CovNotification {
			process_id: 1,
			initiating_device: ObjectId::new(object_type::DEVICE, 1),
			monitored_object: ObjectId::new(object_type::ANALOG_VALUE, 1),
			time_remaining: 30,
			values: vec![(85, PropertyValue::Single(Primitive::Real(4.0)))],
		};
		assert_eq!(CovNotification::decode(&n.encode()).unwrap(), n);
	}

	#[test]
	fn read_property_multiple_request_rejects_oversize_property_list() {
		let r = ReadPropertyMultipleRequest {
			specs: vec![ReadAccessSpecification {
				object: ObjectId::new(object_type::ANALOG_VALUE, 1),
				properties: (0..=tag::MAX_LIST_ELEMENTS as u32).map(|p| PropertyReference { property: p, array_index: None }).collect(),
			}],
		};
		assert!(ReadPropertyMultipleRequest::decode(&r.encode()).is_err());
	}

	#[test]
	fn write_property_multiple_request_rejects_oversize_spec_list() {
		let w = WritePropertyMultipleRequest {
			specs: (0..=tag::MAX_LIST_ELEMENTS as u32)
				.map(|i| (ObjectId::new(object_type::ANALOG_VALUE, i), Vec::new()))
				.collect(),
		};
		assert!(WritePropertyMultipleRequest::decode(&w.encode()).is_err());
	}
}
