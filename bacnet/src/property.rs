//! Standard property identifiers and the tagged value type stored against them.
//!
//! Only the identifiers needed by the Device object and the services this crate implements are
//! named; everything else round-trips as a raw property identifier the caller supplied, per the
//! "unknown identifiers still round-trip" design note.

use crate::primitive::Primitive;

pub mod id {
	pub const ACKED_TRANSITIONS: u32 = 0;
	pub const APDU_TIMEOUT: u32 = 11;
	pub const APPLICATION_SOFTWARE_VERSION: u32 = 12;
	pub const COV_INCREMENT: u32 = 22;
	pub const DATABASE_REVISION: u32 = 155;
	pub const DESCRIPTION: u32 = 28;
	pub const DEVICE_TYPE: u32 = 31;
	pub const EVENT_STATE: u32 = 36;
	pub const FIRMWARE_REVISION: u32 = 44;
	pub const MAX_APDU_LENGTH_ACCEPTED: u32 = 62;
	pub const MODEL_NAME: u32 = 70;
	pub const NUMBER_OF_APDU_RETRIES: u32 = 73;
	pub const OBJECT_IDENTIFIER: u32 = 75;
	pub const OBJECT_LIST: u32 = 76;
	pub const OBJECT_NAME: u32 = 77;
	pub const OBJECT_TYPE: u32 = 79;
	pub const OUT_OF_SERVICE: u32 = 81;
	pub const PRESENT_VALUE: u32 = 85;
	pub const PRIORITY_ARRAY: u32 = 87;
	pub const PROPERTY_LIST: u32 = 371;
	pub const PROTOCOL_REVISION: u32 = 139;
	pub const PROTOCOL_VERSION: u32 = 98;
	pub const RELINQUISH_DEFAULT: u32 = 104;
	pub const SEGMENTATION_SUPPORTED: u32 = 107;
	pub const STATUS_FLAGS: u32 = 111;
	pub const SYSTEM_STATUS: u32 = 112;
	pub const UNITS: u32 = 117;
	pub const VENDOR_IDENTIFIER: u32 = 120;
	pub const VENDOR_NAME: u32 = 121;
}

/// A property's value: either a single primitive or an array of them (BACnet's list/array
/// types collapse to the same wire shape - a run of application-tagged or context-tagged
/// primitives - so one representation covers both).
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
	Single(Primitive),
	Array(Vec<Primitive>),
}

impl PropertyValue {
	pub fn as_single(&self) -> Option<&Primitive> {
		match self {
			PropertyValue::Single(p) => Some(p),
			_ => None,
		}
	}

	pub fn as_array(&self) -> Option<&[Primitive]> {
		match self {
			PropertyValue::Array(v) => Some(v),
			_ => None,
		}
	}
}

impl From<Primitive> for PropertyValue {
	fn from(p: Primitive) -> Self {
		PropertyValue::Single(p)
	}
}

/// Read/write access rule for a property, checked by the object database before mutating one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
	ReadOnly,
	ReadWrite,
	WriteOnly,
}

#[derive(Debug, Clone, Copy)]
pub struct PropertyDef {
	pub id: u32,
	pub access: Access,
	pub required: bool,
}
