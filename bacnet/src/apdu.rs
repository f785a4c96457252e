//! The eight APDU kinds, each carried in the first nibble of the first APDU octet.

use utils::error::*;

use crate::error::{AbortReason, BacnetError, ErrorClass, ErrorCode, RejectReason};

/// Open Question (spec): max-segments code 7 ("greater than 64") is capped at this concrete value.
pub const MAX_SEGMENTS_UNBOUNDED_CAP: u16 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxSegments {
	Unspecified,
	Limit(u16),
}

impl MaxSegments {
	pub fn to_code(self) -> u8 {
		match self {
			MaxSegments::Unspecified => 0,
			MaxSegments::Limit(n) if n <= 2 => 1,
			MaxSegments::Limit(n) if n <= 4 => 2,
			MaxSegments::Limit(n) if n <= 8 => 3,
			MaxSegments::Limit(n) if n <= 16 => 4,
			MaxSegments::Limit(n) if n <= 32 => 5,
			MaxSegments::Limit(n) if n <= 64 => 6,
			MaxSegments::Limit(_) => 7,
		}
	}

	pub fn from_code(code: u8) -> Self {
		match code {
			0 => MaxSegments::Unspecified,
			1 => MaxSegments::Limit(2),
			2 => MaxSegments::Limit(4),
			3 => MaxSegments::Limit(8),
			4 => MaxSegments::Limit(16),
			5 => MaxSegments::Limit(32),
			6 => MaxSegments::Limit(64),
			_ => MaxSegments::Limit(MAX_SEGMENTS_UNBOUNDED_CAP),
		}
	}

	pub fn limit(self) -> u16 {
		match self {
			MaxSegments::Unspecified => MAX_SEGMENTS_UNBOUNDED_CAP,
			MaxSegments::Limit(n) => n,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxApdu(pub u16);

impl MaxApdu {
	pub const MIN: MaxApdu = MaxApdu(50);

	pub fn to_code(self) -> u8 {
		match self.0 {
			n if n <= 50 => 0,
			n if n <= 128 => 1,
			n if n <= 206 => 2,
			n if n <= 480 => 3,
			n if n <= 1024 => 4,
			_ => 5,
		}
	}

	pub fn from_code(code: u8) -> Self {
		MaxApdu(match code {
			0 => 50,
			1 => 128,
			2 => 206,
			3 => 480,
			4 => 1024,
			_ => 1476,
		})
	}
}

macro_rules! service_choice_enum {
	($name:ident { $( $variant:ident = $value:expr ),* $(,)? }) => {
		#[derive(Debug, Clone, Copy, PartialEq, Eq)]
		pub enum $name {
			$( $variant = $value, )*
		}

		impl $name {
			pub fn from_code(code: u8) -> Option<Self> {
				match code {
					$( $value => Some(Self::$variant), )*
					_ => None,
				}
			}
		}
	};
}

service_choice_enum!(ConfirmedServiceChoice {
	AcknowledgeAlarm = 0,
	ConfirmedCovNotification = 1,
	ConfirmedEventNotification = 2,
	GetAlarmSummary = 3,
	GetEnrollmentSummary = 4,
	SubscribeCov = 5,
	AtomicReadFile = 6,
	AtomicWriteFile = 7,
	AddListElement = 8,
	RemoveListElement = 9,
	CreateObject = 10,
	DeleteObject = 11,
	ReadProperty = 12,
	ReadPropertyMultiple = 14,
	WriteProperty = 15,
	WritePropertyMultiple = 16,
	DeviceCommunicationControl = 17,
	ConfirmedPrivateTransfer = 18,
	ConfirmedTextMessage = 19,
	ReinitializeDevice = 20,
	VtOpen = 21,
	VtClose = 22,
	VtData = 23,
	Authenticate = 24,
	RequestKey = 25,
	ReadRange = 26,
	LifeSafetyOperation = 27,
	SubscribeCovProperty = 28,
	GetEventInformation = 29,
});

service_choice_enum!(UnconfirmedServiceChoice {
	IAm = 0,
	IHave = 1,
	UnconfirmedCovNotification = 2,
	UnconfirmedEventNotification = 3,
	UnconfirmedPrivateTransfer = 4,
	UnconfirmedTextMessage = 5,
	TimeSynchronization = 6,
	WhoHas = 7,
	WhoIs = 8,
	UtcTimeSynchronization = 9,
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SegmentInfo {
	pub sequence_number: u8,
	pub proposed_window_size: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConfirmedRequest {
	pub segmented: bool,
	pub more_follows: bool,
	pub segmented_response_accepted: bool,
	pub max_segments: MaxSegments,
	pub max_apdu: MaxApdu,
	pub invoke_id: u8,
	pub segment: Option<SegmentInfo>,
	pub service_choice: u8,
	pub service_data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComplexAck {
	pub segmented: bool,
	pub more_follows: bool,
	pub invoke_id: u8,
	pub segment: Option<SegmentInfo>,
	pub service_choice: u8,
	pub service_data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentAck {
	pub negative_ack: bool,
	pub server_origin: bool,
	pub invoke_id: u8,
	pub sequence_number: u8,
	pub actual_window_size: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorPdu {
	pub invoke_id: u8,
	pub service_choice: u8,
	pub error: BacnetError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RejectPdu {
	pub invoke_id: u8,
	pub reason: RejectReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbortPdu {
	pub server_origin: bool,
	pub invoke_id: u8,
	pub reason: AbortReason,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Apdu {
	ConfirmedRequest(ConfirmedRequest),
	UnconfirmedRequest { service_choice: u8, service_data: Vec<u8> },
	SimpleAck { invoke_id: u8, service_choice: u8 },
	ComplexAck(ComplexAck),
	SegmentAck(SegmentAck),
	Error(ErrorPdu),
	Reject(RejectPdu),
	Abort(AbortPdu),
}

const PDU_CONFIRMED_REQUEST: u8 = 0;
const PDU_UNCONFIRMED_REQUEST: u8 = 1;
const PDU_SIMPLE_ACK: u8 = 2;
const PDU_COMPLEX_ACK: u8 = 3;
const PDU_SEGMENT_ACK: u8 = 4;
const PDU_ERROR: u8 = 5;
const PDU_REJECT: u8 = 6;
const PDU_ABORT: u8 = 7;

impl Apdu {
	pub fn invoke_id(&self) -> Option<u8> {
		match self {
			Apdu::ConfirmedRequest(r) => Some(r.invoke_id),
			Apdu::SimpleAck { invoke_id, .. } => Some(*invoke_id),
			Apdu::ComplexAck(a) => Some(a.invoke_id),
			Apdu::SegmentAck(a) => Some(a.invoke_id),
			Apdu::Error(e) => Some(e.invoke_id),
			Apdu::Reject(r) => Some(r.invoke_id),
			Apdu::Abort(a) => Some(a.invoke_id),
			Apdu::UnconfirmedRequest { .. } => None,
		}
	}

	pub fn encode(&self, out: &mut Vec<u8>) -> Result {
		match self {
			Apdu::ConfirmedRequest(r) => {
				let mut b0 = PDU_CONFIRMED_REQUEST << 4;
				if r.segmented {
					b0 |= 0x08;
				}
				if r.more_follows {
					b0 |= 0x04;
				}
				if r.segmented_response_accepted {
					b0 |= 0x02;
				}
				out.push(b0);
				out.push((r.max_segments.to_code() << 4) | r.max_apdu.to_code());
				out.push(r.invoke_id);

				if let Some(seg) = r.segment {
					if !r.segmented {
						log::debug!("Segment info present on a non-segmented confirmed request");
						return Err(());
					}
					out.push(seg.sequence_number);
					out.push(seg.proposed_window_size);
				}

				out.push(r.service_choice);
				out.extend_from_slice(&r.service_data);
			}
			Apdu::UnconfirmedRequest { service_choice, service_data } => {
				out.push(PDU_UNCONFIRMED_REQUEST << 4);
				out.push(*service_choice);
				out.extend_from_slice(service_data);
			}
			Apdu::SimpleAck { invoke_id, service_choice } => {
				out.push(PDU_SIMPLE_ACK << 4);
				out.push(*invoke_id);
				out.push(*service_choice);
			}
			Apdu::ComplexAck(a) => {
				let mut b0 = PDU_COMPLEX_ACK << 4;
				if a.segmented {
					b0 |= 0x08;
				}
				if a.more_follows {
					b0 |= 0x04;
				}
				out.push(b0);
				out.push(a.invoke_id);

				if let Some(seg) = a.segment {
					if !a.segmented {
						log::debug!("Segment info present on a non-segmented complex ack");
						return Err(());
					}
					out.push(seg.sequence_number);
					out.push(seg.proposed_window_size);
				}

				out.push(a.service_choice);
				out.extend_from_slice(&a.service_data);
			}
			Apdu::SegmentAck(a) => {
				let mut b0 = PDU_SEGMENT_ACK << 4;
				if a.negative_ack {
					b0 |= 0x02;
				}
				if a.server_origin {
					b0 |= 0x01;
				}
				out.push(b0);
				out.push(a.invoke_id);
				out.push(a.sequence_number);
				out.push(a.actual_window_size);
			}
			Apdu::Error(e) => {
				out.push(PDU_ERROR << 4);
				out.push(e.invoke_id);
				out.push(e.service_choice);
				crate::primitive::Primitive::Enumerated(e.error.class as u32).encode_application(out);
				crate::primitive::Primitive::Enumerated(e.error.code as u32).encode_application(out);
			}
			Apdu::Reject(r) => {
				out.push(PDU_REJECT << 4);
				out.push(r.invoke_id);
				out.push(r.reason as u8);
			}
			Apdu::Abort(a) => {
				let mut b0 = PDU_ABORT << 4;
				if a.server_origin {
					b0 |= 0x01;
				}
				out.push(b0);
				out.push(a.invoke_id);
				out.push(a.reason as u8);
			}
		}

		Ok(())
	}

	pub fn decode(buf: &[u8]) -> Result<Self> {
		let &b0 = buf.first().ok_or_else(|| log::debug!("Empty APDU buffer"))?;
		let pdu_type = b0 >> 4;

		Ok(match pdu_type {
			PDU_CONFIRMED_REQUEST => {
				let segmented = b0 & 0x08 != 0;
				let more_follows = b0 & 0x04 != 0;
				let segmented_response_accepted = b0 & 0x02 != 0;

				let &b1 = buf.get(1).ok_or_else(|| log::debug!("Truncated confirmed request"))?;
				let max_segments = MaxSegments::from_code(b1 >> 4);
				let max_apdu = MaxApdu::from_code(b1 & 0x0F);

				let invoke_id = *buf.get(2).ok_or_else(|| log::debug!("Truncated confirmed request"))?;

				let mut pos = 3;

				let segment = if segmented {
					let sequence_number = *buf.get(pos).ok_or_else(|| log::debug!("Truncated segmented request header"))?;
					let proposed_window_size = *buf.get(pos + 1).ok_or_else(|| log::debug!("Truncated segmented request header"))?;
					pos += 2;
					Some(SegmentInfo { sequence_number, proposed_window_size })
				} else {
					None
				};

				let service_choice = *buf.get(pos).ok_or_else(|| log::debug!("Missing service choice"))?;
				pos += 1;

				Apdu::ConfirmedRequest(ConfirmedRequest {
					segmented,
					more_follows,
					segmented_response_accepted,
					max_segments,
					max_apdu,
					invoke_id,
					segment,
					service_choice,
					service_data: buf[pos..].to_vec(),
				})
			}
			PDU_UNCONFIRMED_REQUEST => {
				let service_choice = *buf.get(1).ok_or_else(|| log::debug!("Missing service choice"))?;
				Apdu::UnconfirmedRequest { service_choice, service_data: buf[2.min(buf.len())..].to_vec() }
			}
			PDU_SIMPLE_ACK => Apdu::SimpleAck {
				invoke_id: *buf.get(1).ok_or_else(|| log::debug!("Truncated simple ack"))?,
				service_choice: *buf.get(2).ok_or_else(|| log::debug!("Truncated simple ack"))?,
			},
			PDU_COMPLEX_ACK => {
				let segmented = b0 & 0x08 != 0;
				let more_follows = b0 & 0x04 != 0;

				let invoke_id = *buf.get(1).ok_or_else(|| log::debug!("Truncated complex ack"))?;
				let mut pos = 2;

				let segment = if segmented {
					let sequence_number = *buf.get(pos).ok_or_else(|| log::debug!("Truncated segmented ack header"))?;
					let proposed_window_size = *buf.get(pos + 1).ok_or_else(|| log::debug!("Truncated segmented ack header"))?;
					pos += 2;
					Some(SegmentInfo { sequence_number, proposed_window_size })
				} else {
					None
				};

				let service_choice = *buf.get(pos).ok_or_else(|| log::debug!("Missing service choice"))?;
				pos += 1;

				Apdu::ComplexAck(ComplexAck {
					segmented,
					more_follows,
					invoke_id,
					segment,
					service_choice,
					service_data: buf[pos..].to_vec(),
				})
			}
			PDU_SEGMENT_ACK => Apdu::SegmentAck(SegmentAck {
				negative_ack: b0 & 0x02 != 0,
				server_origin: b0 & 0x01 != 0,
				invoke_id: *buf.get(1).ok_or_else(|| log::debug!("Truncated segment ack"))?,
				sequence_number: *buf.get(2).ok_or_else(|| log::debug!("Truncated segment ack"))?,
				actual_window_size: *buf.get(3).ok_or_else(|| log::debug!("Truncated segment ack"))?,
			}),
			PDU_ERROR => {
				let invoke_id = *buf.get(1).ok_or_else(|| log::debug!("Truncated error pdu"))?;
				let service_choice = *buf.get(2).ok_or_else(|| log::debug!("Truncated error pdu"))?;

				let (class, n1) = crate::primitive::Primitive::decode_application(&buf[3..])?;
				let (code, _) = crate::primitive::Primitive::decode_application(&buf[3 + n1..])?;

				let class = decode_error_class(&class)?;
				let code = decode_error_code(&code)?;

				Apdu::Error(ErrorPdu { invoke_id, service_choice, error: BacnetError::new(class, code) })
			}
			PDU_REJECT => Apdu::Reject(RejectPdu {
				invoke_id: *buf.get(1).ok_or_else(|| log::debug!("Truncated reject pdu"))?,
				reason: decode_reject_reason(*buf.get(2).ok_or_else(|| log::debug!("Truncated reject pdu"))?),
			}),
			PDU_ABORT => Apdu::Abort(AbortPdu {
				server_origin: b0 & 0x01 != 0,
				invoke_id: *buf.get(1).ok_or_else(|| log::debug!("Truncated abort pdu"))?,
				reason: decode_abort_reason(*buf.get(2).ok_or_else(|| log::debug!("Truncated abort pdu"))?),
			}),
			other => {
				log::debug!("Unknown PDU type {other}");
				return Err(());
			}
		})
	}
}

fn decode_error_class(p: &crate::primitive::Primitive) -> Result<ErrorClass> {
	let crate::primitive::Primitive::Enumerated(v) = p else { return Err(()) };

	Ok(match v {
		0 => ErrorClass::Device,
		1 => ErrorClass::Object,
		2 => ErrorClass::Property,
		3 => ErrorClass::Resources,
		4 => ErrorClass::Security,
		5 => ErrorClass::Services,
		6 => ErrorClass::Vt,
		_ => ErrorClass::Communication,
	})
}

fn decode_error_code(p: &crate::primitive::Primitive) -> Result<ErrorCode> {
	let crate::primitive::Primitive::Enumerated(v) = p else { return Err(()) };

	Ok(match v {
		31 => ErrorCode::UnknownObject,
		32 => ErrorCode::UnknownProperty,
		37 => ErrorCode::ValueOutOfRange,
		40 => ErrorCode::WriteAccessDenied,
		24 => ErrorCode::UnsupportedObjectType,
		42 => ErrorCode::InvalidArrayIndex,
		50 => ErrorCode::PropertyIsNotAnArray,
		7 => ErrorCode::InconsistentParameters,
		9 => ErrorCode::NoSpaceToAddListElement,
		10 => ErrorCode::NoSpaceToWriteProperty,
		27 => ErrorCode::ReadAccessDenied,
		62 => ErrorCode::UnknownSubscription,
		23 => ErrorCode::ObjectDeletionNotPermitted,
		45 => ErrorCode::OptionalFunctionalityNotSupported,
		38 => ErrorCode::ValueNotInitialized,
		41 => ErrorCode::InvalidDataType,
		48 => ErrorCode::DuplicateName,
		47 => ErrorCode::DuplicateObjectId,
		26 => ErrorCode::PasswordFailure,
		_ => ErrorCode::Other,
	})
}

fn decode_reject_reason(v: u8) -> RejectReason {
	match v {
		1 => RejectReason::BufferOverflow,
		2 => RejectReason::InconsistentParameters,
		3 => RejectReason::InvalidParameterDataType,
		4 => RejectReason::InvalidTag,
		5 => RejectReason::MissingRequiredParameter,
		6 => RejectReason::ParameterOutOfRange,
		7 => RejectReason::TooManyArguments,
		8 => RejectReason::UndefinedEnumeration,
		9 => RejectReason::UnrecognizedService,
		_ => RejectReason::Other,
	}
}

fn decode_abort_reason(v: u8) -> AbortReason {
	match v {
		1 => AbortReason::BufferOverflow,
		2 => AbortReason::InvalidApduInThisState,
		3 => AbortReason::PreemptedByHigherPriorityTask,
		4 => AbortReason::SegmentationNotSupported,
		5 => AbortReason::SecurityError,
		6 => AbortReason::InsufficientSecurity,
		7 => AbortReason::WindowSizeOutOfRange,
		8 => AbortReason::ApplicationExceededReplyTime,
		9 => AbortReason::OutOfResources,
		10 => AbortReason::TsmTimeout,
		11 => AbortReason::ApduTooLong,
		_ => AbortReason::Other,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn confirmed_request_roundtrip() {
		let req = Apdu::ConfirmedRequest(ConfirmedRequest {
			segmented: false,
			more_follows: false,
			segmented_response_accepted: true,
			max_segments: MaxSegments::Limit(16),
			max_apdu: MaxApdu(1024),
			invoke_id: 7,
			segment: None,
			service_choice: ConfirmedServiceChoice::ReadProperty as u8,
			service_data: vec![1, 2, 3],
		});

		let mut out = Vec::new();
		req.encode(&mut out).unwrap();
		assert_eq!(Apdu::decode(&out).unwrap(), req);
	}

	#[test]
	fn segmented_complex_ack_roundtrip() {
		let ack = Apdu::ComplexAck(ComplexAck {
			segmented: true,
			more_follows: true,
			invoke_id: 9,
			segment: Some(SegmentInfo { sequence_number: 3, proposed_window_size: 8 }),
			service_choice: ConfirmedServiceChoice::ReadPropertyMultiple as u8,
			service_data: vec![0xAA; 40],
		});

		let mut out = Vec::new();
		ack.encode(&mut out).unwrap();
		assert_eq!(Apdu::decode(&out).unwrap(), ack);
	}

	#[test]
	fn error_pdu_roundtrip() {
		let err = Apdu::Error(ErrorPdu {
			invoke_id: 4,
			service_choice: ConfirmedServiceChoice::ReadProperty as u8,
			error: BacnetError::object(ErrorCode::UnknownObject),
		});

		let mut out = Vec::new();
		err.encode(&mut out).unwrap();
		assert_eq!(Apdu::decode(&out).unwrap(), err);
	}

	#[test]
	fn max_segments_code_7_is_capped() {
		assert_eq!(MaxSegments::from_code(7).limit(), MAX_SEGMENTS_UNBOUNDED_CAP);
	}
}
