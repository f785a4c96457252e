//! Ambient configuration layer: every knob a running device needs, with documented defaults.
//! Loaded through a builder rather than a file format — config-file parsing is an external
//! collaborator's job, not this crate's.

use core::net::{Ipv4Addr, SocketAddrV4};
use core::time::Duration;

use crate::apdu::{MaxApdu, MaxSegments};

pub const DEFAULT_PORT: u16 = 0xBAC0;

/// Default confirmed-request timeouts and retry counts.
pub const DEFAULT_APDU_TIMEOUT: Duration = Duration::from_secs(6);
pub const DEFAULT_APDU_RETRIES: u8 = 3;
pub const DEFAULT_SEGMENT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_COV_LIFETIME_SWEEP_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_FOREIGN_DEVICE_REREGISTER_FRACTION: u32 = 2;

#[derive(Debug, Clone)]
pub struct Config {
	pub device_instance: u32,
	pub device_name: String,
	pub vendor_id: u32,
	pub vendor_name: String,
	pub model_name: String,
	pub firmware_revision: String,

	pub bind_address: SocketAddrV4,
	pub broadcast_address: Ipv4Addr,

	pub max_apdu: MaxApdu,
	pub max_segments: MaxSegments,
	pub segmented_response_accepted: bool,

	pub apdu_timeout: Duration,
	pub apdu_retries: u8,
	pub segment_timeout: Duration,
	pub segment_window_size: u8,

	/// Constant-time-compared password gating `DeviceCommunicationControl`/`ReinitializeDevice`.
	/// `None` means the service is open to any caller.
	pub dcc_password: Option<String>,
	pub reinitialize_password: Option<String>,

	/// Set when this device is itself a foreign device registering with a remote BBMD.
	pub foreign_device_bbmd: Option<SocketAddrV4>,
	pub foreign_device_lifetime: Duration,
}

impl Config {
	pub fn new(device_instance: u32, device_name: impl Into<String>) -> Self {
		Self {
			device_instance,
			device_name: device_name.into(),
			vendor_id: 0,
			vendor_name: String::new(),
			model_name: String::new(),
			firmware_revision: String::new(),
			bind_address: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, DEFAULT_PORT),
			broadcast_address: Ipv4Addr::new(255, 255, 255, 255),
			max_apdu: MaxApdu(1476),
			max_segments: MaxSegments::Limit(crate::apdu::MAX_SEGMENTS_UNBOUNDED_CAP),
			segmented_response_accepted: true,
			apdu_timeout: DEFAULT_APDU_TIMEOUT,
			apdu_retries: DEFAULT_APDU_RETRIES,
			segment_timeout: DEFAULT_SEGMENT_TIMEOUT,
			segment_window_size: 4,
			dcc_password: None,
			reinitialize_password: None,
			foreign_device_bbmd: None,
			foreign_device_lifetime: Duration::from_secs(300),
		}
	}

	pub fn vendor(mut self, id: u32, name: impl Into<String>) -> Self {
		self.vendor_id = id;
		self.vendor_name = name.into();
		self
	}

	pub fn bind(mut self, addr: SocketAddrV4) -> Self {
		self.bind_address = addr;
		self
	}

	pub fn foreign_device_of(mut self, bbmd: SocketAddrV4, lifetime: Duration) -> Self {
		self.foreign_device_bbmd = Some(bbmd);
		self.foreign_device_lifetime = lifetime;
		self
	}
}

/// Constant-time byte comparison: short-circuiting on a length mismatch leaks only the length,
/// which is not the secret being protected here (the password content is).
pub fn passwords_match(candidate: &str, expected: &str) -> bool {
	let a = candidate.as_bytes();
	let b = expected.as_bytes();

	if a.len() != b.len() {
		return false;
	}

	a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn password_compare_is_exact() {
		assert!(passwords_match("hunter2", "hunter2"));
		assert!(!passwords_match("hunter2", "hunter3"));
		assert!(!passwords_match("short", "longerpassword"));
	}

	#[test]
	fn defaults_are_populated() {
		let cfg = Config::new(1, "Test Device");
		assert_eq!(cfg.apdu_retries, DEFAULT_APDU_RETRIES);
		assert_eq!(cfg.bind_address.port(), DEFAULT_PORT);
	}
}
