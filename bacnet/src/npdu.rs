//! The network-layer (NPDU) header: routing fields sandwiched between the BVLL frame and the
//! APDU payload.

use utils::error::*;

use crate::address::{Mac, PeerAddress, BROADCAST_NETWORK};

const PROTOCOL_VERSION: u8 = 1;

const CTRL_DEST_PRESENT: u8 = 0x20;
const CTRL_SRC_PRESENT: u8 = 0x08;
const CTRL_EXPECTING_REPLY: u8 = 0x04;
const CTRL_NETWORK_LAYER_MESSAGE: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
	Normal = 0,
	Urgent = 1,
	CriticalEquipment = 2,
	LifeSafety = 3,
}

impl Priority {
	fn from_bits(b: u8) -> Self {
		match b & 0x03 {
			0 => Priority::Normal,
			1 => Priority::Urgent,
			2 => Priority::CriticalEquipment,
			_ => Priority::LifeSafety,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Npdu {
	pub destination: Option<PeerAddress>,
	pub source: Option<PeerAddress>,
	pub expecting_reply: bool,
	pub priority: Priority,
	/// `true` for a network-layer message (e.g. Who-Is-Router), which this crate does not
	/// interpret beyond framing; the orchestrator drops these after logging.
	pub network_layer_message: bool,
}

impl Npdu {
	pub fn application(destination: Option<PeerAddress>) -> Self {
		Self {
			destination,
			source: None,
			expecting_reply: false,
			priority: Priority::Normal,
			network_layer_message: false,
		}
	}

	pub fn encode(&self, out: &mut Vec<u8>) -> Result {
		out.push(PROTOCOL_VERSION);

		let mut ctrl = self.priority as u8;

		if self.expecting_reply {
			ctrl |= CTRL_EXPECTING_REPLY;
		}

		if self.network_layer_message {
			ctrl |= CTRL_NETWORK_LAYER_MESSAGE;
		}

		if let Some(dest) = &self.destination {
			if dest.network == Some(0) {
				log::debug!("Destination network number must not be 0");
				return Err(());
			}

			ctrl |= CTRL_DEST_PRESENT;
		}

		if let Some(src) = &self.source {
			if matches!(src.network, Some(0) | Some(BROADCAST_NETWORK)) {
				log::debug!("Source network number must not be 0 or 0xFFFF");
				return Err(());
			}
		}

		if self.source.is_some() {
			ctrl |= CTRL_SRC_PRESENT;
		}

		out.push(ctrl);

		if let Some(dest) = &self.destination {
			let network = dest.network.unwrap_or(0);
			out.extend_from_slice(&network.to_be_bytes());

			if dest.is_broadcast() {
				out.push(0);
			} else {
				let bytes = dest.mac.to_bytes();
				out.push(bytes.len() as u8);
				out.extend_from_slice(&bytes);
			}
		}

		if let Some(src) = &self.source {
			let network = src.network.ok_or_else(|| log::debug!("Source address requires a network number"))?;
			out.extend_from_slice(&network.to_be_bytes());

			let bytes = src.mac.to_bytes();

			if bytes.is_empty() {
				log::debug!("Source address length must not be 0");
				return Err(());
			}

			out.push(bytes.len() as u8);
			out.extend_from_slice(&bytes);
		}

		if self.destination.is_some() {
			// Hop count: only carried alongside a destination address.
			out.push(255);
		}

		Ok(())
	}

	/// Decodes the NPDU header and returns it along with the offset of the APDU/network-message
	/// payload that follows.
	pub fn decode(buf: &[u8]) -> Result<(Self, usize)> {
		let &version = buf.first().ok_or_else(|| log::debug!("Buffer ended before NPDU version"))?;

		if version != PROTOCOL_VERSION {
			log::debug!("Unsupported NPDU protocol version {version}");
			return Err(());
		}

		let &ctrl = buf.get(1).ok_or_else(|| log::debug!("Buffer ended before NPDU control octet"))?;
		let mut pos = 2;

		let destination = if ctrl & CTRL_DEST_PRESENT != 0 {
			let (addr, next) = decode_address(buf, pos, true)?;
			pos = next;
			Some(addr)
		} else {
			None
		};

		let source = if ctrl & CTRL_SRC_PRESENT != 0 {
			let (addr, next) = decode_address(buf, pos, false)?;
			pos = next;

			if matches!(addr.network, Some(0) | Some(BROADCAST_NETWORK)) {
				log::debug!("Source network number must not be 0 or 0xFFFF");
				return Err(());
			}

			Some(addr)
		} else {
			None
		};

		if destination.is_some() {
			// Hop count octet.
			pos += 1;

			if pos > buf.len() {
				log::debug!("Buffer ended before hop count");
				return Err(());
			}
		}

		Ok((
			Self {
				destination,
				source,
				expecting_reply: ctrl & CTRL_EXPECTING_REPLY != 0,
				priority: Priority::from_bits(ctrl),
				network_layer_message: ctrl & CTRL_NETWORK_LAYER_MESSAGE != 0,
			},
			pos,
		))
	}
}

fn decode_address(buf: &[u8], pos: usize, allow_broadcast: bool) -> Result<(PeerAddress, usize)> {
	let bytes: [u8; 2] = buf
		.get(pos..pos + 2)
		.and_then(|s| s.try_into().ok())
		.ok_or_else(|| log::debug!("Buffer ended before network number"))?;
	let network = u16::from_be_bytes(bytes);

	let &len = buf.get(pos + 2).ok_or_else(|| log::debug!("Buffer ended before address length"))?;
	let mut next = pos + 3;

	if len == 0 {
		if !allow_broadcast {
			log::debug!("Source address length must not be 0");
			return Err(());
		}

		return Ok((PeerAddress::routed(network, Mac::from_bytes(&[0, 0, 0, 0, 0, 0]).unwrap()), next));
	}

	let mac_bytes = buf
		.get(next..next + len as usize)
		.ok_or_else(|| log::debug!("Buffer ended before MAC address"))?;
	next += len as usize;

	let mac = Mac::from_bytes(mac_bytes).ok_or_else(|| log::debug!("Unsupported MAC address length {len}"))?;

	Ok((PeerAddress::routed(network, mac), next))
}

#[cfg(test)]
mod tests {
	use core::net::{Ipv4Addr, SocketAddrV4};

	use super::*;

	fn mac() -> Mac {
		Mac(SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 5), 47808))
	}

	#[test]
	fn no_routing_fields_roundtrip() {
		let npdu = Npdu::application(None);
		let mut out = Vec::new();
		npdu.encode(&mut out).unwrap();

		let (decoded, pos) = Npdu::decode(&out).unwrap();
		assert_eq!(decoded, npdu);
		assert_eq!(pos, out.len());
	}

	#[test]
	fn destination_address_roundtrip() {
		let npdu = Npdu::application(Some(PeerAddress::routed(12, mac())));
		let mut out = Vec::new();
		npdu.encode(&mut out).unwrap();

		let (decoded, pos) = Npdu::decode(&out).unwrap();
		assert_eq!(decoded.destination, npdu.destination);
		assert_eq!(pos, out.len());
	}

	#[test]
	fn global_broadcast_destination() {
		let npdu = Npdu::application(Some(PeerAddress { network: Some(BROADCAST_NETWORK), mac: mac() }));
		let mut out = Vec::new();
		npdu.encode(&mut out).unwrap();

		let (decoded, _) = Npdu::decode(&out).unwrap();
		assert!(decoded.destination.unwrap().is_broadcast());
	}

	#[test]
	fn rejects_zero_source_network() {
		let npdu = Npdu { source: Some(PeerAddress::routed(0, mac())), ..Npdu::application(None) };
		let mut out = Vec::new();
		assert!(npdu.encode(&mut out).is_err());
	}
}
