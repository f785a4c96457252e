//! BACnet Virtual Link Layer framing: the 4-octet header that rides directly on UDP, plus the
//! BBMD/foreign-device messages it carries.

use core::net::SocketAddrV4;

use utils::error::*;

use crate::address::Mac;

pub const BVLL_TYPE: u8 = 0x81;

pub const FUNC_RESULT: u8 = 0x00;
pub const FUNC_WRITE_BDT: u8 = 0x01;
pub const FUNC_READ_BDT: u8 = 0x02;
pub const FUNC_READ_BDT_ACK: u8 = 0x03;
pub const FUNC_FORWARDED_NPDU: u8 = 0x04;
pub const FUNC_REGISTER_FOREIGN_DEVICE: u8 = 0x05;
pub const FUNC_READ_FDT: u8 = 0x06;
pub const FUNC_READ_FDT_ACK: u8 = 0x07;
pub const FUNC_DELETE_FDT_ENTRY: u8 = 0x08;
pub const FUNC_DISTRIBUTE_BROADCAST: u8 = 0x09;
pub const FUNC_ORIGINAL_UNICAST_NPDU: u8 = 0x0A;
pub const FUNC_ORIGINAL_BROADCAST_NPDU: u8 = 0x0B;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BdtEntry {
	pub address: Mac,
	/// Broadcast distribution mask, applied to the address to synthesize the directed-broadcast
	/// destination within that BBMD's own subnet.
	pub mask: [u8; 4],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FdtEntry {
	pub address: Mac,
	pub ttl: u16,
	pub remaining: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Bvll {
	Result(u16),
	WriteBdt(Vec<BdtEntry>),
	ReadBdt,
	ReadBdtAck(Vec<BdtEntry>),
	ForwardedNpdu { original: Mac, npdu: Vec<u8> },
	RegisterForeignDevice { ttl: u16 },
	ReadFdt,
	ReadFdtAck(Vec<FdtEntry>),
	DeleteFdtEntry(Mac),
	DistributeBroadcastToNetwork(Vec<u8>),
	OriginalUnicastNpdu(Vec<u8>),
	OriginalBroadcastNpdu(Vec<u8>),
}

impl Bvll {
	fn function(&self) -> u8 {
		match self {
			Bvll::Result(_) => FUNC_RESULT,
			Bvll::WriteBdt(_) => FUNC_WRITE_BDT,
			Bvll::ReadBdt => FUNC_READ_BDT,
			Bvll::ReadBdtAck(_) => FUNC_READ_BDT_ACK,
			Bvll::ForwardedNpdu { .. } => FUNC_FORWARDED_NPDU,
			Bvll::RegisterForeignDevice { .. } => FUNC_REGISTER_FOREIGN_DEVICE,
			Bvll::ReadFdt => FUNC_READ_FDT,
			Bvll::ReadFdtAck(_) => FUNC_READ_FDT_ACK,
			Bvll::DeleteFdtEntry(_) => FUNC_DELETE_FDT_ENTRY,
			Bvll::DistributeBroadcastToNetwork(_) => FUNC_DISTRIBUTE_BROADCAST,
			Bvll::OriginalUnicastNpdu(_) => FUNC_ORIGINAL_UNICAST_NPDU,
			Bvll::OriginalBroadcastNpdu(_) => FUNC_ORIGINAL_BROADCAST_NPDU,
		}
	}

	pub fn encode(&self) -> Vec<u8> {
		let mut body = Vec::new();

		match self {
			Bvll::Result(code) => body.extend_from_slice(&code.to_be_bytes()),
			Bvll::WriteBdt(entries) | Bvll::ReadBdtAck(entries) => {
				for e in entries {
					body.extend_from_slice(&e.address.to_bytes());
					body.extend_from_slice(&e.mask);
				}
			}
			Bvll::ReadBdt | Bvll::ReadFdt => {}
			Bvll::ForwardedNpdu { original, npdu } => {
				body.extend_from_slice(&original.to_bytes());
				body.extend_from_slice(npdu);
			}
			Bvll::RegisterForeignDevice { ttl } => body.extend_from_slice(&ttl.to_be_bytes()),
			Bvll::ReadFdtAck(entries) => {
				for e in entries {
					body.extend_from_slice(&e.address.to_bytes());
					body.extend_from_slice(&e.ttl.to_be_bytes());
					body.extend_from_slice(&e.remaining.to_be_bytes());
				}
			}
			Bvll::DeleteFdtEntry(mac) => body.extend_from_slice(&mac.to_bytes()),
			Bvll::DistributeBroadcastToNetwork(npdu) | Bvll::OriginalUnicastNpdu(npdu) | Bvll::OriginalBroadcastNpdu(npdu) => {
				body.extend_from_slice(npdu);
			}
		}

		let mut out = Vec::with_capacity(4 + body.len());
		out.push(BVLL_TYPE);
		out.push(self.function());
		out.extend_from_slice(&((4 + body.len()) as u16).to_be_bytes());
		out.extend_from_slice(&body);
		out
	}

	pub fn decode(buf: &[u8]) -> Result<Self> {
		let &ty = buf.first().ok_or_else(|| log::debug!("Empty BVLL frame"))?;

		if ty != BVLL_TYPE {
			log::debug!("Unrecognized BVLL type {ty}");
			return Err(());
		}

		let &function = buf.get(1).ok_or_else(|| log::debug!("Truncated BVLL header"))?;

		let len_bytes: [u8; 2] = buf.get(2..4).and_then(|s| s.try_into().ok()).ok_or_else(|| log::debug!("Truncated BVLL header"))?;
		let len = u16::from_be_bytes(len_bytes) as usize;

		if len != buf.len() {
			log::debug!("BVLL length field {len} does not match datagram length {}", buf.len());
			return Err(());
		}

		let body = &buf[4..];

		Ok(match function {
			FUNC_RESULT => Bvll::Result(u16::from_be_bytes(
				body.try_into().map_err(|_| log::debug!("Malformed BVLC-Result"))?,
			)),
			FUNC_WRITE_BDT => Bvll::WriteBdt(decode_bdt_entries(body)?),
			FUNC_READ_BDT => Bvll::ReadBdt,
			FUNC_READ_BDT_ACK => Bvll::ReadBdtAck(decode_bdt_entries(body)?),
			FUNC_FORWARDED_NPDU => {
				let mac = Mac::from_bytes(body.get(..6).ok_or_else(|| log::debug!("Truncated Forwarded-NPDU"))?)
					.ok_or_else(|| log::debug!("Invalid originating address"))?;
				Bvll::ForwardedNpdu { original: mac, npdu: body[6..].to_vec() }
			}
			FUNC_REGISTER_FOREIGN_DEVICE => {
				let bytes: [u8; 2] = body.try_into().map_err(|_| log::debug!("Malformed Register-Foreign-Device"))?;
				Bvll::RegisterForeignDevice { ttl: u16::from_be_bytes(bytes) }
			}
			FUNC_READ_FDT => Bvll::ReadFdt,
			FUNC_READ_FDT_ACK => {
				let mut entries = Vec::new();
				let mut chunks = body.chunks_exact(10);

				for chunk in &mut chunks {
					let address = Mac::from_bytes(&chunk[..6]).ok_or_else(|| log::debug!("Invalid FDT entry address"))?;
					let ttl = u16::from_be_bytes([chunk[6], chunk[7]]);
					let remaining = u16::from_be_bytes([chunk[8], chunk[9]]);
					entries.push(FdtEntry { address, ttl, remaining });
				}

				if !chunks.remainder().is_empty() {
					log::debug!("Trailing bytes in Read-Foreign-Device-Table-Ack");
					return Err(());
				}

				Bvll::ReadFdtAck(entries)
			}
			FUNC_DELETE_FDT_ENTRY => {
				Bvll::DeleteFdtEntry(Mac::from_bytes(body).ok_or_else(|| log::debug!("Invalid Delete-FDT-Entry address"))?)
			}
			FUNC_DISTRIBUTE_BROADCAST => Bvll::DistributeBroadcastToNetwork(body.to_vec()),
			FUNC_ORIGINAL_UNICAST_NPDU => Bvll::OriginalUnicastNpdu(body.to_vec()),
			FUNC_ORIGINAL_BROADCAST_NPDU => Bvll::OriginalBroadcastNpdu(body.to_vec()),
			other => {
				log::debug!("Unrecognized BVLL function {other}");
				return Err(());
			}
		})
	}
}

fn decode_bdt_entries(body: &[u8]) -> Result<Vec<BdtEntry>> {
	let mut entries = Vec::new();
	let mut chunks = body.chunks_exact(10);

	for chunk in &mut chunks {
		let address = Mac::from_bytes(&chunk[..6]).ok_or_else(|| log::debug!("Invalid BDT entry address"))?;
		let mask = chunk[6..10].try_into().unwrap();
		entries.push(BdtEntry { address, mask });
	}

	if !chunks.remainder().is_empty() {
		log::debug!("Trailing bytes in BDT entry list");
		return Err(());
	}

	Ok(entries)
}

pub fn addr_from_mac(mac: Mac) -> SocketAddrV4 {
	mac.0
}

#[cfg(test)]
mod tests {
	use core::net::Ipv4Addr;

	use super::*;

	fn mac(port: u16) -> Mac {
		Mac(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), port))
	}

	#[test]
	fn original_unicast_roundtrip() {
		let frame = Bvll::OriginalUnicastNpdu(vec![1, 2, 3, 4]);
		let bytes = frame.encode();
		assert_eq!(Bvll::decode(&bytes).unwrap(), frame);
	}

	#[test]
	fn register_foreign_device_roundtrip() {
		let frame = Bvll::RegisterForeignDevice { ttl: 300 };
		let bytes = frame.encode();
		assert_eq!(Bvll::decode(&bytes).unwrap(), frame);
	}

	#[test]
	fn bdt_roundtrip() {
		let frame = Bvll::WriteBdt(vec![BdtEntry { address: mac(47808), mask: [255, 255, 255, 0] }]);
		let bytes = frame.encode();
		assert_eq!(Bvll::decode(&bytes).unwrap(), frame);
	}

	#[test]
	fn forwarded_npdu_roundtrip() {
		let frame = Bvll::ForwardedNpdu { original: mac(47808), npdu: vec![1, 0, 0] };
		let bytes = frame.encode();
		assert_eq!(Bvll::decode(&bytes).unwrap(), frame);
	}

	#[test]
	fn length_mismatch_is_rejected() {
		let mut bytes = Bvll::OriginalUnicastNpdu(vec![1, 2, 3]).encode();
		bytes.push(0xFF);
		assert!(Bvll::decode(&bytes).is_err());
	}
}
