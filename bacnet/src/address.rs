//! Peer addressing. The local-link address for BACnet/IP is a 6-byte tuple: 4-byte IPv4 address
//! followed by a 2-byte big-endian UDP port.

use core::fmt;
use core::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

pub const BROADCAST_NETWORK: u16 = 0xFFFF;

/// A datalink-level (MAC) address: for BACnet/IP, an IPv4 socket address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Mac(pub SocketAddrV4);

impl Mac {
	pub fn to_bytes(self) -> [u8; 6] {
		let mut out = [0u8; 6];
		out[..4].copy_from_slice(&self.0.ip().octets());
		out[4..].copy_from_slice(&self.0.port().to_be_bytes());
		out
	}

	pub fn from_bytes(b: &[u8]) -> Option<Self> {
		if b.len() != 6 {
			return None;
		}

		let ip = Ipv4Addr::new(b[0], b[1], b[2], b[3]);
		let port = u16::from_be_bytes([b[4], b[5]]);
		Some(Mac(SocketAddrV4::new(ip, port)))
	}
}

impl From<SocketAddr> for Mac {
	fn from(addr: SocketAddr) -> Self {
		match addr {
			SocketAddr::V4(v4) => Mac(v4),
			SocketAddr::V6(_) => panic!("BACnet/IP only speaks IPv4"),
		}
	}
}

impl From<Mac> for SocketAddr {
	fn from(mac: Mac) -> Self {
		SocketAddr::V4(mac.0)
	}
}

impl fmt::Display for Mac {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// A full network-layer address: an optional remote network number plus the MAC used to reach it.
/// `network = None` means "directly attached" (no NPDU destination/source address is carried).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerAddress {
	pub network: Option<u16>,
	pub mac: Mac,
}

impl PeerAddress {
	pub fn local(mac: Mac) -> Self {
		Self { network: None, mac }
	}

	pub fn routed(network: u16, mac: Mac) -> Self {
		Self { network: Some(network), mac }
	}

	pub fn is_broadcast(&self) -> bool {
		self.network == Some(BROADCAST_NETWORK)
	}
}

impl From<SocketAddr> for PeerAddress {
	fn from(addr: SocketAddr) -> Self {
		Self::local(addr.into())
	}
}
