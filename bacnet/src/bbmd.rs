//! BBMD (broadcast distribution) and foreign-device registration state.
//!
//! Both tables are bounded (128 entries apiece) and use the same bounded open-addressing map used
//! elsewhere for small, capacity-limited tables (peer maps, port maps).

use core::time::Duration;

use collections::map::{Key, Map};

use crate::address::Mac;
use crate::bvll::{BdtEntry, FdtEntry};

pub const MAX_BDT_ENTRIES: usize = 128;
pub const MAX_FDT_ENTRIES: usize = 128;

/// Grace period added to a foreign device's TTL before its registration is dropped, matching the
/// leeway most BBMD implementations give for a re-registration to arrive slightly late.
pub const FDT_GRACE: Duration = Duration::from_secs(30);

struct BdtRecord(BdtEntry);

impl Key for BdtRecord {
	type Type = Mac;

	fn key(&self) -> &Self::Type {
		&self.0.address
	}
}

struct FdtRecord {
	address: Mac,
	ttl: u16,
	/// Monotonic deadline (seconds since startup) after which this registration expires.
	expires_at: u32,
}

impl Key for FdtRecord {
	type Type = Mac;

	fn key(&self) -> &Self::Type {
		&self.address
	}
}

#[derive(Default)]
pub struct Tables {
	bdt: Map<BdtRecord, MAX_BDT_ENTRIES>,
	fdt: Map<FdtRecord, MAX_FDT_ENTRIES>,
}

impl Tables {
	pub fn write_bdt(&mut self, entries: Vec<BdtEntry>) -> bool {
		if entries.len() > MAX_BDT_ENTRIES {
			return false;
		}

		let mut fresh = Map::default();

		for entry in entries {
			fresh.insert_unique(&entry.address).insert(BdtRecord(entry));
		}

		self.bdt = fresh;
		true
	}

	pub fn read_bdt(&self) -> Vec<BdtEntry> {
		self.bdt.iter().map(|r| r.0).collect()
	}

	pub fn broadcast_peers(&self, skip: Mac) -> Vec<Mac> {
		self.bdt.iter().map(|r| r.0.address).filter(|a| *a != skip).collect()
	}

	/// Registers or refreshes a foreign device for `ttl` seconds, measured from `now_secs`.
	pub fn register_foreign_device(&mut self, address: Mac, ttl: u16, now_secs: u32) -> bool {
		let expires_at = now_secs.saturating_add(u32::from(ttl)).saturating_add(FDT_GRACE.as_secs() as u32);

		match self.fdt.find_entry(&address) {
			collections::map::Entry::Filled(mut f) => {
				f.ttl = ttl;
				f.expires_at = expires_at;
				true
			}
			collections::map::Entry::Empty(e) => {
				if self.fdt.len() >= MAX_FDT_ENTRIES {
					return false;
				}
				e.insert(FdtRecord { address, ttl, expires_at });
				true
			}
		}
	}

	pub fn delete_foreign_device(&mut self, address: Mac) {
		self.fdt.remove(&address);
	}

	/// Drops every foreign-device entry whose grace-extended TTL has elapsed.
	pub fn sweep_expired(&mut self, now_secs: u32) {
		self.fdt.retain(|r| r.expires_at > now_secs);
	}

	pub fn foreign_devices(&self, now_secs: u32) -> Vec<FdtEntry> {
		self.fdt
			.iter()
			.map(|r| FdtEntry {
				address: r.address,
				ttl: r.ttl,
				remaining: r.expires_at.saturating_sub(now_secs).min(u16::MAX as u32) as u16,
			})
			.collect()
	}
}

#[cfg(test)]
mod tests {
	use core::net::{Ipv4Addr, SocketAddrV4};

	use super::*;

	fn mac(n: u8) -> Mac {
		Mac(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, n), 47808))
	}

	#[test]
	fn foreign_device_registration_and_expiry() {
		let mut tables = Tables::default();
		assert!(tables.register_foreign_device(mac(1), 60, 0));
		assert_eq!(tables.foreign_devices(0).len(), 1);

		tables.sweep_expired(60 + 30 + 1);
		assert!(tables.foreign_devices(0).is_empty());
	}

	#[test]
	fn bdt_round_trip_and_broadcast_peers() {
		let mut tables = Tables::default();
		let entries = vec![
			BdtEntry { address: mac(1), mask: [255, 255, 255, 0] },
			BdtEntry { address: mac(2), mask: [255, 255, 255, 0] },
		];

		assert!(tables.write_bdt(entries.clone()));
		assert_eq!(tables.read_bdt().len(), 2);
		assert_eq!(tables.broadcast_peers(mac(1)), vec![mac(2)]);
	}

	#[test]
	fn bdt_rejects_oversize_tables() {
		let mut tables = Tables::default();
		let entries = (0..=MAX_BDT_ENTRIES).map(|i| BdtEntry { address: mac(i as u8), mask: [255; 4] }).collect();
		assert!(!tables.write_bdt(entries));
	}
}
