//! Server transaction state machine: suppresses duplicate confirmed requests by replaying the
//! cached response, and drives outbound segmented responses through the sliding window.
//!
//! Grounded on the same `HashMap`-of-in-flight-state shape as `tsm::client`, mirrored to the
//! receive side; the response cache purge timer follows `net/src/dns`'s retry-timer idiom.

use core::time::Duration;
use std::collections::HashMap;

use stakker::{Fwd, FixedTimerKey, CX};

use crate::address::PeerAddress;
use crate::apdu::{Apdu, ComplexAck, SegmentAck, SegmentInfo};
use crate::app::Device;
use crate::segmentation::Sender;

#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
	/// First time this `(source, invoke-id)` has been seen; proceed to handle the request.
	Fresh,
	/// A duplicate of a request whose response is cached; caller should retransmit it as-is.
	RetransmitCached(Vec<u8>),
	/// A duplicate of a request still being processed; drop it silently.
	StillProcessing,
}

struct Transaction {
	cached_response: Option<Vec<u8>>,
	expire: FixedTimerKey,
	sender: Option<Sender>,
	service_choice: u8,
}

pub struct ServerTsm {
	transmit: Fwd<(PeerAddress, Vec<u8>)>,
	pending: HashMap<(PeerAddress, u8), Transaction>,
	cache_lifetime: Duration,
}

impl ServerTsm {
	pub fn new(transmit: Fwd<(PeerAddress, Vec<u8>)>, cache_lifetime: Duration) -> Self {
		Self { transmit, pending: HashMap::new(), cache_lifetime }
	}

	pub fn admit(&mut self, cx: CX![Device], source: PeerAddress, invoke_id: u8, request_lifetime: Duration) -> Admission {
		let key = (source, invoke_id);

		if let Some(txn) = self.pending.get(&key) {
			return match &txn.cached_response {
				Some(bytes) => Admission::RetransmitCached(bytes.clone()),
				None => Admission::StillProcessing,
			};
		}

		let actor = cx.access_actor().clone();
		let expire = cx.after(request_lifetime, move |s| {
			actor.apply(s, move |this, _| {
				this.server_tsm.pending.remove(&(source, invoke_id));
			});
		});

		self.pending.insert(key, Transaction { cached_response: None, expire, sender: None, service_choice: 0 });
		Admission::Fresh
	}

	/// Records a completed (non-segmented) response for future duplicate suppression.
	pub fn complete(&mut self, cx: CX![Device], source: PeerAddress, invoke_id: u8, response: Vec<u8>) {
		let lifetime = self.cache_lifetime;
		self.replace_timer(cx, source, invoke_id, lifetime);

		if let Some(txn) = self.pending.get_mut(&(source, invoke_id)) {
			txn.cached_response = Some(response);
			txn.sender = None;
		}
	}

	fn replace_timer(&mut self, cx: CX![Device], source: PeerAddress, invoke_id: u8, lifetime: Duration) {
		let key = (source, invoke_id);

		if let Some(txn) = self.pending.get(&key) {
			cx.timer_del(txn.expire);
		}

		let actor = cx.access_actor().clone();
		let expire = cx.after(lifetime, move |s| {
			actor.apply(s, move |this, _| {
				this.server_tsm.pending.remove(&(source, invoke_id));
			});
		});

		self.pending.entry(key).or_insert_with(|| Transaction { cached_response: None, expire, sender: None, service_choice: 0 }).expire = expire;
	}

	/// Begins delivering a response too large for one APDU. Sends the first window immediately.
	pub fn begin_segmented_response(
		&mut self,
		cx: CX![Device],
		source: PeerAddress,
		invoke_id: u8,
		service_choice: u8,
		data: Vec<u8>,
		max_segment_size: usize,
		window_size: u8,
		request_lifetime: Duration,
	) {
		self.replace_timer(cx, source, invoke_id, request_lifetime);

		let mut sender = Sender::new(&data, max_segment_size, window_size);
		self.send_window(source, invoke_id, service_choice, &mut sender);

		if let Some(txn) = self.pending.get_mut(&(source, invoke_id)) {
			txn.sender = Some(sender);
			txn.service_choice = service_choice;
		}
	}

	pub fn on_segment_ack(&mut self, cx: CX![Device], source: PeerAddress, ack: SegmentAck) {
		let key = (source, ack.invoke_id);
		let Some(txn) = self.pending.get_mut(&key) else { return };
		let Some(mut sender) = txn.sender.take() else { return };
		let service_choice = txn.service_choice;

		let done = sender.on_ack(ack);

		if done {
			self.replace_timer(cx, source, ack.invoke_id, self.cache_lifetime);
			return;
		}

		self.send_window(source, ack.invoke_id, service_choice, &mut sender);

		if let Some(txn) = self.pending.get_mut(&key) {
			txn.sender = Some(sender);
		}
	}

	fn send_window(&mut self, destination: PeerAddress, invoke_id: u8, service_choice: u8, sender: &mut Sender) {
		let window_size = sender.window_size();

		for (sequence_number, is_last, chunk) in sender.window() {
			let mut frame = Vec::new();
			let ack = ComplexAck {
				segmented: true,
				more_follows: !is_last,
				invoke_id,
				segment: Some(SegmentInfo { sequence_number, proposed_window_size: window_size }),
				service_choice,
				service_data: chunk.to_vec(),
			};

			Apdu::ComplexAck(ack).encode(&mut frame).expect("complex ack encoding cannot fail");
			self.transmit.fwd((destination, frame));
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use core::net::{Ipv4Addr, SocketAddrV4};
	use std::cell::RefCell;
	use std::rc::Rc;
	use std::time::Instant;

	use stakker::{actor, call, ret_nop, Actor, Ret, Stakker};

	use crate::address::Mac;
	use crate::config::Config;

	fn harness() -> (Stakker, Actor<Device>, Instant) {
		let now = Instant::now();
		let mut s0 = Stakker::new(now);
		let s = &mut s0;
		let config = Config::new(1, "test-device").bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0));
		let device = actor!(s, Device::init(config), ret_nop!());
		s0.run(now, false);
		(s0, device, now)
	}

	fn peer(last_octet: u8) -> PeerAddress {
		PeerAddress::local(Mac(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, last_octet), 47808)))
	}

	fn admit(stakker: &mut Stakker, device: &Actor<Device>, now: Instant, source: PeerAddress, invoke_id: u8, lifetime: Duration) -> Admission {
		let result: Rc<RefCell<Option<Admission>>> = Rc::new(RefCell::new(None));
		let out = result.clone();
		call!([device], test_admit(source, invoke_id, lifetime, Ret::new(move |a| *out.borrow_mut() = Some(a))));
		stakker.run(now, false);
		result.borrow_mut().take().expect("admit did not reply")
	}

	#[test]
	fn admit_then_duplicate_is_still_processing() {
		let (mut stakker, device, now) = harness();
		let src = peer(9);

		assert_eq!(admit(&mut stakker, &device, now, src, 5, Duration::from_secs(1)), Admission::Fresh);
		assert_eq!(admit(&mut stakker, &device, now, src, 5, Duration::from_secs(1)), Admission::StillProcessing);
	}

	#[test]
	fn admit_replays_cached_response_for_completed_duplicate() {
		let (mut stakker, device, now) = harness();
		let src = peer(9);

		assert_eq!(admit(&mut stakker, &device, now, src, 6, Duration::from_secs(1)), Admission::Fresh);

		call!([device], test_complete(src, 6, vec![1, 2, 3]));
		stakker.run(now, false);

		assert_eq!(admit(&mut stakker, &device, now, src, 6, Duration::from_secs(1)), Admission::RetransmitCached(vec![1, 2, 3]));
	}

	#[test]
	fn admit_treats_distinct_invoke_ids_independently() {
		let (mut stakker, device, now) = harness();
		let src = peer(9);

		assert_eq!(admit(&mut stakker, &device, now, src, 1, Duration::from_secs(1)), Admission::Fresh);
		assert_eq!(admit(&mut stakker, &device, now, src, 2, Duration::from_secs(1)), Admission::Fresh);
	}
}
