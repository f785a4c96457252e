//! Client transaction state machine: allocates invoke IDs, retransmits on timeout, correlates
//! replies back to the caller, and hands segmented complex-acks to the reassembly engine.
//!
//! Grounded on `net/src/dns/mod.rs`'s `Resolver`: a `HashMap` of in-flight requests keyed by a
//! request-local ID, each holding a `Ret<T>` completion callback and a `FixedTimerKey` retry
//! timer, retried from a `cx.after` closure that reaches back into the owning actor.

use core::time::Duration;
use std::collections::HashMap;

use log::debug;
use stakker::{Fwd, Ret, FixedTimerKey, CX};

use crate::address::PeerAddress;
use crate::apdu::{Apdu, ComplexAck, ConfirmedRequest, MaxApdu, MaxSegments, SegmentAck};
use crate::app::Device;
use crate::error::{AbortReason, BacnetError, HandlerError, RejectReason};
use crate::segmentation::{Reassembly, SegmentOutcome};

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
	Simple,
	Complex { service_choice: u8, service_data: Vec<u8> },
	Failed(HandlerError),
}

impl From<BacnetError> for Outcome {
	fn from(e: BacnetError) -> Self {
		Outcome::Failed(e.into())
	}
}

struct Transaction {
	service_choice: u8,
	frame: Vec<u8>,
	timeout: Duration,
	retries_left: u8,
	retry: FixedTimerKey,
	ret: Ret<Outcome>,
	reassembly: Option<Reassembly>,
}

/// Keyed by `(destination, invoke-id)`, the identifying pair for a client transaction record.
pub struct ClientTsm {
	transmit: Fwd<(PeerAddress, Vec<u8>)>,
	pending: HashMap<(PeerAddress, u8), Transaction>,
}

impl ClientTsm {
	pub fn new(transmit: Fwd<(PeerAddress, Vec<u8>)>) -> Self {
		Self { transmit, pending: HashMap::new() }
	}

	fn allocate_invoke_id(&self, destination: PeerAddress) -> Option<u8> {
		(0..=255u16).map(|n| n as u8).find(|id| !self.pending.contains_key(&(destination, *id)))
	}

	/// Sends a (possibly segmented, if `request.segmented` is set by the caller) confirmed
	/// request and arranges for `ret` to fire once the transaction completes.
	#[allow(clippy::too_many_arguments)]
	pub fn request(
		&mut self,
		cx: CX![Device],
		destination: PeerAddress,
		service_choice: u8,
		service_data: Vec<u8>,
		max_apdu: MaxApdu,
		segmented_response_accepted: bool,
		timeout: Duration,
		retries: u8,
		ret: Ret<Outcome>,
	) {
		let Some(invoke_id) = self.allocate_invoke_id(destination) else {
			ret.ret(Outcome::Failed(AbortReason::OutOfResources.into()));
			return;
		};

		let apdu = Apdu::ConfirmedRequest(ConfirmedRequest {
			segmented: false,
			more_follows: false,
			segmented_response_accepted,
			max_segments: MaxSegments::Limit(crate::apdu::MAX_SEGMENTS_UNBOUNDED_CAP),
			max_apdu,
			invoke_id,
			segment: None,
			service_choice,
			service_data,
		});

		let mut frame = Vec::new();
		if apdu.encode(&mut frame).is_err() {
			ret.ret(Outcome::Failed(AbortReason::Other.into()));
			return;
		}

		self.transmit.fwd((destination, frame.clone()));

		let actor = cx.access_actor().clone();
		let retry = cx.after(timeout, move |s| {
			actor.apply(s, move |this, cx| this.client_tsm.on_timeout(cx, destination, invoke_id));
		});

		self.pending.insert(
			(destination, invoke_id),
			Transaction { service_choice, frame, timeout, retries_left: retries, retry, ret, reassembly: None },
		);
	}

	fn on_timeout(&mut self, cx: CX![Device], destination: PeerAddress, invoke_id: u8) {
		let Some(txn) = self.pending.get_mut(&(destination, invoke_id)) else { return };

		if txn.retries_left == 0 {
			let txn = self.pending.remove(&(destination, invoke_id)).unwrap();
			txn.ret.ret(Outcome::Failed(AbortReason::TsmTimeout.into()));
			return;
		}

		debug!("Retrying confirmed request to {destination:?} (invoke id {invoke_id})");

		txn.retries_left -= 1;
		self.transmit.fwd((destination, txn.frame.clone()));

		let timeout = txn.timeout;
		let actor = cx.access_actor().clone();
		txn.retry = cx.after(timeout, move |s| {
			actor.apply(s, move |this, cx| this.client_tsm.on_timeout(cx, destination, invoke_id));
		});
	}

	fn complete(&mut self, cx: &mut stakker::Cx<Device>, destination: PeerAddress, invoke_id: u8, outcome: Outcome) {
		if let Some(txn) = self.pending.remove(&(destination, invoke_id)) {
			cx.timer_del(txn.retry);
			txn.ret.ret(outcome);
		}
	}

	pub fn on_simple_ack(&mut self, cx: CX![Device], source: PeerAddress, invoke_id: u8) {
		self.complete(cx, source, invoke_id, Outcome::Simple);
	}

	pub fn on_complex_ack(&mut self, cx: CX![Device], source: PeerAddress, ack: ComplexAck) {
		if !ack.segmented {
			self.complete(cx, source, ack.invoke_id, Outcome::Complex { service_choice: ack.service_choice, service_data: ack.service_data });
			return;
		}

		let Some(seg) = ack.segment else {
			self.complete(cx, source, ack.invoke_id, Outcome::Failed(AbortReason::Other.into()));
			return;
		};

		let Some(txn) = self.pending.get_mut(&(source, ack.invoke_id)) else { return };
		let reassembly = txn.reassembly.get_or_insert_with(Reassembly::default);

		match reassembly.accept(seg.sequence_number, ack.more_follows, &ack.service_data) {
			SegmentOutcome::Continue => {
				self.transmit.fwd((
					source,
					encode_segment_ack(ack.invoke_id, false, seg.sequence_number, seg.proposed_window_size),
				));
			}
			SegmentOutcome::Complete(data) => {
				self.transmit.fwd((
					source,
					encode_segment_ack(ack.invoke_id, false, seg.sequence_number, seg.proposed_window_size),
				));
				self.complete(cx, source, ack.invoke_id, Outcome::Complex { service_choice: ack.service_choice, service_data: data });
			}
			SegmentOutcome::Reject => {
				self.complete(cx, source, ack.invoke_id, Outcome::Failed(AbortReason::Other.into()));
			}
		}
	}

	pub fn on_error(&mut self, cx: CX![Device], source: PeerAddress, invoke_id: u8, error: BacnetError) {
		self.complete(cx, source, invoke_id, Outcome::Failed(error.into()));
	}

	pub fn on_reject(&mut self, cx: CX![Device], source: PeerAddress, invoke_id: u8, reason: RejectReason) {
		self.complete(cx, source, invoke_id, Outcome::Failed(reason.into()));
	}

	pub fn on_abort(&mut self, cx: CX![Device], source: PeerAddress, invoke_id: u8, reason: AbortReason) {
		self.complete(cx, source, invoke_id, Outcome::Failed(reason.into()));
	}
}

fn encode_segment_ack(invoke_id: u8, negative_ack: bool, sequence_number: u8, window_size: u8) -> Vec<u8> {
	let mut out = Vec::new();
	Apdu::SegmentAck(SegmentAck { negative_ack, server_origin: false, invoke_id, sequence_number, actual_window_size: window_size })
		.encode(&mut out)
		.expect("SegmentACK encoding cannot fail");
	out
}

#[cfg(test)]
mod tests {
	use super::*;
	use core::net::{Ipv4Addr, SocketAddrV4};
	use std::cell::RefCell;
	use std::rc::Rc;
	use std::time::Instant;

	use stakker::{actor, call, ret_nop, Actor, Stakker};

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

	fn request(
		stakker: &mut Stakker,
		device: &Actor<Device>,
		now: Instant,
		destination: PeerAddress,
		timeout: Duration,
		retries: u8,
	) -> Rc<RefCell<Option<Outcome>>> {
		let result: Rc<RefCell<Option<Outcome>>> = Rc::new(RefCell::new(None));
		let out = result.clone();
		call!([device], test_request(destination, timeout, retries, Ret::new(move |o| *out.borrow_mut() = Some(o))));
		stakker.run(now, false);
		result
	}

	#[test]
	fn invoke_ids_are_unique_until_exhausted() {
		let (mut stakker, device, now) = harness();
		let dest = peer(9);

		// Fill every invoke id for this destination; each concurrent request gets a distinct one.
		let pending: Vec<_> = (0..=255).map(|_| request(&mut stakker, &device, now, dest, Duration::from_secs(30), 0)).collect();
		assert!(pending.iter().all(|r| r.borrow().is_none()));

		// No invoke id is left to allocate for a further concurrent request to the same destination.
		let exhausted = request(&mut stakker, &device, now, dest, Duration::from_secs(30), 0);
		match exhausted.borrow().as_ref().unwrap() {
			Outcome::Failed(_) => {}
			other => panic!("expected allocation failure, got {other:?}"),
		}
	}

	#[test]
	fn timeout_retries_then_fails_once_retries_are_exhausted() {
		let (mut stakker, device, now) = harness();
		let dest = peer(10);

		let result = request(&mut stakker, &device, now, dest, Duration::from_millis(50), 1);
		assert!(result.borrow().is_none());

		// First timeout: one retry left, so the transaction is still pending.
		let t1 = now + Duration::from_millis(60);
		stakker.run(t1, false);
		assert!(result.borrow().is_none());

		// Second timeout: retries exhausted, the caller is notified of failure.
		let t2 = t1 + Duration::from_millis(60);
		stakker.run(t2, false);
		match result.borrow().as_ref().unwrap() {
			Outcome::Failed(_) => {}
			other => panic!("expected a timeout failure, got {other:?}"),
		}
	}
}
