//! Segment splitting/reassembly: the pure data-structure half of the sliding-window SegmentACK
//! protocol. Owned by a client or server transaction record; the surrounding TSM drives the
//! actual transmissions and timers.
//!
//! Grounded on `net/src/ip/fragment.rs`'s ordered-insert-then-check-contiguity reassembly shape,
//! adapted from IP's unordered fragment arrival to BACnet's windowed-but-still-lossy segment
//! arrival.

use crate::apdu::SegmentAck;

/// Reassembly cap; also an upper bound on `Sender`'s segment count given the largest supported
/// APDU payload.
pub const MAX_REASSEMBLY_BYTES: usize = 1 << 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentOutcome {
	/// Segment accepted, more expected.
	Continue,
	/// Final segment accepted; carries the full reassembled payload.
	Complete(Vec<u8>),
	/// Out-of-order or would exceed the byte cap; caller should abort the transaction.
	Reject,
}

/// Receive-side contiguous reassembly. Segments must arrive in sequence order (the sender only
/// advances its window on ACK, so gaps mean a protocol violation rather than ordinary loss).
#[derive(Default)]
pub struct Reassembly {
	buffer: Vec<u8>,
	next_sequence: u8,
}

impl Reassembly {
	pub fn accept(&mut self, sequence_number: u8, more_follows: bool, data: &[u8]) -> SegmentOutcome {
		if sequence_number != self.next_sequence {
			log::debug!("Out-of-order segment {sequence_number}, expected {}", self.next_sequence);
			return SegmentOutcome::Reject;
		}

		if self.buffer.len() + data.len() > MAX_REASSEMBLY_BYTES {
			log::debug!("Reassembly buffer would exceed {MAX_REASSEMBLY_BYTES} bytes");
			return SegmentOutcome::Reject;
		}

		self.buffer.extend_from_slice(data);
		self.next_sequence = self.next_sequence.wrapping_add(1);

		if more_follows {
			SegmentOutcome::Continue
		} else {
			SegmentOutcome::Complete(core::mem::take(&mut self.buffer))
		}
	}

	pub fn last_sequence(&self) -> u8 {
		self.next_sequence.wrapping_sub(1)
	}
}

/// Send-side windowed segmentation: splits a payload into fixed-size segments up front and tracks
/// which have been acknowledged.
pub struct Sender {
	segments: Vec<Vec<u8>>,
	window_size: u8,
	next_to_send: u8,
}

impl Sender {
	pub fn new(payload: &[u8], max_segment_size: usize, window_size: u8) -> Self {
		let segments = payload.chunks(max_segment_size.max(1)).map(<[u8]>::to_vec).collect();
		Self { segments, window_size: window_size.max(1), next_to_send: 0 }
	}

	pub fn total_segments(&self) -> usize {
		self.segments.len()
	}

	pub fn window_size(&self) -> u8 {
		self.window_size
	}

	/// The segments within the current window still needing transmission: `(sequence, is_last, bytes)`.
	pub fn window(&self) -> Vec<(u8, bool, &[u8])> {
		(0..self.window_size)
			.filter_map(|i| {
				let seq = self.next_to_send.wrapping_add(i);
				let idx = seq as usize;
				(idx < self.segments.len()).then(|| (seq, idx + 1 == self.segments.len(), self.segments[idx].as_slice()))
			})
			.collect()
	}

	/// Applies an incoming `SegmentACK`, advancing the window (or rewinding it on NAK). Returns
	/// `true` once every segment has been acknowledged.
	pub fn on_ack(&mut self, ack: SegmentAck) -> bool {
		self.window_size = self.window_size.min(ack.actual_window_size.max(1));

		self.next_to_send = if ack.negative_ack { ack.sequence_number } else { ack.sequence_number.wrapping_add(1) };

		self.next_to_send as usize >= self.segments.len()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn ack(seq: u8, nak: bool) -> SegmentAck {
		SegmentAck { negative_ack: nak, server_origin: false, invoke_id: 1, sequence_number: seq, actual_window_size: 4 }
	}

	#[test]
	fn reassembly_accepts_in_order_segments() {
		let mut r = Reassembly::default();
		assert_eq!(r.accept(0, true, b"abc"), SegmentOutcome::Continue);
		assert_eq!(r.accept(1, false, b"def"), SegmentOutcome::Complete(b"abcdef".to_vec()));
	}

	#[test]
	fn reassembly_rejects_out_of_order() {
		let mut r = Reassembly::default();
		assert_eq!(r.accept(1, false, b"def"), SegmentOutcome::Reject);
	}

	#[test]
	fn reassembly_rejects_oversize_transfer() {
		let mut r = Reassembly::default();
		let chunk = vec![0u8; MAX_REASSEMBLY_BYTES];
		assert_eq!(r.accept(0, true, &chunk), SegmentOutcome::Continue);
		assert_eq!(r.accept(1, false, &[0u8]), SegmentOutcome::Reject);
	}

	#[test]
	fn sender_splits_and_advances_window() {
		let payload = vec![0xAAu8; 10];
		let mut sender = Sender::new(&payload, 4, 2);
		assert_eq!(sender.total_segments(), 3);

		let window = sender.window();
		assert_eq!(window.len(), 2);
		assert_eq!(window[0].0, 0);
		assert!(!window[0].1);

		assert!(!sender.on_ack(ack(1, false)));
		let window = sender.window();
		assert_eq!(window[0].0, 2);
		assert!(window[0].1);

		assert!(sender.on_ack(ack(2, false)));
	}

	#[test]
	fn negative_ack_rewinds_window() {
		let payload = vec![0xAAu8; 10];
		let mut sender = Sender::new(&payload, 4, 3);
		sender.on_ack(ack(2, false));
		assert!(sender.window().is_empty());

		sender.on_ack(ack(1, true));
		let window = sender.window();
		assert_eq!(window[0].0, 1);
	}
}
