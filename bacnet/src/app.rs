//! The application-layer orchestrator: a single `stakker` actor owning the UDP socket, the
//! object database, and both transaction state machines, tying every other module in this crate
//! together into a running device.
//!
//! Grounded on `wireguard::Wireguard`: one actor owning the socket and every piece of session
//! state, `init` doing fallible setup behind `.ok_or(...)?` and handing the read side to
//! `fwd_to!`. Swapped `runtime::Io`'s connected stream for `runtime::udp::Socket` - BACnet/IP
//! talks to many peers and to the subnet broadcast address off one socket, not a single peer.

use core::net::{SocketAddr, SocketAddrV4};
use core::time::Duration;
use std::collections::HashMap;
use std::time::Instant;

use collections::bytes::Slice;
use log::{debug, error, warn};
use stakker::{fwd_to, ret_to, CX};

use crate::address::{Mac, PeerAddress};
use crate::apdu::{Apdu, ComplexAck, ConfirmedRequest, ConfirmedServiceChoice, MaxApdu, UnconfirmedServiceChoice};
use crate::bbmd;
use crate::bvll::Bvll;
use crate::config::{passwords_match, Config};
use crate::cov;
use crate::error::{AbortReason, BacnetError, ErrorClass, ErrorCode, HandlerError, RejectReason};
use crate::npdu::Npdu;
use crate::object::{Database, Object};
use crate::object_id::{object_type, ObjectId};
use crate::primitive::Primitive;
use crate::property::{id as prop, PropertyValue};
use crate::services::{
	CovNotification, DeviceCommunicationControl, IAm, IHave, ObjectSelector, ReadAccessResult, ReadPropertyMultipleAck,
	ReadPropertyMultipleRequest, ReadPropertyRequest, ReinitializeDevice, SubscribeCovRequest, WhoHas, WhoIs,
	WritePropertyMultipleRequest, WritePropertyRequest,
};
use crate::tsm::client::{ClientTsm, Outcome};
use crate::tsm::server::{Admission, ServerTsm};

/// Rough byte budget an outbound response's own APDU header (PDU type, invoke id, service
/// choice, optional segment header) eats into `max_apdu` before the service payload starts.
const RESPONSE_HEADER_ROOM: usize = 5;
const SEGMENT_HEADER_ROOM: usize = 3;

enum ServiceAck {
	Simple,
	Complex { service_choice: u8, data: Vec<u8> },
}

pub struct Device {
	socket: runtime::udp::Socket,
	config: Config,
	db: Database,
	cov: cov::Registry,
	bdt: bbmd::Tables,
	client_tsm: ClientTsm,
	server_tsm: ServerTsm,
	who_is_collectors: HashMap<u64, (Option<u32>, Option<u32>, Vec<IAm>)>,
	next_collector: u64,
	communication_enabled: bool,
	start: Instant,
}

impl Device {
	pub fn init(cx: CX![], config: Config) -> Option<Self> {
		let recv_fwd = fwd_to!([cx], recv() as (SocketAddr, Slice));
		let socket = runtime::udp::Socket::bind(SocketAddr::V4(config.bind_address), recv_fwd)
			.ok_or(|()| error!("Failed to bind BACnet/IP socket on {}", config.bind_address))?;
		socket.set_broadcast(true).ok_or(|()| error!("Failed to enable broadcast on BACnet/IP socket"))?;

		let device_id = ObjectId::new(object_type::DEVICE, config.device_instance);
		let mut db = Database::new(device_id, config.device_name.clone());
		bootstrap_device_object(&mut db, device_id, &config);

		let transmit_fwd = fwd_to!([cx], transmit() as (PeerAddress, Vec<u8>));
		let client_tsm = ClientTsm::new(transmit_fwd.clone());
		let server_tsm = ServerTsm::new(transmit_fwd, config.apdu_timeout);

		let mut device = Self {
			socket,
			config,
			db,
			cov: cov::Registry::default(),
			bdt: bbmd::Tables::default(),
			client_tsm,
			server_tsm,
			who_is_collectors: HashMap::new(),
			next_collector: 0,
			communication_enabled: true,
			start: cx.now(),
		};

		device.schedule_sweep(cx);
		device.schedule_foreign_device_registration(cx);

		Some(device)
	}
}

fn bootstrap_device_object(db: &mut Database, device_id: ObjectId, config: &Config) {
	let device = db.get_mut(device_id).expect("Database::new always creates the device object");

	device.set(prop::VENDOR_NAME, PropertyValue::Single(Primitive::CharacterString(config.vendor_name.clone())));
	device.set(prop::VENDOR_IDENTIFIER, PropertyValue::Single(Primitive::Unsigned(u64::from(config.vendor_id))));
	device.set(prop::MODEL_NAME, PropertyValue::Single(Primitive::CharacterString(config.model_name.clone())));
	device.set(prop::FIRMWARE_REVISION, PropertyValue::Single(Primitive::CharacterString(config.firmware_revision.clone())));
	device.set(prop::APPLICATION_SOFTWARE_VERSION, PropertyValue::Single(Primitive::CharacterString(env!("CARGO_PKG_VERSION").into())));
	device.set(prop::PROTOCOL_VERSION, PropertyValue::Single(Primitive::Unsigned(1)));
	device.set(prop::PROTOCOL_REVISION, PropertyValue::Single(Primitive::Unsigned(19)));
	device.set(prop::MAX_APDU_LENGTH_ACCEPTED, PropertyValue::Single(Primitive::Unsigned(u64::from(config.max_apdu.0))));
	// 1 = segmented-transmit: this device sends segmented complex acks but never accepts a
	// segmented confirmed request (see `handle_confirmed_request`'s `req.segmented` check).
	device.set(prop::SEGMENTATION_SUPPORTED, PropertyValue::Single(Primitive::Enumerated(1)));
	device.set(prop::APDU_TIMEOUT, PropertyValue::Single(Primitive::Unsigned(config.apdu_timeout.as_millis() as u64)));
	device.set(prop::NUMBER_OF_APDU_RETRIES, PropertyValue::Single(Primitive::Unsigned(u64::from(config.apdu_retries))));
	device.set(prop::SYSTEM_STATUS, PropertyValue::Single(Primitive::Enumerated(0)));
}

fn check_password(expected: Option<&str>, candidate: Option<&str>) -> Result<(), HandlerError> {
	match (expected, candidate) {
		(None, _) => Ok(()),
		(Some(expected), Some(candidate)) if passwords_match(candidate, expected) => Ok(()),
		(Some(_), _) => Err(BacnetError::new(ErrorClass::Security, ErrorCode::PasswordFailure).into()),
	}
}

impl Device {
	fn now_secs(&self, cx: CX![]) -> u32 {
		(cx.now() - self.start).as_secs() as u32
	}

	fn device_id(&self) -> ObjectId {
		ObjectId::new(object_type::DEVICE, self.config.device_instance)
	}

	fn global_broadcast(&self) -> PeerAddress {
		PeerAddress {
			network: Some(crate::address::BROADCAST_NETWORK),
			mac: Mac(SocketAddrV4::new(self.config.broadcast_address, self.config.bind_address.port())),
		}
	}

	fn socket_addr_for(&self, destination: PeerAddress) -> SocketAddr {
		if destination.is_broadcast() {
			SocketAddr::V4(SocketAddrV4::new(self.config.broadcast_address, self.config.bind_address.port()))
		} else {
			SocketAddr::from(destination.mac)
		}
	}

	fn schedule_sweep(&mut self, cx: CX![]) {
		let actor = cx.access_actor().clone();
		cx.after(crate::config::DEFAULT_COV_LIFETIME_SWEEP_INTERVAL, move |s| {
			actor.apply(s, |this, cx| this.sweep(cx));
		});
	}

	fn sweep(&mut self, cx: CX![]) {
		let now = self.now_secs(cx);
		self.cov.sweep(now);
		self.bdt.sweep_expired(now);
		self.schedule_sweep(cx);
	}

	fn schedule_foreign_device_registration(&mut self, cx: CX![]) {
		if let Some(bbmd) = self.config.foreign_device_bbmd {
			self.register_with_bbmd(cx, bbmd);
		}
	}

	fn register_with_bbmd(&mut self, cx: CX![], bbmd: SocketAddrV4) {
		let ttl = self.config.foreign_device_lifetime.as_secs().min(u64::from(u16::MAX)) as u16;
		let frame = Bvll::RegisterForeignDevice { ttl }.encode();

		if self.socket.send_to(SocketAddr::V4(bbmd), frame).is_err() {
			error!("Failed to send foreign device registration to {bbmd}");
		}

		let reregister_after = self.config.foreign_device_lifetime / crate::config::DEFAULT_FOREIGN_DEVICE_REREGISTER_FRACTION;
		let actor = cx.access_actor().clone();
		cx.after(reregister_after, move |s| {
			actor.apply(s, move |this, cx| this.register_with_bbmd(cx, bbmd));
		});
	}

	// ---- outbound framing ----

	fn transmit(&mut self, _cx: CX![], destination: PeerAddress, apdu_bytes: Vec<u8>) {
		let npdu = Npdu::application(destination.network.is_some().then_some(destination));
		let mut frame = Vec::new();

		if npdu.encode(&mut frame).is_err() {
			error!("Failed to encode NPDU header for {destination:?}");
			return;
		}

		frame.extend_from_slice(&apdu_bytes);

		let bvll = if destination.is_broadcast() {
			Bvll::OriginalBroadcastNpdu(frame)
		} else {
			Bvll::OriginalUnicastNpdu(frame)
		};

		let addr = self.socket_addr_for(destination);
		if self.socket.send_to(addr, bvll.encode()).is_err() {
			error!("Failed to send frame to {addr}");
		}
	}

	fn send_unconfirmed(&mut self, cx: CX![], destination: PeerAddress, service_choice: u8, data: Vec<u8>) {
		let apdu = Apdu::UnconfirmedRequest { service_choice, service_data: data };
		let mut frame = Vec::new();

		if apdu.encode(&mut frame).is_err() {
			error!("Failed to encode unconfirmed request (service choice {service_choice})");
			return;
		}

		self.transmit(cx, destination, frame);
	}

	// ---- inbound framing ----

	fn recv(&mut self, cx: CX![], source: SocketAddr, buf: Slice) {
		let bvll = match Bvll::decode(&buf) {
			Ok(b) => b,
			Err(()) => return warn!("Dropping malformed BVLL frame from {source}"),
		};

		self.handle_bvll(cx, source, Mac::from(source), bvll);
	}

	fn handle_bvll(&mut self, cx: CX![], physical_source: SocketAddr, mac: Mac, bvll: Bvll) {
		match bvll {
			Bvll::OriginalUnicastNpdu(npdu) | Bvll::OriginalBroadcastNpdu(npdu) => self.handle_npdu(cx, physical_source, mac, &npdu),
			Bvll::ForwardedNpdu { original, npdu } => self.handle_npdu(cx, physical_source, original, &npdu),
			Bvll::RegisterForeignDevice { ttl } => {
				let now = self.now_secs(cx);
				let ok = self.bdt.register_foreign_device(mac, ttl, now);
				self.send_bvll_result(physical_source, ok);
			}
			Bvll::ReadBdt => {
				let entries = self.bdt.read_bdt();
				self.send_bvll_raw(physical_source, Bvll::ReadBdtAck(entries));
			}
			Bvll::WriteBdt(entries) => {
				let ok = self.bdt.write_bdt(entries);
				self.send_bvll_result(physical_source, ok);
			}
			Bvll::ReadFdt => {
				let now = self.now_secs(cx);
				let entries = self.bdt.foreign_devices(now);
				self.send_bvll_raw(physical_source, Bvll::ReadFdtAck(entries));
			}
			Bvll::DeleteFdtEntry(addr) => {
				self.bdt.delete_foreign_device(addr);
				self.send_bvll_result(physical_source, true);
			}
			Bvll::DistributeBroadcastToNetwork(npdu) => self.handle_distribute_broadcast(cx, mac, npdu),
			Bvll::Result(code) => debug!("BVLC-Result {code} from {physical_source}"),
			Bvll::ReadBdtAck(_) | Bvll::ReadFdtAck(_) => debug!("Unsolicited BBMD table reply from {physical_source} ignored"),
		}
	}

	fn send_bvll_result(&self, dest: SocketAddr, ok: bool) {
		let code = if ok { 0x0000 } else { 0x0010 };
		if self.socket.send_to(dest, Bvll::Result(code).encode()).is_err() {
			error!("Failed to send BVLC-Result to {dest}");
		}
	}

	fn send_bvll_raw(&self, dest: SocketAddr, bvll: Bvll) {
		if self.socket.send_to(dest, bvll.encode()).is_err() {
			error!("Failed to send BVLL reply to {dest}");
		}
	}

	fn handle_distribute_broadcast(&mut self, cx: CX![], origin: Mac, npdu: Vec<u8>) {
		let local_broadcast = SocketAddr::V4(SocketAddrV4::new(self.config.broadcast_address, self.config.bind_address.port()));
		let forwarded = Bvll::ForwardedNpdu { original: origin, npdu: npdu.clone() };

		if self.socket.send_to(local_broadcast, forwarded.encode()).is_err() {
			error!("Failed to rebroadcast Distribute-Broadcast-To-Network locally");
		}

		for peer in self.bdt.broadcast_peers(origin) {
			if self.socket.send_to(SocketAddr::from(peer), forwarded.encode()).is_err() {
				error!("Failed to forward Distribute-Broadcast-To-Network to BDT peer {peer}");
			}
		}

		self.handle_npdu(cx, SocketAddr::from(origin), origin, &npdu);
	}

	fn handle_npdu(&mut self, cx: CX![], physical_source: SocketAddr, mac: Mac, buf: &[u8]) {
		let (npdu, offset) = match Npdu::decode(buf) {
			Ok(v) => v,
			Err(()) => return warn!("Dropping datagram from {physical_source}: malformed NPDU"),
		};

		if npdu.network_layer_message {
			debug!("Dropping network-layer message from {physical_source}");
			return;
		}

		let source = npdu.source.unwrap_or_else(|| PeerAddress::local(mac));

		let apdu = match Apdu::decode(&buf[offset..]) {
			Ok(a) => a,
			Err(()) => return warn!("Dropping datagram from {source:?}: malformed APDU"),
		};

		self.dispatch_apdu(cx, source, apdu);
	}

	fn dispatch_apdu(&mut self, cx: CX![], source: PeerAddress, apdu: Apdu) {
		match apdu {
			Apdu::ConfirmedRequest(req) => self.handle_confirmed_request(cx, source, req),
			Apdu::UnconfirmedRequest { service_choice, service_data } => self.handle_unconfirmed_request(cx, source, service_choice, &service_data),
			Apdu::SimpleAck { invoke_id, .. } => self.client_tsm.on_simple_ack(cx, source, invoke_id),
			Apdu::ComplexAck(ack) => self.client_tsm.on_complex_ack(cx, source, ack),
			Apdu::SegmentAck(ack) => self.server_tsm.on_segment_ack(cx, source, ack),
			Apdu::Error(e) => self.client_tsm.on_error(cx, source, e.invoke_id, e.error),
			Apdu::Reject(r) => self.client_tsm.on_reject(cx, source, r.invoke_id, r.reason),
			Apdu::Abort(a) => self.client_tsm.on_abort(cx, source, a.invoke_id, a.reason),
		}
	}

	// ---- confirmed requests ----

	fn handle_confirmed_request(&mut self, cx: CX![], source: PeerAddress, req: ConfirmedRequest) {
		match self.server_tsm.admit(cx, source, req.invoke_id, self.config.apdu_timeout) {
			Admission::StillProcessing => {}
			Admission::RetransmitCached(bytes) => self.transmit(cx, source, bytes),
			Admission::Fresh => {
				let is_dcc = req.service_choice == ConfirmedServiceChoice::DeviceCommunicationControl as u8;

				if !self.communication_enabled && !is_dcc {
					debug!("Dropping confirmed request from {source:?}: communication disabled");
					return;
				}

				let outcome = if req.segmented {
					Err(HandlerError::Abort(AbortReason::SegmentationNotSupported))
				} else {
					self.dispatch_confirmed_service(cx, source, req.service_choice, &req.service_data)
				};

				self.respond_confirmed(cx, source, req.invoke_id, req.max_apdu, req.segmented_response_accepted, outcome);
			}
		}
	}

	fn dispatch_confirmed_service(&mut self, cx: CX![], source: PeerAddress, service_choice: u8, data: &[u8]) -> Result<ServiceAck, HandlerError> {
		let Some(choice) = ConfirmedServiceChoice::from_code(service_choice) else {
			return Err(HandlerError::Reject(RejectReason::UnrecognizedService));
		};

		match choice {
			ConfirmedServiceChoice::ReadProperty => self.service_read_property(data),
			ConfirmedServiceChoice::WriteProperty => self.service_write_property(cx, data),
			ConfirmedServiceChoice::ReadPropertyMultiple => self.service_read_property_multiple(data),
			ConfirmedServiceChoice::WritePropertyMultiple => self.service_write_property_multiple(cx, data),
			ConfirmedServiceChoice::SubscribeCov => self.service_subscribe_cov(cx, source, data),
			ConfirmedServiceChoice::ConfirmedCovNotification => service_confirmed_cov_notification(data),
			ConfirmedServiceChoice::DeviceCommunicationControl => self.service_device_communication_control(cx, data),
			ConfirmedServiceChoice::ReinitializeDevice => self.service_reinitialize_device(data),
			_ => Err(HandlerError::Reject(RejectReason::UnrecognizedService)),
		}
	}

	fn service_read_property(&self, data: &[u8]) -> Result<ServiceAck, HandlerError> {
		let req = ReadPropertyRequest::decode(data).map_err(|()| RejectReason::InvalidTag)?;
		let value = self.db.read_property(req.object, req.property, req.array_index)?;

		let ack = crate::services::ReadPropertyAck { object: req.object, property: req.property, array_index: req.array_index, value };
		Ok(ServiceAck::Complex { service_choice: ConfirmedServiceChoice::ReadProperty as u8, data: ack.encode() })
	}

	fn service_write_property(&mut self, cx: CX![], data: &[u8]) -> Result<ServiceAck, HandlerError> {
		let req = WritePropertyRequest::decode(data).map_err(|()| RejectReason::InvalidTag)?;
		self.db.write_property(req.object, req.property, req.value, req.priority)?;

		let effective = self.db.read_property(req.object, req.property, None)?;
		let now = self.now_secs(cx);
		self.emit_cov(cx, req.object, req.property, &effective, now);

		Ok(ServiceAck::Simple)
	}

	fn service_read_property_multiple(&self, data: &[u8]) -> Result<ServiceAck, HandlerError> {
		let req = ReadPropertyMultipleRequest::decode(data).map_err(|()| RejectReason::InvalidTag)?;
		let mut results = Vec::new();

		for spec in req.specs {
			let mut props = Vec::new();

			for reference in spec.properties {
				let outcome = self.db.read_property(spec.object, reference.property, reference.array_index);
				props.push(crate::services::PropertyResult { property: reference.property, array_index: reference.array_index, outcome });
			}

			results.push(ReadAccessResult { object: spec.object, results: props });
		}

		let ack = ReadPropertyMultipleAck { results };
		Ok(ServiceAck::Complex { service_choice: ConfirmedServiceChoice::ReadPropertyMultiple as u8, data: ack.encode() })
	}

	/// Writes every property in every spec; the first failure aborts the whole request, leaving
	/// earlier writes in this same request applied (no transactional rollback).
	fn service_write_property_multiple(&mut self, cx: CX![], data: &[u8]) -> Result<ServiceAck, HandlerError> {
		let req = WritePropertyMultipleRequest::decode(data).map_err(|()| RejectReason::InvalidTag)?;
		let now = self.now_secs(cx);

		for (object, properties) in req.specs {
			for p in properties {
				self.db.write_property(object, p.property, p.value, p.priority)?;
				let effective = self.db.read_property(object, p.property, None)?;
				self.emit_cov(cx, object, p.property, &effective, now);
			}
		}

		Ok(ServiceAck::Simple)
	}

	fn service_subscribe_cov(&mut self, cx: CX![], source: PeerAddress, data: &[u8]) -> Result<ServiceAck, HandlerError> {
		let req = SubscribeCovRequest::decode(data).map_err(|()| RejectReason::InvalidTag)?;

		if self.db.get(req.monitored_object).is_none() {
			return Err(BacnetError::object(ErrorCode::UnknownObject).into());
		}

		let cov_increment = match self.db.read_property(req.monitored_object, prop::COV_INCREMENT, None) {
			Ok(PropertyValue::Single(Primitive::Real(v))) => Some(f64::from(v)),
			_ => None,
		};

		let now = self.now_secs(cx);
		let fire = self.cov.subscribe(
			source,
			cov::SubscribeRequest {
				process_id: req.process_id,
				monitored_object: req.monitored_object,
				monitored_property: None,
				issue_confirmed: req.issue_confirmed,
				lifetime_secs: req.lifetime_secs,
				cov_increment,
			},
			now,
		);

		if fire {
			self.send_initial_cov_notification(cx, source, req);
		}

		Ok(ServiceAck::Simple)
	}

	fn send_initial_cov_notification(&mut self, cx: CX![], subscriber: PeerAddress, req: SubscribeCovRequest) {
		let key = cov::SubscriptionKey { subscriber, process_id: req.process_id };
		let now = self.now_secs(cx);
		let time_remaining = self.cov.time_remaining(&key, now);

		let mut values = Vec::new();
		if let Ok(v) = self.db.read_property(req.monitored_object, prop::PRESENT_VALUE, None) {
			values.push((prop::PRESENT_VALUE, v));
		}
		if let Ok(v) = self.db.read_property(req.monitored_object, prop::STATUS_FLAGS, None) {
			values.push((prop::STATUS_FLAGS, v));
		}

		if values.is_empty() {
			return;
		}

		self.send_cov_notification(cx, cov::Notification {
			subscriber,
			process_id: req.process_id,
			monitored_object: req.monitored_object,
			confirmed: req.issue_confirmed.unwrap_or(false),
			time_remaining,
			values,
		});
	}

	fn service_device_communication_control(&mut self, cx: CX![], data: &[u8]) -> Result<ServiceAck, HandlerError> {
		let req = DeviceCommunicationControl::decode(data).map_err(|()| RejectReason::InvalidTag)?;
		check_password(self.config.dcc_password.as_deref(), req.password.as_deref())?;

		self.communication_enabled = req.enable_disable == 0;

		if let (false, Some(minutes)) = (self.communication_enabled, req.time_duration_minutes) {
			let actor = cx.access_actor().clone();
			cx.after(Duration::from_secs(u64::from(minutes) * 60), move |s| {
				actor.apply(s, |this, _| this.communication_enabled = true);
			});
		}

		Ok(ServiceAck::Simple)
	}

	fn service_reinitialize_device(&self, data: &[u8]) -> Result<ServiceAck, HandlerError> {
		let req = ReinitializeDevice::decode(data).map_err(|()| RejectReason::InvalidTag)?;
		check_password(self.config.reinitialize_password.as_deref(), req.password.as_deref())?;

		warn!("Reinitialize-Device requested (state {}); no persistence layer to act on it", req.reinitialized_state);
		Ok(ServiceAck::Simple)
	}

	#[allow(clippy::too_many_arguments)]
	fn respond_confirmed(
		&mut self,
		cx: CX![],
		source: PeerAddress,
		invoke_id: u8,
		max_apdu: MaxApdu,
		segmented_accepted: bool,
		outcome: Result<ServiceAck, HandlerError>,
	) {
		let apdu = match outcome {
			Ok(ServiceAck::Simple) => Apdu::SimpleAck { invoke_id, service_choice: 0 },
			Ok(ServiceAck::Complex { service_choice, data }) => {
				let threshold = (max_apdu.0 as usize).saturating_sub(RESPONSE_HEADER_ROOM);

				if data.len() <= threshold {
					Apdu::ComplexAck(ComplexAck { segmented: false, more_follows: false, invoke_id, segment: None, service_choice, service_data: data })
				} else if segmented_accepted {
					let max_segment_size = threshold.saturating_sub(SEGMENT_HEADER_ROOM).max(1);
					self.server_tsm.begin_segmented_response(
						cx,
						source,
						invoke_id,
						service_choice,
						data,
						max_segment_size,
						self.config.segment_window_size,
						self.config.apdu_timeout,
					);
					return;
				} else {
					Apdu::Abort(crate::apdu::AbortPdu { server_origin: true, invoke_id, reason: AbortReason::ApduTooLong })
				}
			}
			Err(HandlerError::Error(error)) => Apdu::Error(crate::apdu::ErrorPdu { invoke_id, service_choice: 0, error }),
			Err(HandlerError::Reject(reason)) => Apdu::Reject(crate::apdu::RejectPdu { invoke_id, reason }),
			Err(HandlerError::Abort(reason)) => Apdu::Abort(crate::apdu::AbortPdu { server_origin: true, invoke_id, reason }),
		};

		let mut frame = Vec::new();
		if apdu.encode(&mut frame).is_err() {
			error!("Failed to encode response APDU for invoke id {invoke_id}");
			return;
		}

		self.server_tsm.complete(cx, source, invoke_id, frame.clone());
		self.transmit(cx, source, frame);
	}

	// ---- unconfirmed requests ----

	fn handle_unconfirmed_request(&mut self, cx: CX![], source: PeerAddress, service_choice: u8, data: &[u8]) {
		if !self.communication_enabled {
			debug!("Dropping unconfirmed request from {source:?}: communication disabled");
			return;
		}

		let Some(choice) = UnconfirmedServiceChoice::from_code(service_choice) else {
			debug!("Unrecognized unconfirmed service choice {service_choice} from {source:?}");
			return;
		};

		match choice {
			UnconfirmedServiceChoice::WhoIs => self.handle_who_is(cx, source, data),
			UnconfirmedServiceChoice::IAm => self.handle_i_am(source, data),
			UnconfirmedServiceChoice::WhoHas => self.handle_who_has(cx, source, data),
			UnconfirmedServiceChoice::IHave => match IHave::decode(data) {
				Ok(i) => debug!("I-Have from {source:?}: device {} has {} named {:?}", i.device, i.object, i.object_name),
				Err(()) => debug!("Malformed I-Have from {source:?}"),
			},
			UnconfirmedServiceChoice::UnconfirmedCovNotification => match CovNotification::decode(data) {
				Ok(n) => debug!("Unconfirmed COV notification from device {}: {:?}", n.initiating_device, n.values),
				Err(()) => debug!("Malformed unconfirmed COV notification from {source:?}"),
			},
			UnconfirmedServiceChoice::TimeSynchronization | UnconfirmedServiceChoice::UtcTimeSynchronization => {
				debug!("Time synchronization request from {source:?} ignored; this device has no clock to set");
			}
			_ => debug!("Unhandled unconfirmed service {service_choice} from {source:?}"),
		}
	}

	fn handle_who_is(&mut self, cx: CX![], source: PeerAddress, data: &[u8]) {
		let who_is = match WhoIs::decode(data) {
			Ok(w) => w,
			Err(()) => return debug!("Malformed Who-Is from {source:?}"),
		};

		let matches = match (who_is.low_limit, who_is.high_limit) {
			(Some(lo), Some(hi)) => (lo..=hi).contains(&self.config.device_instance),
			_ => true,
		};

		if matches {
			self.send_i_am(cx);
		}
	}

	fn send_i_am(&mut self, cx: CX![]) {
		let i_am = IAm { device: self.device_id(), max_apdu: u32::from(self.config.max_apdu.0), segmentation: 1, vendor_id: self.config.vendor_id };
		let dest = self.global_broadcast();
		self.send_unconfirmed(cx, dest, UnconfirmedServiceChoice::IAm as u8, i_am.encode());
	}

	fn handle_i_am(&mut self, source: PeerAddress, data: &[u8]) {
		let i_am = match IAm::decode(data) {
			Ok(i) => i,
			Err(()) => return debug!("Malformed I-Am from {source:?}"),
		};

		debug!("I-Am from {source:?}: device {} (max-apdu {}, vendor {})", i_am.device, i_am.max_apdu, i_am.vendor_id);

		for (low, high, collected) in self.who_is_collectors.values_mut() {
			let matches = match (*low, *high) {
				(Some(lo), Some(hi)) => (lo..=hi).contains(&i_am.device.instance),
				_ => true,
			};

			if matches {
				collected.push(i_am);
			}
		}
	}

	/// Broadcasts a Who-Is and delivers every matching I-Am collected within `window` to `ret`.
	pub fn who_is(&mut self, cx: CX![], low_limit: Option<u32>, high_limit: Option<u32>, window: Duration, ret: stakker::Ret<Vec<IAm>>) {
		let token = self.next_collector;
		self.next_collector += 1;
		self.who_is_collectors.insert(token, (low_limit, high_limit, Vec::new()));

		let who_is = WhoIs { low_limit, high_limit };
		let dest = self.global_broadcast();
		self.send_unconfirmed(cx, dest, UnconfirmedServiceChoice::WhoIs as u8, who_is.encode());

		let actor = cx.access_actor().clone();
		cx.after(window, move |s| {
			actor.apply(s, move |this, _| {
				if let Some((_, _, collected)) = this.who_is_collectors.remove(&token) {
					ret.ret(collected);
				}
			});
		});
	}

	fn handle_who_has(&mut self, cx: CX![], source: PeerAddress, data: &[u8]) {
		let who_has = match WhoHas::decode(data) {
			Ok(w) => w,
			Err(()) => return debug!("Malformed Who-Has from {source:?}"),
		};

		if let (Some(lo), Some(hi)) = (who_has.low_limit, who_has.high_limit) {
			if !(lo..=hi).contains(&self.config.device_instance) {
				return;
			}
		}

		let found = match &who_has.object {
			ObjectSelector::Id(id) => self.db.get(*id).map(|_| *id),
			ObjectSelector::Name(name) => self.db.object_list().into_iter().find(|id| self.object_name(*id).as_deref() == Some(name.as_str())),
		};

		let Some(object) = found else { return };
		let object_name = self.object_name(object).unwrap_or_default();

		let i_have = IHave { device: self.device_id(), object, object_name };
		let dest = self.global_broadcast();
		self.send_unconfirmed(cx, dest, UnconfirmedServiceChoice::IHave as u8, i_have.encode());
	}

	fn object_name(&self, id: ObjectId) -> Option<String> {
		match self.db.read_property(id, prop::OBJECT_NAME, None).ok()? {
			PropertyValue::Single(Primitive::CharacterString(s)) => Some(s),
			_ => None,
		}
	}

	/// Adds an object to the device's database. Exposed so an embedder can populate points
	/// before the device starts answering requests.
	pub fn add_object(&mut self, _cx: CX![], object: Object) -> Result<(), BacnetError> {
		self.db.add(object)
	}

	// ---- change-of-value notification ----

	fn emit_cov(&mut self, cx: CX![], object: ObjectId, property: u32, value: &PropertyValue, now: u32) {
		let notifications = self.cov.on_change(object, property, value, now);
		for n in notifications {
			self.send_cov_notification(cx, n);
		}
	}

	fn send_cov_notification(&mut self, cx: CX![], n: cov::Notification) {
		let payload = CovNotification {
			process_id: n.process_id,
			initiating_device: self.device_id(),
			monitored_object: n.monitored_object,
			time_remaining: n.time_remaining,
			values: n.values,
		};

		if n.confirmed {
			let ret = ret_to!([cx], on_cov_notification_outcome() as (Outcome));
			self.client_tsm.request(
				cx,
				n.subscriber,
				ConfirmedServiceChoice::ConfirmedCovNotification as u8,
				payload.encode(),
				self.config.max_apdu,
				self.config.segmented_response_accepted,
				self.config.apdu_timeout,
				self.config.apdu_retries,
				ret,
			);
		} else {
			self.send_unconfirmed(cx, n.subscriber, UnconfirmedServiceChoice::UnconfirmedCovNotification as u8, payload.encode());
		}
	}

	fn on_cov_notification_outcome(&mut self, _cx: CX![], outcome: Outcome) {
		if let Outcome::Failed(e) = outcome {
			debug!("Confirmed COV notification was not accepted by the subscriber: {e:?}");
		}
	}
}

fn service_confirmed_cov_notification(data: &[u8]) -> Result<ServiceAck, HandlerError> {
	let n = CovNotification::decode(data).map_err(|()| RejectReason::InvalidTag)?;
	debug!("Confirmed COV notification from device {}: {:?}", n.initiating_device, n.values);
	Ok(ServiceAck::Simple)
}

/// Thin bridges letting `tsm::client`/`tsm::server` unit tests drive a transaction state machine
/// through a real `Device` actor without reaching into its private fields.
#[cfg(test)]
impl Device {
	pub(crate) fn test_admit(&mut self, cx: CX![], source: PeerAddress, invoke_id: u8, request_lifetime: Duration, ret: stakker::Ret<Admission>) {
		ret.ret(self.server_tsm.admit(cx, source, invoke_id, request_lifetime));
	}

	pub(crate) fn test_complete(&mut self, cx: CX![], source: PeerAddress, invoke_id: u8, response: Vec<u8>) {
		self.server_tsm.complete(cx, source, invoke_id, response);
	}

	pub(crate) fn test_request(
		&mut self,
		cx: CX![],
		destination: PeerAddress,
		timeout: Duration,
		retries: u8,
		ret: stakker::Ret<Outcome>,
	) {
		self.client_tsm.request(cx, destination, 1, Vec::new(), self.config.max_apdu, false, timeout, retries, ret);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn check_password_open_when_unset() {
		assert!(check_password(None, None).is_ok());
		assert!(check_password(None, Some("anything")).is_ok());
	}

	#[test]
	fn check_password_rejects_mismatch_and_missing() {
		assert!(check_password(Some("secret"), Some("secret")).is_ok());
		assert!(check_password(Some("secret"), Some("wrong")).is_err());
		assert!(check_password(Some("secret"), None).is_err());
	}

	#[test]
	fn bootstrap_device_object_populates_required_properties() {
		let device_id = ObjectId::new(object_type::DEVICE, 1);
		let config = crate::config::Config::new(1, "Test Device").vendor(99, "Acme");

		let mut db = Database::new(device_id, config.device_name.clone());
		bootstrap_device_object(&mut db, device_id, &config);

		assert_eq!(
			db.read_property(device_id, prop::VENDOR_IDENTIFIER, None).unwrap(),
			PropertyValue::Single(Primitive::Unsigned(99)),
		);
		assert_eq!(
			db.read_property(device_id, prop::SEGMENTATION_SUPPORTED, None).unwrap(),
			PropertyValue::Single(Primitive::Enumerated(1)),
		);
		assert_eq!(
			db.read_property(device_id, prop::PROTOCOL_REVISION, None).unwrap(),
			PropertyValue::Single(Primitive::Unsigned(19)),
		);
	}
}
