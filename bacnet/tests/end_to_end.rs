//! End-to-end scenarios exercising the full BVLL -> NPDU -> APDU -> service pipeline without a
//! running `stakker` actor or a live socket: every layer here is driven directly, request bytes
//! produced by one side and fed straight into the other's decoder, standing in for the loopback
//! channel a live pair of devices would otherwise use.

use bacnet::address::{Mac, PeerAddress, BROADCAST_NETWORK};
use bacnet::apdu::{Apdu, ComplexAck, ConfirmedRequest, ConfirmedServiceChoice, MaxApdu, MaxSegments, UnconfirmedServiceChoice};
use bacnet::bvll::Bvll;
use bacnet::cov::{self, Registry, SubscribeRequest};
use bacnet::npdu::Npdu;
use bacnet::object::{Database, Object};
use bacnet::object_id::{object_type, ObjectId};
use bacnet::primitive::Primitive;
use bacnet::property::{id as prop, PropertyValue};
use bacnet::services::{CovNotification, IAm, ReadPropertyAck, ReadPropertyRequest, WhoIs};

use core::net::{Ipv4Addr, SocketAddrV4};

fn mac(last_octet: u8) -> Mac {
	Mac(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, last_octet), 47808))
}

fn frame_confirmed(destination: Option<PeerAddress>, apdu: &Apdu, broadcast: bool) -> Vec<u8> {
	let mut apdu_bytes = Vec::new();
	apdu.encode(&mut apdu_bytes).unwrap();

	let mut frame = Vec::new();
	Npdu::application(destination).encode(&mut frame).unwrap();
	frame.extend_from_slice(&apdu_bytes);

	if broadcast {
		Bvll::OriginalBroadcastNpdu(frame).encode()
	} else {
		Bvll::OriginalUnicastNpdu(frame).encode()
	}
}

fn unwrap_apdu(datagram: &[u8]) -> Apdu {
	let npdu_bytes = match Bvll::decode(datagram).unwrap() {
		Bvll::OriginalUnicastNpdu(b) | Bvll::OriginalBroadcastNpdu(b) => b,
		other => panic!("unexpected BVLL frame: {other:?}"),
	};

	let (npdu, offset) = Npdu::decode(&npdu_bytes).unwrap();
	assert!(!npdu.network_layer_message);
	Apdu::decode(&npdu_bytes[offset..]).unwrap()
}

#[test]
fn read_property_request_and_reply_round_trip_the_full_frame_stack() {
	let device_id = ObjectId::new(object_type::DEVICE, 1);
	let av = ObjectId::new(object_type::ANALOG_VALUE, 1);

	let mut db = Database::new(device_id, "test-device".into());
	db.add(Object::new(av, "av1".into())).unwrap();
	db.write_property(av, prop::PRESENT_VALUE, PropertyValue::Single(Primitive::Real(42.5)), Some(8)).unwrap();

	// Client side: build and frame the request.
	let request = ReadPropertyRequest { object: av, property: prop::PRESENT_VALUE, array_index: None };
	let req_apdu = Apdu::ConfirmedRequest(ConfirmedRequest {
		segmented: false,
		more_follows: false,
		segmented_response_accepted: true,
		max_segments: MaxSegments::Limit(16),
		max_apdu: MaxApdu(1476),
		invoke_id: 5,
		segment: None,
		service_choice: ConfirmedServiceChoice::ReadProperty as u8,
		service_data: request.encode(),
	});
	let on_wire = frame_confirmed(None, &req_apdu, false);

	// Server side: decode down to the service request and serve it from the database.
	let Apdu::ConfirmedRequest(decoded_req) = unwrap_apdu(&on_wire) else { panic!("expected a confirmed request") };
	assert_eq!(decoded_req.invoke_id, 5);
	assert_eq!(decoded_req.service_choice, ConfirmedServiceChoice::ReadProperty as u8);

	let parsed = ReadPropertyRequest::decode(&decoded_req.service_data).unwrap();
	assert_eq!(parsed.object, av);

	let value = db.read_property(parsed.object, parsed.property, parsed.array_index).unwrap();
	let ack = ReadPropertyAck { object: parsed.object, property: parsed.property, array_index: parsed.array_index, value: value.clone() };

	let ack_apdu = Apdu::ComplexAck(ComplexAck {
		segmented: false,
		more_follows: false,
		invoke_id: decoded_req.invoke_id,
		segment: None,
		service_choice: ConfirmedServiceChoice::ReadProperty as u8,
		service_data: ack.encode(),
	});
	let reply_on_wire = frame_confirmed(None, &ack_apdu, false);

	// Client side: decode the reply and confirm it matches what was written.
	let Apdu::ComplexAck(decoded_ack) = unwrap_apdu(&reply_on_wire) else { panic!("expected a complex ack") };
	assert_eq!(decoded_ack.invoke_id, 5);

	let decoded_value = ReadPropertyAck::decode(&decoded_ack.service_data).unwrap();
	assert_eq!(decoded_value.value, value);
	assert_eq!(decoded_value.value, PropertyValue::Single(Primitive::Real(42.5)));
}

#[test]
fn who_is_broadcast_and_i_am_reply_round_trip() {
	let responder = ObjectId::new(object_type::DEVICE, 42);

	let who_is = WhoIs { low_limit: Some(40), high_limit: Some(50) };
	let who_is_apdu = Apdu::UnconfirmedRequest { service_choice: UnconfirmedServiceChoice::WhoIs as u8, service_data: who_is.encode() };
	let dest = PeerAddress { network: Some(BROADCAST_NETWORK), mac: mac(255) };
	let on_wire = frame_confirmed(Some(dest), &who_is_apdu, true);

	let Apdu::UnconfirmedRequest { service_choice, service_data } = unwrap_apdu(&on_wire) else { panic!("expected unconfirmed request") };
	assert_eq!(service_choice, UnconfirmedServiceChoice::WhoIs as u8);

	let decoded = WhoIs::decode(&service_data).unwrap();
	assert_eq!(decoded, who_is);
	assert!((decoded.low_limit.unwrap()..=decoded.high_limit.unwrap()).contains(&responder.instance));

	let i_am = IAm { device: responder, max_apdu: 1476, segmentation: 1, vendor_id: 99 };
	let i_am_apdu = Apdu::UnconfirmedRequest { service_choice: UnconfirmedServiceChoice::IAm as u8, service_data: i_am.encode() };
	let reply_on_wire = frame_confirmed(Some(dest), &i_am_apdu, true);

	let Apdu::UnconfirmedRequest { service_choice, service_data } = unwrap_apdu(&reply_on_wire) else { panic!("expected unconfirmed request") };
	assert_eq!(service_choice, UnconfirmedServiceChoice::IAm as u8);
	assert_eq!(IAm::decode(&service_data).unwrap(), i_am);
}

#[test]
fn cov_subscription_write_and_notification_round_trip() {
	let device_id = ObjectId::new(object_type::DEVICE, 1);
	let av = ObjectId::new(object_type::ANALOG_VALUE, 7);

	let mut db = Database::new(device_id, "test-device".into());
	db.add(Object::new(av, "av7".into())).unwrap();

	let subscriber = PeerAddress::local(mac(9));
	let mut registry = Registry::default();

	let fire = registry.subscribe(
		subscriber,
		SubscribeRequest {
			process_id: 3,
			monitored_object: av,
			monitored_property: None,
			issue_confirmed: Some(false),
			lifetime_secs: Some(120),
			cov_increment: Some(1.0),
		},
		0,
	);
	assert!(fire);

	db.write_property(av, prop::PRESENT_VALUE, PropertyValue::Single(Primitive::Real(10.0)), Some(8)).unwrap();
	let written = db.read_property(av, prop::PRESENT_VALUE, None).unwrap();

	let notifications = registry.on_change(av, prop::PRESENT_VALUE, &written, 1);
	assert_eq!(notifications.len(), 1);

	let n = &notifications[0];
	let payload = CovNotification {
		process_id: n.process_id,
		initiating_device: device_id,
		monitored_object: n.monitored_object,
		time_remaining: n.time_remaining,
		values: n.values.clone(),
	};

	let on_wire = payload.encode();
	let decoded = CovNotification::decode(&on_wire).unwrap();
	assert_eq!(decoded.monitored_object, av);
	assert_eq!(decoded.values, vec![(prop::PRESENT_VALUE, written)]);

	// A second write within the increment does not trigger another notification.
	db.write_property(av, prop::PRESENT_VALUE, PropertyValue::Single(Primitive::Real(10.4)), Some(8)).unwrap();
	let unchanged = db.read_property(av, prop::PRESENT_VALUE, None).unwrap();
	assert!(registry.on_change(av, prop::PRESENT_VALUE, &unchanged, 2).is_empty());

	let _ = cov::SubscriptionKey { subscriber, process_id: 3 };
}
