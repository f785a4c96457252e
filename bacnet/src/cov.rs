//! Change-of-value subscription registry: matches object database writes against subscriptions
//! and builds the notifications the application orchestrator hands to the client TSM.
//!
//! Subscriptions are dynamically keyed by `(subscriber, process-id)` with no fixed cap (a
//! well-behaved subscriber can register arbitrarily many monitors), so the table is a plain
//! `std::collections::HashMap`, the same choice `bacnet::object`'s object table makes for
//! unbounded dynamic state.

use std::collections::HashMap;

use crate::address::PeerAddress;
use crate::object_id::ObjectId;
use crate::primitive::Primitive;
use crate::property::{id as prop, PropertyValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
	pub subscriber: PeerAddress,
	pub process_id: u32,
}

struct Subscription {
	monitored_object: ObjectId,
	monitored_property: Option<u32>,
	confirmed: bool,
	/// `None` means indefinite (lifetime 0 or absent at subscribe time).
	expires_at: Option<u32>,
	cov_increment: Option<f64>,
	last_reported: Option<f64>,
}

pub struct SubscribeRequest {
	pub process_id: u32,
	pub monitored_object: ObjectId,
	pub monitored_property: Option<u32>,
	pub issue_confirmed: Option<bool>,
	pub lifetime_secs: Option<u32>,
	pub cov_increment: Option<f64>,
}

pub struct Notification {
	pub subscriber: PeerAddress,
	pub process_id: u32,
	pub monitored_object: ObjectId,
	pub confirmed: bool,
	pub time_remaining: u32,
	pub values: Vec<(u32, PropertyValue)>,
}

#[derive(Default)]
pub struct Registry {
	subs: HashMap<SubscriptionKey, Subscription>,
}

impl Registry {
	/// Applies a `SubscribeCOV` request. Returns `true` when an initial notification must be sent
	/// immediately (every successful, non-cancelling subscribe/refresh); `false` on cancellation.
	pub fn subscribe(&mut self, subscriber: PeerAddress, req: SubscribeRequest, now_secs: u32) -> bool {
		let key = SubscriptionKey { subscriber, process_id: req.process_id };

		if req.issue_confirmed.is_none() && req.lifetime_secs.is_none() {
			self.subs.remove(&key);
			return false;
		}

		let expires_at = match req.lifetime_secs {
			None | Some(0) => None,
			Some(secs) => Some(now_secs.saturating_add(secs)),
		};

		self.subs.insert(
			key,
			Subscription {
				monitored_object: req.monitored_object,
				monitored_property: req.monitored_property,
				confirmed: req.issue_confirmed.unwrap_or(false),
				expires_at,
				cov_increment: req.cov_increment,
				last_reported: None,
			},
		);

		true
	}

	pub fn time_remaining(&self, key: &SubscriptionKey, now_secs: u32) -> u32 {
		match self.subs.get(key).and_then(|s| s.expires_at) {
			Some(deadline) => deadline.saturating_sub(now_secs),
			None => 0,
		}
	}

	/// Builds one notification per subscription matching `object`/`property` whose trigger
	/// condition the new `value` satisfies.
	pub fn on_change(&mut self, object: ObjectId, property: u32, value: &PropertyValue, now_secs: u32) -> Vec<Notification> {
		let mut out = Vec::new();

		for (key, sub) in self.subs.iter_mut() {
			if sub.monitored_object != object {
				continue;
			}

			if let Some(watched) = sub.monitored_property {
				if watched != property {
					continue;
				}
			}

			let triggers = property == prop::STATUS_FLAGS || trigger(sub, value);

			if !triggers {
				continue;
			}

			out.push(Notification {
				subscriber: key.subscriber,
				process_id: key.process_id,
				monitored_object: object,
				confirmed: sub.confirmed,
				time_remaining: sub.expires_at.map_or(0, |d| d.saturating_sub(now_secs)),
				values: vec![(property, value.clone())],
			});
		}

		out
	}

	/// Drops every subscription whose lifetime has elapsed. Run roughly every 10 seconds.
	pub fn sweep(&mut self, now_secs: u32) {
		self.subs.retain(|_, s| s.expires_at.is_none_or(|d| d > now_secs));
	}
}

fn trigger(sub: &mut Subscription, value: &PropertyValue) -> bool {
	let Some(n) = as_f64(value) else {
		// Non-numeric (binary/multistate/other): any change triggers.
		return true;
	};

	let increment = sub.cov_increment.unwrap_or(0.0);
	let fires = sub.last_reported.is_none_or(|last| (n - last).abs() >= increment);
	sub.last_reported = Some(n);
	fires
}

fn as_f64(value: &PropertyValue) -> Option<f64> {
	match value.as_single()? {
		Primitive::Real(v) => Some(f64::from(*v)),
		Primitive::Double(v) => Some(*v),
		Primitive::Unsigned(v) => Some(*v as f64),
		Primitive::Signed(v) => Some(*v as f64),
		_ => None,
	}
}

#[cfg(test)]
mod tests {
	use core::net::{Ipv4Addr, SocketAddrV4};

	use super::*;
	use crate::address::Mac;
	use crate::object_id::object_type;

	fn subscriber() -> PeerAddress {
		PeerAddress::local(Mac(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 9), 47808)))
	}

	fn object() -> ObjectId {
		ObjectId::new(object_type::ANALOG_VALUE, 1)
	}

	#[test]
	fn subscribing_requests_initial_notification() {
		let mut reg = Registry::default();
		let fire = reg.subscribe(
			subscriber(),
			SubscribeRequest {
				process_id: 1,
				monitored_object: object(),
				monitored_property: None,
				issue_confirmed: Some(false),
				lifetime_secs: Some(60),
				cov_increment: None,
			},
			0,
		);
		assert!(fire);
	}

	#[test]
	fn cancelling_absent_subscription_is_not_an_error() {
		let mut reg = Registry::default();
		let fire = reg.subscribe(
			subscriber(),
			SubscribeRequest {
				process_id: 1,
				monitored_object: object(),
				monitored_property: None,
				issue_confirmed: None,
				lifetime_secs: None,
				cov_increment: None,
			},
			0,
		);
		assert!(!fire);
	}

	#[test]
	fn analog_increment_gates_notification() {
		let mut reg = Registry::default();
		reg.subscribe(
			subscriber(),
			SubscribeRequest {
				process_id: 1,
				monitored_object: object(),
				monitored_property: Some(prop::PRESENT_VALUE),
				issue_confirmed: Some(false),
				lifetime_secs: None,
				cov_increment: Some(2.0),
			},
			0,
		);

		let first = reg.on_change(object(), prop::PRESENT_VALUE, &PropertyValue::Single(Primitive::Real(10.0)), 0);
		assert_eq!(first.len(), 1);

		let below_threshold = reg.on_change(object(), prop::PRESENT_VALUE, &PropertyValue::Single(Primitive::Real(11.0)), 0);
		assert!(below_threshold.is_empty());

		let above_threshold = reg.on_change(object(), prop::PRESENT_VALUE, &PropertyValue::Single(Primitive::Real(13.0)), 0);
		assert_eq!(above_threshold.len(), 1);
	}

	#[test]
	fn status_flags_always_trigger() {
		let mut reg = Registry::default();
		reg.subscribe(
			subscriber(),
			SubscribeRequest {
				process_id: 1,
				monitored_object: object(),
				monitored_property: None,
				issue_confirmed: Some(false),
				lifetime_secs: None,
				cov_increment: None,
			},
			0,
		);

		let flags = PropertyValue::Single(Primitive::BitString(crate::primitive::BitString { bits: vec![0], unused: 4 }));
		let notifications = reg.on_change(object(), prop::STATUS_FLAGS, &flags, 0);
		assert_eq!(notifications.len(), 1);
	}

	#[test]
	fn expired_subscriptions_are_swept() {
		let mut reg = Registry::default();
		reg.subscribe(
			subscriber(),
			SubscribeRequest {
				process_id: 1,
				monitored_object: object(),
				monitored_property: None,
				issue_confirmed: Some(false),
				lifetime_secs: Some(30),
				cov_increment: None,
			},
			0,
		);

		reg.sweep(31);
		let notifications = reg.on_change(object(), prop::STATUS_FLAGS, &PropertyValue::Single(Primitive::Boolean(true)), 31);
		assert!(notifications.is_empty());
	}
}
