//! Typed object/property database: identifier-keyed objects, each holding a property map and
//! (for commandable types) a 16-slot priority array, plus the change bus that lets the COV/event
//! layer observe writes.
//!
//! The object table itself is unbounded (a device may host thousands of objects), keyed by a plain
//! `std::collections::HashMap` rather than a bounded const-generic map.

pub mod priority;

use std::collections::HashMap;

use crate::error::{BacnetError, ErrorCode};
use crate::object_id::{object_type, ObjectId};
use crate::primitive::Primitive;
use crate::property::{id as prop, Access, PropertyDef, PropertyValue};
use priority::PriorityArray;

/// Maximum callbacks registered against a single `(object, property)` key.
pub const MAX_CALLBACKS_PER_KEY: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
	pub properties: &'static [PropertyDef],
}

const DEVICE_SCHEMA: Schema = Schema {
	properties: &[
		PropertyDef { id: prop::OBJECT_IDENTIFIER, access: Access::ReadOnly, required: true },
		PropertyDef { id: prop::OBJECT_NAME, access: Access::ReadWrite, required: true },
		PropertyDef { id: prop::OBJECT_TYPE, access: Access::ReadOnly, required: true },
		PropertyDef { id: prop::SYSTEM_STATUS, access: Access::ReadWrite, required: true },
		PropertyDef { id: prop::VENDOR_NAME, access: Access::ReadOnly, required: true },
		PropertyDef { id: prop::VENDOR_IDENTIFIER, access: Access::ReadOnly, required: true },
		PropertyDef { id: prop::MODEL_NAME, access: Access::ReadOnly, required: false },
		PropertyDef { id: prop::FIRMWARE_REVISION, access: Access::ReadOnly, required: true },
		PropertyDef { id: prop::APPLICATION_SOFTWARE_VERSION, access: Access::ReadOnly, required: true },
		PropertyDef { id: prop::PROTOCOL_VERSION, access: Access::ReadOnly, required: true },
		PropertyDef { id: prop::PROTOCOL_REVISION, access: Access::ReadOnly, required: true },
		PropertyDef { id: prop::MAX_APDU_LENGTH_ACCEPTED, access: Access::ReadOnly, required: true },
		PropertyDef { id: prop::SEGMENTATION_SUPPORTED, access: Access::ReadOnly, required: true },
		PropertyDef { id: prop::APDU_TIMEOUT, access: Access::ReadWrite, required: true },
		PropertyDef { id: prop::NUMBER_OF_APDU_RETRIES, access: Access::ReadWrite, required: true },
		PropertyDef { id: prop::DATABASE_REVISION, access: Access::ReadOnly, required: true },
		PropertyDef { id: prop::OBJECT_LIST, access: Access::ReadOnly, required: true },
		PropertyDef { id: prop::DESCRIPTION, access: Access::ReadWrite, required: false },
	],
};

const COMMANDABLE_SCHEMA: Schema = Schema {
	properties: &[
		PropertyDef { id: prop::OBJECT_IDENTIFIER, access: Access::ReadOnly, required: true },
		PropertyDef { id: prop::OBJECT_NAME, access: Access::ReadWrite, required: true },
		PropertyDef { id: prop::OBJECT_TYPE, access: Access::ReadOnly, required: true },
		PropertyDef { id: prop::PRESENT_VALUE, access: Access::ReadWrite, required: true },
		PropertyDef { id: prop::STATUS_FLAGS, access: Access::ReadOnly, required: true },
		PropertyDef { id: prop::EVENT_STATE, access: Access::ReadOnly, required: true },
		PropertyDef { id: prop::OUT_OF_SERVICE, access: Access::ReadWrite, required: true },
		PropertyDef { id: prop::UNITS, access: Access::ReadWrite, required: false },
		PropertyDef { id: prop::PRIORITY_ARRAY, access: Access::ReadOnly, required: true },
		PropertyDef { id: prop::RELINQUISH_DEFAULT, access: Access::ReadWrite, required: true },
		PropertyDef { id: prop::COV_INCREMENT, access: Access::ReadWrite, required: false },
		PropertyDef { id: prop::DESCRIPTION, access: Access::ReadWrite, required: false },
	],
};

const NON_COMMANDABLE_SCHEMA: Schema = Schema {
	properties: &[
		PropertyDef { id: prop::OBJECT_IDENTIFIER, access: Access::ReadOnly, required: true },
		PropertyDef { id: prop::OBJECT_NAME, access: Access::ReadWrite, required: true },
		PropertyDef { id: prop::OBJECT_TYPE, access: Access::ReadOnly, required: true },
		PropertyDef { id: prop::PRESENT_VALUE, access: Access::ReadOnly, required: true },
		PropertyDef { id: prop::STATUS_FLAGS, access: Access::ReadOnly, required: true },
		PropertyDef { id: prop::EVENT_STATE, access: Access::ReadOnly, required: true },
		PropertyDef { id: prop::OUT_OF_SERVICE, access: Access::ReadWrite, required: true },
		PropertyDef { id: prop::UNITS, access: Access::ReadWrite, required: false },
		PropertyDef { id: prop::COV_INCREMENT, access: Access::ReadWrite, required: false },
		PropertyDef { id: prop::DESCRIPTION, access: Access::ReadWrite, required: false },
	],
};

fn schema_for(object_type: u16) -> Schema {
	match object_type {
		object_type::DEVICE => DEVICE_SCHEMA,
		object_type::ANALOG_OUTPUT
		| object_type::ANALOG_VALUE
		| object_type::BINARY_OUTPUT
		| object_type::BINARY_VALUE
		| object_type::MULTI_STATE_OUTPUT
		| object_type::MULTI_STATE_VALUE => COMMANDABLE_SCHEMA,
		_ => NON_COMMANDABLE_SCHEMA,
	}
}

fn is_commandable(object_type: u16) -> bool {
	std::ptr::eq(schema_for(object_type).properties, COMMANDABLE_SCHEMA.properties)
}

pub struct Object {
	pub id: ObjectId,
	schema: Schema,
	properties: HashMap<u32, PropertyValue>,
	priority: Option<PriorityArray>,
}

impl Object {
	pub fn new(id: ObjectId, name: String) -> Self {
		let schema = schema_for(id.object_type);
		let priority = is_commandable(id.object_type).then(PriorityArray::default);

		let mut properties = HashMap::new();
		properties.insert(prop::OBJECT_IDENTIFIER, PropertyValue::Single(Primitive::ObjectId(id)));
		properties.insert(prop::OBJECT_NAME, PropertyValue::Single(Primitive::CharacterString(name)));
		properties.insert(prop::OBJECT_TYPE, PropertyValue::Single(Primitive::Enumerated(u32::from(id.object_type))));

		if priority.is_some() {
			properties.insert(prop::RELINQUISH_DEFAULT, PropertyValue::Single(Primitive::Null));
			properties.insert(prop::OUT_OF_SERVICE, PropertyValue::Single(Primitive::Boolean(false)));
			properties.insert(prop::STATUS_FLAGS, status_flags(false, false, false, false));
			properties.insert(prop::EVENT_STATE, PropertyValue::Single(Primitive::Enumerated(0)));
		}

		Self { id, schema, properties, priority }
	}

	pub fn set(&mut self, property: u32, value: PropertyValue) {
		self.properties.insert(property, value);
	}

	fn def(&self, property: u32) -> Option<&PropertyDef> {
		self.schema.properties.iter().find(|p| p.id == property)
	}

	/// The computed Property_List: every populated property plus every required one, in schema
	/// order, excluding Property_List itself.
	fn property_list(&self) -> Vec<Primitive> {
		self.schema
			.properties
			.iter()
			.filter(|p| p.required || self.properties.contains_key(&p.id))
			.map(|p| Primitive::Enumerated(p.id))
			.collect()
	}

	fn read(&self, property: u32, array_index: Option<u32>) -> Result<PropertyValue, BacnetError> {
		if property == prop::PROPERTY_LIST {
			return Ok(PropertyValue::Array(self.property_list()));
		}

		if property == prop::PRIORITY_ARRAY {
			let pa = self.priority.as_ref().ok_or(BacnetError::property(ErrorCode::UnknownProperty))?;
			let slots: Vec<Primitive> = pa
				.as_array()
				.into_iter()
				.map(|s| s.and_then(|v| v.as_single().cloned()).unwrap_or(Primitive::Null))
				.collect();
			return read_indexed(PropertyValue::Array(slots), array_index);
		}

		if property == prop::PRESENT_VALUE {
			if let Some(pa) = &self.priority {
				let value = pa.active().cloned().unwrap_or_else(|| {
					self.properties.get(&prop::RELINQUISH_DEFAULT).cloned().unwrap_or(PropertyValue::Single(Primitive::Null))
				});
				return Ok(value);
			}
		}

		if self.def(property).is_none() {
			return Err(BacnetError::property(ErrorCode::UnknownProperty));
		}

		let value = self.properties.get(&property).cloned().ok_or(BacnetError::property(ErrorCode::ValueNotInitialized))?;
		read_indexed(value, array_index)
	}

	fn write(&mut self, property: u32, value: PropertyValue, priority: Option<u8>) -> Result<(), BacnetError> {
		if property == prop::PRESENT_VALUE && self.priority.is_some() {
			let priority = priority.unwrap_or(16);
			let slot_value = match &value {
				PropertyValue::Single(Primitive::Null) => None,
				other => Some(other.clone()),
			};

			let pa = self.priority.as_mut().unwrap();

			if !pa.write(priority, slot_value) {
				return Err(BacnetError::property(ErrorCode::WriteAccessDenied));
			}

			return Ok(());
		}

		let def = self.def(property).ok_or(BacnetError::property(ErrorCode::UnknownProperty))?;

		if def.access == Access::ReadOnly {
			return Err(BacnetError::property(ErrorCode::WriteAccessDenied));
		}

		self.properties.insert(property, value);
		Ok(())
	}
}

fn status_flags(in_alarm: bool, fault: bool, overridden: bool, out_of_service: bool) -> PropertyValue {
	let mut bits = 0u8;
	bits |= (in_alarm as u8) << 7;
	bits |= (fault as u8) << 6;
	bits |= (overridden as u8) << 5;
	bits |= (out_of_service as u8) << 4;
	PropertyValue::Single(Primitive::BitString(crate::primitive::BitString { bits: vec![bits], unused: 4 }))
}

fn read_indexed(value: PropertyValue, array_index: Option<u32>) -> Result<PropertyValue, BacnetError> {
	match (value, array_index) {
		(v, None) => Ok(v),
		(PropertyValue::Array(items), Some(0)) => Ok(PropertyValue::Single(Primitive::Unsigned(items.len() as u64))),
		(PropertyValue::Array(items), Some(i)) => items
			.get(i as usize - 1)
			.cloned()
			.map(PropertyValue::Single)
			.ok_or(BacnetError::property(ErrorCode::InvalidArrayIndex)),
		(PropertyValue::Single(_), Some(_)) => Err(BacnetError::property(ErrorCode::PropertyIsNotAnArray)),
	}
}

type Callback = Box<dyn FnMut(ObjectId, u32, &PropertyValue)>;

/// Registration table mapping `(object, property)` to the list of callbacks notified after a
/// successful write to that property.
#[derive(Default)]
pub struct ChangeBus {
	callbacks: HashMap<(ObjectId, u32), Vec<(u64, Callback)>>,
	next_token: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackToken(ObjectId, u32, u64);

impl ChangeBus {
	pub fn register(&mut self, object: ObjectId, property: u32, callback: Callback) -> Result<CallbackToken, BacnetError> {
		let list = self.callbacks.entry((object, property)).or_default();

		if list.len() >= MAX_CALLBACKS_PER_KEY {
			return Err(BacnetError::new(crate::error::ErrorClass::Resources, ErrorCode::NoSpaceToAddListElement));
		}

		let token = self.next_token;
		self.next_token += 1;
		list.push((token, callback));
		Ok(CallbackToken(object, property, token))
	}

	pub fn unregister(&mut self, token: CallbackToken) {
		if let Some(list) = self.callbacks.get_mut(&(token.0, token.1)) {
			list.retain(|(t, _)| *t != token.2);
		}
	}

	fn fire(&mut self, object: ObjectId, property: u32, value: &PropertyValue) {
		if let Some(list) = self.callbacks.get_mut(&(object, property)) {
			for (_, cb) in list.iter_mut() {
				cb(object, property, value);
			}
		}
	}
}

pub struct Database {
	objects: HashMap<ObjectId, Object>,
	order: Vec<ObjectId>,
	pub bus: ChangeBus,
	pub database_revision: u32,
	device_id: ObjectId,
}

impl Database {
	pub fn new(device_id: ObjectId, device_name: String) -> Self {
		let mut db = Self { objects: HashMap::new(), order: Vec::new(), bus: ChangeBus::default(), database_revision: 0, device_id };
		db.add(Object::new(device_id, device_name)).expect("device object is always fresh");
		db
	}

	pub fn add(&mut self, object: Object) -> Result<(), BacnetError> {
		if self.objects.contains_key(&object.id) {
			return Err(BacnetError::object(ErrorCode::DuplicateObjectId));
		}

		self.order.push(object.id);
		self.objects.insert(object.id, object);
		self.database_revision += 1;
		Ok(())
	}

	pub fn remove(&mut self, id: ObjectId) -> Result<(), BacnetError> {
		if id == self.device_id {
			return Err(BacnetError::object(ErrorCode::ObjectDeletionNotPermitted));
		}

		if self.objects.remove(&id).is_none() {
			return Err(BacnetError::object(ErrorCode::UnknownObject));
		}

		self.order.retain(|o| *o != id);
		self.database_revision += 1;
		Ok(())
	}

	pub fn get(&self, id: ObjectId) -> Option<&Object> {
		self.objects.get(&id)
	}

	/// Direct mutable access for initial property population (bootstrapping the Device object,
	/// loading persisted state) that must bypass the read-only access check `write_property`
	/// enforces against protocol writes.
	pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut Object> {
		self.objects.get_mut(&id)
	}

	pub fn object_list(&self) -> Vec<ObjectId> {
		self.order.clone()
	}

	pub fn read_property(&self, id: ObjectId, property: u32, array_index: Option<u32>) -> Result<PropertyValue, BacnetError> {
		if property == prop::OBJECT_LIST {
			let ids = self.object_list().into_iter().map(Primitive::ObjectId).collect();
			return read_indexed(PropertyValue::Array(ids), array_index);
		}

		if property == prop::DATABASE_REVISION && id == self.device_id {
			return Ok(PropertyValue::Single(Primitive::Unsigned(u64::from(self.database_revision))));
		}

		self.objects.get(&id).ok_or(BacnetError::object(ErrorCode::UnknownObject))?.read(property, array_index)
	}

	pub fn write_property(
		&mut self,
		id: ObjectId,
		property: u32,
		value: PropertyValue,
		priority: Option<u8>,
	) -> Result<(), BacnetError> {
		let object = self.objects.get_mut(&id).ok_or(BacnetError::object(ErrorCode::UnknownObject))?;
		object.write(property, value, priority)?;

		let effective = object.read(property, None).unwrap_or(PropertyValue::Single(Primitive::Null));
		self.bus.fire(id, property, &effective);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn device() -> Database {
		Database::new(ObjectId::new(object_type::DEVICE, 1), "test-device".into())
	}

	#[test]
	fn add_remove_bumps_database_revision() {
		let mut db = device();
		let rev0 = db.database_revision;

		let ao = ObjectId::new(object_type::ANALOG_VALUE, 1);
		db.add(Object::new(ao, "av1".into())).unwrap();
		assert_eq!(db.database_revision, rev0 + 1);

		db.remove(ao).unwrap();
		assert_eq!(db.database_revision, rev0 + 2);
	}

	#[test]
	fn duplicate_add_is_rejected() {
		let mut db = device();
		let id = ObjectId::new(object_type::ANALOG_VALUE, 1);
		db.add(Object::new(id, "a".into())).unwrap();
		assert_eq!(db.add(Object::new(id, "b".into())), Err(BacnetError::object(ErrorCode::DuplicateObjectId)));
	}

	#[test]
	fn device_object_cannot_be_removed() {
		let mut db = device();
		assert_eq!(db.remove(db.device_id), Err(BacnetError::object(ErrorCode::ObjectDeletionNotPermitted)));
	}

	#[test]
	fn array_index_zero_returns_length() {
		let db = device();
		let count = db.read_property(db.device_id, prop::OBJECT_LIST, Some(0)).unwrap();
		assert_eq!(count, PropertyValue::Single(Primitive::Unsigned(1)));
	}

	#[test]
	fn priority_array_resolves_present_value() {
		let mut db = device();
		let id = ObjectId::new(object_type::ANALOG_VALUE, 1);
		db.add(Object::new(id, "av1".into())).unwrap();

		db.write_property(id, prop::PRESENT_VALUE, PropertyValue::Single(Primitive::Real(1.0)), Some(8)).unwrap();
		db.write_property(id, prop::PRESENT_VALUE, PropertyValue::Single(Primitive::Real(2.0)), Some(3)).unwrap();

		let pv = db.read_property(id, prop::PRESENT_VALUE, None).unwrap();
		assert_eq!(pv, PropertyValue::Single(Primitive::Real(2.0)));
	}

	#[test]
	fn reserved_priority_six_is_rejected() {
		let mut db = device();
		let id = ObjectId::new(object_type::ANALOG_VALUE, 1);
		db.add(Object::new(id, "av1".into())).unwrap();

		let err = db.write_property(id, prop::PRESENT_VALUE, PropertyValue::Single(Primitive::Real(1.0)), Some(6));
		assert_eq!(err, Err(BacnetError::property(ErrorCode::WriteAccessDenied)));
	}

	#[test]
	fn change_bus_fires_on_write() {
		let mut db = device();
		let id = ObjectId::new(object_type::ANALOG_VALUE, 1);
		db.add(Object::new(id, "av1".into())).unwrap();

		let seen = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
		let seen_cb = seen.clone();
		db.bus
			.register(
				id,
				prop::PRESENT_VALUE,
				Box::new(move |_, _, v| seen_cb.borrow_mut().push(v.clone())),
			)
			.unwrap();

		db.write_property(id, prop::PRESENT_VALUE, PropertyValue::Single(Primitive::Real(4.0)), Some(10)).unwrap();
		assert_eq!(seen.borrow().len(), 1);
	}

	#[test]
	fn callback_registration_is_capped() {
		let mut db = device();
		let id = ObjectId::new(object_type::ANALOG_VALUE, 1);
		db.add(Object::new(id, "av1".into())).unwrap();

		for _ in 0..MAX_CALLBACKS_PER_KEY {
			db.bus.register(id, prop::PRESENT_VALUE, Box::new(|_, _, _| {})).unwrap();
		}

		assert!(db.bus.register(id, prop::PRESENT_VALUE, Box::new(|_, _, _| {})).is_err());
	}
}
