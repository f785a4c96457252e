//! The protocol-visible error taxonomy (Clause 18/19 of the standard): the three PDU kinds a
//! device can send back instead of a normal reply, plus the handler-facing wrapper around them.

use core::fmt;

/// An `Error-PDU`'s (class, code) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BacnetError {
	pub class: ErrorClass,
	pub code: ErrorCode,
}

impl BacnetError {
	pub const fn new(class: ErrorClass, code: ErrorCode) -> Self {
		Self { class, code }
	}

	pub const fn object(code: ErrorCode) -> Self {
		Self::new(ErrorClass::Object, code)
	}

	pub const fn property(code: ErrorCode) -> Self {
		Self::new(ErrorClass::Property, code)
	}

	pub const fn services(code: ErrorCode) -> Self {
		Self::new(ErrorClass::Services, code)
	}
}

impl fmt::Display for BacnetError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{:?}: {:?}", self.class, self.code)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorClass {
	Device = 0,
	Object = 1,
	Property = 2,
	Resources = 3,
	Security = 4,
	Services = 5,
	Vt = 6,
	Communication = 7,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
	Other = 0,
	UnknownObject = 31,
	UnknownProperty = 32,
	ValueOutOfRange = 37,
	WriteAccessDenied = 40,
	UnsupportedObjectType = 24,
	InvalidArrayIndex = 42,
	PropertyIsNotAnArray = 50,
	InconsistentParameters = 7,
	NoSpaceToAddListElement = 9,
	NoSpaceToWriteProperty = 10,
	ReadAccessDenied = 27,
	UnknownSubscription = 62,
	ObjectDeletionNotPermitted = 23,
	OptionalFunctionalityNotSupported = 45,
	ValueNotInitialized = 38,
	InvalidDataType = 41,
	DuplicateName = 48,
	DuplicateObjectId = 47,
	PasswordFailure = 26,
}

/// `Reject-PDU` reasons: the requesting PDU itself was malformed before any service logic ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RejectReason {
	Other = 0,
	BufferOverflow = 1,
	InconsistentParameters = 2,
	InvalidParameterDataType = 3,
	InvalidTag = 4,
	MissingRequiredParameter = 5,
	ParameterOutOfRange = 6,
	TooManyArguments = 7,
	UndefinedEnumeration = 8,
	UnrecognizedService = 9,
}

/// `Abort-PDU` reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum AbortReason {
	Other = 0,
	BufferOverflow = 1,
	InvalidApduInThisState = 2,
	PreemptedByHigherPriorityTask = 3,
	SegmentationNotSupported = 4,
	SecurityError = 5,
	InsufficientSecurity = 6,
	WindowSizeOutOfRange = 7,
	ApplicationExceededReplyTime = 8,
	OutOfResources = 9,
	TsmTimeout = 10,
	ApduTooLong = 11,
}

/// What a service handler returns on failure. Bubbles up to the application orchestrator, which
/// translates it into the matching wire-level PDU (see the three-tier design in the module docs
/// for `crate::app`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerError {
	Error(BacnetError),
	Reject(RejectReason),
	Abort(AbortReason),
}

impl From<BacnetError> for HandlerError {
	fn from(e: BacnetError) -> Self {
		HandlerError::Error(e)
	}
}

impl From<RejectReason> for HandlerError {
	fn from(r: RejectReason) -> Self {
		HandlerError::Reject(r)
	}
}

impl From<AbortReason> for HandlerError {
	fn from(a: AbortReason) -> Self {
		HandlerError::Abort(a)
	}
}
