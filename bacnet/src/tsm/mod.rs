//! Transaction state machines: the client side and server side of confirmed-request
//! correlation.

pub mod client;
pub mod server;
