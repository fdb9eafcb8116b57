//! Types shared by every courier crate: identifiers, status enums, the JSON
//! wire protocol spoken with the message server, and protocol constants.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::ProtocolError;
