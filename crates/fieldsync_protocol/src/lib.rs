//! # FieldSync Protocol
//!
//! Operation record types and the conflict-resolution policy for
//! FieldSync.
//!
//! This crate provides:
//! - [`OperationRecord`] for device-originated changes
//! - [`OperationId`] / [`DeviceId`] identity types
//! - [`Timestamp`] wall-clock instants for conflict comparison
//! - [`ConflictResolver`] with the device-priority policy
//!
//! This is a pure value-type crate with no I/O.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod conflict;
mod operation;

pub use conflict::{ConflictResolver, Resolution};
pub use operation::{
    DeviceId, OperationId, OperationRecord, OperationStatus, OperationType, Payload, Timestamp,
    FIELD_DEVICE_PREFIX,
};
