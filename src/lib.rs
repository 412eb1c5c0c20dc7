//! metersrv - power-quality meter acquisition and delivery pipeline
//!
//! Polls a three-phase power-quality meter over a Modbus RTU serial bus,
//! decodes register pairs into engineering units, and forwards each reading
//! to a remote collector. When the collector is unreachable, readings are
//! buffered in a durable local backlog and replayed in order once
//! connectivity resumes.

pub mod backlog;
pub mod collector;
pub mod config;
pub mod decode;
pub mod error;
pub mod logging;
pub mod probe;
pub mod reading;
pub mod router;
pub mod service;
pub mod transport;
pub mod uplink;

pub use error::{MeterError, Result, TransportError};
