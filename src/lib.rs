//! Row-level PostgreSQL change capture, delivered to in-process subscribers
//! via one of two interchangeable drivers: logical replication (WAL) or
//! per-table triggers with `LISTEN`/`NOTIFY`.
//!
//! See [`Client`] for the entry point, [`driver::Driver`] for the contract
//! both drivers satisfy, and the `wal`/`trigger` modules for the drivers
//! themselves.

pub mod client;
pub mod config;
pub mod driver;
pub mod error;
pub mod event_channel;
pub mod listener_registry;
pub mod model;
pub mod trigger;
pub mod type_decoder;
pub mod wal;

pub use client::Client;
pub use config::{Config, DriverKind};
pub use driver::Driver;
pub use error::{Error, Result};
pub use model::{DatabaseEvent, Event, EventData, ListenerConfig, Operation};
