//! Trigger-based driver (C6): generates a PL/pgSQL function + trigger per
//! (listener, operation), delivered over `pg_notify`/`LISTEN`/`NOTIFY`.

pub mod connection;
pub mod driver;
pub mod sql;

pub use driver::TriggerDriver;
