//! Configuration loading for the change-capture core.
//!
//! Generalizes the teacher's `core::config::ReplicationConfig` (which chose
//! between HTTP/Hook0/STDOUT event sinks) to choosing between the WAL and
//! trigger drivers, with the same environment-variable-driven, validated
//! construction style.

use std::env;

use crate::error::{Error, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DriverKind {
    Wal,
    Trigger,
}

impl std::fmt::Display for DriverKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriverKind::Wal => write!(f, "wal"),
            DriverKind::Trigger => write!(f, "trigger"),
        }
    }
}

/// Top-level configuration for a [`crate::Client`].
#[derive(Debug, Clone)]
pub struct Config {
    pub connection_string: String,
    pub driver: DriverKind,
    /// WAL driver only. Defaults to `"sub"`.
    pub slot_name: String,
    /// WAL driver only. Defaults to `"pub"`.
    pub publication_name: String,
    /// WAL driver only: how often to send standby status updates absent
    /// server-requested feedback.
    pub feedback_interval_secs: u64,
    /// Trigger driver only: schema the generated functions/triggers live
    /// in. Defaults to `"public"`.
    pub trigger_schema: String,
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// # Environment variables
    /// - `DATABASE_URL` (required): PostgreSQL connection string.
    /// - `DRIVER`: `"wal"` or `"trigger"` (default: `"wal"`).
    /// - `SLOT_NAME` (default `"sub"`), `PUB_NAME` (default `"pub"`): WAL driver.
    /// - `TRIGGER_SCHEMA` (default `"public"`): trigger driver.
    pub fn from_env() -> Result<Self> {
        let connection_string = env::var("DATABASE_URL")
            .map_err(|_| Error::config("missing required DATABASE_URL environment variable"))?;

        let driver = match env::var("DRIVER").ok().as_deref() {
            None | Some("wal") => DriverKind::Wal,
            Some("trigger") => DriverKind::Trigger,
            Some(other) => {
                return Err(Error::config(format!(
                    "DRIVER must be one of 'wal' or 'trigger', got '{other}'"
                )));
            }
        };

        let slot_name = env::var("SLOT_NAME").unwrap_or_else(|_| "sub".to_string());
        let publication_name = env::var("PUB_NAME").unwrap_or_else(|_| "pub".to_string());
        let trigger_schema = env::var("TRIGGER_SCHEMA").unwrap_or_else(|_| "public".to_string());

        Self::validate_and_create(
            connection_string,
            driver,
            slot_name,
            publication_name,
            trigger_schema,
        )
    }

    fn validate_and_create(
        connection_string: String,
        driver: DriverKind,
        slot_name: String,
        publication_name: String,
        trigger_schema: String,
    ) -> Result<Self> {
        if connection_string.trim().is_empty() {
            return Err(Error::config("DATABASE_URL cannot be empty"));
        }

        if !slot_name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(Error::config(
                "SLOT_NAME can only contain alphanumeric characters and underscores",
            ));
        }
        if slot_name.len() > 63 {
            return Err(Error::config("SLOT_NAME cannot be longer than 63 characters"));
        }

        if publication_name.trim().is_empty() {
            return Err(Error::config("PUB_NAME cannot be empty"));
        }

        if trigger_schema.trim().is_empty() {
            return Err(Error::config("TRIGGER_SCHEMA cannot be empty"));
        }

        Ok(Self {
            connection_string,
            driver,
            slot_name,
            publication_name,
            feedback_interval_secs: 1,
            trigger_schema,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // env::set_var/remove_var races across tests in the same process.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn missing_database_url_is_an_error() {
        let _guard = ENV_LOCK.lock().unwrap();
        unsafe { env::remove_var("DATABASE_URL") };
        let result = Config::from_env();
        assert!(result.is_err());
    }

    #[test]
    fn defaults_are_wal_sub_pub_public() {
        let _guard = ENV_LOCK.lock().unwrap();
        unsafe {
            env::set_var("DATABASE_URL", "postgresql://test@localhost/test");
            env::remove_var("DRIVER");
            env::remove_var("SLOT_NAME");
            env::remove_var("PUB_NAME");
            env::remove_var("TRIGGER_SCHEMA");
        }

        let config = Config::from_env().unwrap();
        assert_eq!(config.driver, DriverKind::Wal);
        assert_eq!(config.slot_name, "sub");
        assert_eq!(config.publication_name, "pub");
        assert_eq!(config.trigger_schema, "public");

        unsafe { env::remove_var("DATABASE_URL") };
    }

    #[test]
    fn rejects_invalid_slot_name() {
        let _guard = ENV_LOCK.lock().unwrap();
        unsafe {
            env::set_var("DATABASE_URL", "postgresql://test@localhost/test");
            env::set_var("SLOT_NAME", "bad slot!");
        }
        let result = Config::from_env();
        assert!(result.is_err());
        unsafe {
            env::remove_var("DATABASE_URL");
            env::remove_var("SLOT_NAME");
        }
    }
}
