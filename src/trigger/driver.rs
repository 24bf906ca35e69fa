//! Trigger driver (C6): the [`Driver`] implementation wiring the SQL codegen
//! in [`crate::trigger::sql`] to a live connection and `NOTIFY` stream.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc::{self, Sender, UnboundedReceiver};
use tracing::{info, warn};

use crate::config::Config;
use crate::driver::Driver;
use crate::error::{Error, Result};
use crate::listener_registry::ListenerRegistry;
use crate::model::{DatabaseEvent, Event, EventData, ListenerConfig, Operation};
use crate::trigger::connection::TriggerConnection;
use crate::trigger::sql;

const OPERATIONS: [Operation; 4] = [
    Operation::INSERT,
    Operation::UPDATE,
    Operation::DELETE,
    Operation::TRUNCATE,
];

pub struct TriggerDriver {
    connection: Option<TriggerConnection>,
    notifications: Option<UnboundedReceiver<(String, String)>>,
    events: Option<Sender<DatabaseEvent>>,
    connection_string: Option<String>,
    schema: String,
    // listener_uid -> (table, operations currently backed by a live trigger)
    installed: Mutex<HashMap<String, (String, Operation)>>,
}

impl TriggerDriver {
    pub fn new() -> Self {
        Self {
            connection: None,
            notifications: None,
            events: None,
            connection_string: None,
            schema: "public".to_string(),
            installed: Mutex::new(HashMap::new()),
        }
    }

    /// Connects on first use. `init` only prepares state, since `attach`
    /// (and the `handle_event_listen_start` calls it makes) can run before
    /// `start` ever calls `init`, so the triggers it installs must be able
    /// to connect here instead.
    async fn ensure_connected(&mut self) -> Result<()> {
        if self.connection.is_some() {
            return Ok(());
        }
        let connection_string = self
            .connection_string
            .clone()
            .ok_or_else(|| Error::connection("trigger driver not initialized"))?;
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let connection = TriggerConnection::connect(&connection_string, notify_tx).await?;
        self.connection = Some(connection);
        self.notifications = Some(notify_rx);
        Ok(())
    }

    fn connection(&self) -> Result<&TriggerConnection> {
        self.connection
            .as_ref()
            .ok_or_else(|| Error::connection("trigger driver not initialized"))
    }
}

impl Default for TriggerDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Driver for TriggerDriver {
    async fn init(
        &mut self,
        config: &Config,
        _registry: Arc<ListenerRegistry>,
        events: Sender<DatabaseEvent>,
    ) -> Result<()> {
        // Only prepares state; the actual connection is established lazily,
        // by `ensure_connected`, since `attach`'s `handle_event_listen_start`
        // calls run before `start` ever calls `init`.
        self.connection_string = Some(config.connection_string.clone());
        self.events = Some(events);
        self.schema = config.trigger_schema.clone();
        Ok(())
    }

    async fn handle_event_listen_start(
        &mut self,
        listener_uid: &str,
        config: &ListenerConfig,
        mask: Operation,
    ) -> Result<()> {
        self.ensure_connected().await?;
        for operation in OPERATIONS {
            if !mask.contains(operation) {
                continue;
            }
            let (ddl, channel) = sql::create_trigger_sql(&self.schema, listener_uid, config, operation)?;
            self.connection()?.batch_execute(&ddl).await?;
            self.connection()?.listen(&channel).await?;
            info!(listener_uid, operation = operation.name(), channel, "trigger installed");
        }

        let mut installed = self.installed.lock();
        let entry = installed
            .entry(listener_uid.to_string())
            .or_insert((config.qualified_table(), Operation::empty()));
        entry.1 = entry.1.union(mask);
        Ok(())
    }

    async fn handle_event_listen_stop(&mut self, listener_uid: &str, mask: Operation) -> Result<()> {
        for operation in OPERATIONS {
            if !mask.contains(operation) {
                continue;
            }
            let channel = sql::channel_name(&self.schema, listener_uid, operation)?;
            self.connection()?.unlisten(&channel).await?;
            let drop_sql = sql::drop_trigger_sql(&self.schema, listener_uid, operation)?;
            self.connection()?.batch_execute(&drop_sql).await?;
            info!(listener_uid, operation = operation.name(), "trigger removed");
        }

        let mut installed = self.installed.lock();
        if let Some(entry) = installed.get_mut(listener_uid) {
            entry.1 = Operation::from_bits(entry.1.bits() & !mask.bits());
            if entry.1 == Operation::empty() {
                installed.remove(listener_uid);
            }
        }
        Ok(())
    }

    async fn listen(&mut self) -> Result<()> {
        // No listener may have been attached before `start`, in which case
        // `ensure_connected` never ran.
        self.ensure_connected().await?;
        let mut notifications = self
            .notifications
            .take()
            .ok_or_else(|| Error::connection("trigger driver not initialized"))?;
        let events = self
            .events
            .take()
            .ok_or_else(|| Error::connection("trigger driver not initialized"))?;

        while let Some((channel, payload)) = notifications.recv().await {
            if let Err(e) = dispatch_notification(&channel, &payload, &events).await {
                warn!(channel, error = %e, "failed to dispatch notification");
            }
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(connection) = self.connection.take() {
            connection.close()?;
        }
        Ok(())
    }
}

async fn dispatch_notification(channel: &str, payload: &str, events: &Sender<DatabaseEvent>) -> Result<()> {
    let (listener_uid, operation) = sql::parse_channel_name(channel)?;
    let event = parse_event_payload(operation, payload)?;
    events
        .send(DatabaseEvent { listener_uid, event })
        .await
        .map_err(|_| Error::connection("event channel closed"))
}

/// Parses the `JSONB_BUILD_OBJECT('old', ..., 'new', ...)` payload the
/// generated trigger function sends, per operation shape from
/// `sql::create_trigger_sql`.
fn parse_event_payload(operation: Operation, payload: &str) -> Result<Event> {
    if operation == Operation::TRUNCATE {
        return Ok(Event::Truncate);
    }
    let value: Value = serde_json::from_str(payload)?;
    let extract = |key: &str| -> Option<EventData> {
        value.get(key).and_then(|v| v.as_object()).map(|obj| {
            obj.iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<EventData>()
        })
    };

    match operation {
        Operation::INSERT => Ok(Event::Insert {
            new: extract("new").ok_or_else(|| Error::trigger("insert payload missing 'new'"))?,
        }),
        Operation::DELETE => Ok(Event::Delete {
            old: extract("old").ok_or_else(|| Error::trigger("delete payload missing 'old'"))?,
        }),
        Operation::UPDATE => Ok(Event::Update {
            old: extract("old"),
            new: extract("new").ok_or_else(|| Error::trigger("update payload missing 'new'"))?,
        }),
        _ => Err(Error::trigger("unsupported operation in notification payload")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_insert_payload() {
        let payload = r#"{"new": {"id": 1, "title": "hi"}}"#;
        let event = parse_event_payload(Operation::INSERT, payload).unwrap();
        match event {
            Event::Insert { new } => assert_eq!(new.get("title").unwrap(), &serde_json::json!("hi")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parses_truncate_payload_regardless_of_body() {
        let event = parse_event_payload(Operation::TRUNCATE, "null").unwrap();
        assert!(matches!(event, Event::Truncate));
    }

    #[test]
    fn update_without_old_is_none() {
        let payload = r#"{"new": {"id": 1}}"#;
        let event = parse_event_payload(Operation::UPDATE, payload).unwrap();
        match event {
            Event::Update { old, .. } => assert!(old.is_none()),
            other => panic!("unexpected {other:?}"),
        }
    }
}
