//! Drives one logical-replication session to completion, parsing wire
//! messages and dispatching matched changes as [`DatabaseEvent`]s.
//!
//! Grounded on the teacher's `src/replication/server.rs` for the connection
//! lifecycle (check_wal_level → identify_system → ensure slot/publication →
//! START_REPLICATION → poll loop → feedback) and on the Go original's
//! `pkg/drivers/wal/process.go` for the transaction/streaming state machine
//! (stale-transaction detection, stream-queue buffering and replay).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::mpsc::Sender;
use tracing::{debug, info, trace, warn};

use crate::config::Config;
use crate::driver::Driver;
use crate::error::{Error, Result};
use crate::listener_registry::ListenerRegistry;
use crate::model::{DatabaseEvent, Event, EventData, Operation};
use crate::type_decoder;
use crate::wal::connection::PgConnection;
use crate::wal::parser::MessageParser;
use crate::wal::protocol::{
    ColumnData, ReplicationMessage, ReplicationState, TupleData, XLogRecPtr, Xid,
    PG_EPOCH_OFFSET_SECS,
};

/// Mutable state threaded through one replication session's message loop.
/// Split out from [`WalDriver`] so it can move into the blocking task
/// without taking the connection handle along.
struct SessionState {
    replication: ReplicationState,
    stream_queues: HashMap<Xid, Vec<ReplicationMessage>>,
    in_stream: bool,
    process_messages: bool,
    last_written_lsn: XLogRecPtr,
}

impl SessionState {
    fn new() -> Self {
        Self {
            replication: ReplicationState::new(),
            stream_queues: HashMap::new(),
            in_stream: false,
            process_messages: false,
            last_written_lsn: 0,
        }
    }
}

pub struct WalDriver {
    config: Option<Config>,
    registry: Option<Arc<ListenerRegistry>>,
    events: Option<Sender<DatabaseEvent>>,
    shutdown: Arc<AtomicBool>,
}

impl WalDriver {
    pub fn new() -> Self {
        Self {
            config: None,
            registry: None,
            events: None,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    fn check_wal_level(conn: &PgConnection) -> Result<()> {
        let result = conn.exec("SHOW wal_level")?;
        if !result.is_ok() || result.ntuples() == 0 {
            return Err(Error::config("unable to query wal_level"));
        }
        let level = result.getvalue(0, 0);
        if level != "logical" {
            return Err(Error::config(format!(
                "wal_level must be 'logical', found '{level}'"
            )));
        }
        Ok(())
    }

    fn check_publication(conn: &PgConnection, publication_name: &str) -> Result<()> {
        let query = format!(
            "SELECT 1 FROM pg_publication WHERE pubname = '{}'",
            escape_literal(publication_name)
        );
        let result = conn.exec(&query)?;
        if result.is_ok() && result.ntuples() > 0 {
            return Ok(());
        }

        // Lazily create the publication for all tables with active
        // listeners. spec.md names "created lazily if missing" without the
        // original implementing it (both the teacher and the Go source only
        // check-and-error); this driver follows the named behavior.
        info!(publication_name, "publication not found, creating FOR ALL TABLES");
        let create = format!(
            "CREATE PUBLICATION \"{}\" FOR ALL TABLES",
            sanitize_identifier(publication_name)
        );
        let result = conn.exec(&create)?;
        if !result.is_ok() {
            return Err(Error::config(format!(
                "failed to create publication '{publication_name}'"
            )));
        }
        Ok(())
    }

    fn check_replication_slot(conn: &PgConnection, slot_name: &str) -> Result<bool> {
        let query = format!(
            "SELECT 1 FROM pg_replication_slots WHERE slot_name = '{}'",
            escape_literal(slot_name)
        );
        let result = conn.exec(&query)?;
        Ok(result.is_ok() && result.ntuples() > 0)
    }

    fn create_replication_slot(conn: &PgConnection, slot_name: &str) -> Result<()> {
        let create = format!(
            "CREATE_REPLICATION_SLOT \"{}\" LOGICAL pgoutput NOEXPORT_SNAPSHOT",
            sanitize_identifier(slot_name)
        );
        let result = conn.exec(&create)?;
        if !result.is_ok() {
            return Err(Error::connection(format!(
                "failed to create replication slot '{slot_name}'"
            )));
        }
        Ok(())
    }

    fn start_replication(conn: &PgConnection, slot_name: &str, publication_name: &str) -> Result<()> {
        let query = format!(
            "START_REPLICATION SLOT \"{}\" LOGICAL 0/0 (proto_version '2', streaming 'on', publication_names '{}')",
            sanitize_identifier(slot_name),
            escape_literal(publication_name)
        );
        let result = conn.exec(&query)?;
        if !result.is_ok() {
            return Err(Error::connection("failed to start replication"));
        }
        Ok(())
    }
}

impl Default for WalDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Driver for WalDriver {
    async fn init(
        &mut self,
        config: &Config,
        registry: Arc<ListenerRegistry>,
        events: Sender<DatabaseEvent>,
    ) -> Result<()> {
        // Only prepares state; the replication connection and slot/publication
        // setup happen lazily in `listen`, since `attach` (and the
        // `handle_event_listen_start` calls it makes) runs before `start`
        // ever calls `init`.
        self.config = Some(config.clone());
        self.registry = Some(registry);
        self.events = Some(events);
        Ok(())
    }

    async fn handle_event_listen_start(
        &mut self,
        _listener_uid: &str,
        _config: &crate::model::ListenerConfig,
        _mask: Operation,
    ) -> Result<()> {
        // The publication is FOR ALL TABLES (see check_publication); no
        // per-listener server-side action is needed. Subscription is
        // entirely handled by the listener registry.
        Ok(())
    }

    async fn handle_event_listen_stop(&mut self, _listener_uid: &str, _mask: Operation) -> Result<()> {
        Ok(())
    }

    async fn listen(&mut self) -> Result<()> {
        let config = self
            .config
            .clone()
            .ok_or_else(|| Error::connection("driver not initialized"))?;
        let registry = self
            .registry
            .clone()
            .ok_or_else(|| Error::connection("driver not initialized"))?;
        let events = self
            .events
            .take()
            .ok_or_else(|| Error::connection("driver not initialized"))?;
        let feedback_interval = Duration::from_secs(config.feedback_interval_secs);
        let shutdown = self.shutdown.clone();

        let connection_string = config.connection_string.clone();
        let slot_name = config.slot_name.clone();
        let publication_name = config.publication_name.clone();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = PgConnection::connect(&connection_string)?;
            Self::check_wal_level(&conn)?;
            Self::check_publication(&conn, &publication_name)?;
            if !Self::check_replication_slot(&conn, &slot_name)? {
                info!(slot_name = %slot_name, "replication slot not found, creating");
                Self::create_replication_slot(&conn, &slot_name)?;
            }
            Self::start_replication(&conn, &slot_name, &publication_name)?;
            replication_loop(&conn, &registry, &events, feedback_interval, &shutdown)
        })
        .await??;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn replication_loop(
    conn: &PgConnection,
    registry: &Arc<ListenerRegistry>,
    events: &Sender<DatabaseEvent>,
    feedback_interval: Duration,
    shutdown: &Arc<AtomicBool>,
) -> Result<()> {
    let mut state = SessionState::new();
    let mut last_feedback = std::time::Instant::now();

    loop {
        if shutdown.load(Ordering::SeqCst) {
            debug!("shutdown requested, ending replication loop");
            return Ok(());
        }

        if last_feedback.elapsed() >= feedback_interval {
            send_feedback(conn, &state.replication)?;
            last_feedback = std::time::Instant::now();
        }

        match conn.get_copy_data(true)? {
            None => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Some(data) => process_copy_data(&data, &mut state, conn, registry, events)?,
        }
    }
}

fn process_copy_data(
    data: &[u8],
    state: &mut SessionState,
    conn: &PgConnection,
    registry: &Arc<ListenerRegistry>,
    events: &Sender<DatabaseEvent>,
) -> Result<()> {
    if data.is_empty() {
        return Ok(());
    }
    match data[0] {
        b'k' => process_keepalive(data, conn, state),
        b'w' => process_xlog_data(data, state, registry, events),
        other => {
            warn!(marker = other as char, "unexpected CopyData marker");
            Ok(())
        }
    }
}

fn process_keepalive(data: &[u8], conn: &PgConnection, state: &mut SessionState) -> Result<()> {
    if data.len() < 18 {
        return Err(Error::protocol("keepalive message too short"));
    }
    let wal_end = u64::from_be_bytes(data[1..9].try_into().unwrap());
    let reply_requested = data[17] != 0;
    state.replication.update_applied_lsn(wal_end);
    if reply_requested {
        send_feedback(conn, &state.replication)?;
    }
    Ok(())
}

fn process_xlog_data(
    data: &[u8],
    state: &mut SessionState,
    registry: &Arc<ListenerRegistry>,
    events: &Sender<DatabaseEvent>,
) -> Result<()> {
    if data.len() < 25 {
        return Err(Error::protocol("XLogData message too short"));
    }
    let wal_start = u64::from_be_bytes(data[1..9].try_into().unwrap());
    let payload = &data[25..];

    // Only advances the wire-read position. The position acknowledged to the
    // server as flushed advances separately, on Commit/StreamCommit only
    // (see ReplicationState::update_flushed_lsn).
    state.replication.update_received_lsn(wal_start);

    let message = MessageParser::parse_wal_message(payload, state.in_stream)?;
    process_message(message, false, state, registry, events)
}

/// Mirrors the Go original's `processMessage`: dispatches on message type,
/// applying the stale-transaction and stream-buffering rules. `from_queue`
/// distinguishes a stream-commit replay from the first time a message is
/// seen, matching the original's disambiguation.
fn process_message(
    message: ReplicationMessage,
    from_queue: bool,
    state: &mut SessionState,
    registry: &Arc<ListenerRegistry>,
    events: &Sender<DatabaseEvent>,
) -> Result<()> {
    // Row-change messages arriving mid-stream get buffered for in-order
    // replay on StreamCommit rather than dispatched immediately — checked
    // before the match consumes `message`, since a partially-destructured
    // value can no longer be cloned whole.
    if state.in_stream && !from_queue {
        if let Some(xid) = row_message_xid(&message) {
            state.stream_queues.entry(xid).or_default().push(message);
            return Ok(());
        }
    }

    match message {
        ReplicationMessage::Relation { relation } => {
            state.replication.add_relation(relation);
        }
        ReplicationMessage::Begin { final_lsn, .. } => {
            if state.last_written_lsn >= final_lsn {
                state.process_messages = false;
                trace!(final_lsn, "dropping stale transaction");
            } else {
                state.process_messages = true;
            }
        }
        ReplicationMessage::Commit { end_lsn, .. } => {
            state.process_messages = false;
            state.last_written_lsn = end_lsn;
            state.replication.update_flushed_lsn(end_lsn);
        }
        ReplicationMessage::StreamStart { xid } => {
            state.in_stream = true;
            state.stream_queues.entry(xid).or_default();
        }
        ReplicationMessage::StreamStop => {
            state.in_stream = false;
        }
        ReplicationMessage::StreamCommit { xid, end_lsn, .. } => {
            // Sequential replay only: reordering a transaction's own changes
            // would violate per-subscriber ordering (spec.md invariant 2).
            if let Some(queued) = state.stream_queues.remove(&xid) {
                for queued_message in queued {
                    process_message(queued_message, true, state, registry, events)?;
                }
            }
            state.last_written_lsn = end_lsn;
            state.replication.update_flushed_lsn(end_lsn);
        }
        ReplicationMessage::StreamAbort { xid, .. } => {
            state.stream_queues.remove(&xid);
        }
        ReplicationMessage::Insert { relation_oid, new_tuple, .. } => {
            if !state.process_messages && !from_queue {
                return Ok(());
            }
            dispatch_row_event(relation_oid, state, registry, events, |relation| {
                Event::Insert {
                    new: decode_tuple(relation, &new_tuple),
                }
            })?;
        }
        ReplicationMessage::Update { relation_oid, old_tuple, new_tuple, .. } => {
            if !state.process_messages && !from_queue {
                return Ok(());
            }
            dispatch_row_event(relation_oid, state, registry, events, |relation| Event::Update {
                old: old_tuple.as_ref().map(|t| decode_tuple(relation, t)),
                new: decode_tuple(relation, &new_tuple),
            })?;
        }
        ReplicationMessage::Delete { relation_oid, old_tuple, .. } => {
            if !state.process_messages && !from_queue {
                return Ok(());
            }
            dispatch_row_event(relation_oid, state, registry, events, |relation| Event::Delete {
                old: decode_tuple(relation, &old_tuple),
            })?;
        }
        ReplicationMessage::Truncate { relation_oids, .. } => {
            if !state.process_messages && !from_queue {
                return Ok(());
            }
            for oid in relation_oids {
                dispatch_row_event(oid, state, registry, events, |_relation| Event::Truncate)?;
            }
        }
    }
    Ok(())
}

/// The xid governing mid-stream buffering for row-change messages, or
/// `None` for message types that never stream (Relation, Begin, Commit, the
/// Stream* control messages themselves).
fn row_message_xid(message: &ReplicationMessage) -> Option<Xid> {
    match message {
        ReplicationMessage::Insert { xid, .. }
        | ReplicationMessage::Update { xid, .. }
        | ReplicationMessage::Delete { xid, .. }
        | ReplicationMessage::Truncate { xid, .. } => *xid,
        _ => None,
    }
}

fn dispatch_row_event(
    relation_oid: u32,
    state: &SessionState,
    registry: &Arc<ListenerRegistry>,
    events: &Sender<DatabaseEvent>,
    build_event: impl FnOnce(&crate::wal::protocol::RelationInfo) -> Event,
) -> Result<()> {
    let Some(relation) = state.replication.get_relation(relation_oid) else {
        return Err(Error::UnknownRelation(relation_oid));
    };
    let table = relation.qualified_name();
    let event = build_event(relation);
    let operation = event.operation();

    for (listener_uid, fields) in registry.matching(&table, operation) {
        let projected = event.project(&fields);
        let database_event = DatabaseEvent {
            listener_uid,
            event: projected,
        };
        if events.blocking_send(database_event).is_err() {
            return Err(Error::connection("event channel closed"));
        }
    }
    Ok(())
}

/// Decodes a wire tuple into an [`EventData`] map, matching columns to the
/// relation catalog by position. Unchanged-TOAST columns are simply absent
/// from the result, never represented as a null or placeholder.
fn decode_tuple(relation: &crate::wal::protocol::RelationInfo, tuple: &TupleData) -> EventData {
    let mut out = EventData::new();
    for (index, (_, data, _)) in tuple.columns.iter().enumerate() {
        let Some(column) = relation.columns.get(index) else {
            continue;
        };
        match data {
            ColumnData::Null => {
                out.insert(column.column_name.clone(), serde_json::Value::Null);
            }
            ColumnData::Unchanged => {}
            ColumnData::Text(text) => {
                out.insert(
                    column.column_name.clone(),
                    type_decoder::decode(column.column_type, text),
                );
            }
        }
    }
    out
}

fn send_feedback(conn: &PgConnection, state: &ReplicationState) -> Result<()> {
    let mut buffer = crate::wal::buffer::BufferWriter::with_capacity(34);
    buffer.write_char('r');
    buffer.write_u64(state.flushed_lsn);
    buffer.write_u64(state.flushed_lsn);
    buffer.write_u64(state.applied_lsn);
    buffer.write_i64(postgres_now());
    buffer.write_u8(0);
    conn.put_copy_data(&buffer.into_bytes())?;
    conn.flush()
}

fn postgres_now() -> i64 {
    let unix_secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as i64;
    unix_secs - PG_EPOCH_OFFSET_SECS * 1_000_000
}

fn sanitize_identifier(name: &str) -> String {
    name.replace('"', "\"\"")
}

fn escape_literal(value: &str) -> String {
    value.replace('\'', "''")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::protocol::{ColumnInfo, RelationInfo};

    const RELATION_OID: u32 = 42;

    fn registry_with_listener() -> Arc<ListenerRegistry> {
        let registry = Arc::new(ListenerRegistry::new());
        registry.attach(
            "listener-a",
            &crate::model::ListenerConfig::new("public.posts"),
            Operation::ALL,
        );
        registry
    }

    fn relation() -> ReplicationMessage {
        ReplicationMessage::Relation {
            relation: RelationInfo {
                oid: RELATION_OID,
                namespace: "public".into(),
                relation_name: "posts".into(),
                replica_identity: 'd',
                column_count: 1,
                columns: vec![ColumnInfo {
                    key_flag: true,
                    column_name: "id".into(),
                    column_type: 23,
                    atttypmod: -1,
                }],
            },
        }
    }

    fn insert(xid: Option<Xid>, id: i64) -> ReplicationMessage {
        ReplicationMessage::Insert {
            xid,
            relation_oid: RELATION_OID,
            new_tuple: TupleData {
                columns: vec![("id".into(), ColumnData::Text(id.to_string()), 23)],
            },
        }
    }

    fn harness() -> (SessionState, Arc<ListenerRegistry>, Sender<DatabaseEvent>, tokio::sync::mpsc::Receiver<DatabaseEvent>) {
        let registry = registry_with_listener();
        let (tx, rx) = tokio::sync::mpsc::channel(8);
        let mut state = SessionState::new();
        process_message(relation(), false, &mut state, &registry, &tx).unwrap();
        (state, registry, tx, rx)
    }

    #[test]
    fn stale_begin_drops_subsequent_inserts() {
        let (mut state, registry, tx, mut rx) = harness();
        state.last_written_lsn = 1000;

        process_message(
            ReplicationMessage::Begin { final_lsn: 500, timestamp: 0, xid: 1 },
            false,
            &mut state,
            &registry,
            &tx,
        )
        .unwrap();
        assert!(!state.process_messages);

        process_message(insert(None, 1), false, &mut state, &registry, &tx).unwrap();

        process_message(
            ReplicationMessage::Commit { flags: 0, commit_lsn: 500, end_lsn: 500, timestamp: 0 },
            false,
            &mut state,
            &registry,
            &tx,
        )
        .unwrap();

        drop(tx);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn streamed_transaction_aborted_emits_nothing() {
        let (mut state, registry, tx, mut rx) = harness();
        let xid = 7;

        process_message(ReplicationMessage::StreamStart { xid }, false, &mut state, &registry, &tx).unwrap();
        assert!(state.in_stream);

        for id in 0..3 {
            process_message(insert(Some(xid), id), false, &mut state, &registry, &tx).unwrap();
        }
        assert_eq!(state.stream_queues.get(&xid).map(|q| q.len()), Some(3));

        process_message(ReplicationMessage::StreamStop, false, &mut state, &registry, &tx).unwrap();
        process_message(
            ReplicationMessage::StreamAbort { xid, sub_xid: xid },
            false,
            &mut state,
            &registry,
            &tx,
        )
        .unwrap();

        drop(tx);
        assert!(rx.try_recv().is_err());
        assert!(!state.stream_queues.contains_key(&xid));
    }

    #[test]
    fn streamed_transaction_committed_replays_all_inserts_in_order() {
        let (mut state, registry, tx, mut rx) = harness();
        let xid = 9;

        process_message(
            ReplicationMessage::Begin { final_lsn: 10, timestamp: 0, xid },
            false,
            &mut state,
            &registry,
            &tx,
        )
        .unwrap();
        process_message(ReplicationMessage::StreamStart { xid }, false, &mut state, &registry, &tx).unwrap();

        for id in 0..3 {
            process_message(insert(Some(xid), id), false, &mut state, &registry, &tx).unwrap();
        }
        process_message(ReplicationMessage::StreamStop, false, &mut state, &registry, &tx).unwrap();

        process_message(
            ReplicationMessage::StreamCommit { xid, commit_lsn: 20, end_lsn: 20, timestamp: 0 },
            false,
            &mut state,
            &registry,
            &tx,
        )
        .unwrap();

        drop(tx);
        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let Event::Insert { new } = event.event {
                seen.push(new.get("id").unwrap().clone());
            }
        }
        assert_eq!(seen, vec![serde_json::json!(0), serde_json::json!(1), serde_json::json!(2)]);
        assert_eq!(state.last_written_lsn, 20);
    }

    #[test]
    fn insert_for_unknown_relation_is_a_hard_error() {
        let mut state = SessionState::new();
        let (tx, _rx) = tokio::sync::mpsc::channel(8);
        let registry = registry_with_listener();
        state.process_messages = true;

        let err = process_message(insert(None, 1), false, &mut state, &registry, &tx).unwrap_err();
        assert!(matches!(err, Error::UnknownRelation(RELATION_OID)));
    }
}
