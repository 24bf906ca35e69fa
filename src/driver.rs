//! Driver contract (C7): the operations a driver must expose so that the
//! client-facing routing layer stays driver-agnostic, per spec.md §4.7.
//!
//! Mirrors the original's `wal.Driver`/`trigger.Driver` satisfying a common
//! interface consumed by `pkg/client`; rendered here as an async trait the
//! way the teacher already renders `EventSink` with `async_trait`.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc::Sender;

use crate::config::Config;
use crate::error::Result;
use crate::listener_registry::ListenerRegistry;
use crate::model::{DatabaseEvent, ListenerConfig, Operation};

#[async_trait]
pub trait Driver: Send + Sync {
    /// Prepares state; must not contact the database yet. `registry` is used
    /// at dispatch time to resolve which listeners a changed table matches;
    /// `events` is where matched [`DatabaseEvent`]s are sent for the
    /// dispatcher to drain.
    async fn init(
        &mut self,
        config: &Config,
        registry: Arc<ListenerRegistry>,
        events: Sender<DatabaseEvent>,
    ) -> Result<()>;

    /// Begins delivering `mask` operations for `listener_uid`. May install
    /// server-side artifacts (trigger driver: functions/triggers/LISTEN).
    async fn handle_event_listen_start(
        &mut self,
        listener_uid: &str,
        config: &ListenerConfig,
        mask: Operation,
    ) -> Result<()>;

    /// Reverse of `handle_event_listen_start`.
    async fn handle_event_listen_stop(
        &mut self,
        listener_uid: &str,
        mask: Operation,
    ) -> Result<()>;

    /// Blocking loop that pushes events onto the event channel until
    /// `close` is called. Returns when the connection ends or is closed.
    async fn listen(&mut self) -> Result<()>;

    /// Cooperative shutdown. Releases the connection; not required to
    /// remove installed server-side artifacts (they're idempotent per
    /// session, per spec.md §4.7).
    async fn close(&mut self) -> Result<()>;
}
