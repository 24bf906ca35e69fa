//! Client facade (C9): the surface application code actually touches.
//!
//! Grounded on the Go original's `_examples/debug_trace/main.go` usage
//! pattern — `client.NewClient(cfg)`, `client.Attach(listener)`,
//! `go client.Start()`, `client.Close()` — rendered as an owned, `Send`
//! struct wrapping a boxed [`Driver`] plus the registry/dispatcher pair,
//! the way the teacher wraps `ReplicationServer` around its connection and
//! sink.

use std::sync::Arc;

use tokio::sync::mpsc::{Receiver, Sender};
use tracing::info;
use uuid::Uuid;

use crate::config::Config;
use crate::driver::Driver;
use crate::error::{Error, Result};
use crate::event_channel::{self, Callback, Dispatcher};
use crate::listener_registry::ListenerRegistry;
use crate::model::{DatabaseEvent, ListenerConfig, Operation};

/// A handle returned by [`Client::attach`]; dropping it does not detach —
/// call [`Client::detach`] explicitly, mirroring the original's returned
/// `stop func()` being an explicit call, not a `Drop` guard.
pub struct Listener {
    pub uid: String,
}

pub struct Client {
    config: Config,
    driver: Box<dyn Driver>,
    registry: Arc<ListenerRegistry>,
    dispatcher: Arc<Dispatcher>,
    tx: Option<Sender<DatabaseEvent>>,
    rx: Option<Receiver<DatabaseEvent>>,
    initialized: bool,
}

impl Client {
    pub fn new(config: Config, driver: Box<dyn Driver>) -> Self {
        let (tx, rx) = event_channel::channel();
        Self {
            config,
            driver,
            registry: Arc::new(ListenerRegistry::new()),
            dispatcher: Arc::new(Dispatcher::new()),
            tx: Some(tx),
            rx: Some(rx),
            initialized: false,
        }
    }

    /// Runs the driver's `init` exactly once, on whichever of `attach` or
    /// `start` is called first. `attach` calling `handle_event_listen_start`
    /// before `start` calls `init` (mirroring the original's `Attach` then
    /// `go Start()` usage) means `init` can't wait for `start` to run it.
    async fn ensure_driver_initialized(&mut self) -> Result<()> {
        if self.initialized {
            return Ok(());
        }
        let tx = self
            .tx
            .take()
            .ok_or_else(|| Error::connection("client already started"))?;
        self.driver.init(&self.config, self.registry.clone(), tx).await?;
        self.initialized = true;
        Ok(())
    }

    /// Registers `callback` for `mask` operations on `listener_config.table`.
    /// Returns a [`Listener`] handle carrying the auto-generated UID (or the
    /// caller-assigned one, if `listener_uid` is supplied) for later
    /// [`Client::detach`].
    pub async fn attach(
        &mut self,
        listener_uid: Option<String>,
        listener_config: ListenerConfig,
        mask: Operation,
        callback: Callback,
    ) -> Result<Listener> {
        let uid = listener_uid.unwrap_or_else(|| Uuid::new_v4().to_string());

        self.ensure_driver_initialized().await?;
        self.registry.attach(&uid, &listener_config, mask);
        self.dispatcher
            .register(&uid, listener_config.max_parallel_process, callback);
        self.driver
            .handle_event_listen_start(&uid, &listener_config, mask)
            .await?;

        info!(listener_uid = %uid, table = %listener_config.table, "listener attached");
        Ok(Listener { uid })
    }

    pub async fn detach(&mut self, listener: &Listener, mask: Operation) -> Result<()> {
        self.registry.detach(&listener.uid, mask);
        self.driver
            .handle_event_listen_stop(&listener.uid, mask)
            .await?;
        self.dispatcher.unregister(&listener.uid);
        info!(listener_uid = %listener.uid, "listener detached");
        Ok(())
    }

    /// Initializes the driver (if `attach` hasn't already) and runs its
    /// blocking `listen` loop, feeding the dispatcher until the driver
    /// returns (connection loss, or [`Client::close`] from another task).
    /// Mirrors the original's `go client.Start()` — callers are expected to
    /// spawn this.
    ///
    /// The dispatcher drains the channel on its own task so that events
    /// produced right before `listen()` returns still get delivered: the
    /// channel only closes once the driver drops its sender, which is the
    /// actual end-of-delivery signal, not `listen()` returning.
    pub async fn start(&mut self) -> Result<()> {
        self.ensure_driver_initialized().await?;
        let rx = self
            .rx
            .take()
            .ok_or_else(|| Error::connection("client already started"))?;

        let dispatcher = self.dispatcher.clone();
        let dispatch_task = tokio::spawn(async move { dispatcher.run(rx).await });

        let result = self.driver.listen().await;
        dispatch_task
            .await
            .map_err(|_| crate::error::Error::connection("dispatcher task panicked"))?;
        result
    }

    pub async fn close(&mut self) -> Result<()> {
        self.driver.close().await
    }

    pub fn registry(&self) -> &Arc<ListenerRegistry> {
        &self.registry
    }
}
