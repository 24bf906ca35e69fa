//! End-to-end dispatch test: a fake [`Driver`] that emits synthetic events
//! and verifies they reach the attached callback through [`Client`].
//! Exercises the attach → start → dispatch → close path without a real
//! database, the seam the WAL and trigger drivers both plug into.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use pg_rowcast::{Client, Config, DatabaseEvent, Driver, Event, EventData, ListenerConfig, Operation};
use pg_rowcast::listener_registry::ListenerRegistry;
use tokio::sync::mpsc::Sender;

struct FakeDriver {
    events: Option<Sender<DatabaseEvent>>,
    registry: Option<Arc<ListenerRegistry>>,
}

impl FakeDriver {
    fn new() -> Self {
        Self {
            events: None,
            registry: None,
        }
    }
}

#[async_trait]
impl Driver for FakeDriver {
    async fn init(
        &mut self,
        _config: &Config,
        registry: Arc<ListenerRegistry>,
        events: Sender<DatabaseEvent>,
    ) -> pg_rowcast::Result<()> {
        self.events = Some(events);
        self.registry = Some(registry);
        Ok(())
    }

    async fn handle_event_listen_start(
        &mut self,
        _listener_uid: &str,
        _config: &ListenerConfig,
        _mask: Operation,
    ) -> pg_rowcast::Result<()> {
        Ok(())
    }

    async fn handle_event_listen_stop(&mut self, _listener_uid: &str, _mask: Operation) -> pg_rowcast::Result<()> {
        Ok(())
    }

    async fn listen(&mut self) -> pg_rowcast::Result<()> {
        let events = self.events.take().unwrap();
        let registry = self.registry.clone().unwrap();

        for (listener_uid, fields) in registry.matching("public.posts", Operation::INSERT) {
            let mut new = EventData::new();
            new.insert("id".to_string(), serde_json::json!(1));
            new.insert("title".to_string(), serde_json::json!("hello"));
            let event = Event::Insert { new }.project(&fields);
            events
                .send(DatabaseEvent { listener_uid, event })
                .await
                .ok();
        }
        drop(events);
        Ok(())
    }

    async fn close(&mut self) -> pg_rowcast::Result<()> {
        Ok(())
    }
}

fn test_config() -> Config {
    // SAFETY: test-only env manipulation, no concurrent test in this binary
    // touches these variables.
    unsafe {
        std::env::set_var("DATABASE_URL", "postgresql://test@localhost/test");
    }
    let config = Config::from_env().unwrap();
    unsafe {
        std::env::remove_var("DATABASE_URL");
    }
    config
}

#[tokio::test]
async fn attached_callback_receives_dispatched_event() {
    let config = test_config();
    let mut client = Client::new(config, Box::new(FakeDriver::new()));

    let received = Arc::new(AtomicUsize::new(0));
    let received_clone = received.clone();
    let callback: pg_rowcast::event_channel::Callback = Arc::new(move |event| {
        if let Event::Insert { new } = event {
            assert_eq!(new.get("title").unwrap(), &serde_json::json!("hello"));
            received_clone.fetch_add(1, Ordering::SeqCst);
        } else {
            panic!("expected insert event");
        }
    });

    let listener_config = ListenerConfig::new("public.posts");
    let listener = client
        .attach(None, listener_config, Operation::INSERT, callback)
        .await
        .unwrap();

    client.start().await.unwrap();
    client.detach(&listener, Operation::INSERT).await.unwrap();

    assert_eq!(received.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unmatched_table_receives_nothing() {
    let config = test_config();
    let mut client = Client::new(config, Box::new(FakeDriver::new()));

    let received = Arc::new(AtomicUsize::new(0));
    let received_clone = received.clone();
    let callback: pg_rowcast::event_channel::Callback = Arc::new(move |_event| {
        received_clone.fetch_add(1, Ordering::SeqCst);
    });

    // Listener attached to a different table than the one FakeDriver emits for.
    let listener_config = ListenerConfig::new("public.comments");
    client
        .attach(None, listener_config, Operation::INSERT, callback)
        .await
        .unwrap();

    client.start().await.unwrap();
    assert_eq!(received.load(Ordering::SeqCst), 0);
}
