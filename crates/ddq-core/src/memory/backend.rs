//! The in-memory backend instance, its poller and its lease restorer.

use super::faults::Faults;
use super::store::{ClaimOutcome, ClaimedRow, MemoryStore, QueueTable, lock};
use async_trait::async_trait;
use ddq_proto::{
    BackendConfig, BackendError, BackendEvent, BackendFactory, BackendResult, Delivery,
    DeliveryHandle, DiagnosticAttribute, EventReceiver, EventSender, QueueBackend, event_channel,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

type Listener = Arc<Mutex<Option<EventSender>>>;

#[derive(Debug, Default)]
struct InstanceState {
    connected: bool,
    currently_polling: bool,
    currently_restoring: bool,
    poller: Option<JoinHandle<()>>,
    restorer: Option<JoinHandle<()>>,
}

/// A backend instance storing its queue in a shared [`QueueTable`].
pub struct MemoryBackend {
    config: BackendConfig,
    table: Arc<QueueTable>,
    faults: Faults,
    state: Mutex<InstanceState>,
    listener: Listener,
}

impl MemoryBackend {
    /// Creates an instance bound to `table`.
    pub fn new(config: BackendConfig, table: Arc<QueueTable>, faults: Faults) -> Self {
        Self {
            config,
            table,
            faults,
            state: Mutex::new(InstanceState::default()),
            listener: Arc::new(Mutex::new(None)),
        }
    }

    /// The table this instance reads and writes.
    pub fn table(&self) -> &Arc<QueueTable> {
        &self.table
    }

    fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }

    fn halt_polling(&self) {
        let mut state = lock(&self.state);
        let was_polling = state.poller.is_some();

        if let Some(poller) = state.poller.take() {
            poller.abort();
        }
        if let Some(restorer) = state.restorer.take() {
            restorer.abort();
        }
        if !self.faults.leak_diagnostics {
            state.currently_polling = false;
            state.currently_restoring = false;
        }

        if was_polling {
            debug!(owner = %self.config.owner, "Stopped polling");
        }
    }
}

impl Drop for MemoryBackend {
    fn drop(&mut self) {
        self.halt_polling();
    }
}

#[async_trait]
impl QueueBackend for MemoryBackend {
    async fn connect(&self) -> BackendResult<()> {
        lock(&self.state).connected = true;
        info!(
            owner = %self.config.owner,
            queue = %self.config.queue_key(),
            "Connected to in-memory queue"
        );
        Ok(())
    }

    async fn disconnect(&self) -> BackendResult<()> {
        self.halt_polling();
        lock(&self.state).connected = false;
        info!(owner = %self.config.owner, "Disconnected from in-memory queue");
        Ok(())
    }

    async fn start_listening(&self) -> BackendResult<()> {
        let mut state = lock(&self.state);
        if !state.connected {
            return Err(BackendError::NotConnected);
        }
        if state.poller.is_some() {
            return Ok(());
        }

        let poller = Poller {
            table: Arc::clone(&self.table),
            listener: Arc::clone(&self.listener),
            owner: self.config.owner.clone(),
            topic: self.config.topics.clone(),
            lifetime: self.config.heartbeat_lifetime(),
            limit: self.config.create_message_cycle_limit as usize,
            attempts: self.config.deadlock_count_limit,
            faults: self.faults,
        };
        let polling_delay = self.config.polling_delay();
        state.poller = Some(tokio::spawn(poller.run(polling_delay)));

        let table = Arc::clone(&self.table);
        let cleanup_delay = self.config.heartbeat_cleanup_delay();
        state.restorer = Some(tokio::spawn(restore_leases(table, cleanup_delay)));

        state.currently_polling = true;
        state.currently_restoring = true;
        debug!(owner = %self.config.owner, "Started polling");
        Ok(())
    }

    async fn stop_listening(&self) -> BackendResult<()> {
        self.halt_polling();
        Ok(())
    }

    async fn send_message(&self, payload: &str, topic: &str) -> BackendResult<()> {
        if !self.is_connected() {
            return Err(BackendError::NotConnected);
        }

        let id = self.table.insert(payload, topic, self.faults)?;
        debug!(id, topic, "Stored message");
        Ok(())
    }

    fn subscribe(&self) -> EventReceiver {
        let (tx, rx) = event_channel();
        *lock(&self.listener) = Some(tx);
        rx
    }

    fn clear_listeners(&self) {
        lock(&self.listener).take();
    }

    fn has_diagnostic(&self, attribute: DiagnosticAttribute) -> bool {
        let state = lock(&self.state);
        match attribute {
            DiagnosticAttribute::CurrentlyPolling => state.currently_polling,
            DiagnosticAttribute::CurrentlyRestoring => state.currently_restoring,
            DiagnosticAttribute::Poller => state.poller.is_some(),
            DiagnosticAttribute::Restorer => state.restorer.is_some(),
        }
    }

    fn config(&self) -> &BackendConfig {
        &self.config
    }
}

/// Periodically claims messages and hands them to the current listener.
struct Poller {
    table: Arc<QueueTable>,
    listener: Listener,
    owner: String,
    topic: String,
    lifetime: Duration,
    limit: usize,
    attempts: u32,
    faults: Faults,
}

impl Poller {
    async fn run(self, delay: Duration) {
        let mut ticker = tokio::time::interval(delay);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.poll_once().await;
        }
    }

    async fn poll_once(&self) {
        // Nobody to hand messages to: leave them available for other owners
        let Some(sender) = self.current_listener() else {
            return;
        };

        let outcome = self
            .table
            .claim(
                &self.owner,
                &self.topic,
                self.lifetime,
                self.limit,
                self.attempts,
                self.faults,
            )
            .await;

        let rows = match outcome {
            ClaimOutcome::Claimed(rows) => rows,
            ClaimOutcome::Contended => {
                warn!(owner = %self.owner, attempts = self.attempts, "Deadlock count limit reached");
                let _ = sender.send(BackendEvent::Error(BackendError::Other(format!(
                    "deadlock count limit of {} reached",
                    self.attempts
                ))));
                return;
            }
        };

        for row in rows {
            debug!(owner = %self.owner, id = row.id, payload = %row.payload, "Claimed message");
            let (id, lease) = (row.id, row.lease);
            let handle = MemoryDelivery {
                table: Arc::clone(&self.table),
                listener: Arc::clone(&self.listener),
                id,
                lease,
                owner: self.owner.clone(),
                lifetime: self.lifetime,
                faults: self.faults,
            };

            if sender.send(BackendEvent::Data(handle.into_delivery(row))).is_err() {
                // Listener dropped between claim and send; always release for real
                if let Err(e) = self.table.requeue(id, lease, &self.owner, Faults::none()) {
                    debug!(id, error = %e, "Could not release undelivered message");
                }
            }
        }
    }

    fn current_listener(&self) -> Option<EventSender> {
        lock(&self.listener)
            .as_ref()
            .filter(|tx| !tx.is_closed())
            .cloned()
    }
}

/// Periodically returns expired leases to the available pool.
async fn restore_leases(table: Arc<QueueTable>, delay: Duration) {
    let mut ticker = tokio::time::interval(delay);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let restored = table.restore_expired(Instant::now());
        if restored > 0 {
            debug!(restored, "Restored expired leases");
        }
    }
}

/// Lease operations for one claimed row.
struct MemoryDelivery {
    table: Arc<QueueTable>,
    listener: Listener,
    id: u64,
    lease: u64,
    owner: String,
    lifetime: Duration,
    faults: Faults,
}

impl MemoryDelivery {
    fn into_delivery(self, row: ClaimedRow) -> Delivery {
        Delivery::new(row.payload, row.topic, Arc::new(self))
    }

    /// Leases the row to the same owner again and emits it on the current
    /// listener, listening or not.
    fn hand_back(&self) -> BackendResult<()> {
        let row = self
            .table
            .reclaim(self.id, self.lease, &self.owner, self.lifetime, self.faults)?;
        let handle = MemoryDelivery {
            table: Arc::clone(&self.table),
            listener: Arc::clone(&self.listener),
            id: row.id,
            lease: row.lease,
            owner: self.owner.clone(),
            lifetime: self.lifetime,
            faults: self.faults,
        };

        let sender = lock(&self.listener).clone();
        if let Some(sender) = sender {
            let _ = sender.send(BackendEvent::Data(handle.into_delivery(row)));
        }
        debug!(id = self.id, owner = %self.owner, "Handed requeued message back to holder");
        Ok(())
    }
}

#[async_trait]
impl DeliveryHandle for MemoryDelivery {
    async fn requeue(&self) -> BackendResult<()> {
        if self.faults.requeue_to_holder {
            return self.hand_back();
        }
        self.table
            .requeue(self.id, self.lease, &self.owner, self.faults)?;
        debug!(id = self.id, owner = %self.owner, "Requeued message");
        Ok(())
    }

    async fn heartbeat(&self) -> BackendResult<()> {
        self.table
            .heartbeat(self.id, self.lease, &self.owner, self.lifetime, self.faults)?;
        debug!(id = self.id, owner = %self.owner, "Renewed lease");
        Ok(())
    }

    async fn remove(&self) -> BackendResult<()> {
        self.table.remove(self.id, self.lease, &self.owner, self.faults)?;
        debug!(id = self.id, owner = %self.owner, "Removed message");
        Ok(())
    }
}

/// Creates [`MemoryBackend`] instances that share one [`MemoryStore`].
#[derive(Debug, Clone, Default)]
pub struct MemoryBackendFactory {
    store: Arc<MemoryStore>,
    faults: Faults,
}

impl MemoryBackendFactory {
    /// Creates a factory for conforming backends.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a factory whose backends commit the given faults.
    pub fn with_faults(faults: Faults) -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            faults,
        }
    }

    /// The faults injected into created backends.
    pub fn faults(&self) -> Faults {
        self.faults
    }

    /// The table instances built from `config` would use.
    pub fn table(&self, config: &BackendConfig) -> Arc<QueueTable> {
        self.store.table(&config.queue_key())
    }
}

impl BackendFactory for MemoryBackendFactory {
    fn create(&self, config: BackendConfig) -> BackendResult<Arc<dyn QueueBackend>> {
        config.validate()?;
        let table = self.table(&config);
        Ok(Arc::new(MemoryBackend::new(config, table, self.faults)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::RowState;

    const WAIT: Duration = Duration::from_secs(3);

    fn test_config() -> BackendConfig {
        BackendConfig {
            polling_delay_ms: 20,
            heartbeat_cleanup_delay_ms: 20,
            ..BackendConfig::default()
        }
    }

    async fn next_delivery(rx: &mut EventReceiver) -> Delivery {
        match tokio::time::timeout(WAIT, rx.recv()).await {
            Ok(Some(BackendEvent::Data(delivery))) => delivery,
            other => panic!("expected a delivery, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let factory = MemoryBackendFactory::new();
        let backend = factory.create(test_config()).unwrap();

        let err = backend.send_message("message", "Test Topic").await.unwrap_err();
        assert_eq!(err, BackendError::NotConnected);
        assert!(matches!(
            backend.start_listening().await,
            Err(BackendError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_config() {
        let factory = MemoryBackendFactory::new();
        let config = BackendConfig {
            heartbeat_lifetime_seconds: 0,
            ..test_config()
        };
        assert!(matches!(
            factory.create(config),
            Err(BackendError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_diagnostics_follow_listening() {
        let factory = MemoryBackendFactory::new();
        let backend = factory.create(test_config()).unwrap();
        backend.connect().await.unwrap();

        for _ in 0..2 {
            assert!(DiagnosticAttribute::ALL.iter().all(|a| !backend.has_diagnostic(*a)));
            backend.start_listening().await.unwrap();
            assert!(DiagnosticAttribute::ALL.iter().all(|a| backend.has_diagnostic(*a)));
            backend.stop_listening().await.unwrap();
        }
        assert!(DiagnosticAttribute::ALL.iter().all(|a| !backend.has_diagnostic(*a)));
    }

    #[tokio::test]
    async fn test_leaked_diagnostics_fault() {
        let factory = MemoryBackendFactory::with_faults(Faults {
            leak_diagnostics: true,
            ..Faults::default()
        });
        let backend = factory.create(test_config()).unwrap();
        backend.connect().await.unwrap();
        backend.start_listening().await.unwrap();
        backend.stop_listening().await.unwrap();

        assert!(backend.has_diagnostic(DiagnosticAttribute::CurrentlyPolling));
        assert!(!backend.has_diagnostic(DiagnosticAttribute::Poller));
    }

    #[tokio::test]
    async fn test_delivery_then_remove() {
        let factory = MemoryBackendFactory::new();
        let backend = factory.create(test_config()).unwrap();
        backend.connect().await.unwrap();
        let mut rx = backend.subscribe();

        backend.send_message("message", "Test Topic").await.unwrap();
        backend.start_listening().await.unwrap();

        let delivery = next_delivery(&mut rx).await;
        assert_eq!(delivery.message(), "message");
        assert_eq!(delivery.topic(), "Test Topic");

        delivery.remove().await.unwrap();
        assert!(factory.table(backend.config()).is_empty());
        assert!(delivery.remove().await.is_err());

        backend.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_requeue_redelivers() {
        let factory = MemoryBackendFactory::new();
        let backend = factory.create(test_config()).unwrap();
        backend.connect().await.unwrap();
        let mut rx = backend.subscribe();
        backend.send_message("message", "Test Topic").await.unwrap();
        backend.start_listening().await.unwrap();

        let first = next_delivery(&mut rx).await;
        first.requeue().await.unwrap();
        let second = next_delivery(&mut rx).await;
        assert_eq!(second.message(), "message");
        second.remove().await.unwrap();

        backend.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_deadlock_limit_emits_error_event() {
        let factory = MemoryBackendFactory::with_faults(Faults {
            deadlocked: true,
            ..Faults::default()
        });
        let backend = factory.create(test_config()).unwrap();
        backend.connect().await.unwrap();
        let mut rx = backend.subscribe();
        backend.send_message("message", "Test Topic").await.unwrap();
        backend.start_listening().await.unwrap();

        match tokio::time::timeout(WAIT, rx.recv()).await {
            Ok(Some(BackendEvent::Error(BackendError::Other(message)))) => {
                assert_eq!(message, "deadlock count limit of 5 reached");
            }
            other => panic!("expected a deadlock error, got {:?}", other),
        }
        backend.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_requeue_to_holder_reaches_stopped_instance() {
        let factory = MemoryBackendFactory::with_faults(Faults {
            requeue_to_holder: true,
            ..Faults::default()
        });
        let one = factory.create(test_config()).unwrap();
        let two = factory.create(test_config().with_owner("testerTwo")).unwrap();
        one.connect().await.unwrap();
        two.connect().await.unwrap();
        let mut rx_one = one.subscribe();
        let mut rx_two = two.subscribe();
        one.send_message("multiMsg", "Test Topic").await.unwrap();
        one.start_listening().await.unwrap();

        let first = next_delivery(&mut rx_one).await;
        one.stop_listening().await.unwrap();
        two.start_listening().await.unwrap();
        first.requeue().await.unwrap();

        let again = next_delivery(&mut rx_one).await;
        assert_eq!(again.message(), "multiMsg");
        assert!(first.remove().await.is_err());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx_two.try_recv().is_err());

        again.remove().await.unwrap();
        one.disconnect().await.unwrap();
        two.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_noop_requeue_waits_for_lease_expiry() {
        let factory = MemoryBackendFactory::with_faults(Faults {
            noop_requeue: true,
            ..Faults::default()
        });
        let backend = factory.create(test_config()).unwrap();
        backend.connect().await.unwrap();
        let mut rx = backend.subscribe();
        backend.send_message("message", "Test Topic").await.unwrap();
        backend.start_listening().await.unwrap();

        let first = next_delivery(&mut rx).await;
        let requeued_at = Instant::now();
        first.requeue().await.unwrap();
        let second = next_delivery(&mut rx).await;

        assert!(requeued_at.elapsed() >= Duration::from_millis(900));
        second.remove().await.unwrap();
        backend.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_instances_share_table_but_not_leases() {
        let factory = MemoryBackendFactory::new();
        let one = factory.create(test_config()).unwrap();
        let two = factory.create(test_config().with_owner("testerTwo")).unwrap();
        one.connect().await.unwrap();
        two.connect().await.unwrap();

        let mut rx_one = one.subscribe();
        let mut rx_two = two.subscribe();
        one.send_message("multiMsg", "Test Topic").await.unwrap();
        one.start_listening().await.unwrap();
        two.start_listening().await.unwrap();

        let delivery = tokio::select! {
            Some(BackendEvent::Data(d)) = rx_one.recv() => d,
            Some(BackendEvent::Data(d)) = rx_two.recv() => d,
        };
        assert_eq!(delivery.message(), "multiMsg");

        // Several poll cycles later nobody else has it
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(rx_one.try_recv().is_err());
        assert!(rx_two.try_recv().is_err());

        delivery.remove().await.unwrap();
        one.disconnect().await.unwrap();
        two.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_lease_is_restored() {
        let factory = MemoryBackendFactory::new();
        let backend = factory.create(test_config()).unwrap();
        backend.connect().await.unwrap();
        let mut rx = backend.subscribe();
        backend.send_message("message", "Test Topic").await.unwrap();
        backend.start_listening().await.unwrap();

        let first = next_delivery(&mut rx).await;
        let delivered_at = Instant::now();
        let second = next_delivery(&mut rx).await;

        assert!(delivered_at.elapsed() >= Duration::from_millis(900));
        assert!(first.remove().await.is_err(), "expired lease must not be usable");
        second.remove().await.unwrap();

        backend.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_no_claims_without_listener() {
        let factory = MemoryBackendFactory::new();
        let backend = factory.create(test_config()).unwrap();
        backend.connect().await.unwrap();
        backend.send_message("message", "Test Topic").await.unwrap();
        backend.start_listening().await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let table = factory.table(backend.config());
        assert_eq!(table.states_of("message"), vec![RowState::Available]);

        backend.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_subscribe_closes_previous_receiver() {
        let factory = MemoryBackendFactory::new();
        let backend = factory.create(test_config()).unwrap();

        let mut old = backend.subscribe();
        let _new = backend.subscribe();
        assert!(old.recv().await.is_none());

        let mut current = backend.subscribe();
        backend.clear_listeners();
        assert!(current.recv().await.is_none());
    }
}
