use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::time::{sleep, timeout};
use tracing::debug;

use crate::cloudevent::CloudEvent;
use crate::model::TestId;
use crate::streams::producer::{NackCause, ProduceOutcome, ProduceRequest, ProducerHandle};

/// A record the consumer stream matched and indexed for this test.
#[derive(Debug, Clone)]
pub struct ConsumedEvent {
    pub key: CloudEvent,
    pub value: serde_json::Value,
}

/// Concurrent `(topic, correlation id) → consumed event` index. Only the
/// owning consumer stream writes; the owning test's scenario thread reads.
#[derive(Default)]
pub struct ConsumedIndex {
    records: DashMap<(String, String), ConsumedEvent>,
    skipped: AtomicU64,
}

impl ConsumedIndex {
    pub fn insert(&self, topic: &str, event: ConsumedEvent) {
        self.records
            .insert((topic.to_string(), event.key.correlationid.clone()), event);
    }

    pub fn get(&self, topic: &str, correlation_id: &str) -> Option<ConsumedEvent> {
        self.records
            .get(&(topic.to_string(), correlation_id.to_string()))
            .map(|entry| entry.clone())
    }

    pub fn record_skip(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Outcome of a consumed-event lookup from a scenario step.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Found(Box<ConsumedEvent>),
    /// Wait budget exhausted without a matching record.
    NotAvailable,
}

struct TestEntry {
    producer: ProducerHandle,
    consumed: Arc<ConsumedIndex>,
}

/// Per-process map of active tests to their streaming handles, consulted by
/// scenario step code. The owning execution state machine registers on
/// entering `Testing` and unregisters when it shuts down.
pub struct EventRegistry {
    tests: DashMap<TestId, TestEntry>,
    /// Scenario engines instantiate step listeners with no arguments; the
    /// suite thread registers here before the run so a listener can find
    /// its test.
    current: DashMap<ThreadId, TestId>,
    produce_timeout: Duration,
    fetch_poll: Duration,
}

impl EventRegistry {
    pub fn new(produce_timeout: Duration) -> Self {
        Self {
            tests: DashMap::new(),
            current: DashMap::new(),
            produce_timeout,
            fetch_poll: Duration::from_millis(50),
        }
    }

    pub fn register(
        &self,
        test_id: TestId,
        producer: ProducerHandle,
        consumed: Arc<ConsumedIndex>,
    ) {
        self.tests.insert(test_id, TestEntry { producer, consumed });
    }

    pub fn unregister(&self, test_id: &TestId) {
        self.tests.remove(test_id);
    }

    pub fn is_registered(&self, test_id: &TestId) -> bool {
        self.tests.contains_key(test_id)
    }

    /// Bind the calling scenario thread to a test for the duration of a
    /// suite run.
    pub fn enter_suite(&self, test_id: TestId) {
        self.current.insert(std::thread::current().id(), test_id);
    }

    pub fn exit_suite(&self) {
        self.current.remove(&std::thread::current().id());
    }

    /// The test bound to the calling thread, for no-arg step listeners.
    pub fn current_test(&self) -> Option<TestId> {
        self.current
            .get(&std::thread::current().id())
            .map(|entry| *entry)
    }

    /// Produce an event on behalf of a scenario step. Synchronous from the
    /// step's perspective; internally an ask to the producer stream bounded
    /// by the produce timeout.
    pub async fn produce_event(
        &self,
        test_id: TestId,
        topic: &str,
        key: CloudEvent,
        value: serde_json::Value,
    ) -> ProduceOutcome {
        let Some(entry) = self.tests.get(&test_id) else {
            return ProduceOutcome::Nack(NackCause::Closed);
        };
        let (reply, response) = oneshot::channel();
        entry.producer.produce(ProduceRequest {
            topic: topic.to_string(),
            key,
            value,
            reply,
        });
        drop(entry); // do not hold the map entry across the await

        match timeout(self.produce_timeout, response).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => ProduceOutcome::Nack(NackCause::Closed),
            Err(_) => ProduceOutcome::Nack(NackCause::Broker("ack timeout".to_string())),
        }
    }

    /// Look up a consumed event by correlation id, polling until the wait
    /// budget is exhausted.
    pub async fn fetch_consumed(
        &self,
        test_id: TestId,
        topic: &str,
        correlation_id: &str,
        wait_budget: Duration,
    ) -> FetchOutcome {
        let deadline = tokio::time::Instant::now() + wait_budget;
        let mut backoff = self.fetch_poll;
        loop {
            if let Some(entry) = self.tests.get(&test_id) {
                if let Some(event) = entry.consumed.get(topic, correlation_id) {
                    return FetchOutcome::Found(Box::new(event));
                }
            } else {
                debug!(%test_id, "fetch for unregistered test");
                return FetchOutcome::NotAvailable;
            }
            if tokio::time::Instant::now() + backoff > deadline {
                return FetchOutcome::NotAvailable;
            }
            sleep(backoff).await;
            backoff = (backoff * 2).min(Duration::from_millis(500));
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::streams::producer::ProducerMsg;

    fn sample_event(correlation_id: &str) -> ConsumedEvent {
        ConsumedEvent {
            key: CloudEvent::new("sut", "PaymentProcessed", "payments", correlation_id, "1.0"),
            value: serde_json::json!({"status": "done"}),
        }
    }

    fn registry() -> EventRegistry {
        EventRegistry::new(Duration::from_millis(200))
    }

    fn stub_producer() -> (ProducerHandle, mpsc::Receiver<ProducerMsg>) {
        let (tx, rx) = mpsc::channel(8);
        (ProducerHandle::for_tests(tx), rx)
    }

    #[tokio::test]
    async fn fetch_finds_indexed_event() {
        let registry = registry();
        let (producer, _rx) = stub_producer();
        let index = Arc::new(ConsumedIndex::default());
        let test_id = uuid::Uuid::now_v7();
        registry.register(test_id, producer, index.clone());

        index.insert("payments", sample_event("corr-1"));

        match registry
            .fetch_consumed(test_id, "payments", "corr-1", Duration::from_millis(100))
            .await
        {
            FetchOutcome::Found(event) => {
                assert_eq!(event.key.correlationid, "corr-1");
                assert_eq!(event.value["status"], "done");
            }
            other => panic!("expected Found, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn fetch_times_out_to_not_available() {
        let registry = registry();
        let (producer, _rx) = stub_producer();
        let test_id = uuid::Uuid::now_v7();
        registry.register(test_id, producer, Arc::new(ConsumedIndex::default()));

        let started = std::time::Instant::now();
        let outcome = registry
            .fetch_consumed(test_id, "payments", "corr-none", Duration::from_millis(150))
            .await;
        assert!(matches!(outcome, FetchOutcome::NotAvailable));
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn fetch_sees_event_arriving_mid_wait() {
        let registry = Arc::new(registry());
        let (producer, _rx) = stub_producer();
        let index = Arc::new(ConsumedIndex::default());
        let test_id = uuid::Uuid::now_v7();
        registry.register(test_id, producer, index.clone());

        let writer = {
            let index = index.clone();
            tokio::spawn(async move {
                sleep(Duration::from_millis(80)).await;
                index.insert("payments", sample_event("corr-2"));
            })
        };
        let outcome = registry
            .fetch_consumed(test_id, "payments", "corr-2", Duration::from_secs(2))
            .await;
        writer.await.unwrap();
        assert!(matches!(outcome, FetchOutcome::Found(_)));
    }

    #[tokio::test]
    async fn produce_for_unknown_test_is_nacked() {
        let registry = registry();
        let outcome = registry
            .produce_event(
                uuid::Uuid::now_v7(),
                "orders",
                CloudEvent::new("probe", "OrderEvent", "orders", "corr-1", "1.0"),
                serde_json::json!({}),
            )
            .await;
        assert_eq!(outcome, ProduceOutcome::Nack(NackCause::Closed));
    }

    #[tokio::test]
    async fn current_test_tracks_the_suite_thread() {
        let registry = registry();
        assert!(registry.current_test().is_none());
        let test_id = uuid::Uuid::now_v7();
        registry.enter_suite(test_id);
        assert_eq!(registry.current_test(), Some(test_id));
        registry.exit_suite();
        assert!(registry.current_test().is_none());
    }

    #[tokio::test]
    async fn unregister_reclaims_the_entry() {
        let registry = registry();
        let (producer, _rx) = stub_producer();
        let test_id = uuid::Uuid::now_v7();
        registry.register(test_id, producer, Arc::new(ConsumedIndex::default()));
        assert!(registry.is_registered(&test_id));
        registry.unregister(&test_id);
        assert!(!registry.is_registered(&test_id));
    }
}
