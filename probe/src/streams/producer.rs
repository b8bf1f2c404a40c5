use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cloudevent::CloudEvent;
use crate::config::KafkaConfig;
use crate::execution::{ChildKind, FsmMsg};
use crate::model::{BlockStorageDirective, ExecError, KafkaSecurityDirective, TestId, TopicRole};
use crate::schema::{RecordCodec, SerdeFactory};
use crate::streams::{client_config, security_for};

struct ProducerContext;

impl rdkafka::ClientContext for ProducerContext {
    fn stats(&self, stats: rdkafka::Statistics) {
        metrics::gauge!("probe_producer_queue_depth").set(stats.msg_cnt as f64);
        metrics::gauge!("probe_producer_queue_bytes").set(stats.msg_size as f64);
    }
}

/// Why a produce request was not acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NackCause {
    /// The send queue is full; the caller should slow down.
    Overloaded,
    /// The worker has not been initialized with its directives yet.
    NotReady,
    /// The topic is not a producer topic of this test.
    UnknownTopic(String),
    Serialization(String),
    Broker(String),
    /// The worker is gone.
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProduceOutcome {
    Ack,
    Nack(NackCause),
}

pub struct ProduceRequest {
    pub topic: String,
    pub key: CloudEvent,
    pub value: serde_json::Value,
    pub reply: oneshot::Sender<ProduceOutcome>,
}

pub enum ProducerMsg {
    Initialize {
        directive: BlockStorageDirective,
        security: Vec<KafkaSecurityDirective>,
    },
    Produce(ProduceRequest),
    Stop,
}

/// Cheap handle to the producer worker. Produce requests go through a
/// bounded queue; overflow nacks immediately instead of blocking the
/// scenario thread past its deadline.
#[derive(Clone)]
pub struct ProducerHandle {
    tx: mpsc::Sender<ProducerMsg>,
}

impl ProducerHandle {
    #[cfg(test)]
    pub(crate) fn for_tests(tx: mpsc::Sender<ProducerMsg>) -> Self {
        Self { tx }
    }

    pub async fn initialize(
        &self,
        directive: BlockStorageDirective,
        security: Vec<KafkaSecurityDirective>,
    ) {
        let _unused = self
            .tx
            .send(ProducerMsg::Initialize {
                directive,
                security,
            })
            .await;
    }

    /// Enqueue a produce request. The reply arrives on `request.reply`; a
    /// full queue is answered here with `Nack(Overloaded)`.
    pub fn produce(&self, request: ProduceRequest) {
        if let Err(err) = self.tx.try_send(ProducerMsg::Produce(request)) {
            let request = match err {
                mpsc::error::TrySendError::Full(ProducerMsg::Produce(r)) => {
                    counter!("probe_produce_overflow_total").increment(1);
                    let _unused = r.reply.send(ProduceOutcome::Nack(NackCause::Overloaded));
                    return;
                }
                mpsc::error::TrySendError::Closed(ProducerMsg::Produce(r)) => r,
                _ => return,
            };
            let _unused = request.reply.send(ProduceOutcome::Nack(NackCause::Closed));
        }
    }

    pub async fn stop(&self) {
        let _unused = self.tx.send(ProducerMsg::Stop).await;
    }
}

struct Initialized {
    directive: BlockStorageDirective,
    // one client per distinct cluster
    producers: HashMap<String, FutureProducer<ProducerContext>>,
    topic_cluster: HashMap<String, String>,
    key_codecs: HashMap<String, Arc<RecordCodec>>,
}

pub struct ProducerWorker {
    test_id: TestId,
    config: KafkaConfig,
    serde: Arc<SerdeFactory>,
    fsm: mpsc::Sender<FsmMsg>,
    state: Option<Initialized>,
}

impl ProducerWorker {
    pub fn spawn(
        test_id: TestId,
        config: KafkaConfig,
        serde: Arc<SerdeFactory>,
        fsm: mpsc::Sender<FsmMsg>,
    ) -> (ProducerHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.kafka_produce_queue_depth);
        let worker = Self {
            test_id,
            config,
            serde,
            fsm,
            state: None,
        };
        let join = tokio::spawn(worker.run(rx));
        (ProducerHandle { tx }, join)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<ProducerMsg>) {
        while let Some(msg) = rx.recv().await {
            match msg {
                ProducerMsg::Initialize {
                    directive,
                    security,
                } => self.handle_initialize(directive, security).await,
                ProducerMsg::Produce(request) => {
                    let outcome = self.handle_produce(&request).await;
                    if let ProduceOutcome::Nack(cause) = &outcome {
                        counter!("probe_produce_nacks_total").increment(1);
                        warn!(test_id = %self.test_id, topic = %request.topic,
                              ?cause, "produce not acknowledged");
                    } else {
                        counter!("probe_produce_acks_total").increment(1);
                    }
                    let _unused = request.reply.send(outcome);
                }
                ProducerMsg::Stop => break,
            }
        }
        // Drain the in-flight librdkafka queues before going away.
        if let Some(state) = &self.state {
            for producer in state.producers.values() {
                use rdkafka::producer::Producer;
                let _unused = producer.flush(Duration::from_secs(5));
            }
        }
        debug!(test_id = %self.test_id, "producer stream stopped");
    }

    async fn handle_initialize(
        &mut self,
        directive: BlockStorageDirective,
        security: Vec<KafkaSecurityDirective>,
    ) {
        if self.state.is_some() {
            // second Initialize is a no-op, no duplicate ready ack
            return;
        }
        match self.build(&directive, &security).await {
            Ok(state) => {
                self.state = Some(state);
                let _unused = self.fsm.send(FsmMsg::ChildReady(ChildKind::Producer)).await;
            }
            Err(e) => {
                error!(test_id = %self.test_id, "producer stream failed to initialize: {e}");
                let _unused = self
                    .fsm
                    .send(FsmMsg::ChildFailed(ChildKind::Producer, e))
                    .await;
            }
        }
    }

    async fn build(
        &self,
        directive: &BlockStorageDirective,
        security: &[KafkaSecurityDirective],
    ) -> Result<Initialized, ExecError> {
        let mut producers = HashMap::new();
        let mut topic_cluster = HashMap::new();
        let mut key_codecs = HashMap::new();

        for topic in directive.producer_topics() {
            let bootstrap = topic
                .bootstrap_servers
                .clone()
                .unwrap_or_else(|| self.config.kafka_hosts.clone());
            if !producers.contains_key(&bootstrap) {
                let mut client_config = client_config(
                    &bootstrap,
                    security_for(security, &topic.topic, TopicRole::Producer),
                );
                client_config
                    .set("linger.ms", self.config.kafka_producer_linger_ms.to_string())
                    .set(
                        "message.timeout.ms",
                        self.config.kafka_message_timeout_ms.to_string(),
                    )
                    .set(
                        "compression.codec",
                        self.config.kafka_compression_codec.to_owned(),
                    )
                    .set(
                        "queue.buffering.max.kbytes",
                        (self.config.kafka_producer_queue_mib * 1024).to_string(),
                    );
                let producer: FutureProducer<ProducerContext> = client_config
                    .create_with_context(ProducerContext)
                    .map_err(|e| ExecError::KafkaFailed(format!("producer create: {e}")))?;
                producers.insert(bootstrap.clone(), producer);
            }
            topic_cluster.insert(topic.topic.clone(), bootstrap);

            let codec = self
                .serde
                .key_codec(&topic.topic, topic.key_schema_type())
                .await
                .map_err(|e| ExecError::KafkaFailed(format!("key serde: {e}")))?;
            key_codecs.insert(topic.topic.clone(), codec);
        }

        info!(test_id = %self.test_id, clusters = producers.len(),
              topics = topic_cluster.len(), "producer stream ready");
        Ok(Initialized {
            directive: directive.clone(),
            producers,
            topic_cluster,
            key_codecs,
        })
    }

    async fn handle_produce(&mut self, request: &ProduceRequest) -> ProduceOutcome {
        let Some(state) = &self.state else {
            return ProduceOutcome::Nack(NackCause::NotReady);
        };
        let Some(cluster) = state.topic_cluster.get(&request.topic) else {
            return ProduceOutcome::Nack(NackCause::UnknownTopic(request.topic.clone()));
        };
        let producer = &state.producers[cluster];
        let key_codec = &state.key_codecs[&request.topic];

        let key_bytes = match key_codec.encode_key(&request.key) {
            Ok(bytes) => bytes,
            Err(e) => return ProduceOutcome::Nack(NackCause::Serialization(e.to_string())),
        };

        let topic_directive = state
            .directive
            .topics
            .iter()
            .find(|t| t.topic == request.topic && t.role == TopicRole::Producer)
            .expect("topic_cluster entries come from producer topics");
        let record_name = request.key.event_type.as_str();
        let value_codec = match self
            .serde
            .value_codec(
                &request.topic,
                topic_directive.value_schema_type(),
                record_name,
                topic_directive
                    .value_schemas
                    .get(record_name)
                    .map(String::as_str),
            )
            .await
        {
            Ok(codec) => codec,
            Err(e) => return ProduceOutcome::Nack(NackCause::Serialization(e.to_string())),
        };
        let value_bytes = match value_codec.encode_value(&request.value) {
            Ok(bytes) => bytes,
            Err(e) => return ProduceOutcome::Nack(NackCause::Serialization(e.to_string())),
        };

        let record = FutureRecord::to(&request.topic)
            .key(&key_bytes)
            .payload(&value_bytes);
        match producer
            .send(
                record,
                Timeout::After(Duration::from_millis(
                    self.config.kafka_message_timeout_ms.into(),
                )),
            )
            .await
        {
            Ok(_) => ProduceOutcome::Ack,
            Err((KafkaError::MessageProduction(code), _)) => {
                ProduceOutcome::Nack(NackCause::Broker(code.to_string()))
            }
            Err((err, _)) => ProduceOutcome::Nack(NackCause::Broker(err.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn overflow_nacks_without_blocking() {
        // a queue of one with nobody draining it
        let (tx, _rx) = mpsc::channel(1);
        let handle = ProducerHandle::for_tests(tx);

        let (reply_a, _recv_a) = oneshot::channel();
        handle.produce(ProduceRequest {
            topic: "orders".to_string(),
            key: CloudEvent::new("probe", "OrderEvent", "orders", "corr-1", "1.0"),
            value: serde_json::json!({}),
            reply: reply_a,
        });

        let (reply_b, recv_b) = oneshot::channel();
        handle.produce(ProduceRequest {
            topic: "orders".to_string(),
            key: CloudEvent::new("probe", "OrderEvent", "orders", "corr-2", "1.0"),
            value: serde_json::json!({}),
            reply: reply_b,
        });

        assert_eq!(
            recv_b.await.unwrap(),
            ProduceOutcome::Nack(NackCause::Overloaded)
        );
    }

    #[tokio::test]
    async fn produce_round_trips_against_a_mock_cluster() {
        use rdkafka::mocking::MockCluster;

        let mut server = mockito::Server::new_async().await;
        server
            .mock(
                "POST",
                mockito::Matcher::Regex(r"^/subjects/.+/versions$".to_string()),
            )
            .with_status(200)
            .with_body(r#"{"id": 9}"#)
            .create_async()
            .await;
        let registry = Arc::new(
            crate::schema::client::SchemaRegistryClient::new(
                &server.url(),
                Duration::from_secs(2),
            )
            .unwrap(),
        );
        let serde = Arc::new(SerdeFactory::new(registry));

        let cluster = MockCluster::new(1).expect("failed to create mock brokers");
        let directive: BlockStorageDirective = serde_json::from_value(serde_json::json!({
            "bucket": "b",
            "staging-root": "/staging/t",
            "evidence-dir": "evidence",
            "topics": [{
                "topic": "orders",
                "role": "producer",
                "client-principal": "svc",
                "bootstrap-servers": cluster.bootstrap_servers(),
            }]
        }))
        .unwrap();

        let (fsm_tx, mut fsm_rx) = mpsc::channel(8);
        let (handle, _join) = ProducerWorker::spawn(
            uuid::Uuid::now_v7(),
            crate::streams::tests::kafka_config(),
            serde,
            fsm_tx,
        );
        handle.initialize(directive, vec![]).await;
        assert!(matches!(
            fsm_rx.recv().await.unwrap(),
            FsmMsg::ChildReady(ChildKind::Producer)
        ));

        // retry until the mock brokers accept writes
        let deadline = std::time::Instant::now() + Duration::from_secs(20);
        loop {
            let (reply, recv) = oneshot::channel();
            handle.produce(ProduceRequest {
                topic: "orders".to_string(),
                key: CloudEvent::new("probe", "OrderEvent", "orders", "corr-1", "1.0"),
                value: serde_json::json!({"order-id": "o-1"}),
                reply,
            });
            if recv.await.unwrap() == ProduceOutcome::Ack {
                break;
            }
            assert!(
                std::time::Instant::now() < deadline,
                "mock cluster never acked"
            );
        }

        // an unknown topic is nacked without touching the broker
        let (reply, recv) = oneshot::channel();
        handle.produce(ProduceRequest {
            topic: "not-a-topic".to_string(),
            key: CloudEvent::new("probe", "OrderEvent", "orders", "corr-2", "1.0"),
            value: serde_json::json!({}),
            reply,
        });
        assert!(matches!(
            recv.await.unwrap(),
            ProduceOutcome::Nack(NackCause::UnknownTopic(_))
        ));
    }

    #[tokio::test]
    async fn produce_before_initialize_is_nacked_not_ready() {
        let registry = Arc::new(
            crate::schema::client::SchemaRegistryClient::new(
                "http://127.0.0.1:1",
                Duration::from_millis(100),
            )
            .unwrap(),
        );
        let serde = Arc::new(SerdeFactory::new(registry));
        let (fsm_tx, _fsm_rx) = mpsc::channel(8);
        let config = crate::streams::tests::kafka_config();
        let (handle, _join) =
            ProducerWorker::spawn(uuid::Uuid::now_v7(), config, serde, fsm_tx);

        let (reply, recv) = oneshot::channel();
        handle.produce(ProduceRequest {
            topic: "orders".to_string(),
            key: CloudEvent::new("probe", "OrderEvent", "orders", "corr-1", "1.0"),
            value: serde_json::json!({}),
            reply,
        });
        assert_eq!(recv.await.unwrap(), ProduceOutcome::Nack(NackCause::NotReady));
    }
}
