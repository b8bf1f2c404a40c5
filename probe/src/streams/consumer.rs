use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::Message;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::KafkaConfig;
use crate::execution::{ChildKind, FsmMsg};
use crate::metrics::report_skipped_record;
use crate::model::{
    BlockStorageDirective, EventFilter, ExecError, KafkaSecurityDirective, SchemaType, TestId,
    TopicRole,
};
use crate::registry::{ConsumedEvent, ConsumedIndex};
use crate::schema::{RecordCodec, SerdeFactory};
use crate::streams::{client_config, security_for};

pub enum ConsumerMsg {
    Initialize {
        directive: BlockStorageDirective,
        security: Vec<KafkaSecurityDirective>,
    },
    Stop,
}

#[derive(Clone)]
pub struct ConsumerHandle {
    tx: mpsc::Sender<ConsumerMsg>,
    token: CancellationToken,
}

impl ConsumerHandle {
    #[cfg(test)]
    pub(crate) fn for_tests(tx: mpsc::Sender<ConsumerMsg>) -> Self {
        Self {
            tx,
            token: CancellationToken::new(),
        }
    }

    pub async fn initialize(
        &self,
        directive: BlockStorageDirective,
        security: Vec<KafkaSecurityDirective>,
    ) {
        let _unused = self
            .tx
            .send(ConsumerMsg::Initialize {
                directive,
                security,
            })
            .await;
    }

    /// Cooperative stop: short-circuits the polling loops, then lets the
    /// worker drain and close its clients.
    pub async fn stop(&self) {
        self.token.cancel();
        let _unused = self.tx.send(ConsumerMsg::Stop).await;
    }
}

/// Everything the poll loop needs to know about one subscribed topic.
struct TopicRuntime {
    filters: Vec<EventFilter>,
    key_codec: Arc<RecordCodec>,
    value_schema_type: SchemaType,
    value_schemas: HashMap<String, String>,
}

pub struct ConsumerWorker {
    test_id: TestId,
    config: KafkaConfig,
    serde: Arc<SerdeFactory>,
    fsm: mpsc::Sender<FsmMsg>,
    index: Arc<ConsumedIndex>,
}

impl ConsumerWorker {
    pub fn spawn(
        test_id: TestId,
        config: KafkaConfig,
        serde: Arc<SerdeFactory>,
        fsm: mpsc::Sender<FsmMsg>,
        index: Arc<ConsumedIndex>,
    ) -> (ConsumerHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(8);
        let token = CancellationToken::new();
        let worker = Self {
            test_id,
            config,
            serde,
            fsm,
            index,
        };
        let join = tokio::spawn(worker.run(rx, token.clone()));
        (ConsumerHandle { tx, token }, join)
    }

    async fn run(self, mut rx: mpsc::Receiver<ConsumerMsg>, token: CancellationToken) {
        let mut poll_tasks: Vec<JoinHandle<()>> = Vec::new();
        let mut initialized = false;

        while let Some(msg) = rx.recv().await {
            match msg {
                ConsumerMsg::Initialize {
                    directive,
                    security,
                } => {
                    if initialized {
                        // second Initialize is a no-op, no duplicate ready ack
                        continue;
                    }
                    match self.start_polling(&directive, &security, &token).await {
                        Ok(tasks) => {
                            initialized = true;
                            poll_tasks = tasks;
                            let _unused = self
                                .fsm
                                .send(FsmMsg::ChildReady(ChildKind::Consumer))
                                .await;
                        }
                        Err(e) => {
                            error!(test_id = %self.test_id,
                                   "consumer stream failed to initialize: {e}");
                            let _unused = self
                                .fsm
                                .send(FsmMsg::ChildFailed(ChildKind::Consumer, e))
                                .await;
                        }
                    }
                }
                ConsumerMsg::Stop => break,
            }
        }

        token.cancel();
        for task in poll_tasks {
            let _unused = task.await;
        }
        debug!(test_id = %self.test_id, "consumer stream stopped");
    }

    /// Build one polling loop per cluster the consumer topics live on.
    async fn start_polling(
        &self,
        directive: &BlockStorageDirective,
        security: &[KafkaSecurityDirective],
        token: &CancellationToken,
    ) -> Result<Vec<JoinHandle<()>>, ExecError> {
        // cluster -> (consumer, topic runtimes)
        let mut clusters: HashMap<String, HashMap<String, TopicRuntime>> = HashMap::new();
        let mut security_by_cluster: HashMap<String, Option<&KafkaSecurityDirective>> =
            HashMap::new();

        for topic in directive.consumer_topics() {
            let bootstrap = topic
                .bootstrap_servers
                .clone()
                .unwrap_or_else(|| self.config.kafka_hosts.clone());
            let key_codec = self
                .serde
                .key_codec(&topic.topic, topic.key_schema_type())
                .await
                .map_err(|e| ExecError::KafkaFailed(format!("key serde: {e}")))?;
            security_by_cluster
                .entry(bootstrap.clone())
                .or_insert_with(|| security_for(security, &topic.topic, TopicRole::Consumer));
            clusters.entry(bootstrap).or_default().insert(
                topic.topic.clone(),
                TopicRuntime {
                    filters: topic.filters.clone(),
                    key_codec,
                    value_schema_type: topic.value_schema_type(),
                    value_schemas: topic.value_schemas.clone(),
                },
            );
        }

        let mut tasks = Vec::with_capacity(clusters.len());
        for (bootstrap, topics) in clusters {
            let mut config = client_config(
                &bootstrap,
                security_by_cluster.get(&bootstrap).copied().flatten(),
            );
            config
                .set("group.id", format!("probe-{}", self.test_id))
                .set("auto.offset.reset", "latest")
                .set("enable.auto.commit", "false")
                .set("enable.auto.offset.store", "false");
            let consumer: StreamConsumer = config
                .create()
                .map_err(|e| ExecError::KafkaFailed(format!("consumer create: {e}")))?;
            let names: Vec<&str> = topics.keys().map(String::as_str).collect();
            consumer
                .subscribe(&names)
                .map_err(|e| ExecError::KafkaFailed(format!("subscribe: {e}")))?;

            info!(test_id = %self.test_id, cluster = %bootstrap, topics = names.len(),
                  "consumer stream polling");
            tasks.push(tokio::spawn(poll_loop(
                self.test_id,
                consumer,
                topics,
                self.serde.clone(),
                self.index.clone(),
                self.config.kafka_commit_batch_size,
                self.config.kafka_commit_interval.0,
                token.clone(),
            )));
        }
        Ok(tasks)
    }
}

#[allow(clippy::too_many_arguments)]
async fn poll_loop(
    test_id: TestId,
    consumer: StreamConsumer,
    topics: HashMap<String, TopicRuntime>,
    serde: Arc<SerdeFactory>,
    index: Arc<ConsumedIndex>,
    commit_batch_size: usize,
    commit_interval: Duration,
    token: CancellationToken,
) {
    // every offset is staged, but only matching records count toward the
    // batch-size bound; non-matching offsets ride along in the same commit
    let mut staged: usize = 0;
    let mut matched_since_commit: usize = 0;
    let mut commit_deadline = Instant::now() + commit_interval;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep_until(commit_deadline) => {
                if staged > 0 {
                    commit(&consumer, CommitMode::Async, &mut staged, &mut matched_since_commit);
                }
                commit_deadline = Instant::now() + commit_interval;
            }
            received = consumer.recv() => {
                match received {
                    Err(e) => {
                        warn!(%test_id, "consumer poll error: {e}");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                    Ok(message) => {
                        let topic = message.topic().to_string();
                        if let Some(runtime) = topics.get(&topic) {
                            let matched = handle_record(
                                test_id,
                                &topic,
                                runtime,
                                message.key(),
                                message.payload(),
                                &serde,
                                &index,
                            )
                            .await;
                            if let Err(e) = consumer.store_offset(
                                &topic,
                                message.partition(),
                                message.offset(),
                            ) {
                                warn!(%test_id, "failed to store offset: {e}");
                            }
                            staged += 1;
                            if matched {
                                matched_since_commit += 1;
                            }
                            if matched_since_commit >= commit_batch_size {
                                commit(
                                    &consumer,
                                    CommitMode::Async,
                                    &mut staged,
                                    &mut matched_since_commit,
                                );
                                commit_deadline = Instant::now() + commit_interval;
                            }
                        }
                    }
                }
            }
        }
    }

    if staged > 0 {
        commit(&consumer, CommitMode::Sync, &mut staged, &mut matched_since_commit);
    }
}

fn commit(
    consumer: &StreamConsumer,
    mode: CommitMode,
    staged: &mut usize,
    matched_since_commit: &mut usize,
) {
    if let Err(e) = consumer.commit_consumer_state(mode) {
        warn!("offset commit failed: {e}");
    } else {
        metrics::counter!("probe_consumer_commits_total").increment(1);
        *staged = 0;
        *matched_since_commit = 0;
    }
}

/// Decode, filter and index one record. Returns true when the record
/// matched a filter and was indexed. Malformed records are skipped, never
/// fatal: the stream must survive poison pills.
async fn handle_record(
    test_id: TestId,
    topic: &str,
    runtime: &TopicRuntime,
    key_bytes: Option<&[u8]>,
    payload: Option<&[u8]>,
    serde: &SerdeFactory,
    index: &ConsumedIndex,
) -> bool {
    let Some(key_bytes) = key_bytes else {
        index.record_skip();
        report_skipped_record(topic, "missing_key");
        return false;
    };
    let key = match runtime.key_codec.decode_key(key_bytes) {
        Ok(key) => key,
        Err(e) => {
            index.record_skip();
            report_skipped_record(topic, "malformed_key");
            warn!(%test_id, topic, "skipping record with undecodable key: {e}");
            return false;
        }
    };

    let matches = runtime
        .filters
        .iter()
        .any(|f| f.event_type == key.event_type && f.payload_version == key.payloadversion);
    if !matches {
        return false;
    }

    let Some(payload) = payload else {
        index.record_skip();
        report_skipped_record(topic, "empty_payload");
        return false;
    };
    let value_codec = match serde
        .value_codec(
            topic,
            runtime.value_schema_type,
            &key.event_type,
            runtime.value_schemas.get(&key.event_type).map(String::as_str),
        )
        .await
    {
        Ok(codec) => codec,
        Err(e) => {
            index.record_skip();
            report_skipped_record(topic, "no_value_schema");
            warn!(%test_id, topic, "skipping record without value codec: {e}");
            return false;
        }
    };
    let value = match value_codec.decode_value(payload) {
        Ok(value) => value,
        Err(e) => {
            index.record_skip();
            report_skipped_record(topic, "malformed_value");
            warn!(%test_id, topic, "skipping undecodable record: {e}");
            return false;
        }
    };

    // indexed before its offset is staged: a crash here re-delivers, and
    // the overwrite on the same correlation id is harmless
    index.insert(topic, ConsumedEvent { key, value });
    true
}
