use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::VaultConfig;
use crate::execution::{ChildKind, FsmMsg};
use crate::model::{
    BlockStorageDirective, ExecError, KafkaSecurityDirective, SaslCredentials, SaslSecret,
    TestId, TopicRole,
};

pub enum VaultMsg {
    Initialize {
        directive: Box<BlockStorageDirective>,
    },
    Stop,
}

#[derive(Clone)]
pub struct VaultHandle {
    tx: mpsc::Sender<VaultMsg>,
}

impl VaultHandle {
    pub(crate) fn new(tx: mpsc::Sender<VaultMsg>) -> Self {
        Self { tx }
    }

    pub async fn initialize(&self, directive: BlockStorageDirective) {
        let _unused = self
            .tx
            .send(VaultMsg::Initialize {
                directive: Box::new(directive),
            })
            .await;
    }

    pub async fn stop(&self) {
        let _unused = self.tx.send(VaultMsg::Stop).await;
    }
}

/// The cloud function that trades topic principals for credentials.
#[async_trait]
pub trait VaultInvoker: Send + Sync {
    async fn invoke(&self, body: Value) -> Result<Value, ExecError>;
}

pub struct HttpVaultInvoker {
    url: String,
    http: reqwest::Client,
}

impl HttpVaultInvoker {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, ExecError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ExecError::VaultFailed(e.to_string()))?;
        Ok(Self {
            url: url.to_string(),
            http,
        })
    }
}

#[async_trait]
impl VaultInvoker for HttpVaultInvoker {
    async fn invoke(&self, body: Value) -> Result<Value, ExecError> {
        let response = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ExecError::VaultFailed(format!("invoke: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            // the body may carry secrets, only the status is safe to report
            return Err(ExecError::VaultFailed(format!("status {status}")));
        }
        response
            .json()
            .await
            .map_err(|e| ExecError::VaultFailed(format!("unparseable response: {e}")))
    }
}

/// Declarative projection from the vault response onto security directives:
/// a list path plus dotted paths resolved against each list element.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RosettaMapping {
    pub list: String,
    pub topic: String,
    pub role: String,
    pub security_protocol: String,
    pub sasl_mechanism: String,
    pub sasl_username: String,
    pub sasl_password: String,
}

impl Default for RosettaMapping {
    fn default() -> Self {
        Self {
            list: "credentials".to_string(),
            topic: "topic".to_string(),
            role: "role".to_string(),
            security_protocol: "security-protocol".to_string(),
            sasl_mechanism: "sasl.mechanism".to_string(),
            sasl_username: "sasl.username".to_string(),
            sasl_password: "sasl.password".to_string(),
        }
    }
}

impl RosettaMapping {
    pub fn from_config(raw: &str) -> Result<Self, ExecError> {
        if raw.is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(raw)
            .map_err(|e| ExecError::VaultFailed(format!("invalid rosetta mapping: {e}")))
    }

    pub fn apply(&self, response: &Value) -> Result<Vec<KafkaSecurityDirective>, ExecError> {
        let Some(Value::Array(entries)) = lookup(response, &self.list) else {
            return Err(ExecError::VaultFailed(format!(
                "response has no list at {}",
                self.list
            )));
        };

        let mut directives = Vec::with_capacity(entries.len());
        for entry in entries {
            let topic = require_str(entry, &self.topic)?;
            let role: TopicRole = match require_str(entry, &self.role)? {
                "producer" => TopicRole::Producer,
                "consumer" => TopicRole::Consumer,
                other => {
                    return Err(ExecError::VaultFailed(format!("unknown role {other}")))
                }
            };
            let security_protocol = require_str(entry, &self.security_protocol)?
                .parse()
                .map_err(ExecError::VaultFailed)?;

            let sasl = match (
                lookup_str(entry, &self.sasl_mechanism),
                lookup_str(entry, &self.sasl_username),
                lookup_str(entry, &self.sasl_password),
            ) {
                (Some(mechanism), Some(username), Some(password)) => Some(SaslCredentials {
                    mechanism: mechanism.to_string(),
                    username: username.to_string(),
                    password: SaslSecret::new(password.to_string()),
                }),
                _ => None,
            };

            directives.push(KafkaSecurityDirective {
                topic: topic.to_string(),
                role,
                security_protocol,
                sasl,
            });
        }
        Ok(directives)
    }
}

/// Resolve a dotted path against a JSON document.
fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

fn lookup_str<'a>(value: &'a Value, path: &str) -> Option<&'a str> {
    lookup(value, path).and_then(Value::as_str)
}

fn require_str<'a>(value: &'a Value, path: &str) -> Result<&'a str, ExecError> {
    lookup_str(value, path)
        .ok_or_else(|| ExecError::VaultFailed(format!("response missing {path}")))
}

/// Substitute `{{namespace.key}}` placeholders in a JSON template. A string
/// value that is exactly one placeholder is replaced by the variable's
/// value; placeholders embedded in longer strings interpolate its string
/// form. `request-params.*` is the only namespace fed from caller input.
pub fn render_template(template: &Value, vars: &HashMap<String, Value>) -> Value {
    match template {
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.starts_with("{{") && trimmed.ends_with("}}") && !trimmed[2..].contains("{{")
            {
                let key = trimmed[2..trimmed.len() - 2].trim();
                if let Some(value) = vars.get(key) {
                    return value.clone();
                }
            }
            let mut out = s.clone();
            for (key, value) in vars {
                let needle = format!("{{{{{key}}}}}");
                if out.contains(&needle) {
                    let replacement = match value {
                        Value::String(v) => v.clone(),
                        other => other.to_string(),
                    };
                    out = out.replace(&needle, &replacement);
                }
            }
            Value::String(out)
        }
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| render_template(v, vars)).collect())
        }
        Value::Object(fields) => Value::Object(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), render_template(v, vars)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn default_template() -> Value {
    serde_json::json!({
        "request-params": {
            "principals": "{{request-params.principals}}",
            "topics": "{{request-params.topics}}"
        },
        "requestor": "{{constants.requestor}}",
        "environment": "{{system.environment}}"
    })
}

/// Parsed vault configuration, validated once at boot so per-test spawns
/// cannot fail.
#[derive(Clone)]
pub struct VaultSpec {
    template: Value,
    mapping: RosettaMapping,
}

impl VaultSpec {
    pub fn from_config(config: &VaultConfig) -> Result<Self, ExecError> {
        let template = if config.request_template.is_empty() {
            default_template()
        } else {
            serde_json::from_str(&config.request_template)
                .map_err(|e| ExecError::VaultFailed(format!("invalid request template: {e}")))?
        };
        let mapping = RosettaMapping::from_config(&config.rosetta_mapping)?;
        Ok(Self { template, mapping })
    }
}

/// The only place credentials exist in memory: invokes the vault function
/// and projects the response into per-topic security directives.
pub struct VaultWorker {
    test_id: TestId,
    invoker: Arc<dyn VaultInvoker>,
    template: Value,
    mapping: RosettaMapping,
    fsm: mpsc::Sender<FsmMsg>,
    fetched: bool,
}

impl VaultWorker {
    pub fn spawn(
        test_id: TestId,
        spec: VaultSpec,
        invoker: Arc<dyn VaultInvoker>,
        fsm: mpsc::Sender<FsmMsg>,
    ) -> (VaultHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(8);
        let worker = Self {
            test_id,
            invoker,
            template: spec.template,
            mapping: spec.mapping,
            fsm,
            fetched: false,
        };
        let join = tokio::spawn(worker.run(rx));
        (VaultHandle::new(tx), join)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<VaultMsg>) {
        while let Some(msg) = rx.recv().await {
            match msg {
                VaultMsg::Initialize { directive } => {
                    if self.fetched {
                        // second Initialize is a no-op, no duplicate ready ack
                        continue;
                    }
                    match self.fetch(&directive).await {
                        Ok(directives) => {
                            self.fetched = true;
                            info!(test_id = %self.test_id, count = directives.len(),
                                  "security directives fetched");
                            let _unused = self.fsm.send(FsmMsg::SecurityFetched(directives)).await;
                            let _unused = self.fsm.send(FsmMsg::ChildReady(ChildKind::Vault)).await;
                        }
                        Err(e) => {
                            error!(test_id = %self.test_id, "vault fetch failed: {e}");
                            let _unused = self
                                .fsm
                                .send(FsmMsg::ChildFailed(ChildKind::Vault, e))
                                .await;
                        }
                    }
                }
                VaultMsg::Stop => break,
            }
        }
        debug!(test_id = %self.test_id, "vault worker stopped");
    }

    async fn fetch(
        &self,
        directive: &BlockStorageDirective,
    ) -> Result<Vec<KafkaSecurityDirective>, ExecError> {
        let vars = self.variables(directive);
        let body = render_template(&self.template, &vars);
        let response = self.invoker.invoke(body).await?;
        self.mapping.apply(&response)
    }

    fn variables(&self, directive: &BlockStorageDirective) -> HashMap<String, Value> {
        let principals: Vec<Value> = directive
            .topics
            .iter()
            .map(|t| Value::String(t.client_principal.clone()))
            .collect();
        let topics: Vec<Value> = directive
            .topics
            .iter()
            .map(|t| {
                serde_json::json!({
                    "topic": t.topic,
                    "role": t.role.to_string(),
                })
            })
            .collect();

        HashMap::from([
            (
                "request-params.principals".to_string(),
                Value::Array(principals),
            ),
            ("request-params.topics".to_string(), Value::Array(topics)),
            (
                "constants.requestor".to_string(),
                Value::String("probe".to_string()),
            ),
            (
                "system.environment".to_string(),
                Value::String(
                    std::env::var("PROBE_ENVIRONMENT").unwrap_or_else(|_| "local".to_string()),
                ),
            ),
        ])
    }
}
