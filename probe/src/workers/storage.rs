use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::execution::{ChildKind, FsmMsg};
use crate::memfs::MemFs;
use crate::model::{BlockStorageDirective, ExecError, TestId};
use crate::storage::ObjectStore;

const MANIFEST_KEY: &str = "manifest.json";

pub enum StorageMsg {
    Initialize { bucket: String },
    UploadEvidence,
    Stop,
}

#[derive(Clone)]
pub struct StorageHandle {
    tx: mpsc::Sender<StorageMsg>,
}

impl StorageHandle {
    pub(crate) fn new(tx: mpsc::Sender<StorageMsg>) -> Self {
        Self { tx }
    }

    pub async fn initialize(&self, bucket: String) {
        let _unused = self.tx.send(StorageMsg::Initialize { bucket }).await;
    }

    pub async fn upload_evidence(&self) {
        let _unused = self.tx.send(StorageMsg::UploadEvidence).await;
    }

    pub async fn stop(&self) {
        let _unused = self.tx.send(StorageMsg::Stop).await;
    }
}

/// Materializes a bucket's manifest and scenario assets into the test's
/// in-memory filesystem, and pushes evidence back out on completion.
pub struct StorageWorker {
    test_id: TestId,
    store: Arc<dyn ObjectStore>,
    memfs: MemFs,
    fsm: mpsc::Sender<FsmMsg>,
    fetched: Option<BlockStorageDirective>,
}

impl StorageWorker {
    pub fn spawn(
        test_id: TestId,
        store: Arc<dyn ObjectStore>,
        memfs: MemFs,
        fsm: mpsc::Sender<FsmMsg>,
    ) -> (StorageHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(8);
        let worker = Self {
            test_id,
            store,
            memfs,
            fsm,
            fetched: None,
        };
        let join = tokio::spawn(worker.run(rx));
        (StorageHandle::new(tx), join)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<StorageMsg>) {
        while let Some(msg) = rx.recv().await {
            match msg {
                StorageMsg::Initialize { bucket } => {
                    if self.fetched.is_some() {
                        // second Initialize is a no-op, no duplicate ready ack
                        continue;
                    }
                    match self.fetch(&bucket).await {
                        Ok(directive) => {
                            self.fetched = Some(directive.clone());
                            let _unused = self
                                .fsm
                                .send(FsmMsg::ManifestFetched(Box::new(directive)))
                                .await;
                            let _unused = self.fsm.send(FsmMsg::ChildReady(ChildKind::Storage)).await;
                        }
                        Err(e) => {
                            error!(test_id = %self.test_id, bucket, "storage fetch failed: {e}");
                            let _unused = self
                                .fsm
                                .send(FsmMsg::ChildFailed(ChildKind::Storage, e))
                                .await;
                        }
                    }
                }
                StorageMsg::UploadEvidence => match self.upload().await {
                    Ok(count) => {
                        info!(test_id = %self.test_id, files = count, "evidence uploaded");
                        let _unused = self.fsm.send(FsmMsg::EvidenceUploaded).await;
                    }
                    Err(e) => {
                        error!(test_id = %self.test_id, "evidence upload failed: {e}");
                        let _unused = self
                            .fsm
                            .send(FsmMsg::ChildFailed(ChildKind::Storage, e))
                            .await;
                    }
                },
                StorageMsg::Stop => break,
            }
        }
        debug!(test_id = %self.test_id, "storage worker stopped");
    }

    async fn fetch(&self, bucket: &str) -> Result<BlockStorageDirective, ExecError> {
        let manifest = self
            .store
            .get(bucket, MANIFEST_KEY)
            .await
            .map_err(|e| ExecError::StorageFailed(e.to_string()))?;
        let directive: BlockStorageDirective = serde_json::from_slice(&manifest)
            .map_err(|e| ExecError::StorageFailed(format!("unparseable manifest: {e}")))?;

        let root = directive.staging_root.trim_end_matches('/');
        self.memfs.write(&format!("{root}/{MANIFEST_KEY}"), manifest);
        for asset in &directive.assets {
            let body = self
                .store
                .get(bucket, asset)
                .await
                .map_err(|e| ExecError::StorageFailed(format!("asset {asset}: {e}")))?;
            self.memfs.write(&format!("{root}/{asset}"), body);
        }
        info!(test_id = %self.test_id, bucket, assets = directive.assets.len(),
              "manifest staged");
        Ok(directive)
    }

    async fn upload(&self) -> Result<usize, ExecError> {
        let Some(directive) = &self.fetched else {
            return Err(ExecError::StorageFailed(
                "no directive, nothing staged".to_string(),
            ));
        };
        let root = directive.staging_root.trim_end_matches('/');
        let evidence_dir = format!("{root}/{}", directive.evidence_dir.trim_matches('/'));
        let files = self.memfs.read_dir(&evidence_dir);
        let mut uploaded = 0;
        for (path, contents) in files {
            let relative = path
                .strip_prefix(&format!("{evidence_dir}/"))
                .unwrap_or(&path);
            let key = format!("evidence/{}/{relative}", self.test_id);
            self.store
                .put(&directive.bucket, &key, contents)
                .await
                .map_err(|e| ExecError::StorageFailed(format!("upload {key}: {e}")))?;
            uploaded += 1;
        }
        Ok(uploaded)
    }
}
