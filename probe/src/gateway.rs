//! Translation layer between the HTTP surface and the coordinator: one
//! function per external operation, each guarded by a per-endpoint circuit
//! breaker and a call deadline, with failures mapped onto the API taxonomy.

use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::timeout;

use crate::api::ApiError;
use crate::breaker::{BreakerError, CircuitBreaker};
use crate::config::BreakerConfig;
use crate::coordinator::CoordMsg;
use crate::execution::{AskReject, CancelAck, StartAck};
use crate::model::{QueueSnapshot, TestId, TestStatus};
use crate::supervisor::CoordinatorRef;

enum AskError {
    Timeout,
    Closed,
}

pub struct RequestGateway {
    coordinator: CoordinatorRef,
    call_timeout: Duration,
    initialize: CircuitBreaker,
    start: CircuitBreaker,
    status: CircuitBreaker,
    queue: CircuitBreaker,
    cancel: CircuitBreaker,
}

impl RequestGateway {
    pub fn new(coordinator: CoordinatorRef, config: &BreakerConfig) -> Self {
        let breaker = || CircuitBreaker::new(config.max_failures, config.reset_timeout.0);
        Self {
            coordinator,
            call_timeout: config.call_timeout.0,
            initialize: breaker(),
            start: breaker(),
            status: breaker(),
            queue: breaker(),
            cancel: breaker(),
        }
    }

    pub async fn initialize_test(&self) -> Result<TestId, ApiError> {
        self.ask(&self.initialize, |reply| CoordMsg::InitializeTest { reply })
            .await
    }

    pub async fn start_test(
        &self,
        test_id: TestId,
        bucket: String,
        test_type: Option<String>,
    ) -> Result<StartAck, ApiError> {
        if bucket.is_empty() {
            return Err(ApiError::ValidationFailed("bucket must not be empty".to_string()));
        }
        self.ask(&self.start, |reply| CoordMsg::StartTest {
            test_id,
            bucket,
            test_type,
            reply,
        })
        .await?
        .map_err(|AskReject::UnknownTest| ApiError::UnknownTest(test_id))
    }

    pub async fn get_status(&self, test_id: TestId) -> Result<TestStatus, ApiError> {
        self.ask(&self.status, |reply| CoordMsg::TestStatus { test_id, reply })
            .await?
            .map_err(|AskReject::UnknownTest| ApiError::UnknownTest(test_id))
    }

    pub async fn get_queue_status(&self) -> Result<QueueSnapshot, ApiError> {
        self.ask(&self.queue, |reply| CoordMsg::QueueStatus { reply })
            .await
    }

    pub async fn cancel_test(&self, test_id: TestId) -> Result<CancelAck, ApiError> {
        let ack = self
            .ask(&self.cancel, |reply| CoordMsg::Cancel { test_id, reply })
            .await?
            .map_err(|AskReject::UnknownTest| ApiError::UnknownTest(test_id))?;
        if ack.cancelled {
            Ok(ack)
        } else {
            Err(ApiError::Conflict(
                ack.message
                    .unwrap_or_else(|| "test is already terminal".to_string()),
            ))
        }
    }

    /// One guarded ask. Only transport failures (deadline, closed mailbox)
    /// count against the breaker; typed rejects from the coordinator are
    /// successful calls.
    async fn ask<T>(
        &self,
        breaker: &CircuitBreaker,
        make: impl FnOnce(oneshot::Sender<T>) -> CoordMsg,
    ) -> Result<T, ApiError> {
        let coordinator = &self.coordinator;
        let call_timeout = self.call_timeout;
        let result = breaker
            .call(|| async move {
                let (reply, response) = oneshot::channel();
                coordinator
                    .send(make(reply))
                    .await
                    .map_err(|_| AskError::Closed)?;
                match timeout(call_timeout, response).await {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(_)) => Err(AskError::Closed),
                    Err(_) => Err(AskError::Timeout),
                }
            })
            .await;

        match result {
            Ok(value) => Ok(value),
            Err(BreakerError::Open) => Err(ApiError::ServiceUnavailable),
            Err(BreakerError::Inner(AskError::Timeout)) => Err(ApiError::ServiceTimeout),
            Err(BreakerError::Inner(AskError::Closed)) => Err(ApiError::ServiceUnavailable),
        }
    }
}
