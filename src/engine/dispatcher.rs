//! Sending query batches to the engine.

use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use super::classify;
use super::error::{EngineError, EngineResult, ItemResult, UnknownRequestError};
use super::protocol::{BatchRequest, BatchResponse};
use super::supervisor::EngineSupervisor;

/// How long a failed request waits for a dying engine to finish exiting, so
/// that its last output is available for classification.
const EXIT_SETTLE: Duration = Duration::from_millis(500);

/// Turns query batches into HTTP round-trips against the supervised engine.
///
/// The engine is started on first use. Each call is tracked by its own
/// [`PendingRequest`], so cancelling one request never reaches another.
#[derive(Debug, Clone)]
pub struct RequestDispatcher {
    supervisor: EngineSupervisor,
}

impl RequestDispatcher {
    pub fn new(supervisor: EngineSupervisor) -> Self {
        Self { supervisor }
    }

    pub fn supervisor(&self) -> &EngineSupervisor {
        &self.supervisor
    }

    /// Prepare a batch without sending it yet.
    ///
    /// The returned ticket exposes a cancellation handle before the request
    /// is awaited.
    pub fn submit<I, S>(&self, queries: I) -> RequestTicket
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        RequestTicket {
            pending: PendingRequest::new(),
            queries: queries.into_iter().map(Into::into).collect(),
            supervisor: self.supervisor.clone(),
        }
    }

    /// Send a batch and wait for one result per query, in input order.
    pub async fn send<I, S>(&self, queries: I) -> EngineResult<Vec<ItemResult>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.submit(queries).outcome().await
    }
}

/// Cancellation handle of one request.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    id: Uuid,
    token: CancellationToken,
}

impl PendingRequest {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            token: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Abandon the request. Has no effect once it completed.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// A prepared batch together with its cancellation handle.
#[derive(Debug)]
pub struct RequestTicket {
    pending: PendingRequest,
    queries: Vec<String>,
    supervisor: EngineSupervisor,
}

impl RequestTicket {
    pub fn id(&self) -> Uuid {
        self.pending.id
    }

    /// A handle that can cancel this request from elsewhere.
    pub fn handle(&self) -> PendingRequest {
        self.pending.clone()
    }

    /// Run the request to completion.
    pub async fn outcome(self) -> EngineResult<Vec<ItemResult>> {
        let RequestTicket {
            pending,
            queries,
            supervisor,
        } = self;

        if queries.is_empty() {
            return Ok(Vec::new());
        }

        let body = serde_json::to_string(&BatchRequest::from_queries(&queries))
            .map_err(EngineError::Serialize)?;

        let incarnation = tokio::select! {
            biased;
            _ = pending.token.cancelled() => return Err(EngineError::Canceled(pending.id)),
            started = supervisor.acquire() => started?,
        };

        let _guard = incarnation.track(pending.id, pending.token.clone());
        debug!(
            request = %pending.id,
            generation = incarnation.generation(),
            queries = queries.len(),
            "sending batch"
        );

        let transport = supervisor.transport();
        let sent = tokio::select! {
            biased;
            _ = pending.token.cancelled() => None,
            response = transport.post_batch(incarnation.base_url(), body) => Some(response),
        };

        let text = match sent {
            Some(Ok(text)) => text,
            Some(Err(err)) => {
                if err.is_connection_lost() {
                    incarnation.settle(EXIT_SETTLE).await;
                }
                debug!(request = %pending.id, error = %err, "batch failed");
                return Err(classify::transport_failure(
                    pending.token.is_cancelled(),
                    incarnation.last_failure().as_ref(),
                    &incarnation.diagnostics(),
                    err,
                ));
            }
            None => {
                debug!(request = %pending.id, "batch canceled");
                return Err(classify::cancellation(
                    pending.id,
                    incarnation.last_failure().as_ref(),
                ));
            }
        };

        decode_batch(&text, queries.len())
    }
}

/// Split a batch response into per-query results.
fn decode_batch(text: &str, expected: usize) -> EngineResult<Vec<ItemResult>> {
    let response: BatchResponse = serde_json::from_str(text).map_err(|e| {
        UnknownRequestError::new(format!("failed to decode engine response: {e}"))
    })?;

    let items = match response {
        BatchResponse::Items(items) | BatchResponse::Wrapped { batch_result: items } => items,
        BatchResponse::Rejected { errors } => return Err(classify::item_error(&errors).into()),
    };

    if items.len() != expected {
        return Err(UnknownRequestError::new(format!(
            "engine returned {} results for {} queries",
            items.len(),
            expected
        ))
        .into());
    }

    Ok(items
        .into_iter()
        .map(|item| {
            if item.errors.is_empty() {
                Ok(item.data.unwrap_or(Value::Null))
            } else {
                Err(classify::item_error(&item.errors))
            }
        })
        .collect())
}
