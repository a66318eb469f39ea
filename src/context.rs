//! Request-scoped context: transaction id, arrival time, deadline, and the
//! cancellation signal the backend call is raced against.

use std::time::{Duration, Instant};

use hyper::header::HeaderMap;
use tokio::sync::watch;

use crate::headers::{self, TRANSACTION_ID_HEADER};
use crate::{GatewayError, Result};

/// Per-request values captured when a request arrives.
///
/// Each value has a documented behavior when absent: a missing transaction
/// id is an error ([`RequestContext::transaction_id`]), a missing arrival
/// time only degrades the reported latency ([`RequestContext::latency`]).
#[derive(Debug, Clone)]
pub struct RequestContext {
    transaction_id: Option<String>,
    arrival: Option<Instant>,
    deadline: Instant,
    timeout: Duration,
    cancel: watch::Receiver<bool>,
}

/// Creates a cancellation pair. Sending `true` cancels every context built
/// from the receiver; dropping the sender leaves them uncancellable.
pub fn cancellation() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

impl RequestContext {
    /// Captures the context of an inbound request.
    ///
    /// The transaction id is taken from the inbound header when present and
    /// generated otherwise. The deadline is `timeout` from now.
    pub fn capture(
        headers: &HeaderMap,
        timeout: Duration,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        let transaction_id = headers::non_empty(headers, TRANSACTION_ID_HEADER)
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
        let arrival = Instant::now();

        Self {
            transaction_id: Some(transaction_id),
            arrival: Some(arrival),
            deadline: arrival + timeout,
            timeout,
            cancel,
        }
    }

    /// Builds a bare context with only a deadline, for callers that fill in
    /// the remaining values themselves.
    pub fn new(timeout: Duration, cancel: watch::Receiver<bool>) -> Self {
        Self {
            transaction_id: None,
            arrival: None,
            deadline: Instant::now() + timeout,
            timeout,
            cancel,
        }
    }

    /// Sets the transaction id.
    pub fn with_transaction_id(mut self, transaction_id: impl Into<String>) -> Self {
        self.transaction_id = Some(transaction_id.into());
        self
    }

    /// Returns the transaction id, failing if it was never set.
    pub fn transaction_id(&self) -> Result<&str> {
        self.transaction_id
            .as_deref()
            .ok_or(GatewayError::MissingTransactionId)
    }

    /// Returns the transaction id if one was set.
    pub fn transaction_id_opt(&self) -> Option<&str> {
        self.transaction_id.as_deref()
    }

    /// Returns the time elapsed since arrival, or `None` if the arrival time
    /// was never captured.
    pub fn latency(&self) -> Option<Duration> {
        self.arrival.map(|arrival| arrival.elapsed())
    }

    /// The instant after which the backend call is abandoned.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// The timeout the deadline was derived from.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Returns `true` if cancellation has already been signalled.
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolves once cancellation is signalled. Never resolves if the
    /// sending half is dropped without cancelling.
    pub async fn cancelled(&self) {
        let mut cancel = self.cancel.clone();
        if cancel.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
