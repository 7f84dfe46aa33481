//! Bounded FIFO of pending download requests.
//!
//! The queue owns requests until the worker dequeues them and remembers the
//! key of the request currently running, so the same resource is never
//! pending twice or pending while it downloads.

use crate::request::DownRequest;
use std::collections::VecDeque;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};

/// Why a request was not accepted.
#[derive(Debug, Error)]
pub enum EnqueueError {
    /// The pending depth is exhausted; the request is handed back for later.
    #[error("Queue is full ({max_pending} pending)")]
    Full {
        request: Box<DownRequest>,
        max_pending: usize,
    },

    /// A request with the same resource key is pending or running.
    #[error("Resource '{0}' is already queued or running")]
    Duplicate(String),
}

/// Observable queue state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueState {
    Empty,
    HasPending,
    RunningOne,
}

impl std::fmt::Display for QueueState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueState::Empty => write!(f, "empty"),
            QueueState::HasPending => write!(f, "has_pending"),
            QueueState::RunningOne => write!(f, "running_one"),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    pending: VecDeque<DownRequest>,
    running: Option<String>,
}

/// Pending requests plus the key of the running one.
#[derive(Debug)]
pub struct RequestQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    max_pending: usize,
}

impl RequestQueue {
    pub fn new(max_pending: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            max_pending: max_pending.max(1),
        }
    }

    pub fn max_pending(&self) -> usize {
        self.max_pending
    }

    /// Append a request unless its key is already known or the queue is full.
    pub async fn try_enqueue(&self, request: DownRequest) -> Result<(), EnqueueError> {
        let mut inner = self.inner.lock().await;

        if inner.running.as_deref() == Some(request.resource_key.as_str())
            || inner
                .pending
                .iter()
                .any(|r| r.resource_key == request.resource_key)
        {
            return Err(EnqueueError::Duplicate(request.resource_key));
        }
        if inner.pending.len() >= self.max_pending {
            return Err(EnqueueError::Full {
                request: Box::new(request),
                max_pending: self.max_pending,
            });
        }

        inner.pending.push_back(request);
        drop(inner);
        self.notify.notify_one();
        Ok(())
    }

    /// Pop the oldest request and mark it running, without waiting.
    pub async fn try_dequeue(&self) -> Option<DownRequest> {
        let mut inner = self.inner.lock().await;
        let request = inner.pending.pop_front()?;
        inner.running = Some(request.resource_key.clone());
        Some(request)
    }

    /// Wait for the next request and mark it running.
    pub async fn dequeue(&self) -> DownRequest {
        loop {
            let notified = self.notify.notified();
            if let Some(request) = self.try_dequeue().await {
                return request;
            }
            notified.await;
        }
    }

    /// Clear the running marker once the job for `key` has been recorded.
    pub async fn finish(&self, key: &str) {
        let mut inner = self.inner.lock().await;
        if inner.running.as_deref() == Some(key) {
            inner.running = None;
        }
    }

    /// Forget the running marker regardless of key, returning it.
    pub async fn abandon_running(&self) -> Option<String> {
        self.inner.lock().await.running.take()
    }

    pub async fn contains_key(&self, key: &str) -> bool {
        let inner = self.inner.lock().await;
        inner.running.as_deref() == Some(key) || inner.pending.iter().any(|r| r.resource_key == key)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.pending.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.pending.is_empty()
    }

    pub async fn running(&self) -> Option<String> {
        self.inner.lock().await.running.clone()
    }

    pub async fn state(&self) -> QueueState {
        let inner = self.inner.lock().await;
        if inner.running.is_some() {
            QueueState::RunningOne
        } else if inner.pending.is_empty() {
            QueueState::Empty
        } else {
            QueueState::HasPending
        }
    }

    /// Resource keys of pending requests in FIFO order.
    pub async fn pending_keys(&self) -> Vec<String> {
        self.inner
            .lock()
            .await
            .pending
            .iter()
            .map(|r| r.resource_key.clone())
            .collect()
    }

    /// Consistent view of the whole queue under one lock.
    pub async fn snapshot(&self) -> QueueSnapshot {
        let inner = self.inner.lock().await;
        let state = if inner.running.is_some() {
            QueueState::RunningOne
        } else if inner.pending.is_empty() {
            QueueState::Empty
        } else {
            QueueState::HasPending
        };
        QueueSnapshot {
            state,
            running: inner.running.clone(),
            pending: inner.pending.iter().map(|r| r.resource_key.clone()).collect(),
            max_pending: self.max_pending,
        }
    }
}

/// Point-in-time copy of the queue for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct QueueSnapshot {
    pub state: QueueState,
    pub running: Option<String>,
    pub pending: Vec<String>,
    pub max_pending: usize,
}
