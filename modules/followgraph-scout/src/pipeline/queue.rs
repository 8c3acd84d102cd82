//! Single-flight, rate-limited access to the connection endpoints.
//!
//! One [`RateLimitedQueue`] per [`Direction`]. Callers hold a cloneable
//! [`QueueHandle`]; every fetch travels as a [`ConnectionFetchRequest`]
//! carrying its own oneshot reply sender, so replies can't cross between
//! callers. The queue drains its inbox strictly FIFO, one account at a time,
//! sleeping between pages and between accounts.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use followgraph_common::{parse_api_timestamp, parse_id, AccountRef, ConnectionEntry, Direction, Edge};
use x_api_client::XApiError;

use super::status::StatusReporter;
use crate::traits::ProfileSource;

/// One account's full connection list, requested from a queue.
pub struct ConnectionFetchRequest {
    pub account: AccountRef,
    pub direction: Direction,
    /// `Some(edges)` on success, `None` when any page failed.
    pub reply: oneshot::Sender<Option<Vec<Edge>>>,
}

// ---------------------------------------------------------------------------
// QueueHandle: caller side
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct QueueHandle {
    direction: Direction,
    tx: mpsc::Sender<ConnectionFetchRequest>,
    reply_timeout: Option<Duration>,
}

impl QueueHandle {
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Submit a fetch and wait for its reply.
    ///
    /// `None` means "retry later": a page failed, the queue is gone, or the
    /// reply deadline passed. It never means "no connections".
    pub async fn fetch(&self, account: &AccountRef) -> Option<Vec<Edge>> {
        let (reply, rx) = oneshot::channel();
        let request = ConnectionFetchRequest {
            account: account.clone(),
            direction: self.direction,
            reply,
        };
        if self.tx.send(request).await.is_err() {
            warn!(account = %account, direction = %self.direction, "Connection queue closed");
            return None;
        }

        let Some(limit) = self.reply_timeout else {
            return rx.await.ok().flatten();
        };
        match tokio::time::timeout(limit, rx).await {
            Ok(reply) => reply.ok().flatten(),
            Err(_) => {
                warn!(
                    account = %account,
                    direction = %self.direction,
                    timeout_secs = limit.as_secs_f64(),
                    "Timed out waiting for connection reply"
                );
                None
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ConnectionFetchClient: pagination for one account
// ---------------------------------------------------------------------------

pub struct ConnectionFetchClient {
    source: Arc<dyn ProfileSource>,
    direction: Direction,
    page_interval: Duration,
}

impl ConnectionFetchClient {
    pub fn new(source: Arc<dyn ProfileSource>, direction: Direction, page_interval: Duration) -> Self {
        Self {
            source,
            direction,
            page_interval,
        }
    }

    /// Page through an account's whole list. Any page error discards what
    /// was collected so far.
    pub async fn fetch_all(&self, account: &AccountRef) -> Result<Vec<Edge>> {
        let mut edges = Vec::new();
        let mut page_token: Option<String> = None;
        let mut page_no = 0usize;

        loop {
            if page_no > 0 {
                tokio::time::sleep(self.page_interval).await;
            }
            page_no += 1;

            let page = self
                .source
                .connections(account.id, self.direction, page_token.as_deref())
                .await
                .with_context(|| {
                    format!("{} page {page_no} for {account}", self.direction)
                })?;

            let observed_at = Utc::now();
            for entry in &page.entries {
                match self.edge_from_entry(account, entry, observed_at) {
                    Ok(edge) => edges.push(edge),
                    Err(e) => {
                        warn!(account = %account, entry = entry.id.as_str(), error = %e, "Skipping malformed connection entry");
                    }
                }
            }
            debug!(account = %account, direction = %self.direction, page = page_no, total = edges.len(), "Fetched connection page");

            match page.next_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        Ok(edges)
    }

    fn edge_from_entry(
        &self,
        subject: &AccountRef,
        entry: &ConnectionEntry,
        observed_at: chrono::DateTime<Utc>,
    ) -> Result<Edge> {
        let peer = AccountRef::new(parse_id(&entry.id)?, &entry.handle);
        let formed_at = entry
            .created_at
            .as_deref()
            .map(parse_api_timestamp)
            .transpose()?;
        Ok(self.direction.edge(subject, &peer, formed_at, observed_at))
    }
}

// ---------------------------------------------------------------------------
// RateLimitedQueue: the owning task
// ---------------------------------------------------------------------------

pub struct RateLimitedQueue {
    client: ConnectionFetchClient,
    account_interval: Duration,
    status: StatusReporter,
}

impl RateLimitedQueue {
    pub fn new(client: ConnectionFetchClient, account_interval: Duration, status: StatusReporter) -> Self {
        Self {
            client,
            account_interval,
            status,
        }
    }

    /// Create the inbox for a queue. The handle is cloned out to every caller.
    pub fn channel(
        direction: Direction,
        capacity: usize,
        reply_timeout: Option<Duration>,
    ) -> (QueueHandle, mpsc::Receiver<ConnectionFetchRequest>) {
        let (tx, rx) = mpsc::channel(capacity);
        let handle = QueueHandle {
            direction,
            tx,
            reply_timeout,
        };
        (handle, rx)
    }

    /// Serve requests until every handle is dropped.
    pub async fn run(self, mut inbox: mpsc::Receiver<ConnectionFetchRequest>) {
        let direction = self.client.direction;
        info!(%direction, "Connection queue started");

        while let Some(request) = inbox.recv().await {
            let ConnectionFetchRequest {
                account,
                direction: requested,
                reply,
            } = request;
            self.status.working(&account.handle);

            let result = if requested != direction {
                warn!(account = %account, %requested, %direction, "Request routed to the wrong queue");
                None
            } else {
                match self.client.fetch_all(&account).await {
                    Ok(edges) => {
                        info!(account = %account, %direction, edges = edges.len(), "Fetched connections");
                        Some(edges)
                    }
                    Err(e) => {
                        warn!(
                            account = %account,
                            %direction,
                            rate_limited = is_rate_limited(&e),
                            error = format!("{e:#}"),
                            "Connection fetch failed"
                        );
                        None
                    }
                }
            };

            if reply.send(result).is_err() {
                debug!(account = %account, %direction, "Requester stopped waiting, reply dropped");
            }

            self.status.idle();
            tokio::time::sleep(self.account_interval).await;
        }

        self.status.stopped();
        info!(%direction, "Connection queue stopped");
    }
}

/// Whether any cause in the chain is an upstream rate-limit rejection.
fn is_rate_limited(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<XApiError>())
        .any(XApiError::is_rate_limited)
}
