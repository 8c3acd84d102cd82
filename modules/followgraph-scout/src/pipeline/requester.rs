//! Connection request stage, one instance per direction.
//!
//! Takes [`ConnectionJob`]s from the profile worker (or the backlog replay),
//! fetches the subject's full list through the matching queue, persists the
//! edges whose endpoints exist or can be fetched, and forwards the novel ones
//! to the connections worker.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use followgraph_common::{AccountRef, DiscoveredConnectionsBatch, Direction, Edge};

use super::queue::QueueHandle;
use super::status::StatusReporter;
use super::ConnectionJob;
use crate::traits::{ProfileSource, Repository};

pub struct ConnectionRequestWorker {
    queue: QueueHandle,
    source: Arc<dyn ProfileSource>,
    repo: Arc<dyn Repository>,
    batches: mpsc::Sender<DiscoveredConnectionsBatch>,
    status: StatusReporter,
}

impl ConnectionRequestWorker {
    pub fn new(
        queue: QueueHandle,
        source: Arc<dyn ProfileSource>,
        repo: Arc<dyn Repository>,
        batches: mpsc::Sender<DiscoveredConnectionsBatch>,
        status: StatusReporter,
    ) -> Self {
        Self {
            queue,
            source,
            repo,
            batches,
            status,
        }
    }

    fn direction(&self) -> Direction {
        self.queue.direction()
    }

    pub async fn run(self, mut jobs: mpsc::Receiver<ConnectionJob>) {
        let direction = self.direction();
        while let Some(job) = jobs.recv().await {
            self.status.working(&job.account.handle);
            self.handle(job).await;
            self.status.idle();
        }
        self.status.stopped();
        info!(%direction, "Connection request worker stopped");
    }

    async fn handle(&self, job: ConnectionJob) {
        let direction = self.direction();
        let ConnectionJob { account, backlog_id } = job;

        let novel = match self.queue.fetch(&account).await {
            Some(edges) => {
                let total = edges.len();
                let novel = self.persist(&account, edges).await;
                info!(account = %account, %direction, total, novel = novel.len(), "Stored connections");
                novel
            }
            None => {
                warn!(account = %account, %direction, "No connections returned, dropping job");
                Vec::new()
            }
        };

        if let Some(id) = backlog_id {
            if let Err(e) = self.repo.complete_backlog(id).await {
                warn!(account = %account, backlog_id = id, error = %e, "Failed to clear backlog entry");
            }
        }

        if novel.is_empty() {
            return;
        }
        let batch = DiscoveredConnectionsBatch {
            subject: account,
            direction,
            edges: novel,
        };
        if self.batches.send(batch).await.is_err() {
            warn!(%direction, "Connections worker gone, dropping batch");
        }
    }

    /// Insert the edges whose endpoints are (or can be made) present. Returns
    /// the edges that were not stored before.
    async fn persist(&self, subject: &AccountRef, edges: Vec<Edge>) -> Vec<Edge> {
        let direction = self.direction();
        if let Err(e) = self.ensure_profile(subject).await {
            warn!(account = %subject, error = format!("{e:#}"), "Subject profile missing, skipping batch");
            return Vec::new();
        }

        let mut novel = Vec::new();
        for edge in edges {
            let peer = direction.peer_of(&edge);
            if let Err(e) = self.ensure_profile(&peer).await {
                warn!(peer = %peer, error = format!("{e:#}"), "Skipping edge, peer profile unavailable");
                continue;
            }
            match self.insert_if_new(&edge).await {
                Ok(true) => novel.push(edge),
                Ok(false) => debug!(follower = edge.follower_id, followee = edge.followee_id, "Edge already known"),
                Err(e) => warn!(follower = edge.follower_id, followee = edge.followee_id, error = %e, "Failed to store edge"),
            }
        }
        novel
    }

    async fn insert_if_new(&self, edge: &Edge) -> Result<bool> {
        if self.repo.edge_exists(edge.follower_id, edge.followee_id).await? {
            return Ok(false);
        }
        self.repo.insert_edge(edge).await
    }

    /// Make sure a profile row exists for `account`, fetching it on a miss.
    async fn ensure_profile(&self, account: &AccountRef) -> Result<()> {
        if self.repo.profile_exists(account.id).await? {
            return Ok(());
        }
        let profile = self
            .source
            .profile(&account.handle)
            .await
            .with_context(|| format!("fetching profile for {account}"))?;
        if profile.id != account.id {
            anyhow::bail!("@{} now belongs to account {}", account.handle, profile.id);
        }
        self.repo.insert_profile(&profile).await?;
        Ok(())
    }
}
