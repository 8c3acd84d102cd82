//! Second-order discovery.
//!
//! For every newly found peer in a batch, fetch the peer's own followers and
//! followees and store only the edges that close over accounts we already
//! hold. This never creates profiles: an edge is written only when both
//! endpoints exist and the pair is new.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use followgraph_common::{AccountRef, DiscoveredConnectionsBatch, Direction, Edge};

use super::queue::QueueHandle;
use super::status::StatusReporter;
use crate::traits::{ProfileSource, Repository};

pub struct ConnectionsWorker {
    source: Arc<dyn ProfileSource>,
    repo: Arc<dyn Repository>,
    followers: QueueHandle,
    following: QueueHandle,
    follow_ceiling: i64,
    status: StatusReporter,
}

impl ConnectionsWorker {
    pub fn new(
        source: Arc<dyn ProfileSource>,
        repo: Arc<dyn Repository>,
        followers: QueueHandle,
        following: QueueHandle,
        follow_ceiling: i64,
        status: StatusReporter,
    ) -> Self {
        Self {
            source,
            repo,
            followers,
            following,
            follow_ceiling,
            status,
        }
    }

    pub async fn run(self, mut batches: mpsc::Receiver<DiscoveredConnectionsBatch>) {
        while let Some(batch) = batches.recv().await {
            self.status.working(&batch.subject.handle);
            self.process(batch).await;
            self.status.idle();
        }
        self.status.stopped();
        info!("Connections worker stopped");
    }

    async fn process(&self, batch: DiscoveredConnectionsBatch) {
        let mut seen = HashSet::new();
        let peers: Vec<AccountRef> = batch
            .edges
            .iter()
            .map(|edge| batch.direction.peer_of(edge))
            .filter(|peer| peer.id != batch.subject.id && seen.insert(peer.id))
            .collect();
        debug!(subject = %batch.subject, direction = %batch.direction, peers = peers.len(), "Processing batch");

        for peer in peers {
            match self.close_over(&peer).await {
                Ok(inserted) if inserted > 0 => {
                    info!(peer = %peer, inserted, "Stored closing edges");
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(peer = %peer, error = format!("{e:#}"), "Closure failed for peer, continuing");
                }
            }
        }
    }

    /// Query both of a peer's lists and store the closing edges. Returns the
    /// number of edges inserted.
    async fn close_over(&self, peer: &AccountRef) -> Result<usize> {
        let profile = self
            .source
            .profile(&peer.handle)
            .await
            .with_context(|| format!("refreshing profile for {peer}"))?;
        if profile.followers_count > self.follow_ceiling
            || profile.following_count > self.follow_ceiling
        {
            info!(
                peer = %peer,
                followers = profile.followers_count,
                following = profile.following_count,
                ceiling = self.follow_ceiling,
                "Peer over follow ceiling, skipping"
            );
            return Ok(0);
        }

        let (followers, following) =
            futures::join!(self.followers.fetch(peer), self.following.fetch(peer));

        let mut inserted = 0;
        for (direction, edges) in [
            (Direction::Followers, followers),
            (Direction::Following, following),
        ] {
            let Some(edges) = edges else {
                warn!(peer = %peer, %direction, "No reply for peer, skipping direction");
                continue;
            };
            for edge in &edges {
                match self.link(edge).await {
                    Ok(true) => inserted += 1,
                    Ok(false) => {}
                    Err(e) => {
                        warn!(follower = edge.follower_id, followee = edge.followee_id, error = %e, "Failed to store closing edge");
                    }
                }
            }
        }
        Ok(inserted)
    }

    /// Closure rule: both endpoints known, pair not yet stored.
    async fn link(&self, edge: &Edge) -> Result<bool> {
        if !self.repo.profile_exists(edge.follower_id).await?
            || !self.repo.profile_exists(edge.followee_id).await?
        {
            return Ok(false);
        }
        if self.repo.edge_exists(edge.follower_id, edge.followee_id).await? {
            return Ok(false);
        }
        self.repo.insert_edge(edge).await
    }
}
