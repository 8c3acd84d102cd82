//! The harvesting pipeline.
//!
//! Fixed topology, one task per role:
//!
//! ```text
//! ingress -> profile -+-> content
//!                     +-> followers requester -+-> connections
//!                     +-> following requester -+
//!
//! followers requester, connections -> followers queue
//! following requester, connections -> following queue
//! ```
//!
//! Shutdown is by channel closure: dropping the ingress lets the profile
//! worker finish, which closes the content and requester inboxes, which closes
//! the connections inbox, after which the last queue handles drop and the
//! queues stop.

pub mod connections;
pub mod content;
pub mod profile;
pub mod queue;
pub mod requester;
pub mod status;

#[cfg(test)]
mod chain_tests;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;
use typed_builder::TypedBuilder;

use followgraph_common::{AccountRef, Config, Direction, ScrapeRequest};

use crate::traits::{ProfileSource, Repository};
use connections::ConnectionsWorker;
use content::ContentIngestWorker;
use profile::ProfileIngestWorker;
use queue::{ConnectionFetchClient, QueueHandle, RateLimitedQueue};
use requester::ConnectionRequestWorker;
use status::{StatusBoard, StatusSnapshot, WorkerRole};

/// Connection harvest for one account in one direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionJob {
    pub account: AccountRef,
    /// Durable backlog row, cleared once the job finishes. `None` only when
    /// recording it failed.
    pub backlog_id: Option<i64>,
}

/// Timeline harvest for one account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentJob {
    pub account: AccountRef,
    pub start_date: Option<DateTime<Utc>>,
}

/// Tunables. Defaults match production.
#[derive(Debug, Clone, TypedBuilder)]
pub struct PipelineSettings {
    #[builder(default = 1000)]
    pub follow_ceiling: i64,
    #[builder(default = Duration::from_secs(60))]
    pub page_interval: Duration,
    #[builder(default = Duration::from_secs(60))]
    pub account_interval: Duration,
    #[builder(default)]
    pub reply_timeout: Option<Duration>,
    #[builder(default = 16)]
    pub max_chain_depth: usize,
    #[builder(default = 100)]
    pub ingest_capacity: usize,
    #[builder(default = 3000)]
    pub connection_capacity: usize,
    #[builder(default = 1000)]
    pub queue_capacity: usize,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self::builder()
            .follow_ceiling(config.follow_ceiling)
            .page_interval(config.page_interval)
            .account_interval(config.account_interval)
            .reply_timeout(config.reply_timeout)
            .max_chain_depth(config.max_chain_depth)
            .ingest_capacity(config.ingest_capacity)
            .connection_capacity(config.connection_capacity)
            .queue_capacity(config.queue_capacity)
            .build()
    }
}

/// External collaborators. Each queue gets its own source so the two
/// connection endpoints are throttled independently.
#[derive(Clone)]
pub struct PipelineDeps {
    /// Profile and post lookups.
    pub source: Arc<dyn ProfileSource>,
    pub followers_source: Arc<dyn ProfileSource>,
    pub following_source: Arc<dyn ProfileSource>,
    pub repo: Arc<dyn Repository>,
}

impl PipelineDeps {
    /// One source for everything.
    pub fn shared(source: Arc<dyn ProfileSource>, repo: Arc<dyn Repository>) -> Self {
        Self {
            followers_source: source.clone(),
            following_source: source.clone(),
            source,
            repo,
        }
    }
}

/// Running pipeline.
pub struct Pipeline {
    ingress: mpsc::Sender<ScrapeRequest>,
    followers_jobs: mpsc::Sender<ConnectionJob>,
    following_jobs: mpsc::Sender<ConnectionJob>,
    repo: Arc<dyn Repository>,
    board: StatusBoard,
    tasks: Vec<(WorkerRole, JoinHandle<()>)>,
}

impl Pipeline {
    /// Spawn every worker. Must be called inside a tokio runtime.
    pub fn start(deps: PipelineDeps, settings: PipelineSettings) -> Self {
        let mut board = StatusBoard::new();
        let mut tasks = Vec::with_capacity(WorkerRole::ALL.len());

        let (ingress, ingress_rx) = mpsc::channel(settings.ingest_capacity);
        let (content_tx, content_rx) = mpsc::channel(settings.ingest_capacity);
        let (followers_jobs, followers_rx) = mpsc::channel(settings.connection_capacity);
        let (following_jobs, following_rx) = mpsc::channel(settings.connection_capacity);
        let (batch_tx, batch_rx) = mpsc::channel(settings.connection_capacity);

        // Queues
        let followers_queue = Self::spawn_queue(
            Direction::Followers,
            &deps.followers_source,
            WorkerRole::FollowersQueue,
            &settings,
            &mut board,
            &mut tasks,
        );
        let following_queue = Self::spawn_queue(
            Direction::Following,
            &deps.following_source,
            WorkerRole::FollowingQueue,
            &settings,
            &mut board,
            &mut tasks,
        );

        // Connections
        let connections = ConnectionsWorker::new(
            deps.source.clone(),
            deps.repo.clone(),
            followers_queue.clone(),
            following_queue.clone(),
            settings.follow_ceiling,
            board.reporter(WorkerRole::Connections),
        );
        tasks.push((WorkerRole::Connections, tokio::spawn(connections.run(batch_rx))));

        // Requesters
        for (queue, jobs, role) in [
            (followers_queue, followers_rx, WorkerRole::Followers),
            (following_queue, following_rx, WorkerRole::Following),
        ] {
            let worker = ConnectionRequestWorker::new(
                queue,
                deps.source.clone(),
                deps.repo.clone(),
                batch_tx.clone(),
                board.reporter(role),
            );
            tasks.push((role, tokio::spawn(worker.run(jobs))));
        }
        drop(batch_tx);

        // Content
        let content = ContentIngestWorker::new(
            deps.source.clone(),
            deps.repo.clone(),
            settings.max_chain_depth,
            board.reporter(WorkerRole::Content),
        );
        tasks.push((WorkerRole::Content, tokio::spawn(content.run(content_rx))));

        // Profile
        let profile = ProfileIngestWorker::new(
            deps.source.clone(),
            deps.repo.clone(),
            settings.follow_ceiling,
            content_tx,
            followers_jobs.clone(),
            following_jobs.clone(),
            board.reporter(WorkerRole::Profile),
        );
        tasks.push((WorkerRole::Profile, tokio::spawn(profile.run(ingress_rx))));

        info!(
            follow_ceiling = settings.follow_ceiling,
            page_interval_secs = settings.page_interval.as_secs_f64(),
            account_interval_secs = settings.account_interval.as_secs_f64(),
            "Pipeline started"
        );

        Self {
            ingress,
            followers_jobs,
            following_jobs,
            repo: deps.repo,
            board,
            tasks,
        }
    }

    fn spawn_queue(
        direction: Direction,
        source: &Arc<dyn ProfileSource>,
        role: WorkerRole,
        settings: &PipelineSettings,
        board: &mut StatusBoard,
        tasks: &mut Vec<(WorkerRole, JoinHandle<()>)>,
    ) -> QueueHandle {
        let (handle, inbox) =
            RateLimitedQueue::channel(direction, settings.queue_capacity, settings.reply_timeout);
        let client = ConnectionFetchClient::new(source.clone(), direction, settings.page_interval);
        let queue = RateLimitedQueue::new(client, settings.account_interval, board.reporter(role));
        tasks.push((role, tokio::spawn(queue.run(inbox))));
        handle
    }

    /// Queue a request. Waits while the ingress is full.
    pub async fn submit(&self, request: ScrapeRequest) -> Result<()> {
        self.ingress
            .send(request)
            .await
            .map_err(|e| anyhow!("pipeline stopped, dropped request for @{}", e.0.handle))
    }

    /// Re-enqueue connection jobs a previous run accepted but never finished.
    /// Returns how many were replayed.
    pub async fn replay_backlog(&self) -> Result<usize> {
        let pending = self
            .repo
            .pending_backlog()
            .await
            .context("loading connection backlog")?;
        let count = pending.len();
        for entry in pending {
            let tx = match entry.direction {
                Direction::Followers => &self.followers_jobs,
                Direction::Following => &self.following_jobs,
            };
            let job = ConnectionJob {
                account: entry.account,
                backlog_id: Some(entry.id),
            };
            tx.send(job)
                .await
                .map_err(|_| anyhow!("pipeline stopped during backlog replay"))?;
        }
        if count > 0 {
            info!(count, "Replayed connection backlog");
        }
        Ok(count)
    }

    pub fn status(&self) -> StatusSnapshot {
        self.board.snapshot()
    }

    /// A read-only board that outlives the pipeline handle.
    pub fn status_board(&self) -> StatusBoard {
        self.board.clone()
    }

    /// Close the ingress and wait for every worker to drain. Returns the
    /// final status.
    pub async fn shutdown(self) -> Result<StatusSnapshot> {
        let Pipeline {
            ingress,
            followers_jobs,
            following_jobs,
            board,
            tasks,
            ..
        } = self;
        drop(ingress);
        drop(followers_jobs);
        drop(following_jobs);

        // Profile first, then down the cascade.
        for (role, task) in tasks.into_iter().rev() {
            task.await
                .with_context(|| format!("{} worker panicked", role.as_str()))?;
        }
        info!("Pipeline drained");
        Ok(board.snapshot())
    }
}
