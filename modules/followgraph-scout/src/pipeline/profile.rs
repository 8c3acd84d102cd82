//! Profile ingest: the pipeline's entry stage.
//!
//! Every [`ScrapeRequest`] gets a fresh profile fetch and an upsert, then
//! provenance (institution, participant enrollment, bio tags), then fan-out to
//! the content and connection stages according to the request's policy flags
//! and the follow ceiling.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use followgraph_common::{
    bio_mentions, AccountKind, BioTag, Direction, Institution, Participant, Profile, ScrapeRequest,
};

use super::status::StatusReporter;
use super::{ConnectionJob, ContentJob};
use crate::traits::{ProfileSource, Repository};

pub struct ProfileIngestWorker {
    source: Arc<dyn ProfileSource>,
    repo: Arc<dyn Repository>,
    follow_ceiling: i64,
    content: mpsc::Sender<ContentJob>,
    followers: mpsc::Sender<ConnectionJob>,
    following: mpsc::Sender<ConnectionJob>,
    status: StatusReporter,
}

impl ProfileIngestWorker {
    pub fn new(
        source: Arc<dyn ProfileSource>,
        repo: Arc<dyn Repository>,
        follow_ceiling: i64,
        content: mpsc::Sender<ContentJob>,
        followers: mpsc::Sender<ConnectionJob>,
        following: mpsc::Sender<ConnectionJob>,
        status: StatusReporter,
    ) -> Self {
        Self {
            source,
            repo,
            follow_ceiling,
            content,
            followers,
            following,
            status,
        }
    }

    /// Consume requests until the ingress closes. Dropping `self` afterwards
    /// closes the downstream channels.
    pub async fn run(self, mut requests: mpsc::Receiver<ScrapeRequest>) {
        while let Some(request) = requests.recv().await {
            self.status.working(&request.handle);
            let handle = request.handle.clone();
            if let Err(e) = self.ingest(request).await {
                warn!(handle = handle.as_str(), error = format!("{e:#}"), "Profile ingest failed, skipping request");
            }
            self.status.idle();
        }
        self.status.stopped();
        info!("Profile worker stopped");
    }

    async fn ingest(&self, mut request: ScrapeRequest) -> Result<()> {
        let mut profile = self
            .source
            .profile(&request.handle)
            .await
            .with_context(|| format!("fetching profile @{}", request.handle))?;
        if let Some(known) = request.known_id.filter(|id| *id != profile.id) {
            warn!(handle = request.handle.as_str(), known, fetched = profile.id, "Handle now resolves to a different account");
        }
        request.known_id = Some(profile.id);
        profile.is_participant = request.is_participant();

        self.upsert_profile(&profile).await?;

        if let Err(e) = self.record_provenance(&request, &profile).await {
            warn!(handle = profile.handle.as_str(), error = format!("{e:#}"), "Failed to record provenance");
        }
        self.tag_bio_mentions(&profile).await;
        self.fan_out(&request, &profile).await;
        Ok(())
    }

    /// Update when the id is known, insert otherwise.
    async fn upsert_profile(&self, profile: &Profile) -> Result<()> {
        if self.repo.profile_exists(profile.id).await? {
            self.repo.update_profile(profile).await?;
            debug!(handle = profile.handle.as_str(), "Updated profile");
        } else if self.repo.insert_profile(profile).await? {
            info!(handle = profile.handle.as_str(), id = profile.id, "Inserted profile");
        } else {
            // Lost an insert race; the row exists now.
            self.repo.update_profile(profile).await?;
        }
        Ok(())
    }

    async fn record_provenance(&self, request: &ScrapeRequest, profile: &Profile) -> Result<()> {
        if let (AccountKind::Institutional, Some(info)) = (request.kind, &request.institution) {
            if !self.repo.institution_registered(profile.id).await? {
                self.repo
                    .upsert_institution(&Institution {
                        info: info.clone(),
                        user_id: profile.id,
                    })
                    .await?;
                info!(handle = profile.handle.as_str(), institution = info.name.as_str(), "Registered institution");
            }
        }

        if let Some(enrollment) = request.enrollment {
            self.repo
                .upsert_participant(&Participant {
                    institution_id: enrollment.institution_id,
                    cohort: enrollment.cohort,
                    user_id: profile.id,
                })
                .await?;
        }
        Ok(())
    }

    /// Link every `@handle` in the bio to its account, fetching accounts we
    /// have never seen.
    async fn tag_bio_mentions(&self, profile: &Profile) {
        for handle in bio_mentions(&profile.bio) {
            if handle.eq_ignore_ascii_case(&profile.handle) {
                continue;
            }
            match self.resolve_handle(&handle).await {
                Ok(mentioned_id) => {
                    let tag = BioTag {
                        user_id: profile.id,
                        mentioned_user_id: mentioned_id,
                        collected_at: Utc::now(),
                    };
                    if let Err(e) = self.repo.insert_bio_tag(&tag).await {
                        warn!(handle = profile.handle.as_str(), mentioned = handle.as_str(), error = %e, "Failed to store bio tag");
                    }
                }
                Err(e) => {
                    warn!(handle = profile.handle.as_str(), mentioned = handle.as_str(), error = format!("{e:#}"), "Skipping unresolvable bio mention");
                }
            }
        }
    }

    async fn resolve_handle(&self, handle: &str) -> Result<i64> {
        if let Some(id) = self.repo.profile_id_by_handle(handle).await? {
            return Ok(id);
        }
        let profile = self
            .source
            .profile(handle)
            .await
            .with_context(|| format!("fetching mentioned profile @{handle}"))?;
        self.repo.insert_profile(&profile).await?;
        Ok(profile.id)
    }

    async fn fan_out(&self, request: &ScrapeRequest, profile: &Profile) {
        let account = profile.account();

        if request.scrape_content {
            let job = ContentJob {
                account: account.clone(),
                start_date: request.start_date,
            };
            if self.content.send(job).await.is_err() {
                warn!(account = %account, "Content worker gone, dropping content job");
            }
        }

        if !request.scrape_connections {
            return;
        }
        for direction in Direction::ALL {
            let count = profile.count(direction);
            if count > self.follow_ceiling {
                info!(
                    account = %account,
                    %direction,
                    count,
                    ceiling = self.follow_ceiling,
                    "Over follow ceiling, skipping connection harvest"
                );
                continue;
            }
            let tx = match direction {
                Direction::Followers => &self.followers,
                Direction::Following => &self.following,
            };
            // The backlog row must exist before the job is queued.
            let backlog_id = match self.repo.enqueue_backlog(&account, direction).await {
                Ok(id) => Some(id),
                Err(e) => {
                    warn!(account = %account, %direction, error = %e, "Failed to record backlog entry");
                    None
                }
            };
            let job = ConnectionJob {
                account: account.clone(),
                backlog_id,
            };
            if tx.send(job).await.is_err() {
                warn!(account = %account, %direction, "Connection worker gone, dropping job");
            }
        }
    }
}
