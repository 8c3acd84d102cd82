//! Timeline harvesting.
//!
//! Pages through an account's posts newest first, stopping at the first post
//! older than the job's start date. Each post is stored after the posts it
//! replies to, quotes or reposts, which are fetched on demand. Resolution is
//! depth-first with a visited set and a depth limit so cyclic or very long
//! chains terminate.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use futures::future::{BoxFuture, FutureExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use followgraph_common::{AccountRef, Hashtag, Mention, Post, Profile, Reply};

use super::status::StatusReporter;
use super::ContentJob;
use crate::traits::{ProfileSource, Repository};

pub struct ContentIngestWorker {
    source: Arc<dyn ProfileSource>,
    repo: Arc<dyn Repository>,
    max_chain_depth: usize,
    status: StatusReporter,
}

impl ContentIngestWorker {
    pub fn new(
        source: Arc<dyn ProfileSource>,
        repo: Arc<dyn Repository>,
        max_chain_depth: usize,
        status: StatusReporter,
    ) -> Self {
        Self {
            source,
            repo,
            max_chain_depth,
            status,
        }
    }

    pub async fn run(self, mut jobs: mpsc::Receiver<ContentJob>) {
        while let Some(job) = jobs.recv().await {
            self.status.working(&job.account.handle);
            match self.harvest(&job).await {
                Ok(stored) => info!(account = %job.account, stored, "Harvested posts"),
                Err(e) => warn!(account = %job.account, error = format!("{e:#}"), "Content harvest failed"),
            }
            self.status.idle();
        }
        self.status.stopped();
        info!("Content worker stopped");
    }

    /// Returns the number of timeline posts newly stored.
    async fn harvest(&self, job: &ContentJob) -> Result<usize> {
        let mut cursor: Option<String> = None;
        let mut stored = 0;

        'pages: loop {
            let page = self
                .source
                .posts(&job.account, cursor.as_deref())
                .await
                .with_context(|| format!("fetching posts for {}", job.account))?;

            for post in page.posts {
                if let (Some(cutoff), Some(posted_at)) = (job.start_date, post.posted_at) {
                    if posted_at < cutoff {
                        debug!(account = %job.account, post = post.id, "Reached start date");
                        break 'pages;
                    }
                }
                let id = post.id;
                let mut visited = HashSet::new();
                match self.store_post(post, 0, &mut visited).await {
                    Ok(true) => stored += 1,
                    Ok(false) => {}
                    Err(e) => warn!(post = id, error = format!("{e:#}"), "Failed to store post"),
                }
            }

            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(stored)
    }

    /// Store `post` and, first, whatever it references. Returns false when
    /// the post was already stored or already visited in this chain.
    fn store_post<'a>(
        &'a self,
        mut post: Post,
        depth: usize,
        visited: &'a mut HashSet<i64>,
    ) -> BoxFuture<'a, Result<bool>> {
        async move {
            if !visited.insert(post.id) || self.repo.post_exists(post.id).await? {
                return Ok(false);
            }

            if depth < self.max_chain_depth {
                let references: Vec<i64> = post.references().collect();
                for id in references {
                    if visited.contains(&id) || self.repo.post_exists(id).await? {
                        continue;
                    }
                    match self.source.post(id).await {
                        Ok(referenced) => {
                            if let Err(e) = self.store_post(referenced, depth + 1, visited).await {
                                warn!(post = id, error = format!("{e:#}"), "Failed to store referenced post");
                            }
                        }
                        Err(e) => warn!(post = id, error = format!("{e:#}"), "Referenced post unavailable"),
                    }
                }
            } else {
                debug!(post = post.id, depth, "Chain depth limit reached");
            }

            // Links to posts that could not be stored would dangle.
            post.reply_to_id = self.stored(post.reply_to_id).await?;
            post.quoted_id = self.stored(post.quoted_id).await?;
            post.retweeted_id = self.stored(post.retweeted_id).await?;

            self.ensure_account(&post.author).await?;
            let inserted = self.repo.insert_post(&post).await?;
            self.link(&post).await;
            Ok(inserted)
        }
        .boxed()
    }

    async fn stored(&self, id: Option<i64>) -> Result<Option<i64>> {
        match id {
            Some(id) if self.repo.post_exists(id).await? => Ok(Some(id)),
            _ => Ok(None),
        }
    }

    /// Reply, mention and hashtag rows for a stored post.
    async fn link(&self, post: &Post) {
        if let Some(parent) = post.reply_to_id {
            match self.repo.post_author(parent).await {
                Ok(Some(author)) => {
                    let reply = Reply {
                        post_id: post.id,
                        replied_to_user_id: author,
                    };
                    if let Err(e) = self.repo.insert_reply(&reply).await {
                        warn!(post = post.id, error = %e, "Failed to store reply");
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(post = post.id, error = %e, "Failed to look up replied-to author"),
            }
        }

        for account in &post.mentions {
            let mention = Mention {
                post_id: post.id,
                user_id: account.id,
            };
            let result = match self.ensure_account(account).await {
                Ok(()) => self.repo.insert_mention(&mention).await.map(|_| ()),
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                warn!(post = post.id, mentioned = %account, error = %e, "Failed to store mention");
            }
        }

        for tag in &post.hashtags {
            let hashtag = Hashtag {
                post_id: post.id,
                tag: tag.clone(),
            };
            if let Err(e) = self.repo.insert_hashtag(&hashtag).await {
                warn!(post = post.id, tag = tag.as_str(), error = %e, "Failed to store hashtag");
            }
        }
    }

    /// Insert an identity-only profile for accounts we have only seen referenced.
    async fn ensure_account(&self, account: &AccountRef) -> Result<()> {
        if !self.repo.profile_exists(account.id).await? {
            self.repo
                .insert_profile(&Profile::skeletal(account, Utc::now()))
                .await?;
        }
        Ok(())
    }
}
