// Test mocks for the harvesting pipeline.
//
// Two mocks matching the two trait boundaries:
// - MockProfileSource (ProfileSource): HashMap-based handle/id → response,
//   paged connections with failure injection, call recording
// - MemoryRepository (Repository): stateful in-memory store that enforces the
//   same foreign keys and uniqueness as the Postgres schema
//
// Plus helpers for constructing profiles, connection entries, posts and fast
// pipeline settings.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use followgraph_common::{
    AccountRef, BacklogEntry, BioTag, ConnectionEntry, ConnectionPage, Direction, Edge, Hashtag,
    Institution, Mention, Participant, Post, PostPage, Profile, Reply,
};

use crate::pipeline::PipelineSettings;
use crate::traits::{ProfileSource, Repository};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub fn alice() -> AccountRef {
    AccountRef::new(1, "alice")
}

pub fn bob() -> AccountRef {
    AccountRef::new(2, "bob")
}

/// A full profile with the given counts.
pub fn profile(id: i64, handle: &str, followers: i64, following: i64) -> Profile {
    let mut p = Profile::skeletal(&AccountRef::new(id, handle), Utc::now());
    p.display_name = handle.to_uppercase();
    p.followers_count = followers;
    p.following_count = following;
    p
}

/// A connection entry as the API reports it.
pub fn entry(id: i64, handle: &str) -> ConnectionEntry {
    ConnectionEntry {
        id: id.to_string(),
        handle: handle.to_string(),
        name: handle.to_uppercase(),
        created_at: Some("2020-06-01T00:00:00.000Z".to_string()),
    }
}

/// A plain post by `author`, posted `days_ago` days before 2024-06-01.
pub fn post(id: i64, author: &AccountRef, days_ago: i64) -> Post {
    Post {
        id,
        author: author.clone(),
        text: format!("post {id}"),
        posted_at: Some(reference_date() - chrono::Duration::days(days_ago)),
        url: format!("https://x.com/{}/status/{id}", author.handle),
        reply_to_id: None,
        quoted_id: None,
        retweeted_id: None,
        likes: 0,
        retweets: 0,
        replies: 0,
        mentions: vec![],
        hashtags: vec![],
        collected_at: Utc::now(),
    }
}

pub fn reference_date() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
}

/// Production shape, no sleeping.
pub fn fast_settings() -> PipelineSettings {
    PipelineSettings::builder()
        .page_interval(Duration::ZERO)
        .account_interval(Duration::ZERO)
        .build()
}

// ---------------------------------------------------------------------------
// MockProfileSource
// ---------------------------------------------------------------------------

/// One recorded `connections` call. `page` is 1-based; `at` is the tokio clock
/// when the call was made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionCall {
    pub account_id: i64,
    pub direction: Direction,
    pub page: usize,
    pub at: tokio::time::Instant,
}

#[derive(Default)]
struct SourceCalls {
    profiles: Vec<String>,
    connections: Vec<ConnectionCall>,
    posts: Vec<i64>,
    lookups: Vec<i64>,
}

/// HashMap-based upstream. Returns `Err` for anything unregistered.
/// Builder pattern: `.on_profile()`, `.on_followers()`, `.on_following()`,
/// `.failing_page()`, `.on_posts()`, `.on_post()`.
#[derive(Default)]
pub struct MockProfileSource {
    profiles: HashMap<String, Profile>,
    connections: HashMap<(i64, Direction), Vec<Vec<ConnectionEntry>>>,
    failing_pages: HashSet<(i64, Direction, usize)>,
    timelines: HashMap<i64, Vec<Vec<Post>>>,
    lookups: HashMap<i64, Post>,
    calls: Mutex<SourceCalls>,
}

impl MockProfileSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_profile(mut self, profile: Profile) -> Self {
        self.profiles.insert(profile.handle.to_lowercase(), profile);
        self
    }

    pub fn on_followers(self, account_id: i64, pages: Vec<Vec<ConnectionEntry>>) -> Self {
        self.on_connections(account_id, Direction::Followers, pages)
    }

    pub fn on_following(self, account_id: i64, pages: Vec<Vec<ConnectionEntry>>) -> Self {
        self.on_connections(account_id, Direction::Following, pages)
    }

    pub fn on_connections(
        mut self,
        account_id: i64,
        direction: Direction,
        pages: Vec<Vec<ConnectionEntry>>,
    ) -> Self {
        self.connections.insert((account_id, direction), pages);
        self
    }

    /// Make the page at 0-based `index` fail.
    pub fn failing_page(mut self, account_id: i64, direction: Direction, index: usize) -> Self {
        self.failing_pages.insert((account_id, direction, index));
        self
    }

    /// Timeline pages, newest first.
    pub fn on_posts(mut self, account_id: i64, pages: Vec<Vec<Post>>) -> Self {
        self.timelines.insert(account_id, pages);
        self
    }

    /// A post available through single-post lookup.
    pub fn on_post(mut self, post: Post) -> Self {
        self.lookups.insert(post.id, post);
        self
    }

    // --- Recorded calls ---

    pub fn profile_calls(&self, handle: &str) -> usize {
        let calls = self.calls.lock().unwrap();
        calls
            .profiles
            .iter()
            .filter(|h| h.eq_ignore_ascii_case(handle))
            .count()
    }

    pub fn connection_calls(&self) -> Vec<ConnectionCall> {
        self.calls.lock().unwrap().connections.clone()
    }

    /// Fetches started for an account in a direction (first pages only).
    pub fn fetches_for(&self, account_id: i64, direction: Direction) -> usize {
        self.connection_calls()
            .iter()
            .filter(|c| c.account_id == account_id && c.direction == direction && c.page == 1)
            .count()
    }

    pub fn post_lookups(&self) -> Vec<i64> {
        self.calls.lock().unwrap().lookups.clone()
    }

    pub fn timeline_calls(&self) -> usize {
        self.calls.lock().unwrap().posts.len()
    }
}

fn page_index(token: Option<&str>) -> Result<usize> {
    match token {
        None => Ok(0),
        Some(raw) => raw
            .strip_prefix("page-")
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| anyhow!("MockProfileSource: bad page token {raw}")),
    }
}

fn next_token(index: usize, len: usize) -> Option<String> {
    (index + 1 < len).then(|| format!("page-{}", index + 1))
}

#[async_trait]
impl ProfileSource for MockProfileSource {
    async fn profile(&self, handle: &str) -> Result<Profile> {
        self.calls.lock().unwrap().profiles.push(handle.to_string());
        let mut profile = self
            .profiles
            .get(&handle.to_lowercase())
            .cloned()
            .ok_or_else(|| anyhow!("MockProfileSource: no profile registered for {handle}"))?;
        profile.collected_at = Utc::now();
        Ok(profile)
    }

    async fn connections(
        &self,
        account_id: i64,
        direction: Direction,
        page_token: Option<&str>,
    ) -> Result<ConnectionPage> {
        let index = page_index(page_token)?;
        self.calls.lock().unwrap().connections.push(ConnectionCall {
            account_id,
            direction,
            page: index + 1,
            at: tokio::time::Instant::now(),
        });

        if self.failing_pages.contains(&(account_id, direction, index)) {
            bail!("MockProfileSource: HTTP 503 on {direction} page {} for {account_id}", index + 1);
        }
        let pages = self.connections.get(&(account_id, direction)).ok_or_else(|| {
            anyhow!("MockProfileSource: no {direction} registered for {account_id}")
        })?;
        let entries = pages.get(index).cloned().unwrap_or_default();
        Ok(ConnectionPage {
            entries,
            next_token: next_token(index, pages.len()),
        })
    }

    async fn posts(&self, account: &AccountRef, cursor: Option<&str>) -> Result<PostPage> {
        self.calls.lock().unwrap().posts.push(account.id);
        let index = page_index(cursor)?;
        let pages = self
            .timelines
            .get(&account.id)
            .ok_or_else(|| anyhow!("MockProfileSource: no posts registered for {account}"))?;
        Ok(PostPage {
            posts: pages.get(index).cloned().unwrap_or_default(),
            next_cursor: next_token(index, pages.len()),
        })
    }

    async fn post(&self, id: i64) -> Result<Post> {
        self.calls.lock().unwrap().lookups.push(id);
        self.lookups
            .get(&id)
            .cloned()
            .ok_or_else(|| anyhow!("MockProfileSource: no post registered for {id}"))
    }
}

// ---------------------------------------------------------------------------
// MemoryRepository
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryInner {
    profiles: HashMap<i64, Profile>,
    profile_inserts: usize,
    profile_updates: usize,
    edges: Vec<Edge>,
    edge_keys: HashSet<(i64, i64)>,
    posts: HashMap<i64, Post>,
    mentions: HashSet<Mention>,
    replies: HashSet<Reply>,
    hashtags: HashSet<Hashtag>,
    bio_tags: HashSet<(i64, i64)>,
    institutions: HashMap<i32, Institution>,
    participants: HashMap<(i32, i64), i32>,
    backlog: BTreeMap<i64, BacklogEntry>,
    next_backlog_id: i64,
}

/// Stateful in-memory store. Thread-safe via interior Mutex.
/// Inserts that would violate a Postgres foreign key return `Err`.
#[derive(Default)]
pub struct MemoryRepository {
    inner: Mutex<MemoryInner>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a profile without counting it as an insert.
    pub fn with_profile(self, profile: Profile) -> Self {
        self.inner
            .lock()
            .unwrap()
            .profiles
            .insert(profile.id, profile);
        self
    }

    /// Seed an edge without counting it as an insert.
    pub fn with_edge(self, edge: Edge) -> Self {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.edge_keys.insert(edge.key());
            inner.edges.push(edge);
        }
        self
    }

    /// Seed a pending backlog entry.
    pub fn with_backlog(self, account: AccountRef, direction: Direction) -> Self {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.next_backlog_id += 1;
            let id = inner.next_backlog_id;
            inner.backlog.insert(
                id,
                BacklogEntry {
                    id,
                    account,
                    direction,
                },
            );
        }
        self
    }

    pub fn profile(&self, id: i64) -> Option<Profile> {
        self.inner.lock().unwrap().profiles.get(&id).cloned()
    }

    pub fn profile_count(&self) -> usize {
        self.inner.lock().unwrap().profiles.len()
    }

    pub fn profile_inserts(&self) -> usize {
        self.inner.lock().unwrap().profile_inserts
    }

    pub fn profile_updates(&self) -> usize {
        self.inner.lock().unwrap().profile_updates
    }

    /// `(follower, followee)` pairs in insertion order.
    pub fn edge_keys(&self) -> Vec<(i64, i64)> {
        self.inner.lock().unwrap().edges.iter().map(Edge::key).collect()
    }

    pub fn has_edge(&self, follower_id: i64, followee_id: i64) -> bool {
        self.inner
            .lock()
            .unwrap()
            .edge_keys
            .contains(&(follower_id, followee_id))
    }

    pub fn edges(&self) -> Vec<Edge> {
        self.inner.lock().unwrap().edges.clone()
    }

    pub fn post(&self, id: i64) -> Option<Post> {
        self.inner.lock().unwrap().posts.get(&id).cloned()
    }

    pub fn post_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.inner.lock().unwrap().posts.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn mentions(&self) -> HashSet<Mention> {
        self.inner.lock().unwrap().mentions.clone()
    }

    pub fn replies(&self) -> HashSet<Reply> {
        self.inner.lock().unwrap().replies.clone()
    }

    pub fn hashtags(&self) -> HashSet<Hashtag> {
        self.inner.lock().unwrap().hashtags.clone()
    }

    pub fn bio_tags(&self) -> HashSet<(i64, i64)> {
        self.inner.lock().unwrap().bio_tags.clone()
    }

    pub fn institution(&self, id: i32) -> Option<Institution> {
        self.inner.lock().unwrap().institutions.get(&id).cloned()
    }

    pub fn cohort(&self, institution_id: i32, user_id: i64) -> Option<i32> {
        self.inner
            .lock()
            .unwrap()
            .participants
            .get(&(institution_id, user_id))
            .copied()
    }

    pub fn backlog_len(&self) -> usize {
        self.inner.lock().unwrap().backlog.len()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn profile_exists(&self, id: i64) -> Result<bool> {
        Ok(self.inner.lock().unwrap().profiles.contains_key(&id))
    }

    async fn profile_id_by_handle(&self, handle: &str) -> Result<Option<i64>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .profiles
            .values()
            .find(|p| p.handle.eq_ignore_ascii_case(handle))
            .map(|p| p.id))
    }

    async fn insert_profile(&self, profile: &Profile) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        if inner.profiles.contains_key(&profile.id) {
            return Ok(false);
        }
        inner.profiles.insert(profile.id, profile.clone());
        inner.profile_inserts += 1;
        Ok(true)
    }

    async fn update_profile(&self, profile: &Profile) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let Some(existing) = inner.profiles.get_mut(&profile.id) else {
            return Ok(());
        };
        let was_participant = existing.is_participant;
        *existing = profile.clone();
        existing.is_participant |= was_participant;
        inner.profile_updates += 1;
        Ok(())
    }

    async fn edge_exists(&self, follower_id: i64, followee_id: i64) -> Result<bool> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .edge_keys
            .contains(&(follower_id, followee_id)))
    }

    async fn insert_edge(&self, edge: &Edge) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        for id in [edge.follower_id, edge.followee_id] {
            if !inner.profiles.contains_key(&id) {
                bail!("MemoryRepository: edge references missing profile {id}");
            }
        }
        if !inner.edge_keys.insert(edge.key()) {
            return Ok(false);
        }
        inner.edges.push(edge.clone());
        Ok(true)
    }

    async fn insert_bio_tag(&self, tag: &BioTag) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        for id in [tag.user_id, tag.mentioned_user_id] {
            if !inner.profiles.contains_key(&id) {
                bail!("MemoryRepository: bio tag references missing profile {id}");
            }
        }
        Ok(inner.bio_tags.insert((tag.user_id, tag.mentioned_user_id)))
    }

    async fn institution_registered(&self, user_id: i64) -> Result<bool> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .institutions
            .values()
            .any(|i| i.user_id == user_id))
    }

    async fn upsert_institution(&self, institution: &Institution) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .institutions
            .entry(institution.info.id)
            .and_modify(|existing| existing.user_id = institution.user_id)
            .or_insert_with(|| institution.clone());
        Ok(())
    }

    async fn upsert_participant(&self, participant: &Participant) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.institutions.contains_key(&participant.institution_id) {
            bail!(
                "MemoryRepository: participant references missing institution {}",
                participant.institution_id
            );
        }
        inner.participants.insert(
            (participant.institution_id, participant.user_id),
            participant.cohort,
        );
        Ok(())
    }

    async fn post_exists(&self, id: i64) -> Result<bool> {
        Ok(self.inner.lock().unwrap().posts.contains_key(&id))
    }

    async fn insert_post(&self, post: &Post) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.profiles.contains_key(&post.author.id) {
            bail!("MemoryRepository: post {} references missing author {}", post.id, post.author.id);
        }
        for parent in [post.reply_to_id, post.repeated_id()].into_iter().flatten() {
            if !inner.posts.contains_key(&parent) {
                bail!("MemoryRepository: post {} references missing post {parent}", post.id);
            }
        }
        if inner.posts.contains_key(&post.id) {
            return Ok(false);
        }
        inner.posts.insert(post.id, post.clone());
        Ok(true)
    }

    async fn post_author(&self, post_id: i64) -> Result<Option<i64>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .posts
            .get(&post_id)
            .map(|p| p.author.id))
    }

    async fn insert_mention(&self, mention: &Mention) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.profiles.contains_key(&mention.user_id) {
            bail!("MemoryRepository: mention references missing profile {}", mention.user_id);
        }
        Ok(inner.mentions.insert(*mention))
    }

    async fn insert_reply(&self, reply: &Reply) -> Result<bool> {
        Ok(self.inner.lock().unwrap().replies.insert(*reply))
    }

    async fn insert_hashtag(&self, hashtag: &Hashtag) -> Result<bool> {
        Ok(self.inner.lock().unwrap().hashtags.insert(hashtag.clone()))
    }

    async fn enqueue_backlog(&self, account: &AccountRef, direction: Direction) -> Result<i64> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_backlog_id += 1;
        let id = inner.next_backlog_id;
        inner.backlog.insert(
            id,
            BacklogEntry {
                id,
                account: account.clone(),
                direction,
            },
        );
        Ok(id)
    }

    async fn complete_backlog(&self, id: i64) -> Result<()> {
        self.inner.lock().unwrap().backlog.remove(&id);
        Ok(())
    }

    async fn pending_backlog(&self) -> Result<Vec<BacklogEntry>> {
        Ok(self.inner.lock().unwrap().backlog.values().cloned().collect())
    }
}
