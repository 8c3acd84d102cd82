// Trait abstractions for the pipeline's two collaborators.
//
// ProfileSource wraps the upstream social API: profiles, connection pages,
// timeline pages and single-post lookups.
// Repository wraps persistence: existence checks and idempotent inserts keyed
// by numeric id, plus the durable connection backlog.
//
// Workers only ever see `Arc<dyn ProfileSource>` / `Arc<dyn Repository>`, so the
// chain tests run against MockProfileSource and MemoryRepository with no
// network and no database.

use std::collections::HashMap;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;

use followgraph_common::{
    parse_api_timestamp, parse_id, AccountRef, BacklogEntry, BioTag, ConnectionEntry,
    ConnectionPage, Direction, Edge, Hashtag, Institution, Mention, Participant, Post, PostPage,
    Profile, Reply,
};
use followgraph_store::PgStore;
use x_api_client::{ConnectionEndpoint, ReferenceKind, XClient, XTweet, XUser};

// ---------------------------------------------------------------------------
// ProfileSource: the upstream API
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ProfileSource: Send + Sync {
    /// Fetch the current profile for a handle.
    async fn profile(&self, handle: &str) -> Result<Profile>;

    /// Fetch one page of an account's followers or followees.
    /// `page_token` is the token returned by the previous page, `None` for the first.
    async fn connections(
        &self,
        account_id: i64,
        direction: Direction,
        page_token: Option<&str>,
    ) -> Result<ConnectionPage>;

    /// Fetch one page of an account's timeline, newest first.
    async fn posts(&self, account: &AccountRef, cursor: Option<&str>) -> Result<PostPage>;

    /// Look up a single post by id.
    async fn post(&self, id: i64) -> Result<Post>;
}

#[async_trait]
impl ProfileSource for XClient {
    async fn profile(&self, handle: &str) -> Result<Profile> {
        let user = self.user_by_username(handle).await?;
        profile_from_user(&user, Utc::now())
    }

    async fn connections(
        &self,
        account_id: i64,
        direction: Direction,
        page_token: Option<&str>,
    ) -> Result<ConnectionPage> {
        let endpoint = match direction {
            Direction::Followers => ConnectionEndpoint::Followers,
            Direction::Following => ConnectionEndpoint::Following,
        };
        let page = self
            .connections_page(account_id, endpoint, page_token)
            .await?;
        Ok(ConnectionPage {
            entries: page
                .items
                .into_iter()
                .map(|u| ConnectionEntry {
                    id: u.id,
                    handle: u.username,
                    name: u.name,
                    created_at: u.created_at,
                })
                .collect(),
            next_token: page.next_token,
        })
    }

    async fn posts(&self, account: &AccountRef, cursor: Option<&str>) -> Result<PostPage> {
        let page = self.user_tweets_page(account.id, cursor).await?;
        let handles = handle_index(&page.users);
        let now = Utc::now();
        let posts = page
            .items
            .iter()
            .filter_map(|tweet| match post_from_tweet(tweet, &handles, Some(account), now) {
                Ok(post) => Some(post),
                Err(e) => {
                    warn!(account = %account, tweet = tweet.id.as_str(), error = %e, "Skipping malformed post");
                    None
                }
            })
            .collect();
        Ok(PostPage {
            posts,
            next_cursor: page.next_token,
        })
    }

    async fn post(&self, id: i64) -> Result<Post> {
        let lookup = self.tweet(&id.to_string()).await?;
        let handles = handle_index(&lookup.users);
        post_from_tweet(&lookup.tweet, &handles, None, Utc::now())
    }
}

fn profile_from_user(user: &XUser, collected_at: DateTime<Utc>) -> Result<Profile> {
    let metrics = user.public_metrics.clone().unwrap_or_default();
    Ok(Profile {
        id: parse_id(&user.id)?,
        display_name: user.name.clone(),
        handle: user.username.clone(),
        verified: user.verified.unwrap_or(false),
        posts_count: metrics.tweet_count,
        likes_count: metrics.like_count,
        following_count: metrics.following_count,
        followers_count: metrics.followers_count,
        bio: user.description.clone().unwrap_or_default(),
        location: user.location.clone().unwrap_or_default(),
        avatar_url: user.profile_image_url.clone().unwrap_or_default(),
        joined: user
            .created_at
            .as_deref()
            .and_then(|raw| parse_api_timestamp(raw).ok()),
        is_participant: false,
        collected_at,
    })
}

fn handle_index(users: &[XUser]) -> HashMap<&str, &str> {
    users
        .iter()
        .map(|u| (u.id.as_str(), u.username.as_str()))
        .collect()
}

/// Convert an API tweet. `owner` is the timeline's account, used when the
/// author was not expanded in the response.
fn post_from_tweet(
    tweet: &XTweet,
    handles: &HashMap<&str, &str>,
    owner: Option<&AccountRef>,
    collected_at: DateTime<Utc>,
) -> Result<Post> {
    let id = parse_id(&tweet.id)?;
    let author = match (tweet.author_id.as_deref(), owner) {
        (Some(raw), _) => {
            let author_id = parse_id(raw)?;
            let handle = handles
                .get(raw)
                .copied()
                .or_else(|| owner.filter(|o| o.id == author_id).map(|o| o.handle.as_str()))
                .ok_or_else(|| anyhow!("author {raw} of post {id} not expanded"))?;
            AccountRef::new(author_id, handle)
        }
        (None, Some(owner)) => owner.clone(),
        (None, None) => return Err(anyhow!("post {id} has no author")),
    };

    let reference = |kind| tweet.referenced(kind).and_then(|raw| parse_id(raw).ok());
    let entities = tweet.entities.clone().unwrap_or_default();
    let metrics = tweet.public_metrics.clone().unwrap_or_default();

    Ok(Post {
        id,
        url: format!("https://x.com/{}/status/{}", author.handle, id),
        author,
        text: tweet.text.clone(),
        posted_at: tweet
            .created_at
            .as_deref()
            .and_then(|raw| parse_api_timestamp(raw).ok()),
        reply_to_id: reference(ReferenceKind::RepliedTo),
        quoted_id: reference(ReferenceKind::Quoted),
        retweeted_id: reference(ReferenceKind::Retweeted),
        likes: metrics.like_count,
        retweets: metrics.retweet_count,
        replies: metrics.reply_count,
        mentions: entities
            .mentions
            .iter()
            .filter_map(|m| {
                let id = parse_id(m.id.as_deref()?).ok()?;
                Some(AccountRef::new(id, &m.username))
            })
            .collect(),
        hashtags: entities.hashtags.into_iter().map(|h| h.tag).collect(),
        collected_at,
    })
}

// ---------------------------------------------------------------------------
// Repository: persistence
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Repository: Send + Sync {
    // --- Profiles ---

    async fn profile_exists(&self, id: i64) -> Result<bool>;

    /// Case-insensitive handle lookup.
    async fn profile_id_by_handle(&self, handle: &str) -> Result<Option<i64>>;

    /// Returns false when the id was already present.
    async fn insert_profile(&self, profile: &Profile) -> Result<bool>;

    async fn update_profile(&self, profile: &Profile) -> Result<()>;

    // --- Edges ---

    async fn edge_exists(&self, follower_id: i64, followee_id: i64) -> Result<bool>;

    /// Returns false when the pair was already recorded.
    async fn insert_edge(&self, edge: &Edge) -> Result<bool>;

    // --- Provenance ---

    async fn insert_bio_tag(&self, tag: &BioTag) -> Result<bool>;

    async fn institution_registered(&self, user_id: i64) -> Result<bool>;

    async fn upsert_institution(&self, institution: &Institution) -> Result<()>;

    async fn upsert_participant(&self, participant: &Participant) -> Result<()>;

    // --- Posts ---

    async fn post_exists(&self, id: i64) -> Result<bool>;

    async fn insert_post(&self, post: &Post) -> Result<bool>;

    /// Author id of a persisted post.
    async fn post_author(&self, post_id: i64) -> Result<Option<i64>>;

    async fn insert_mention(&self, mention: &Mention) -> Result<bool>;

    async fn insert_reply(&self, reply: &Reply) -> Result<bool>;

    async fn insert_hashtag(&self, hashtag: &Hashtag) -> Result<bool>;

    // --- Connection backlog ---

    /// Durably record a pending connection job. Returns its id.
    async fn enqueue_backlog(&self, account: &AccountRef, direction: Direction) -> Result<i64>;

    async fn complete_backlog(&self, id: i64) -> Result<()>;

    /// Pending jobs, oldest first.
    async fn pending_backlog(&self) -> Result<Vec<BacklogEntry>>;
}

#[async_trait]
impl Repository for PgStore {
    async fn profile_exists(&self, id: i64) -> Result<bool> {
        Ok(PgStore::profile_exists(self, id).await?)
    }

    async fn profile_id_by_handle(&self, handle: &str) -> Result<Option<i64>> {
        Ok(PgStore::profile_id_by_handle(self, handle).await?)
    }

    async fn insert_profile(&self, profile: &Profile) -> Result<bool> {
        Ok(PgStore::insert_profile(self, profile).await?)
    }

    async fn update_profile(&self, profile: &Profile) -> Result<()> {
        Ok(PgStore::update_profile(self, profile).await?)
    }

    async fn edge_exists(&self, follower_id: i64, followee_id: i64) -> Result<bool> {
        Ok(PgStore::edge_exists(self, follower_id, followee_id).await?)
    }

    async fn insert_edge(&self, edge: &Edge) -> Result<bool> {
        Ok(PgStore::insert_edge(self, edge).await?)
    }

    async fn insert_bio_tag(&self, tag: &BioTag) -> Result<bool> {
        Ok(PgStore::insert_bio_tag(self, tag).await?)
    }

    async fn institution_registered(&self, user_id: i64) -> Result<bool> {
        Ok(PgStore::institution_registered(self, user_id).await?)
    }

    async fn upsert_institution(&self, institution: &Institution) -> Result<()> {
        Ok(PgStore::upsert_institution(self, institution).await?)
    }

    async fn upsert_participant(&self, participant: &Participant) -> Result<()> {
        Ok(PgStore::upsert_participant(self, participant).await?)
    }

    async fn post_exists(&self, id: i64) -> Result<bool> {
        Ok(PgStore::post_exists(self, id).await?)
    }

    async fn insert_post(&self, post: &Post) -> Result<bool> {
        Ok(PgStore::insert_post(self, post).await?)
    }

    async fn post_author(&self, post_id: i64) -> Result<Option<i64>> {
        Ok(PgStore::post_author(self, post_id).await?)
    }

    async fn insert_mention(&self, mention: &Mention) -> Result<bool> {
        Ok(PgStore::insert_mention(self, mention).await?)
    }

    async fn insert_reply(&self, reply: &Reply) -> Result<bool> {
        Ok(PgStore::insert_reply(self, reply).await?)
    }

    async fn insert_hashtag(&self, hashtag: &Hashtag) -> Result<bool> {
        Ok(PgStore::insert_hashtag(self, hashtag).await?)
    }

    async fn enqueue_backlog(&self, account: &AccountRef, direction: Direction) -> Result<i64> {
        Ok(PgStore::enqueue_backlog(self, account, direction).await?)
    }

    async fn complete_backlog(&self, id: i64) -> Result<()> {
        Ok(PgStore::complete_backlog(self, id).await?)
    }

    async fn pending_backlog(&self) -> Result<Vec<BacklogEntry>> {
        Ok(PgStore::pending_backlog(self).await?)
    }
}
