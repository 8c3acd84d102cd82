use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// --- Enums ---

/// Which side of an account's follow graph a request or batch covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Accounts that follow the subject.
    Followers,
    /// Accounts the subject follows.
    Following,
}

impl Direction {
    pub const ALL: [Direction; 2] = [Direction::Followers, Direction::Following];

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Followers => "followers",
            Direction::Following => "following",
        }
    }

    /// Build the edge between `subject` and a `peer` found in the subject's list.
    pub fn edge(
        self,
        subject: &AccountRef,
        peer: &AccountRef,
        formed_at: Option<DateTime<Utc>>,
        observed_at: DateTime<Utc>,
    ) -> Edge {
        let (follower, followee) = match self {
            Direction::Followers => (peer, subject),
            Direction::Following => (subject, peer),
        };
        Edge {
            follower_id: follower.id,
            follower_handle: follower.handle.clone(),
            followee_id: followee.id,
            followee_handle: followee.handle.clone(),
            formed_at,
            observed_at,
        }
    }

    /// The endpoint of `edge` that is not the subject of a batch in this direction.
    pub fn peer_of(self, edge: &Edge) -> AccountRef {
        match self {
            Direction::Followers => AccountRef::new(edge.follower_id, &edge.follower_handle),
            Direction::Following => AccountRef::new(edge.followee_id, &edge.followee_handle),
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Direction {
    type Err = crate::HarvestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "followers" => Ok(Direction::Followers),
            "following" | "follows" | "followings" => Ok(Direction::Following),
            other => Err(crate::HarvestError::Parse(format!(
                "unknown connection direction: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountKind {
    #[default]
    Ordinary,
    /// The account belongs to an affiliated institution.
    Institutional,
}

// --- Requests ---

/// Identity token passed between workers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountRef {
    pub id: i64,
    pub handle: String,
}

impl AccountRef {
    pub fn new(id: i64, handle: &str) -> Self {
        Self {
            id,
            handle: handle.to_string(),
        }
    }
}

impl std::fmt::Display for AccountRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "@{} ({})", self.handle, self.id)
    }
}

/// Study enrollment carried by participant requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enrollment {
    pub institution_id: i32,
    pub cohort: i32,
}

/// Institution details carried by institutional requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstitutionInfo {
    pub id: i32,
    pub name: String,
    #[serde(default)]
    pub top_rated: bool,
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub country: String,
}

/// One account to harvest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeRequest {
    pub handle: String,
    /// Numeric id, attached once the profile has been fetched.
    #[serde(default)]
    pub known_id: Option<i64>,
    #[serde(default)]
    pub kind: AccountKind,
    #[serde(default)]
    pub scrape_connections: bool,
    #[serde(default)]
    pub scrape_content: bool,
    #[serde(default)]
    pub enrollment: Option<Enrollment>,
    #[serde(default)]
    pub institution: Option<InstitutionInfo>,
    /// Posts older than this are not harvested.
    #[serde(default)]
    pub start_date: Option<DateTime<Utc>>,
}

impl ScrapeRequest {
    pub fn new(handle: &str) -> Self {
        Self {
            handle: handle.trim_start_matches('@').to_string(),
            known_id: None,
            kind: AccountKind::Ordinary,
            scrape_connections: false,
            scrape_content: false,
            enrollment: None,
            institution: None,
            start_date: None,
        }
    }

    pub fn with_connections(mut self) -> Self {
        self.scrape_connections = true;
        self
    }

    pub fn with_content(mut self, start_date: Option<DateTime<Utc>>) -> Self {
        self.scrape_content = true;
        self.start_date = start_date;
        self
    }

    pub fn institutional(mut self, info: InstitutionInfo) -> Self {
        self.kind = AccountKind::Institutional;
        self.institution = Some(info);
        self
    }

    pub fn enrolled(mut self, enrollment: Enrollment) -> Self {
        self.enrollment = Some(enrollment);
        self
    }

    pub fn is_participant(&self) -> bool {
        self.enrollment.is_some()
    }
}

// --- Persisted entities ---

/// Snapshot of an account at collection time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: i64,
    pub display_name: String,
    pub handle: String,
    pub verified: bool,
    pub posts_count: i64,
    pub likes_count: i64,
    pub following_count: i64,
    pub followers_count: i64,
    pub bio: String,
    pub location: String,
    pub avatar_url: String,
    pub joined: Option<DateTime<Utc>>,
    pub is_participant: bool,
    pub collected_at: DateTime<Utc>,
}

impl Profile {
    /// Identity-only row for accounts we have only seen referenced.
    pub fn skeletal(account: &AccountRef, collected_at: DateTime<Utc>) -> Self {
        Self {
            id: account.id,
            display_name: String::new(),
            handle: account.handle.clone(),
            verified: false,
            posts_count: 0,
            likes_count: 0,
            following_count: 0,
            followers_count: 0,
            bio: String::new(),
            location: String::new(),
            avatar_url: String::new(),
            joined: None,
            is_participant: false,
            collected_at,
        }
    }

    pub fn account(&self) -> AccountRef {
        AccountRef::new(self.id, &self.handle)
    }

    pub fn count(&self, direction: Direction) -> i64 {
        match direction {
            Direction::Followers => self.followers_count,
            Direction::Following => self.following_count,
        }
    }
}

/// Directed follow relationship.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub follower_id: i64,
    pub follower_handle: String,
    pub followee_id: i64,
    pub followee_handle: String,
    pub formed_at: Option<DateTime<Utc>>,
    pub observed_at: DateTime<Utc>,
}

impl Edge {
    pub fn key(&self) -> (i64, i64) {
        (self.follower_id, self.followee_id)
    }
}

/// Edges found for one subject in one direction.
#[derive(Debug, Clone)]
pub struct DiscoveredConnectionsBatch {
    pub subject: AccountRef,
    pub direction: Direction,
    pub edges: Vec<Edge>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub id: i64,
    pub author: AccountRef,
    pub text: String,
    pub posted_at: Option<DateTime<Utc>>,
    pub url: String,
    pub reply_to_id: Option<i64>,
    pub quoted_id: Option<i64>,
    pub retweeted_id: Option<i64>,
    pub likes: i64,
    pub retweets: i64,
    pub replies: i64,
    pub mentions: Vec<AccountRef>,
    pub hashtags: Vec<String>,
    pub collected_at: DateTime<Utc>,
}

impl Post {
    /// Posts this one replies to, quotes or reposts.
    pub fn references(&self) -> impl Iterator<Item = i64> + '_ {
        [self.reply_to_id, self.quoted_id, self.retweeted_id]
            .into_iter()
            .flatten()
    }

    pub fn is_retweet(&self) -> bool {
        self.retweeted_id.is_some()
    }

    /// The post this one repeats, for the `retweet_id` column.
    pub fn repeated_id(&self) -> Option<i64> {
        self.retweeted_id.or(self.quoted_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Mention {
    pub post_id: i64,
    pub user_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Reply {
    pub post_id: i64,
    pub replied_to_user_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Hashtag {
    pub post_id: i64,
    pub tag: String,
}

/// An account tagged in another account's bio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BioTag {
    pub user_id: i64,
    pub mentioned_user_id: i64,
    pub collected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Institution {
    pub info: InstitutionInfo,
    pub user_id: i64,
}

/// Participant association between an account and an institution cohort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Participant {
    pub institution_id: i32,
    pub cohort: i32,
    pub user_id: i64,
}

/// Pending connection job persisted so a crash does not lose it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BacklogEntry {
    pub id: i64,
    pub account: AccountRef,
    pub direction: Direction,
}

// --- Upstream pages ---

/// A raw follower/followee entry as the API reported it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEntry {
    pub id: String,
    pub handle: String,
    pub name: String,
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ConnectionPage {
    pub entries: Vec<ConnectionEntry>,
    pub next_token: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PostPage {
    pub posts: Vec<Post>,
    pub next_cursor: Option<String>,
}
