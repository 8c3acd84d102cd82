use serde::Deserialize;

// Identifiers and timestamps stay as the raw strings the API sends. Callers
// parse them per record so one malformed entry never sinks a whole page.

/// Envelope for every v2 response.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiResponse<T> {
    pub data: Option<T>,
    #[serde(default)]
    pub includes: Includes,
    #[serde(default)]
    pub meta: Meta,
    #[serde(default)]
    pub errors: Vec<ApiProblem>,
}

/// Expanded objects referenced from `data`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Includes {
    #[serde(default)]
    pub users: Vec<XUser>,
}

/// Pagination metadata.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Meta {
    pub next_token: Option<String>,
    pub previous_token: Option<String>,
    pub result_count: Option<u32>,
}

/// Partial-error entry. The API answers 200 with these for unknown users.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiProblem {
    pub title: Option<String>,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct XUser {
    pub id: String,
    pub name: String,
    pub username: String,
    pub created_at: Option<String>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub profile_image_url: Option<String>,
    pub verified: Option<bool>,
    pub public_metrics: Option<UserMetrics>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserMetrics {
    #[serde(default)]
    pub followers_count: i64,
    #[serde(default)]
    pub following_count: i64,
    #[serde(default)]
    pub tweet_count: i64,
    #[serde(default)]
    pub like_count: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct XTweet {
    pub id: String,
    pub text: String,
    pub author_id: Option<String>,
    pub created_at: Option<String>,
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub referenced_tweets: Vec<ReferencedTweet>,
    pub entities: Option<TweetEntities>,
    pub public_metrics: Option<TweetMetrics>,
}

impl XTweet {
    /// Id of the tweet referenced with the given relation, if any.
    pub fn referenced(&self, kind: ReferenceKind) -> Option<&str> {
        self.referenced_tweets
            .iter()
            .find(|r| r.kind == kind)
            .map(|r| r.id.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceKind {
    RepliedTo,
    Quoted,
    Retweeted,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReferencedTweet {
    #[serde(rename = "type")]
    pub kind: ReferenceKind,
    pub id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TweetEntities {
    #[serde(default)]
    pub mentions: Vec<MentionEntity>,
    #[serde(default)]
    pub hashtags: Vec<HashtagEntity>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MentionEntity {
    pub username: String,
    pub id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HashtagEntity {
    pub tag: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TweetMetrics {
    #[serde(default)]
    pub retweet_count: i64,
    #[serde(default)]
    pub reply_count: i64,
    #[serde(default)]
    pub like_count: i64,
    #[serde(default)]
    pub quote_count: i64,
}

/// Which relationship list of an account to page through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEndpoint {
    Followers,
    Following,
}

impl ConnectionEndpoint {
    pub fn path(self) -> &'static str {
        match self {
            ConnectionEndpoint::Followers => "followers",
            ConnectionEndpoint::Following => "following",
        }
    }
}

/// One page of a paginated listing.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_token: Option<String>,
    /// Users expanded alongside the items (tweet authors).
    pub users: Vec<XUser>,
}

/// A single tweet plus its expanded author.
#[derive(Debug, Clone)]
pub struct TweetLookup {
    pub tweet: XTweet,
    pub users: Vec<XUser>,
}
