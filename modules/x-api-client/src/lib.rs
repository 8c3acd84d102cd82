pub mod error;
pub mod types;

pub use error::{Result, XApiError};
pub use types::{
    ConnectionEndpoint, HashtagEntity, MentionEntity, Page, ReferenceKind, ReferencedTweet,
    TweetEntities, TweetLookup, TweetMetrics, UserMetrics, XTweet, XUser,
};

use serde::de::DeserializeOwned;
use types::ApiResponse;

const BASE_URL: &str = "https://api.twitter.com/2";

const USER_FIELDS: &str =
    "created_at,description,location,profile_image_url,public_metrics,verified";

const TWEET_FIELDS: &str =
    "author_id,conversation_id,created_at,entities,public_metrics,referenced_tweets";

/// Largest page the followers/following endpoints accept.
const CONNECTIONS_PAGE_SIZE: u32 = 1000;

/// Largest page the user timeline endpoint accepts.
const TIMELINE_PAGE_SIZE: u32 = 100;

#[derive(Clone)]
pub struct XClient {
    client: reqwest::Client,
    token: String,
}

impl XClient {
    pub fn new(token: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            token,
        }
    }

    /// Look up a user by handle.
    pub async fn user_by_username(&self, username: &str) -> Result<XUser> {
        let url = format!(
            "{}/users/by/username/{}?user.fields={}",
            BASE_URL, username, USER_FIELDS
        );
        let resp: ApiResponse<XUser> = self.get(&url).await?;
        resp.data
            .ok_or_else(|| XApiError::NotFound(describe_problems(username, &resp.errors)))
    }

    /// Fetch one page of an account's followers or followees.
    pub async fn connections_page(
        &self,
        user_id: i64,
        endpoint: ConnectionEndpoint,
        page_token: Option<&str>,
    ) -> Result<Page<XUser>> {
        let url = connections_url(BASE_URL, user_id, endpoint, page_token);
        let resp: ApiResponse<Vec<XUser>> = self.get(&url).await?;
        tracing::debug!(
            user_id,
            endpoint = endpoint.path(),
            count = resp.meta.result_count.unwrap_or_default(),
            "Fetched connections page"
        );
        Ok(Page {
            items: resp.data.unwrap_or_default(),
            next_token: resp.meta.next_token,
            users: resp.includes.users,
        })
    }

    /// Fetch one page of an account's timeline, newest first.
    pub async fn user_tweets_page(
        &self,
        user_id: i64,
        pagination_token: Option<&str>,
    ) -> Result<Page<XTweet>> {
        let mut url = format!(
            "{}/users/{}/tweets?max_results={}&tweet.fields={}&expansions=author_id&user.fields=username,name",
            BASE_URL, user_id, TIMELINE_PAGE_SIZE, TWEET_FIELDS
        );
        if let Some(token) = pagination_token {
            url.push_str("&pagination_token=");
            url.push_str(token);
        }
        let resp: ApiResponse<Vec<XTweet>> = self.get(&url).await?;
        Ok(Page {
            items: resp.data.unwrap_or_default(),
            next_token: resp.meta.next_token,
            users: resp.includes.users,
        })
    }

    /// Look up a single tweet with its author expanded.
    pub async fn tweet(&self, id: &str) -> Result<TweetLookup> {
        let url = format!(
            "{}/tweets/{}?tweet.fields={}&expansions=author_id&user.fields=username,name",
            BASE_URL, id, TWEET_FIELDS
        );
        let resp: ApiResponse<XTweet> = self.get(&url).await?;
        let tweet = resp
            .data
            .ok_or_else(|| XApiError::NotFound(describe_problems(id, &resp.errors)))?;
        Ok(TweetLookup {
            tweet,
            users: resp.includes.users,
        })
    }

    async fn get<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let resp = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .header("Content-Type", "application/json")
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(XApiError::Api {
                status: status.as_u16(),
                message: body,
            });
        }

        let body = resp.text().await?;
        Ok(serde_json::from_str(&body)?)
    }
}

fn connections_url(
    base_url: &str,
    user_id: i64,
    endpoint: ConnectionEndpoint,
    page_token: Option<&str>,
) -> String {
    let mut url = format!(
        "{}/users/{}/{}?user.fields=created_at&max_results={}",
        base_url,
        user_id,
        endpoint.path(),
        CONNECTIONS_PAGE_SIZE
    );
    if let Some(token) = page_token.filter(|t| !t.is_empty()) {
        url.push_str("&pagination_token=");
        url.push_str(token);
    }
    url
}

fn describe_problems(target: &str, problems: &[types::ApiProblem]) -> String {
    match problems.first().and_then(|p| p.detail.as_deref()) {
        Some(detail) => format!("{target}: {detail}"),
        None => target.to_string(),
    }
}
