// Posts and the records hanging off them.

use followgraph_common::{Hashtag, Mention, Post, Reply};

use crate::error::Result;
use crate::store::PgStore;

impl PgStore {
    pub async fn post_exists(&self, id: i64) -> Result<bool> {
        let exists = sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM tweets WHERE id = $1)")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    /// Insert a post. Referenced posts must be stored first.
    pub async fn insert_post(&self, post: &Post) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO tweets
                (id, reply_to_id, text, posted_at, url, user_id, is_retweet, retweet_id,
                 likes, retweets, replies, collected_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(post.id)
        .bind(post.reply_to_id)
        .bind(&post.text)
        .bind(post.posted_at)
        .bind(&post.url)
        .bind(post.author.id)
        .bind(post.is_retweet())
        .bind(post.repeated_id())
        .bind(post.likes)
        .bind(post.retweets)
        .bind(post.replies)
        .bind(post.collected_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn insert_mention(&self, mention: &Mention) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO mentions (tweet_id, user_id) VALUES ($1, $2) ON CONFLICT (tweet_id, user_id) DO NOTHING",
        )
        .bind(mention.post_id)
        .bind(mention.user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn insert_reply(&self, reply: &Reply) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO replies (tweet_id, user_replied_to_id) VALUES ($1, $2)
            ON CONFLICT (tweet_id, user_replied_to_id) DO NOTHING
            "#,
        )
        .bind(reply.post_id)
        .bind(reply.replied_to_user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn insert_hashtag(&self, hashtag: &Hashtag) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO hashtags (tag, tweet_id) VALUES ($1, $2) ON CONFLICT (tag, tweet_id) DO NOTHING",
        )
        .bind(&hashtag.tag)
        .bind(hashtag.post_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Author of a stored post, used to resolve reply targets.
    pub async fn post_author(&self, post_id: i64) -> Result<Option<i64>> {
        let author = sqlx::query_scalar::<_, i64>("SELECT user_id FROM tweets WHERE id = $1")
            .bind(post_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(author)
    }
}
