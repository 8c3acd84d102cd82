// Postgres persistence for harvested accounts and the follow graph.

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use followgraph_common::{BioTag, Edge, Institution, Participant, Profile};

use crate::error::Result;

/// Shared handle over the connection pool. Cheap to clone.
#[derive(Clone)]
pub struct PgStore {
    pub(crate) pool: PgPool,
}

/// A row from the users table.
#[derive(Debug, Clone, sqlx::FromRow)]
struct UserRow {
    id: i64,
    profile_name: String,
    handle: String,
    verified: bool,
    joined: Option<DateTime<Utc>>,
    bio: String,
    location: String,
    avatar: String,
    tweets: i64,
    likes: i64,
    following: i64,
    followers: i64,
    is_participant: bool,
    collected_at: DateTime<Utc>,
}

impl From<UserRow> for Profile {
    fn from(row: UserRow) -> Self {
        Profile {
            id: row.id,
            display_name: row.profile_name,
            handle: row.handle,
            verified: row.verified,
            posts_count: row.tweets,
            likes_count: row.likes,
            following_count: row.following,
            followers_count: row.followers,
            bio: row.bio,
            location: row.location,
            avatar_url: row.avatar,
            joined: row.joined,
            is_participant: row.is_participant,
            collected_at: row.collected_at,
        }
    }
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect with a small pool sized for the fixed worker topology.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Run the embedded SQL migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    // --- Profiles ---

    pub async fn profile_exists(&self, id: i64) -> Result<bool> {
        let exists = sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM users WHERE id = $1)")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    /// Resolve a handle to an id. Handles compare case-insensitively.
    pub async fn profile_id_by_handle(&self, handle: &str) -> Result<Option<i64>> {
        let id = sqlx::query_scalar::<_, i64>(
            "SELECT id FROM users WHERE lower(handle) = lower($1) ORDER BY collected_at DESC LIMIT 1",
        )
        .bind(handle)
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn profile(&self, id: i64) -> Result<Option<Profile>> {
        let row = sqlx::query_as::<_, UserRow>(
            r#"
            SELECT id, profile_name, handle, verified, joined, bio, location, avatar,
                   tweets, likes, following, followers, is_participant, collected_at
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Profile::from))
    }

    /// Insert a profile. Returns false when the id is already present.
    pub async fn insert_profile(&self, p: &Profile) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO users
                (id, profile_name, handle, verified, joined, bio, location, avatar,
                 tweets, likes, following, followers, is_participant, collected_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(p.id)
        .bind(&p.display_name)
        .bind(&p.handle)
        .bind(p.verified)
        .bind(p.joined)
        .bind(&p.bio)
        .bind(&p.location)
        .bind(&p.avatar_url)
        .bind(p.posts_count)
        .bind(p.likes_count)
        .bind(p.following_count)
        .bind(p.followers_count)
        .bind(p.is_participant)
        .bind(p.collected_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Overwrite the mutable fields of an existing profile.
    pub async fn update_profile(&self, p: &Profile) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE users
            SET profile_name = $2, handle = $3, verified = $4, joined = $5, bio = $6,
                location = $7, avatar = $8, tweets = $9, likes = $10, following = $11,
                followers = $12, is_participant = is_participant OR $13, collected_at = $14
            WHERE id = $1
            "#,
        )
        .bind(p.id)
        .bind(&p.display_name)
        .bind(&p.handle)
        .bind(p.verified)
        .bind(p.joined)
        .bind(&p.bio)
        .bind(&p.location)
        .bind(&p.avatar_url)
        .bind(p.posts_count)
        .bind(p.likes_count)
        .bind(p.following_count)
        .bind(p.followers_count)
        .bind(p.is_participant)
        .bind(p.collected_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // --- Follow edges ---

    pub async fn edge_exists(&self, follower_id: i64, followee_id: i64) -> Result<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM follows WHERE follower_id = $1 AND followee_id = $2)",
        )
        .bind(follower_id)
        .bind(followee_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    /// Insert an edge. Returns false when the pair was already recorded.
    pub async fn insert_edge(&self, edge: &Edge) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO follows (follower_id, followee_id, created_at, collected_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (follower_id, followee_id) DO NOTHING
            "#,
        )
        .bind(edge.follower_id)
        .bind(edge.followee_id)
        .bind(edge.formed_at)
        .bind(edge.observed_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    // --- Bio tags ---

    pub async fn insert_bio_tag(&self, tag: &BioTag) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO bio_tags (user_id, mentioned_user_id, collected_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id, mentioned_user_id) DO NOTHING
            "#,
        )
        .bind(tag.user_id)
        .bind(tag.mentioned_user_id)
        .bind(tag.collected_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    // --- Institutions and participants ---

    /// Whether an institution row already points at this account.
    pub async fn institution_registered(&self, user_id: i64) -> Result<bool> {
        let exists = sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM schools WHERE user_id = $1)")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    /// Register an institution, or attach the account to an existing row with the same id.
    pub async fn upsert_institution(&self, inst: &Institution) -> Result<()> {
        let info = &inst.info;
        sqlx::query(
            r#"
            INSERT INTO schools (id, name, top_rated, public, city, state_province, country, user_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE SET user_id = EXCLUDED.user_id
            "#,
        )
        .bind(info.id)
        .bind(&info.name)
        .bind(info.top_rated)
        .bind(info.public)
        .bind(&info.city)
        .bind(&info.state)
        .bind(&info.country)
        .bind(inst.user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record (or move) an account's cohort at an institution.
    pub async fn upsert_participant(&self, p: &Participant) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO students (school_id, user_id, cohort)
            VALUES ($1, $2, $3)
            ON CONFLICT (school_id, user_id) DO UPDATE SET cohort = EXCLUDED.cohort
            "#,
        )
        .bind(p.institution_id)
        .bind(p.user_id)
        .bind(p.cohort)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
