// Durable record of connection jobs that were accepted but not finished.
// Rows are removed once the job completes; whatever is left after a crash is
// replayed on the next start.

use followgraph_common::{AccountRef, BacklogEntry, Direction};
use tracing::warn;

use crate::error::Result;
use crate::store::PgStore;

impl PgStore {
    pub async fn enqueue_backlog(&self, account: &AccountRef, direction: Direction) -> Result<i64> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO connection_requests (user_id, username, direction)
            VALUES ($1, $2, $3)
            RETURNING id
            "#,
        )
        .bind(account.id)
        .bind(&account.handle)
        .bind(direction.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn complete_backlog(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM connection_requests WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Pending jobs in the order they were accepted. Rows with an unknown
    /// direction are logged and skipped.
    pub async fn pending_backlog(&self) -> Result<Vec<BacklogEntry>> {
        let rows = sqlx::query_as::<_, (i64, i64, String, String)>(
            "SELECT id, user_id, username, direction FROM connection_requests ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for (id, user_id, username, direction) in rows {
            match direction.parse::<Direction>() {
                Ok(direction) => entries.push(BacklogEntry {
                    id,
                    account: AccountRef::new(user_id, &username),
                    direction,
                }),
                Err(e) => warn!(id, error = %e, "Skipping backlog row"),
            }
        }
        Ok(entries)
    }
}
