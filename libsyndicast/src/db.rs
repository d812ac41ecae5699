//! SQLite storage for Syndicast
//!
//! A single [`Database`] backs every shared-state collaborator: publish
//! attempts, credentials, quota counters and the task queue. Several workers
//! pointing at the same file share one view of all four.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;

use crate::attempts::AttemptRepository;
use crate::classify::ErrorCode;
use crate::credentials::CredentialStore;
use crate::error::{DbError, Result, SyndicastError};
use crate::queue::{run_at, PublishTask, TaskQueue};
use crate::quota::QuotaCounter;
use crate::types::{AttemptStatus, ImageStatus, PublishAttempt, PublishCredential, TokenUpdate};

const ATTEMPT_COLUMNS: &str = "id, content_id, status, attempt_count, max_attempts, \
     remote_post_id, remote_post_url, error_message, error_code, next_retry_at, \
     image_status, media_ids, created_at, last_attempt_at, posted_at";

const CREDENTIAL_COLUMNS: &str = "id, client_id, client_secret, access_token, refresh_token, \
     expires_at, is_active, version";

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the database at `db_path` and run migrations
    pub async fn new(db_path: &str) -> Result<Self> {
        let expanded_path = shellexpand::tilde(db_path).to_string();
        let path = Path::new(&expanded_path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(DbError::IoError)?;
        }

        // Forward slashes work on both Windows and Unix; mode=rwc creates the file
        let db_url = format!("sqlite://{}?mode=rwc", expanded_path.replace('\\', "/"));

        let pool = SqlitePool::connect(&db_url)
            .await
            .map_err(DbError::SqlxError)?;

        Self::migrate(pool).await
    }

    /// Private in-memory database, mostly for tests
    pub async fn in_memory() -> Result<Self> {
        // every connection to :memory: is a separate database, so keep one
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(DbError::SqlxError)?;

        Self::migrate(pool).await
    }

    async fn migrate(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(DbError::MigrationError)?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Every attempt with the given status, oldest first
    pub async fn list_attempts(&self, status: AttemptStatus) -> Result<Vec<PublishAttempt>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM publish_attempts WHERE status = ? ORDER BY created_at, id",
            ATTEMPT_COLUMNS
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(row_to_attempt).collect()
    }
}

fn to_timestamp(at: DateTime<Utc>) -> i64 {
    at.timestamp()
}

fn from_timestamp(table: &'static str, secs: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0).ok_or_else(|| {
        DbError::CorruptRow {
            table,
            reason: format!("timestamp {} out of range", secs),
        }
        .into()
    })
}

fn from_optional_timestamp(
    table: &'static str,
    secs: Option<i64>,
) -> Result<Option<DateTime<Utc>>> {
    secs.map(|s| from_timestamp(table, s)).transpose()
}

fn corrupt(table: &'static str, reason: String) -> SyndicastError {
    DbError::CorruptRow { table, reason }.into()
}

fn row_to_attempt(row: &SqliteRow) -> Result<PublishAttempt> {
    const TABLE: &str = "publish_attempts";

    let status: String = row.try_get("status").map_err(DbError::SqlxError)?;
    let status = AttemptStatus::parse(&status)
        .ok_or_else(|| corrupt(TABLE, format!("unknown status '{}'", status)))?;

    let image_status: String = row.try_get("image_status").map_err(DbError::SqlxError)?;
    let image_status = ImageStatus::parse(&image_status)
        .ok_or_else(|| corrupt(TABLE, format!("unknown image status '{}'", image_status)))?;

    let error_code: Option<String> = row.try_get("error_code").map_err(DbError::SqlxError)?;
    let error_code = error_code
        .map(|code| code.parse::<ErrorCode>().map_err(|e| corrupt(TABLE, e)))
        .transpose()?;

    let media_ids: String = row.try_get("media_ids").map_err(DbError::SqlxError)?;
    let media_ids: Vec<String> = serde_json::from_str(&media_ids)
        .map_err(|e| corrupt(TABLE, format!("media_ids: {}", e)))?;

    let attempt_count: i64 = row.try_get("attempt_count").map_err(DbError::SqlxError)?;
    let max_attempts: i64 = row.try_get("max_attempts").map_err(DbError::SqlxError)?;

    Ok(PublishAttempt {
        id: row.try_get("id").map_err(DbError::SqlxError)?,
        content_id: row.try_get("content_id").map_err(DbError::SqlxError)?,
        status,
        attempt_count: u32::try_from(attempt_count)
            .map_err(|_| corrupt(TABLE, format!("attempt_count {}", attempt_count)))?,
        max_attempts: u32::try_from(max_attempts)
            .map_err(|_| corrupt(TABLE, format!("max_attempts {}", max_attempts)))?,
        remote_post_id: row.try_get("remote_post_id").map_err(DbError::SqlxError)?,
        remote_post_url: row.try_get("remote_post_url").map_err(DbError::SqlxError)?,
        error_message: row.try_get("error_message").map_err(DbError::SqlxError)?,
        error_code,
        next_retry_at: from_optional_timestamp(
            TABLE,
            row.try_get("next_retry_at").map_err(DbError::SqlxError)?,
        )?,
        image_status,
        media_ids,
        created_at: from_timestamp(TABLE, row.try_get("created_at").map_err(DbError::SqlxError)?)?,
        last_attempt_at: from_optional_timestamp(
            TABLE,
            row.try_get("last_attempt_at").map_err(DbError::SqlxError)?,
        )?,
        posted_at: from_optional_timestamp(
            TABLE,
            row.try_get("posted_at").map_err(DbError::SqlxError)?,
        )?,
    })
}

fn row_to_credential(row: &SqliteRow) -> Result<PublishCredential> {
    const TABLE: &str = "credentials";

    let client_secret: String = row.try_get("client_secret").map_err(DbError::SqlxError)?;
    let access_token: Option<String> = row.try_get("access_token").map_err(DbError::SqlxError)?;
    let refresh_token: Option<String> =
        row.try_get("refresh_token").map_err(DbError::SqlxError)?;
    let is_active: i64 = row.try_get("is_active").map_err(DbError::SqlxError)?;

    Ok(PublishCredential {
        id: row.try_get("id").map_err(DbError::SqlxError)?,
        client_id: row.try_get("client_id").map_err(DbError::SqlxError)?,
        client_secret: SecretString::from(client_secret),
        access_token: access_token.map(SecretString::from),
        refresh_token: refresh_token.map(SecretString::from),
        expires_at: from_optional_timestamp(
            TABLE,
            row.try_get("expires_at").map_err(DbError::SqlxError)?,
        )?,
        is_active: is_active != 0,
        version: row.try_get("version").map_err(DbError::SqlxError)?,
    })
}

#[async_trait]
impl AttemptRepository for Database {
    async fn get(&self, content_id: &str) -> Result<Option<PublishAttempt>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM publish_attempts WHERE content_id = ?",
            ATTEMPT_COLUMNS
        ))
        .bind(content_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        row.as_ref().map(row_to_attempt).transpose()
    }

    async fn save(&self, attempt: &PublishAttempt) -> Result<PublishAttempt> {
        let media_ids =
            serde_json::to_string(&attempt.media_ids).unwrap_or_else(|_| "[]".to_string());

        let (id,) = sqlx::query_as::<_, (i64,)>(
            r#"
            INSERT INTO publish_attempts (
                content_id, status, attempt_count, max_attempts, remote_post_id,
                remote_post_url, error_message, error_code, next_retry_at, image_status,
                media_ids, created_at, last_attempt_at, posted_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(content_id) DO UPDATE SET
                status = excluded.status,
                attempt_count = excluded.attempt_count,
                max_attempts = excluded.max_attempts,
                remote_post_id = excluded.remote_post_id,
                remote_post_url = excluded.remote_post_url,
                error_message = excluded.error_message,
                error_code = excluded.error_code,
                next_retry_at = excluded.next_retry_at,
                image_status = excluded.image_status,
                media_ids = excluded.media_ids,
                last_attempt_at = excluded.last_attempt_at,
                posted_at = excluded.posted_at,
                claimed_until = NULL
            RETURNING id
            "#,
        )
        .bind(&attempt.content_id)
        .bind(attempt.status.as_str())
        .bind(i64::from(attempt.attempt_count))
        .bind(i64::from(attempt.max_attempts))
        .bind(&attempt.remote_post_id)
        .bind(&attempt.remote_post_url)
        .bind(&attempt.error_message)
        .bind(attempt.error_code.map(|c| c.as_str()))
        .bind(attempt.next_retry_at.map(to_timestamp))
        .bind(attempt.image_status.as_str())
        .bind(media_ids)
        .bind(to_timestamp(attempt.created_at))
        .bind(attempt.last_attempt_at.map(to_timestamp))
        .bind(attempt.posted_at.map(to_timestamp))
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        let mut saved = attempt.clone();
        saved.id = Some(id);
        Ok(saved)
    }

    async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<PublishAttempt>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM publish_attempts
            WHERE status = 'retrying' AND next_retry_at <= ?
              AND (claimed_until IS NULL OR claimed_until <= ?)
            ORDER BY next_retry_at, id
            "#,
            ATTEMPT_COLUMNS
        ))
        .bind(to_timestamp(now))
        .bind(to_timestamp(now))
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(row_to_attempt).collect()
    }

    async fn claim(
        &self,
        content_id: &str,
        max_attempts: u32,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<PublishAttempt>> {
        // Creates the row on first use; otherwise only an idle, runnable row
        // takes the lease. A skipped update returns no row.
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO publish_attempts (
                content_id, status, attempt_count, max_attempts, image_status,
                media_ids, created_at, claimed_until
            )
            VALUES (?, 'pending', 0, ?, 'pending', '[]', ?, ?)
            ON CONFLICT(content_id) DO UPDATE SET
                claimed_until = excluded.claimed_until
            WHERE (status = 'pending' OR (status = 'retrying' AND next_retry_at <= ?))
              AND (claimed_until IS NULL OR claimed_until <= ?)
            RETURNING {}
            "#,
            ATTEMPT_COLUMNS
        ))
        .bind(content_id)
        .bind(i64::from(max_attempts))
        .bind(to_timestamp(now))
        .bind(to_timestamp(lease_until))
        .bind(to_timestamp(now))
        .bind(to_timestamp(now))
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        row.as_ref().map(row_to_attempt).transpose()
    }

    async fn release(&self, content_id: &str) -> Result<()> {
        sqlx::query("UPDATE publish_attempts SET claimed_until = NULL WHERE content_id = ?")
            .bind(content_id)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for Database {
    async fn get_active(&self) -> Result<Option<PublishCredential>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM credentials WHERE is_active = 1",
            CREDENTIAL_COLUMNS
        ))
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        row.as_ref().map(row_to_credential).transpose()
    }

    async fn save_credential(&self, mut credential: PublishCredential) -> Result<PublishCredential> {
        if credential.client_id.trim().is_empty() {
            return Err(SyndicastError::InvalidInput(
                "credential client id is empty".to_string(),
            ));
        }

        let now = Utc::now().timestamp();
        let mut tx = self.pool.begin().await.map_err(DbError::SqlxError)?;

        sqlx::query("UPDATE credentials SET is_active = 0, updated_at = ? WHERE is_active = 1")
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(DbError::SqlxError)?;

        let (id,) = sqlx::query_as::<_, (i64,)>(
            r#"
            INSERT INTO credentials (
                client_id, client_secret, access_token, refresh_token, expires_at,
                is_active, version, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, 1, 1, ?, ?)
            RETURNING id
            "#,
        )
        .bind(&credential.client_id)
        .bind(credential.client_secret.expose_secret())
        .bind(credential.access_token.as_ref().map(|t| t.expose_secret()))
        .bind(credential.refresh_token.as_ref().map(|t| t.expose_secret()))
        .bind(credential.expires_at.map(to_timestamp))
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        tx.commit().await.map_err(DbError::SqlxError)?;

        credential.id = Some(id);
        credential.is_active = true;
        credential.version = 1;
        Ok(credential)
    }

    async fn update_tokens(
        &self,
        id: i64,
        expected_version: i64,
        update: &TokenUpdate,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE credentials
            SET access_token = ?,
                refresh_token = COALESCE(?, refresh_token),
                expires_at = ?,
                version = version + 1,
                updated_at = ?
            WHERE id = ? AND version = ?
            "#,
        )
        .bind(update.access_token.expose_secret())
        .bind(update.refresh_token.as_ref().map(|t| t.expose_secret()))
        .bind(to_timestamp(update.expires_at))
        .bind(Utc::now().timestamp())
        .bind(id)
        .bind(expected_version)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    async fn clear_tokens(&self, id: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE credentials
            SET access_token = NULL,
                refresh_token = NULL,
                expires_at = NULL,
                version = version + 1,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(Utc::now().timestamp())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }
}

#[async_trait]
impl QuotaCounter for Database {
    async fn increment(&self, key: &str, expires_at: DateTime<Utc>) -> Result<u64> {
        let (count,) = sqlx::query_as::<_, (i64,)>(
            r#"
            INSERT INTO quota_counters (key, count, expires_at)
            VALUES (?, 1, ?)
            ON CONFLICT(key)
            DO UPDATE SET count = count + 1
            RETURNING count
            "#,
        )
        .bind(key)
        .bind(to_timestamp(expires_at))
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(count.max(0) as u64)
    }

    async fn get(&self, key: &str, now: DateTime<Utc>) -> Result<u64> {
        let row = sqlx::query_as::<_, (i64,)>(
            "SELECT count FROM quota_counters WHERE key = ? AND expires_at > ?",
        )
        .bind(key)
        .bind(to_timestamp(now))
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(row.map(|r| r.0.max(0) as u64).unwrap_or(0))
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM quota_counters WHERE expires_at <= ?")
            .bind(to_timestamp(now))
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl TaskQueue for Database {
    async fn enqueue_delayed(&self, content_id: &str, delay: Duration) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO publish_queue (content_id, run_at, enqueued_at)
            VALUES (?, ?, ?)
            ON CONFLICT(content_id)
            DO UPDATE SET run_at = excluded.run_at, enqueued_at = excluded.enqueued_at
            "#,
        )
        .bind(content_id)
        .bind(to_timestamp(run_at(now, delay)))
        .bind(to_timestamp(now))
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    async fn take_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<PublishTask>> {
        // one statement, so two workers never take the same task
        let rows = sqlx::query_as::<_, (String, i64)>(
            r#"
            DELETE FROM publish_queue
            WHERE content_id IN (
                SELECT content_id FROM publish_queue
                WHERE run_at <= ?
                ORDER BY run_at, content_id
                LIMIT ?
            )
            RETURNING content_id, run_at
            "#,
        )
        .bind(to_timestamp(now))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        let mut tasks = rows
            .into_iter()
            .map(|(content_id, at)| {
                Ok(PublishTask {
                    content_id,
                    run_at: from_timestamp("publish_queue", at)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        tasks.sort_by(|a, b| a.run_at.cmp(&b.run_at).then(a.content_id.cmp(&b.content_id)));
        Ok(tasks)
    }

    async fn pending(&self) -> Result<Vec<PublishTask>> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT content_id, run_at FROM publish_queue ORDER BY run_at, content_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.into_iter()
            .map(|(content_id, at)| {
                Ok(PublishTask {
                    content_id,
                    run_at: from_timestamp("publish_queue", at)?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::PublishError;
    use crate::quota::{DailyQuota, QuotaKind, QuotaLimits};
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn setup_test_db() -> (TempDir, Database) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let db = Database::new(&db_path.to_string_lossy()).await.unwrap();
        (temp_dir, db)
    }

    fn update(token: &str) -> TokenUpdate {
        TokenUpdate {
            access_token: SecretString::from(token.to_string()),
            refresh_token: None,
            expires_at: Utc::now() + chrono::Duration::hours(1),
        }
    }

    #[tokio::test]
    async fn test_database_creation_creates_parent_dirs() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("nested").join("dir").join("syndicast.db");
        let db = Database::new(&db_path.to_string_lossy()).await;
        assert!(db.is_ok());
        assert!(db_path.exists());
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        Database::new(&db_path.to_string_lossy()).await.unwrap();
        Database::new(&db_path.to_string_lossy()).await.unwrap();
    }

    #[tokio::test]
    async fn test_attempt_round_trip() {
        let (_dir, db) = setup_test_db().await;

        let mut attempt = PublishAttempt::new("post-1", 3);
        attempt.status = AttemptStatus::Retrying;
        attempt.attempt_count = 1;
        attempt.error_code = Some(ErrorCode::RateLimitError);
        attempt.error_message = Some("429".to_string());
        attempt.next_retry_at = Some(Utc::now() + chrono::Duration::seconds(120));
        attempt.media_ids = vec!["urn:li:digitalmediaAsset:1".to_string()];

        let saved = db.save(&attempt).await.unwrap();
        assert!(saved.id.is_some());

        let loaded = AttemptRepository::get(&db, "post-1").await.unwrap().unwrap();
        assert_eq!(loaded.id, saved.id);
        assert_eq!(loaded.status, AttemptStatus::Retrying);
        assert_eq!(loaded.attempt_count, 1);
        assert_eq!(loaded.error_code, Some(ErrorCode::RateLimitError));
        assert_eq!(loaded.media_ids, attempt.media_ids);
        assert_eq!(
            loaded.next_retry_at.unwrap().timestamp(),
            attempt.next_retry_at.unwrap().timestamp()
        );
        assert_eq!(loaded.created_at.timestamp(), attempt.created_at.timestamp());
    }

    #[tokio::test]
    async fn test_save_upserts_by_content_id() {
        let (_dir, db) = setup_test_db().await;

        let first = db.save(&PublishAttempt::new("post-1", 3)).await.unwrap();
        let mut updated = first.clone();
        updated.status = AttemptStatus::Success;
        updated.remote_post_id = Some("urn:li:share:1".to_string());
        let second = db.save(&updated).await.unwrap();

        assert_eq!(first.id, second.id);
        let all = db.list_attempts(AttemptStatus::Success).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn test_schema_rejects_success_without_remote_id() {
        let (_dir, db) = setup_test_db().await;

        let mut attempt = PublishAttempt::new("post-1", 3);
        attempt.status = AttemptStatus::Success;
        let result = db.save(&attempt).await;
        assert!(matches!(
            result,
            Err(SyndicastError::Database(DbError::SqlxError(_)))
        ));
    }

    #[tokio::test]
    async fn test_schema_rejects_retrying_without_next_retry() {
        let (_dir, db) = setup_test_db().await;

        let mut attempt = PublishAttempt::new("post-1", 3);
        attempt.status = AttemptStatus::Retrying;
        assert!(db.save(&attempt).await.is_err());
    }

    #[tokio::test]
    async fn test_list_due() {
        let (_dir, db) = setup_test_db().await;
        let now = Utc::now();

        let mut due = PublishAttempt::new("due", 3);
        crate::attempts::apply_failure(
            &mut due,
            &PublishError::Network("reset".to_string()),
            ImageStatus::Pending,
            now - chrono::Duration::hours(1),
        )
        .unwrap();
        db.save(&due).await.unwrap();

        let mut later = PublishAttempt::new("later", 3);
        crate::attempts::apply_failure(
            &mut later,
            &PublishError::Network("reset".to_string()),
            ImageStatus::Pending,
            now,
        )
        .unwrap();
        db.save(&later).await.unwrap();

        db.save(&PublishAttempt::new("pending", 3)).await.unwrap();

        let listed = db.list_due(now).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].content_id, "due");
    }

    #[tokio::test]
    async fn test_claim_is_exclusive_until_saved() {
        let (_dir, db) = setup_test_db().await;
        let now = Utc::now();
        let lease = now + chrono::Duration::minutes(10);

        let claimed = db.claim("post-1", 3, now, lease).await.unwrap().unwrap();
        assert_eq!(claimed.status, AttemptStatus::Pending);
        assert_eq!(claimed.max_attempts, 3);
        assert!(claimed.id.is_some());

        assert!(db.claim("post-1", 3, now, lease).await.unwrap().is_none());

        // Recording the outcome releases the lease
        db.save(&claimed).await.unwrap();
        assert!(db.claim("post-1", 3, now, lease).await.unwrap().is_some());

        db.release("post-1").await.unwrap();
        assert!(db.claim("post-1", 3, now, lease).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_expired_claim_can_be_taken_over() {
        let (_dir, db) = setup_test_db().await;
        let now = Utc::now();

        db.claim("post-1", 3, now, now + chrono::Duration::minutes(1))
            .await
            .unwrap()
            .unwrap();

        let later = now + chrono::Duration::minutes(2);
        let taken = db
            .claim("post-1", 3, later, later + chrono::Duration::minutes(1))
            .await
            .unwrap();
        assert!(taken.is_some());
    }

    #[tokio::test]
    async fn test_claim_refuses_terminal_and_undue_attempts() {
        let (_dir, db) = setup_test_db().await;
        let now = Utc::now();
        let lease = now + chrono::Duration::minutes(10);

        let mut failed = PublishAttempt::new("failed", 3);
        failed.status = AttemptStatus::Failed;
        db.save(&failed).await.unwrap();

        let mut waiting = PublishAttempt::new("waiting", 3);
        crate::attempts::apply_failure(
            &mut waiting,
            &PublishError::Network("reset".to_string()),
            ImageStatus::Pending,
            now,
        )
        .unwrap();
        db.save(&waiting).await.unwrap();

        assert!(db.claim("failed", 3, now, lease).await.unwrap().is_none());
        assert!(db.claim("waiting", 3, now, lease).await.unwrap().is_none());

        let due_at = waiting.next_retry_at.unwrap();
        let claimed = db
            .claim("waiting", 3, due_at, due_at + chrono::Duration::minutes(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.status, AttemptStatus::Retrying);
        assert_eq!(claimed.attempt_count, 1);
    }

    #[tokio::test]
    async fn test_list_due_skips_claimed_attempts() {
        let (_dir, db) = setup_test_db().await;
        let now = Utc::now();

        let mut due = PublishAttempt::new("due", 3);
        crate::attempts::apply_failure(
            &mut due,
            &PublishError::Network("reset".to_string()),
            ImageStatus::Pending,
            now - chrono::Duration::hours(1),
        )
        .unwrap();
        db.save(&due).await.unwrap();

        db.claim("due", 3, now, now + chrono::Duration::minutes(10))
            .await
            .unwrap()
            .unwrap();
        assert!(db.list_due(now).await.unwrap().is_empty());

        let after_lease = now + chrono::Duration::minutes(11);
        assert_eq!(db.list_due(after_lease).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_credentials_single_active() {
        let (_dir, db) = setup_test_db().await;

        let first = db
            .save_credential(PublishCredential::new("client-a", "secret-a"))
            .await
            .unwrap();
        let second = db
            .save_credential(PublishCredential::new("client-b", "secret-b"))
            .await
            .unwrap();
        assert_ne!(first.id, second.id);

        let active = db.get_active().await.unwrap().unwrap();
        assert_eq!(active.client_id, "client-b");
        assert_eq!(active.client_secret.expose_secret(), "secret-b");

        let (active_rows,) =
            sqlx::query_as::<_, (i64,)>("SELECT COUNT(*) FROM credentials WHERE is_active = 1")
                .fetch_one(db.pool())
                .await
                .unwrap();
        assert_eq!(active_rows, 1);
    }

    #[tokio::test]
    async fn test_update_tokens_compare_and_swap() {
        let (_dir, db) = setup_test_db().await;
        let mut credential = PublishCredential::new("client", "secret");
        credential.refresh_token = Some(SecretString::from("refresh-1".to_string()));
        let saved = db.save_credential(credential).await.unwrap();
        let id = saved.id.unwrap();

        assert!(db.update_tokens(id, saved.version, &update("first")).await.unwrap());
        assert!(!db.update_tokens(id, saved.version, &update("second")).await.unwrap());

        let active = db.get_active().await.unwrap().unwrap();
        assert_eq!(active.version, 2);
        assert_eq!(active.access_token.as_ref().unwrap().expose_secret(), "first");
        assert_eq!(
            active.refresh_token.as_ref().unwrap().expose_secret(),
            "refresh-1"
        );
    }

    #[tokio::test]
    async fn test_clear_tokens() {
        let (_dir, db) = setup_test_db().await;
        let saved = db
            .save_credential(PublishCredential::new("client", "secret"))
            .await
            .unwrap();
        let id = saved.id.unwrap();
        db.update_tokens(id, saved.version, &update("tok")).await.unwrap();

        db.clear_tokens(id).await.unwrap();
        let active = db.get_active().await.unwrap().unwrap();
        assert!(!active.has_access_token());
        assert!(active.expires_at.is_none());
        assert_eq!(active.version, 3);
    }

    #[tokio::test]
    async fn test_quota_shared_between_handles() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("shared.db");
        let worker_a = Database::new(&db_path.to_string_lossy()).await.unwrap();
        let worker_b = Database::new(&db_path.to_string_lossy()).await.unwrap();

        let limits = QuotaLimits {
            posts_per_day: 2,
            uploads_per_day: 2,
        };
        let quota_a = DailyQuota::new(Arc::new(worker_a), limits);
        let quota_b = DailyQuota::new(Arc::new(worker_b), limits);
        let now = Utc::now();

        quota_a.record(QuotaKind::Posts, now).await.unwrap();
        assert_eq!(quota_b.record(QuotaKind::Posts, now).await.unwrap(), 2);

        assert!(quota_a.reserve(QuotaKind::Posts, now).await.unwrap().is_some());
        assert!(quota_b.reserve(QuotaKind::MediaUploads, now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_quota_purge_expired() {
        let (_dir, db) = setup_test_db().await;
        let now = Utc::now();

        db.increment("old", now - chrono::Duration::hours(1)).await.unwrap();
        db.increment("current", now + chrono::Duration::hours(1)).await.unwrap();

        assert_eq!(QuotaCounter::get(&db, "old", now).await.unwrap(), 0);
        assert_eq!(db.purge_expired(now).await.unwrap(), 1);
        assert_eq!(QuotaCounter::get(&db, "current", now).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_queue_take_due_removes_tasks() {
        let (_dir, db) = setup_test_db().await;

        db.enqueue("post-1").await.unwrap();
        db.enqueue_delayed("post-2", Duration::from_secs(3600))
            .await
            .unwrap();

        let due = db.take_due(Utc::now(), 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].content_id, "post-1");

        let pending = db.pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].content_id, "post-2");
        assert!(db.take_due(Utc::now(), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_queue_requeue_moves_run_time() {
        let (_dir, db) = setup_test_db().await;

        db.enqueue_delayed("post-1", Duration::from_secs(3600))
            .await
            .unwrap();
        db.enqueue("post-1").await.unwrap();

        let pending = db.pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(db.take_due(Utc::now(), 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_in_memory_database() {
        let db = Database::in_memory().await.unwrap();
        db.save(&PublishAttempt::new("post-1", 3)).await.unwrap();
        assert!(AttemptRepository::get(&db, "post-1").await.unwrap().is_some());
    }
}
