//! SQLite-backed article store.
//!
//! Owns the `articles` table and the append-only `model_scores` history.
//! Score rows are never updated in place; every analysis run allocates a new
//! version and appends to it.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use crate::schema::SCHEMA_SQL;
use crate::types::*;
use newsbias_core::{Error, Result};

const ARTICLE_COLUMNS: &str = "id, title, url, content, status, fail_count, last_attempt, \
     escalated, composite_score, confidence, score_source, created_at";

const SCORE_COLUMNS: &str =
    "id, article_id, model, perspective, score, metadata_json, version, created_at";

/// SQLite store for articles and their score history.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl SqliteStore {
    /// Open or create the database file at `db_path`.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::Storage(e.to_string()))?;
        }

        let conn = Self::create_connection(&db_path)?;
        Self::init_schema(&conn)?;

        let store = Self {
            conn: Mutex::new(conn),
            db_path,
        };

        info!(
            "SqliteStore initialized: {} articles, path={}",
            store.count_articles()?,
            store.db_path.display()
        );

        Ok(store)
    }

    fn create_connection(db_path: &Path) -> Result<Connection> {
        let conn = Connection::open(db_path).map_err(|e| Error::Database(e.to_string()))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;",
        )
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(conn)
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| Error::Database(format!("Schema init failed: {}", e)))?;
        Ok(())
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    // ---------------------------------------------------------------
    // Articles
    // ---------------------------------------------------------------

    /// Insert an article in `pending` state. Returns the new article ID.
    pub fn insert_article(&self, article: NewArticle) -> Result<i64> {
        let conn = self.conn.lock();
        let id = conn
            .prepare_cached(
                "INSERT INTO articles (title, url, content, status, created_at) \
                 VALUES (?1, ?2, ?3, 'pending', ?4)",
            )
            .map_err(|e| Error::Database(e.to_string()))?
            .insert(params![article.title, article.url, article.content, now_millis()])
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(id)
    }

    /// Get an article by ID.
    pub fn get_article(&self, article_id: i64) -> Result<Option<Article>> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {} FROM articles WHERE id = ?1", ARTICLE_COLUMNS);
        let row = conn
            .prepare_cached(&sql)
            .map_err(|e| Error::Database(e.to_string()))?
            .query_row(params![article_id], |row| Ok(Self::row_to_article(row)))
            .optional()
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(row)
    }

    /// Count total articles.
    pub fn count_articles(&self) -> Result<i64> {
        let conn = self.conn.lock();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM articles", [], |row| row.get(0))
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(count)
    }

    /// Mark an article as being analyzed and stamp `last_attempt`.
    pub fn mark_processing(&self, article_id: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let count = conn
            .execute(
                "UPDATE articles SET status = 'processing', last_attempt = ?1 WHERE id = ?2",
                params![now_millis(), article_id],
            )
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(count > 0)
    }

    /// Overwrite only the status column.
    pub fn set_status(&self, article_id: i64, status: ArticleStatus) -> Result<bool> {
        let conn = self.conn.lock();
        let count = conn
            .execute(
                "UPDATE articles SET status = ?1 WHERE id = ?2",
                params![status.as_str(), article_id],
            )
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(count > 0)
    }

    /// Put back articles left `processing` by a process that stopped mid-job.
    ///
    /// No job survives a restart, so every such row is interrupted. Articles
    /// with failures go back to `failed`, scored ones to `processed`, the
    /// rest to `pending`. Returns how many rows were reset.
    pub fn reset_interrupted(&self) -> Result<usize> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE articles SET status = CASE
                 WHEN escalated = 1 THEN 'escalated'
                 WHEN fail_count > 0 THEN 'failed'
                 WHEN composite_score IS NOT NULL THEN 'processed'
                 ELSE 'pending'
             END
             WHERE status = 'processing'",
            [],
        )
        .map_err(|e| Error::Database(e.to_string()))
    }

    /// Persist the end of a run in one transaction.
    ///
    /// With an aggregate, the `ensemble` score row is appended and the
    /// article's composite fields are replaced. Without one, the composite
    /// fields are left as they were.
    pub fn finalize_run(
        &self,
        article_id: i64,
        bookkeeping: Bookkeeping,
        aggregate: Option<&AggregateUpdate>,
    ) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| Error::Database(e.to_string()))?;

        if let Some(agg) = aggregate {
            let metadata = serde_json::json!({
                "confidence": agg.confidence,
                "aggregation": ENSEMBLE_MODEL,
                "contributing": agg.contributing,
            });
            tx.execute(
                "INSERT INTO model_scores (article_id, model, perspective, score, metadata_json, version, created_at) \
                 VALUES (?1, ?2, NULL, ?3, ?4, ?5, ?6)",
                params![
                    article_id,
                    ENSEMBLE_MODEL,
                    agg.composite_score,
                    metadata.to_string(),
                    agg.version,
                    now_millis(),
                ],
            )
            .map_err(|e| Error::Database(e.to_string()))?;

            tx.execute(
                "UPDATE articles SET composite_score = ?1, confidence = ?2, score_source = ?3 WHERE id = ?4",
                params![
                    agg.composite_score,
                    agg.confidence,
                    ScoreSource::Llm.as_str(),
                    article_id,
                ],
            )
            .map_err(|e| Error::Database(e.to_string()))?;
        }

        let updated = tx
            .execute(
                "UPDATE articles SET status = ?1, fail_count = ?2, escalated = ?3 WHERE id = ?4",
                params![
                    bookkeeping.status.as_str(),
                    bookkeeping.fail_count,
                    bookkeeping.escalated,
                    article_id,
                ],
            )
            .map_err(|e| Error::Database(e.to_string()))?;
        if updated == 0 {
            return Err(Error::NotFound(format!("article {}", article_id)));
        }

        tx.commit().map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    /// Articles the retry sweep should resubmit: failed or with a non-zero
    /// failure count, never escalated ones. Oldest attempt first.
    pub fn list_retry_candidates(&self, limit: usize) -> Result<Vec<Article>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} FROM articles \
             WHERE (status = 'failed' OR fail_count > 0) AND escalated = 0 \
             ORDER BY last_attempt IS NOT NULL, last_attempt ASC, id ASC \
             LIMIT ?1",
            ARTICLE_COLUMNS
        );
        let mut stmt = conn
            .prepare_cached(&sql)
            .map_err(|e| Error::Database(e.to_string()))?;
        let rows = stmt
            .query_map(params![limit as i64], |row| Ok(Self::row_to_article(row)))
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    // ---------------------------------------------------------------
    // Model scores
    // ---------------------------------------------------------------

    /// Version number for a new run on this article.
    pub fn next_score_version(&self, article_id: i64) -> Result<i64> {
        let conn = self.conn.lock();
        let current: Option<i64> = conn
            .query_row(
                "SELECT MAX(version) FROM model_scores WHERE article_id = ?1",
                params![article_id],
                |row| row.get(0),
            )
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(current.unwrap_or(0) + 1)
    }

    /// Append one score row. Returns the new row ID.
    pub fn add_model_score(&self, score: &NewModelScore) -> Result<i64> {
        let conn = self.conn.lock();
        let id = conn
            .prepare_cached(
                "INSERT INTO model_scores (article_id, model, perspective, score, metadata_json, version, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )
            .map_err(|e| Error::Database(e.to_string()))?
            .insert(params![
                score.article_id,
                score.model,
                score.perspective,
                score.score,
                score.metadata.to_string(),
                score.version,
                now_millis(),
            ])
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(id)
    }

    /// All score rows of the most recent run, in insertion order.
    pub fn latest_run_scores(&self, article_id: i64) -> Result<Vec<ModelScore>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} FROM model_scores \
             WHERE article_id = ?1 \
               AND version = (SELECT MAX(version) FROM model_scores WHERE article_id = ?1) \
             ORDER BY id ASC",
            SCORE_COLUMNS
        );
        let mut stmt = conn
            .prepare_cached(&sql)
            .map_err(|e| Error::Database(e.to_string()))?;
        let rows = stmt
            .query_map(params![article_id], |row| Ok(Self::row_to_score(row)))
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Full score history for an article, newest first.
    pub fn get_model_scores(&self, article_id: i64) -> Result<Vec<ModelScore>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} FROM model_scores WHERE article_id = ?1 ORDER BY version DESC, id ASC",
            SCORE_COLUMNS
        );
        let mut stmt = conn
            .prepare_cached(&sql)
            .map_err(|e| Error::Database(e.to_string()))?;
        let rows = stmt
            .query_map(params![article_id], |row| Ok(Self::row_to_score(row)))
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    // ---------------------------------------------------------------
    // Row Mapping Helpers
    // ---------------------------------------------------------------

    fn row_to_article(row: &rusqlite::Row<'_>) -> Article {
        Article {
            id: row.get("id").unwrap_or(0),
            title: row.get("title").unwrap_or_default(),
            url: row.get::<_, Option<String>>("url").ok().flatten(),
            content: row.get("content").unwrap_or_default(),
            status: row
                .get::<_, String>("status")
                .map(|s| ArticleStatus::parse(&s))
                .unwrap_or(ArticleStatus::Pending),
            fail_count: row.get::<_, i64>("fail_count").unwrap_or(0).max(0) as u32,
            last_attempt: row.get::<_, Option<i64>>("last_attempt").ok().flatten(),
            escalated: row.get::<_, i64>("escalated").unwrap_or(0) != 0,
            composite_score: row.get::<_, Option<f64>>("composite_score").ok().flatten(),
            confidence: row.get::<_, Option<f64>>("confidence").ok().flatten(),
            score_source: row
                .get::<_, Option<String>>("score_source")
                .ok()
                .flatten()
                .and_then(|s| ScoreSource::parse(&s)),
            created_at: row.get("created_at").unwrap_or(0),
        }
    }

    fn row_to_score(row: &rusqlite::Row<'_>) -> ModelScore {
        ModelScore {
            id: row.get("id").unwrap_or(0),
            article_id: row.get("article_id").unwrap_or(0),
            model: row.get("model").unwrap_or_default(),
            perspective: row.get::<_, Option<String>>("perspective").ok().flatten(),
            score: row.get("score").unwrap_or(0.0),
            metadata: row
                .get::<_, Option<String>>("metadata_json")
                .ok()
                .flatten()
                .and_then(|s| serde_json::from_str(&s).ok())
                .unwrap_or_else(|| serde_json::json!({})),
            version: row.get("version").unwrap_or(1),
            created_at: row.get("created_at").unwrap_or(0),
        }
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
