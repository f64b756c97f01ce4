// SQLite-backed observation store
//
// Writes go through a single connection behind a mutex; analytics reads go
// through a small read-only pool so they can proceed concurrently with the
// writer under WAL. Statement reuse comes from rusqlite's prepare_cached.
//
// The responses.queryId column is deliberately unenforced: responses may
// arrive before, after, or without their query, and none of those may lose
// data.

pub mod attach;

use crate::events::{
    Complexity, Confidence, OptimizationNote, QueryRecord, ResponseRecord, StoreRecord,
};
use anyhow::{Context, Result};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

/// Where the store keeps its data. `Memory` is used in test mode; it routes
/// reads through the writer connection since a second connection would see
/// a different database.
#[derive(Debug, Clone)]
pub enum StoreKind {
    File { path: PathBuf, wal: bool },
    Memory,
}

impl StoreKind {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        StoreKind::File {
            path: path.into(),
            wal: true,
        }
    }
}

/// Optional time bounds for aggregate queries (epoch millis, inclusive).
#[derive(Debug, Clone, Copy, Default)]
pub struct StatsRange {
    pub start: Option<i64>,
    pub end: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    pub total_queries: u64,
    pub total_tokens: u64,
    pub avg_latency_ms: f64,
    pub category_counts: HashMap<String, u64>,
    pub model_counts: HashMap<String, u64>,
    pub error_rate: f64,
}

pub struct Store {
    writer: Mutex<Option<Connection>>,
    readers: Mutex<Option<Pool<SqliteConnectionManager>>>,
}

impl Store {
    /// Open the database, apply pragmas, and create tables/indexes if
    /// absent. A failure here is fatal to the run.
    pub fn open(kind: StoreKind) -> Result<Self> {
        let conn = match &kind {
            StoreKind::File { path, wal } => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("creating {}", parent.display()))?;
                }
                let conn = Connection::open(path)
                    .with_context(|| format!("opening {}", path.display()))?;
                if *wal {
                    conn.execute_batch("PRAGMA journal_mode=WAL;")
                        .context("enabling WAL")?;
                }
                conn.execute_batch(
                    r#"
                    PRAGMA synchronous=NORMAL;
                    PRAGMA busy_timeout=5000;
                    "#,
                )
                .context("applying pragmas")?;
                conn
            }
            StoreKind::Memory => {
                let conn = Connection::open_in_memory().context("opening in-memory store")?;
                conn.execute_batch("PRAGMA busy_timeout=5000;")
                    .context("applying pragmas")?;
                conn
            }
        };

        Self::init_schema(&conn)?;

        let readers = match &kind {
            StoreKind::File { path, .. } => {
                let manager = SqliteConnectionManager::file(path).with_init(|c| {
                    c.execute_batch("PRAGMA busy_timeout=5000; PRAGMA query_only=ON;")
                });
                Some(
                    Pool::builder()
                        .max_size(4)
                        .build(manager)
                        .context("building read pool")?,
                )
            }
            StoreKind::Memory => None,
        };

        Ok(Store {
            writer: Mutex::new(Some(conn)),
            readers: Mutex::new(readers),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS queries (
                id TEXT PRIMARY KEY,
                sessionId TEXT NOT NULL,
                timestampMs INTEGER NOT NULL,
                text TEXT NOT NULL,
                model TEXT NOT NULL,
                category TEXT,
                complexity TEXT,
                tokenCount INTEGER,
                metadataJson TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_queries_session ON queries(sessionId);
            CREATE INDEX IF NOT EXISTS idx_queries_timestamp ON queries(timestampMs);
            CREATE INDEX IF NOT EXISTS idx_queries_category ON queries(category);

            CREATE TABLE IF NOT EXISTS responses (
                id TEXT PRIMARY KEY,
                queryId TEXT NOT NULL,
                sessionId TEXT NOT NULL,
                timestampMs INTEGER NOT NULL,
                text TEXT,
                model TEXT NOT NULL,
                inputTokens INTEGER,
                outputTokens INTEGER,
                latencyMs INTEGER,
                finishReason TEXT,
                error TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_responses_query ON responses(queryId);

            CREATE TABLE IF NOT EXISTS optimizations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                queryId TEXT NOT NULL,
                suggestion TEXT NOT NULL,
                alternativeModel TEXT,
                estimatedSavings REAL,
                confidence TEXT NOT NULL,
                createdAtMs INTEGER NOT NULL DEFAULT (CAST(strftime('%s','now') AS INTEGER) * 1000)
            );
            "#,
        )
        .context("creating schema")?;
        Ok(())
    }

    pub fn save_query(&self, record: &QueryRecord) -> Result<()> {
        self.with_writer(|conn| Self::insert_query(conn, record))
    }

    pub fn save_response(&self, record: &ResponseRecord) -> Result<()> {
        self.with_writer(|conn| Self::insert_response(conn, record))
    }

    pub fn save_optimization(&self, note: &OptimizationNote) -> Result<()> {
        self.with_writer(|conn| Self::insert_optimization(conn, note))
    }

    /// Persist a mixed batch in a single transaction.
    pub fn save_batch(&self, records: &[StoreRecord]) -> Result<()> {
        let mut guard = self.writer.lock().unwrap();
        let conn = guard.as_mut().context("store is closed")?;
        let tx = conn.transaction().context("beginning transaction")?;
        for record in records {
            match record {
                StoreRecord::Query(q) => Self::insert_query(&tx, q)?,
                StoreRecord::Response(r) => Self::insert_response(&tx, r)?,
                StoreRecord::Optimization(o) => Self::insert_optimization(&tx, o)?,
            }
        }
        tx.commit().context("committing batch")?;
        Ok(())
    }

    pub fn get_query(&self, id: &str) -> Result<Option<QueryRecord>> {
        self.with_reader(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, sessionId, timestampMs, text, model, category, complexity,
                        tokenCount, metadataJson
                 FROM queries WHERE id = ?1",
            )?;
            let row = stmt
                .query_row(params![id], Self::row_to_query)
                .optional()?;
            Ok(row)
        })
    }

    /// First response recorded for a query, if any.
    pub fn get_response(&self, query_id: &str) -> Result<Option<ResponseRecord>> {
        self.with_reader(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, queryId, sessionId, timestampMs, text, model, inputTokens,
                        outputTokens, latencyMs, finishReason, error
                 FROM responses WHERE queryId = ?1 ORDER BY timestampMs LIMIT 1",
            )?;
            let row = stmt
                .query_row(params![query_id], Self::row_to_response)
                .optional()?;
            Ok(row)
        })
    }

    pub fn get_optimizations(&self, query_id: &str) -> Result<Vec<OptimizationNote>> {
        self.with_reader(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT queryId, suggestion, alternativeModel, estimatedSavings, confidence
                 FROM optimizations WHERE queryId = ?1 ORDER BY id",
            )?;
            let rows = stmt
                .query_map(params![query_id], |row| {
                    let confidence: String = row.get(4)?;
                    Ok(OptimizationNote {
                        query_id: row.get(0)?,
                        suggestion: row.get(1)?,
                        alternative_model: row.get(2)?,
                        estimated_savings: row.get(3)?,
                        confidence: Confidence::parse(&confidence)
                            .unwrap_or(Confidence::Low),
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    pub fn get_session_queries(&self, session_id: &str) -> Result<Vec<QueryRecord>> {
        self.with_reader(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, sessionId, timestampMs, text, model, category, complexity,
                        tokenCount, metadataJson
                 FROM queries WHERE sessionId = ?1 ORDER BY timestampMs",
            )?;
            let rows = stmt
                .query_map(params![session_id], Self::row_to_query)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    pub fn stats(&self, range: StatsRange) -> Result<StoreStats> {
        let start = range.start.unwrap_or(i64::MIN);
        let end = range.end.unwrap_or(i64::MAX);
        self.with_reader(|conn| {
            let (total_queries, total_tokens): (u64, u64) = conn
                .prepare_cached(
                    "SELECT COUNT(*), COALESCE(SUM(tokenCount), 0)
                     FROM queries WHERE timestampMs BETWEEN ?1 AND ?2",
                )?
                .query_row(params![start, end], |row| Ok((row.get(0)?, row.get(1)?)))?;

            let avg_latency_ms: f64 = conn
                .prepare_cached(
                    "SELECT COALESCE(AVG(latencyMs), 0.0)
                     FROM responses WHERE timestampMs BETWEEN ?1 AND ?2",
                )?
                .query_row(params![start, end], |row| row.get(0))?;

            let error_count: u64 = conn
                .prepare_cached(
                    "SELECT COUNT(*) FROM responses
                     WHERE error IS NOT NULL AND timestampMs BETWEEN ?1 AND ?2",
                )?
                .query_row(params![start, end], |row| row.get(0))?;

            let mut category_counts = HashMap::new();
            let mut stmt = conn.prepare_cached(
                "SELECT category, COUNT(*) FROM queries
                 WHERE category IS NOT NULL AND timestampMs BETWEEN ?1 AND ?2
                 GROUP BY category",
            )?;
            let rows = stmt.query_map(params![start, end], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
            })?;
            for row in rows {
                let (category, count) = row?;
                category_counts.insert(category, count);
            }

            let mut model_counts = HashMap::new();
            let mut stmt = conn.prepare_cached(
                "SELECT model, COUNT(*) FROM queries
                 WHERE timestampMs BETWEEN ?1 AND ?2 GROUP BY model",
            )?;
            let rows = stmt.query_map(params![start, end], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
            })?;
            for row in rows {
                let (model, count) = row?;
                model_counts.insert(model, count);
            }

            Ok(StoreStats {
                total_queries,
                total_tokens,
                avg_latency_ms,
                category_counts,
                model_counts,
                error_rate: if total_queries > 0 {
                    error_count as f64 / total_queries as f64
                } else {
                    0.0
                },
            })
        })
    }

    /// Idempotent. Close errors are swallowed; by this point there is
    /// nothing useful to do with them.
    pub fn close(&self) {
        if let Some(conn) = self.writer.lock().unwrap().take() {
            if let Err((_conn, err)) = conn.close() {
                tracing::warn!("store close reported: {err}");
            }
        }
        self.readers.lock().unwrap().take();
    }

    pub fn is_closed(&self) -> bool {
        self.writer.lock().unwrap().is_none()
    }

    fn insert_query(conn: &Connection, record: &QueryRecord) -> Result<()> {
        let metadata = record
            .metadata_json
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("serializing query metadata")?;
        conn.prepare_cached(
            "INSERT OR REPLACE INTO queries
             (id, sessionId, timestampMs, text, model, category, complexity, tokenCount, metadataJson)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )?
        .execute(params![
            record.id,
            record.session_id,
            record.timestamp_ms,
            record.text,
            record.model,
            record.category,
            record.complexity.map(|c| c.as_str()),
            record.token_count,
            metadata,
        ])
        .context("inserting query")?;
        Ok(())
    }

    fn insert_response(conn: &Connection, record: &ResponseRecord) -> Result<()> {
        conn.prepare_cached(
            "INSERT OR REPLACE INTO responses
             (id, queryId, sessionId, timestampMs, text, model, inputTokens, outputTokens,
              latencyMs, finishReason, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        )?
        .execute(params![
            record.id,
            record.query_id,
            record.session_id,
            record.timestamp_ms,
            record.text,
            record.model,
            record.input_tokens,
            record.output_tokens,
            record.latency_ms,
            record.finish_reason,
            record.error,
        ])
        .context("inserting response")?;
        Ok(())
    }

    fn insert_optimization(conn: &Connection, note: &OptimizationNote) -> Result<()> {
        conn.prepare_cached(
            "INSERT INTO optimizations
             (queryId, suggestion, alternativeModel, estimatedSavings, confidence)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?
        .execute(params![
            note.query_id,
            note.suggestion,
            note.alternative_model,
            note.estimated_savings,
            note.confidence.as_str(),
        ])
        .context("inserting optimization")?;
        Ok(())
    }

    fn row_to_query(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueryRecord> {
        let complexity: Option<String> = row.get(6)?;
        let metadata: Option<String> = row.get(8)?;
        Ok(QueryRecord {
            id: row.get(0)?,
            session_id: row.get(1)?,
            timestamp_ms: row.get(2)?,
            text: row.get(3)?,
            model: row.get(4)?,
            category: row.get(5)?,
            complexity: complexity.as_deref().and_then(Complexity::parse),
            token_count: row.get(7)?,
            metadata_json: metadata.and_then(|m| serde_json::from_str(&m).ok()),
        })
    }

    fn row_to_response(row: &rusqlite::Row<'_>) -> rusqlite::Result<ResponseRecord> {
        Ok(ResponseRecord {
            id: row.get(0)?,
            query_id: row.get(1)?,
            session_id: row.get(2)?,
            timestamp_ms: row.get(3)?,
            text: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
            model: row.get(5)?,
            input_tokens: row.get(6)?,
            output_tokens: row.get(7)?,
            latency_ms: row.get(8)?,
            finish_reason: row.get(9)?,
            error: row.get(10)?,
        })
    }

    fn with_writer<R>(&self, f: impl FnOnce(&Connection) -> Result<R>) -> Result<R> {
        let guard = self.writer.lock().unwrap();
        let conn = guard.as_ref().context("store is closed")?;
        f(conn)
    }

    /// Reads use the pool when file-backed; in-memory mode shares the
    /// writer connection.
    fn with_reader<R>(&self, f: impl FnOnce(&Connection) -> Result<R>) -> Result<R> {
        let pool = self.readers.lock().unwrap().clone();
        match pool {
            Some(pool) => {
                let conn = pool.get().context("getting read connection")?;
                f(&conn)
            }
            None => self.with_writer(f),
        }
    }
}
