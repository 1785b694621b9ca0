//! SQLite-backed store for the query side.
//!
//! Owns every persisted table: the read-only corpus (chunks, embeddings,
//! graph) written by the ingestion and graph-builder collaborators, and
//! the query-side state (memory, feedback, thread messages). Embedding
//! vectors are little-endian f32 BLOBs; list-valued columns are JSON text.

use chrono::Utc;
use graphrag_schemas::{
    Chunk, Community, CommunityHit, EntityHit, Feedback, MemoryEntry, MemoryStatLine, MemoryStats,
    SourceMeta, ThreadMessage, ThreadSummary,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json;
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info};

use crate::embeddings::cosine_similarity;
use crate::error::QueryError;

/// Fields of a memory entry that the pipeline persists after a successful
/// answer. Access accounting and timestamps are filled in by the store.
#[derive(Debug, Clone)]
pub struct NewMemory {
    pub question: String,
    pub normalized_question: String,
    pub embedding: Vec<f32>,
    pub answer: String,
    pub references: Vec<String>,
    pub chunk_ids: Vec<i64>,
    pub entities: Vec<EntityHit>,
    pub communities: Vec<CommunityHit>,
}

/// A favorite entry as returned by `GET /favorites`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct FavoriteEntry {
    pub id: i64,
    pub query: String,
    pub answer: String,
    pub references: Vec<String>,
    pub created_at: String,
    pub rating: Option<i64>,
    pub feedback: Option<String>,
    pub favorited_at: String,
}

pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) the database and ensure the schema exists.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, QueryError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON")?;

        let store = Self { conn };
        store.init_schema()?;

        info!("Store initialized");
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), QueryError> {
        // Corpus tables, written by the ingestion collaborator
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS chunks (
                id INTEGER PRIMARY KEY,
                text TEXT NOT NULL,
                source_meta TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS chunk_embeddings (
                chunk_id INTEGER PRIMARY KEY,
                vec BLOB NOT NULL,
                FOREIGN KEY (chunk_id) REFERENCES chunks(id) ON DELETE CASCADE
            )",
            [],
        )?;

        // Graph tables, written by the graph builder. A processing run is
        // identified by its timestamp; readers use the latest run only.
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS graph_nodes (
                node_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                entity_type TEXT,
                text TEXT,
                source TEXT,
                ts TEXT NOT NULL,
                PRIMARY KEY (node_id, ts)
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS graph_edges (
                src TEXT NOT NULL,
                dst TEXT NOT NULL,
                weight REAL NOT NULL DEFAULT 0,
                relation TEXT,
                ts TEXT NOT NULL,
                UNIQUE (src, dst, relation, ts)
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS community_summaries (
                community_id INTEGER NOT NULL,
                summary TEXT NOT NULL,
                entities TEXT NOT NULL,
                relations TEXT NOT NULL,
                num_entities INTEGER NOT NULL DEFAULT 0,
                num_chunks INTEGER NOT NULL DEFAULT 0,
                ts TEXT NOT NULL,
                PRIMARY KEY (community_id, ts)
            )",
            [],
        )?;

        // Query-side tables
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS memory (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                question TEXT NOT NULL,
                normalized_question TEXT NOT NULL UNIQUE,
                embedding BLOB NOT NULL,
                answer TEXT NOT NULL,
                refs TEXT NOT NULL,
                chunk_ids TEXT NOT NULL,
                entities TEXT NOT NULL,
                communities TEXT NOT NULL,
                access_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                last_accessed TEXT NOT NULL
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS feedback (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                memory_id INTEGER NOT NULL UNIQUE,
                feedback_text TEXT,
                rating INTEGER,
                is_favorite INTEGER NOT NULL DEFAULT 0,
                has_thread INTEGER NOT NULL DEFAULT 0,
                thread_title TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                FOREIGN KEY (memory_id) REFERENCES memory(id) ON DELETE CASCADE
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS thread_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                feedback_id INTEGER NOT NULL,
                message TEXT NOT NULL,
                is_user INTEGER NOT NULL,
                refs TEXT NOT NULL DEFAULT '[]',
                chunk_ids TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL,
                FOREIGN KEY (feedback_id) REFERENCES feedback(id) ON DELETE CASCADE
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_graph_edges_ts ON graph_edges(ts)",
            [],
        )?;
        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_graph_nodes_ts ON graph_nodes(ts)",
            [],
        )?;
        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_memory_created ON memory(created_at DESC)",
            [],
        )?;
        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_thread_messages_feedback
             ON thread_messages(feedback_id)",
            [],
        )?;

        debug!("Store schema initialized");
        Ok(())
    }

    /// Probe used by the health endpoint.
    pub fn ping(&self) -> Result<(), QueryError> {
        self.conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }

    // ========== CHUNKS ==========

    /// Insert a chunk with its embedding. Exposed for the ingestion
    /// collaborator and for seeding test corpora.
    pub fn insert_chunk(
        &self,
        text: &str,
        source: &SourceMeta,
        embedding: &[f32],
    ) -> Result<i64, QueryError> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO chunks (text, source_meta, created_at) VALUES (?1, ?2, ?3)",
            params![text, serde_json::to_string(source)?, now],
        )?;
        let chunk_id = self.conn.last_insert_rowid();

        self.conn.execute(
            "INSERT INTO chunk_embeddings (chunk_id, vec) VALUES (?1, ?2)",
            params![chunk_id, vec_to_blob(embedding)],
        )?;

        Ok(chunk_id)
    }

    pub fn fetch_chunk(&self, id: i64) -> Result<Chunk, QueryError> {
        self.conn
            .query_row(
                "SELECT id, text, source_meta, created_at FROM chunks WHERE id = ?1",
                params![id],
                row_to_chunk,
            )
            .optional()?
            .ok_or_else(|| QueryError::NotFound(format!("chunk {id}")))
    }

    /// Fetch chunks by id, preserving the input order. Missing ids are
    /// skipped so a stale memory entry still renders.
    pub fn fetch_chunks(&self, ids: &[i64]) -> Result<Vec<Chunk>, QueryError> {
        let mut chunks = Vec::with_capacity(ids.len());
        for id in ids {
            let chunk = self
                .conn
                .query_row(
                    "SELECT id, text, source_meta, created_at FROM chunks WHERE id = ?1",
                    params![id],
                    row_to_chunk,
                )
                .optional()?;
            if let Some(chunk) = chunk {
                chunks.push(chunk);
            }
        }
        Ok(chunks)
    }

    pub fn count_chunks(&self) -> Result<usize, QueryError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM chunks", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Cosine nearest-neighbor search over the chunk embeddings.
    ///
    /// `k` is clamped to [1, 50]. Results are ordered by similarity
    /// descending, ties broken by ascending chunk id. `source` optionally
    /// restricts the scan to chunks from one document.
    pub fn vector_search(
        &self,
        qvec: &[f32],
        k: usize,
        source: Option<&str>,
    ) -> Result<Vec<(Chunk, f64)>, QueryError> {
        let k = k.clamp(1, 50);

        let mut stmt = self.conn.prepare(
            "SELECT c.id, c.text, c.source_meta, c.created_at, e.vec
             FROM chunks c
             JOIN chunk_embeddings e ON e.chunk_id = c.id",
        )?;

        let mut scored: Vec<(Chunk, f64)> = stmt
            .query_map([], |row| {
                let chunk = row_to_chunk(row)?;
                let blob: Vec<u8> = row.get(4)?;
                Ok((chunk, blob))
            })?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .filter(|(chunk, _)| source.map_or(true, |s| chunk.source.source == s))
            .map(|(chunk, blob)| {
                let similarity = cosine_similarity(qvec, &blob_to_vec(&blob));
                (chunk, similarity)
            })
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.id.cmp(&b.0.id))
        });
        scored.truncate(k);

        Ok(scored)
    }

    // ========== MEMORY ==========

    pub fn memory_lookup_exact(&self, normalized: &str) -> Result<Option<MemoryEntry>, QueryError> {
        let entry = self
            .conn
            .query_row(
                "SELECT id, question, embedding, answer, refs, chunk_ids, entities,
                        communities, access_count, created_at, last_accessed
                 FROM memory WHERE normalized_question = ?1",
                params![normalized],
                row_to_memory,
            )
            .optional()?;
        Ok(entry)
    }

    /// Best semantic match at or above `threshold`; highest similarity
    /// first, ties broken by most recent entry.
    pub fn memory_lookup_semantic(
        &self,
        qvec: &[f32],
        threshold: f64,
    ) -> Result<Option<MemoryEntry>, QueryError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, question, embedding, answer, refs, chunk_ids, entities,
                    communities, access_count, created_at, last_accessed
             FROM memory",
        )?;

        let entries: Vec<MemoryEntry> = stmt
            .query_map([], row_to_memory)?
            .collect::<Result<Vec<_>, _>>()?;

        let mut best: Option<(f64, MemoryEntry)> = None;
        for entry in entries {
            let similarity = cosine_similarity(qvec, &entry.embedding);
            if similarity < threshold {
                continue;
            }
            let newer = match &best {
                None => true,
                Some((best_sim, best_entry)) => {
                    similarity > *best_sim
                        || (similarity == *best_sim && entry.created_at > best_entry.created_at)
                }
            };
            if newer {
                best = Some((similarity, entry));
            }
        }

        Ok(best.map(|(_, entry)| entry))
    }

    pub fn memory_touch(&self, id: i64) -> Result<(), QueryError> {
        let updated = self.conn.execute(
            "UPDATE memory
             SET access_count = access_count + 1, last_accessed = ?1
             WHERE id = ?2",
            params![Utc::now().to_rfc3339(), id],
        )?;
        if updated == 0 {
            return Err(QueryError::NotFound(format!("memory entry {id}")));
        }
        Ok(())
    }

    /// Insert a memory entry unless an equivalent one already exists.
    ///
    /// The exact (normalized text) and semantic checks run inside one
    /// transaction with the insert, so two concurrent identical misses
    /// produce a single row: the loser observes the winner's entry and
    /// touches it instead. Returns the entry id and whether a row was
    /// inserted.
    pub fn memory_insert_or_touch(
        &self,
        new: &NewMemory,
        semantic_threshold: f64,
    ) -> Result<(i64, bool), QueryError> {
        let tx = self.conn.unchecked_transaction()?;

        let existing: Option<i64> = tx
            .query_row(
                "SELECT id FROM memory WHERE normalized_question = ?1",
                params![new.normalized_question],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(id) = existing {
            tx.execute(
                "UPDATE memory
                 SET access_count = access_count + 1, last_accessed = ?1
                 WHERE id = ?2",
                params![Utc::now().to_rfc3339(), id],
            )?;
            tx.commit()?;
            return Ok((id, false));
        }

        // Semantic duplicate check within the same transaction.
        let semantic_match: Option<i64> = {
            let mut stmt = tx.prepare("SELECT id, embedding FROM memory")?;
            let rows: Vec<(i64, Vec<u8>)> = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter()
                .find(|(_, blob)| {
                    cosine_similarity(&new.embedding, &blob_to_vec(blob)) >= semantic_threshold
                })
                .map(|(id, _)| id)
        };
        if let Some(id) = semantic_match {
            tx.execute(
                "UPDATE memory
                 SET access_count = access_count + 1, last_accessed = ?1
                 WHERE id = ?2",
                params![Utc::now().to_rfc3339(), id],
            )?;
            tx.commit()?;
            return Ok((id, false));
        }

        let now = Utc::now().to_rfc3339();
        tx.execute(
            "INSERT INTO memory (question, normalized_question, embedding, answer, refs,
                                 chunk_ids, entities, communities, access_count,
                                 created_at, last_accessed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9, ?9)",
            params![
                new.question,
                new.normalized_question,
                vec_to_blob(&new.embedding),
                new.answer,
                serde_json::to_string(&new.references)?,
                serde_json::to_string(&new.chunk_ids)?,
                serde_json::to_string(&new.entities)?,
                serde_json::to_string(&new.communities)?,
                now,
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        debug!("Inserted memory entry {id}");
        Ok((id, true))
    }

    pub fn memory_get(&self, id: i64) -> Result<Option<MemoryEntry>, QueryError> {
        let entry = self
            .conn
            .query_row(
                "SELECT id, question, embedding, answer, refs, chunk_ids, entities,
                        communities, access_count, created_at, last_accessed
                 FROM memory WHERE id = ?1",
                params![id],
                row_to_memory,
            )
            .optional()?;
        Ok(entry)
    }

    pub fn memory_delete(&self, id: i64) -> Result<bool, QueryError> {
        let deleted = self
            .conn
            .execute("DELETE FROM memory WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    pub fn memory_clear(&self) -> Result<usize, QueryError> {
        let deleted = self.conn.execute("DELETE FROM memory", [])?;
        Ok(deleted)
    }

    pub fn memory_stats(&self) -> Result<MemoryStats, QueryError> {
        let (total_entries, total_accesses, average_accesses, max_accesses, oldest, newest) =
            self.conn.query_row(
                "SELECT COUNT(*),
                        COALESCE(SUM(access_count), 0),
                        COALESCE(AVG(access_count), 0.0),
                        COALESCE(MAX(access_count), 0),
                        MIN(created_at),
                        MAX(created_at)
                 FROM memory",
                [],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, f64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, Option<String>>(5)?,
                    ))
                },
            )?;

        let most_accessed = self.stat_lines(
            "SELECT question, access_count, created_at, last_accessed
             FROM memory ORDER BY access_count DESC LIMIT 10",
        )?;
        let recent_queries = self.stat_lines(
            "SELECT question, access_count, created_at, NULL
             FROM memory ORDER BY created_at DESC LIMIT 10",
        )?;

        Ok(MemoryStats {
            total_entries,
            total_accesses,
            average_accesses,
            max_accesses,
            oldest_entry: oldest,
            newest_entry: newest,
            most_accessed,
            recent_queries,
        })
    }

    fn stat_lines(&self, sql: &str) -> Result<Vec<MemoryStatLine>, QueryError> {
        let mut stmt = self.conn.prepare(sql)?;
        let lines = stmt
            .query_map([], |row| {
                Ok(MemoryStatLine {
                    query: row.get(0)?,
                    access_count: row.get(1)?,
                    created_at: row.get(2)?,
                    last_accessed: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(lines)
    }

    // ========== GRAPH ==========

    /// Insert a graph node for a processing run. Exposed for the graph
    /// builder collaborator and tests.
    pub fn insert_graph_node(
        &self,
        node_id: &str,
        kind: &str,
        entity_type: Option<&str>,
        text: Option<&str>,
        ts: &str,
    ) -> Result<(), QueryError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO graph_nodes (node_id, kind, entity_type, text, source, ts)
             VALUES (?1, ?2, ?3, ?4, NULL, ?5)",
            params![node_id, kind, entity_type, text, ts],
        )?;
        Ok(())
    }

    pub fn insert_graph_edge(
        &self,
        src: &str,
        dst: &str,
        weight: f64,
        relation: Option<&str>,
        ts: &str,
    ) -> Result<(), QueryError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO graph_edges (src, dst, weight, relation, ts)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![src, dst, weight, relation, ts],
        )?;
        Ok(())
    }

    pub fn insert_community(&self, community: &Community, ts: &str) -> Result<(), QueryError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO community_summaries
             (community_id, summary, entities, relations, num_entities, num_chunks, ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                community.community_id,
                community.summary,
                serde_json::to_string(&community.entities)?,
                serde_json::to_string(&community.key_relations)?,
                community.num_entities,
                community.num_chunks,
                ts
            ],
        )?;
        Ok(())
    }

    fn latest_graph_ts(&self) -> Result<Option<String>, QueryError> {
        let ts: Option<String> =
            self.conn
                .query_row("SELECT MAX(ts) FROM graph_edges", [], |row| row.get(0))?;
        Ok(ts)
    }

    /// Entities incident to the given chunks in the latest graph view,
    /// scored by the sum of edge weights.
    pub fn entities_for_chunks(
        &self,
        chunk_ids: &[i64],
    ) -> Result<Vec<(String, String, f64)>, QueryError> {
        let Some(ts) = self.latest_graph_ts()? else {
            return Ok(vec![]);
        };

        let chunk_nodes: HashSet<String> =
            chunk_ids.iter().map(|id| format!("chunk:{id}")).collect();

        let mut stmt = self.conn.prepare(
            "SELECT e.src, e.dst, e.weight,
                    ns.kind, ns.text, ns.entity_type,
                    nd.kind, nd.text, nd.entity_type
             FROM graph_edges e
             LEFT JOIN graph_nodes ns ON ns.node_id = e.src AND ns.ts = e.ts
             LEFT JOIN graph_nodes nd ON nd.node_id = e.dst AND nd.ts = e.ts
             WHERE e.ts = ?1",
        )?;

        #[allow(clippy::type_complexity)]
        let edges: Vec<(
            String,
            String,
            f64,
            Option<String>,
            Option<String>,
            Option<String>,
            Option<String>,
            Option<String>,
            Option<String>,
        )> = stmt
            .query_map(params![ts], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                    row.get(8)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut scores: std::collections::HashMap<String, (String, f64)> = Default::default();
        for (src, dst, weight, src_kind, src_text, src_type, dst_kind, dst_text, dst_type) in edges
        {
            // One endpoint must be a retrieved chunk, the other an entity.
            let entity = if chunk_nodes.contains(&src) && dst_kind.as_deref() == Some("entity") {
                dst_text.map(|text| (text, dst_type.unwrap_or_default()))
            } else if chunk_nodes.contains(&dst) && src_kind.as_deref() == Some("entity") {
                src_text.map(|text| (text, src_type.unwrap_or_default()))
            } else {
                None
            };

            if let Some((text, entity_type)) = entity {
                let slot = scores.entry(text).or_insert((entity_type, 0.0));
                slot.1 += weight;
            }
        }

        let mut ranked: Vec<(String, String, f64)> = scores
            .into_iter()
            .map(|(text, (entity_type, score))| (text, entity_type, score))
            .collect();
        ranked.sort_by(|a, b| {
            b.2.partial_cmp(&a.2)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });

        Ok(ranked)
    }

    /// Communities from the latest run that contain any of the given
    /// entity names.
    pub fn communities_for_entities(
        &self,
        entity_names: &[String],
    ) -> Result<Vec<Community>, QueryError> {
        let ts: Option<String> = self.conn.query_row(
            "SELECT MAX(ts) FROM community_summaries",
            [],
            |row| row.get(0),
        )?;
        let Some(ts) = ts else {
            return Ok(vec![]);
        };

        let mut stmt = self.conn.prepare(
            "SELECT community_id, summary, entities, relations, num_entities, num_chunks
             FROM community_summaries
             WHERE ts = ?1
             ORDER BY community_id",
        )?;

        let communities: Vec<Community> = stmt
            .query_map(params![ts], |row| {
                let entities_json: String = row.get(2)?;
                let relations_json: String = row.get(3)?;
                Ok(Community {
                    community_id: row.get(0)?,
                    summary: row.get(1)?,
                    entities: serde_json::from_str(&entities_json).unwrap_or_default(),
                    key_relations: serde_json::from_str(&relations_json).unwrap_or_default(),
                    num_entities: row.get(4)?,
                    num_chunks: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let wanted: HashSet<&str> = entity_names.iter().map(|s| s.as_str()).collect();
        Ok(communities
            .into_iter()
            .filter(|c| c.entities.iter().any(|e| wanted.contains(e.as_str())))
            .collect())
    }

    // ========== FEEDBACK ==========

    /// Create or update the feedback row for a memory entry, touching only
    /// the provided fields.
    pub fn feedback_upsert(
        &self,
        memory_id: i64,
        feedback_text: Option<&str>,
        rating: Option<i64>,
        is_favorite: Option<bool>,
    ) -> Result<i64, QueryError> {
        if self.memory_get(memory_id)?.is_none() {
            return Err(QueryError::NotFound(format!("memory entry {memory_id}")));
        }

        let now = Utc::now().to_rfc3339();
        let existing: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM feedback WHERE memory_id = ?1",
                params![memory_id],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(id) = existing {
            if let Some(text) = feedback_text {
                self.conn.execute(
                    "UPDATE feedback SET feedback_text = ?1 WHERE id = ?2",
                    params![text, id],
                )?;
            }
            if let Some(rating) = rating {
                self.conn.execute(
                    "UPDATE feedback SET rating = ?1 WHERE id = ?2",
                    params![rating, id],
                )?;
            }
            if let Some(favorite) = is_favorite {
                self.conn.execute(
                    "UPDATE feedback SET is_favorite = ?1 WHERE id = ?2",
                    params![favorite as i64, id],
                )?;
            }
            self.conn.execute(
                "UPDATE feedback SET updated_at = ?1 WHERE id = ?2",
                params![now, id],
            )?;
            Ok(id)
        } else {
            self.conn.execute(
                "INSERT INTO feedback
                 (memory_id, feedback_text, rating, is_favorite, has_thread,
                  thread_title, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 0, NULL, ?5, ?5)",
                params![
                    memory_id,
                    feedback_text,
                    rating,
                    is_favorite.unwrap_or(false) as i64,
                    now
                ],
            )?;
            Ok(self.conn.last_insert_rowid())
        }
    }

    pub fn favorites(&self) -> Result<Vec<FavoriteEntry>, QueryError> {
        let mut stmt = self.conn.prepare(
            "SELECT m.id, m.question, m.answer, m.refs, m.created_at,
                    f.rating, f.feedback_text, f.updated_at
             FROM memory m
             JOIN feedback f ON f.memory_id = m.id
             WHERE f.is_favorite = 1
             ORDER BY f.updated_at DESC",
        )?;

        let favorites = stmt
            .query_map([], |row| {
                let refs_json: String = row.get(3)?;
                Ok(FavoriteEntry {
                    id: row.get(0)?,
                    query: row.get(1)?,
                    answer: row.get(2)?,
                    references: serde_json::from_str(&refs_json).unwrap_or_default(),
                    created_at: row.get(4)?,
                    rating: row.get(5)?,
                    feedback: row.get(6)?,
                    favorited_at: row.get(7)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(favorites)
    }

    pub fn feedback_get(&self, id: i64) -> Result<Option<Feedback>, QueryError> {
        let feedback = self
            .conn
            .query_row(
                "SELECT id, memory_id, feedback_text, rating, is_favorite, has_thread,
                        thread_title, created_at, updated_at
                 FROM feedback WHERE id = ?1",
                params![id],
                row_to_feedback,
            )
            .optional()?;
        Ok(feedback)
    }

    // ========== THREADS ==========

    /// Mark (or create) the feedback row of a memory entry as a thread.
    /// Fails with `Conflict` when a thread already exists for that entry.
    pub fn thread_create(&self, memory_id: i64, title: &str) -> Result<i64, QueryError> {
        if self.memory_get(memory_id)?.is_none() {
            return Err(QueryError::NotFound(format!("memory entry {memory_id}")));
        }

        let now = Utc::now().to_rfc3339();
        let existing: Option<(i64, bool)> = self
            .conn
            .query_row(
                "SELECT id, has_thread FROM feedback WHERE memory_id = ?1",
                params![memory_id],
                |row| Ok((row.get(0)?, row.get::<_, i64>(1)? != 0)),
            )
            .optional()?;

        match existing {
            Some((_, true)) => Err(QueryError::Conflict(format!(
                "a thread already exists for memory entry {memory_id}"
            ))),
            Some((id, false)) => {
                self.conn.execute(
                    "UPDATE feedback
                     SET has_thread = 1, thread_title = ?1, updated_at = ?2
                     WHERE id = ?3",
                    params![title, now, id],
                )?;
                Ok(id)
            }
            None => {
                self.conn.execute(
                    "INSERT INTO feedback
                     (memory_id, feedback_text, rating, is_favorite, has_thread,
                      thread_title, created_at, updated_at)
                     VALUES (?1, NULL, NULL, 0, 1, ?2, ?3, ?3)",
                    params![memory_id, title, now],
                )?;
                Ok(self.conn.last_insert_rowid())
            }
        }
    }

    /// Whether the feedback row is an active thread.
    pub fn thread_exists(&self, feedback_id: i64) -> Result<bool, QueryError> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM feedback WHERE id = ?1 AND has_thread = 1",
                params![feedback_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn threads_list(&self) -> Result<Vec<ThreadSummary>, QueryError> {
        let mut stmt = self.conn.prepare(
            "SELECT f.id, f.thread_title, f.memory_id, m.question,
                    COUNT(t.id), f.created_at
             FROM feedback f
             JOIN memory m ON m.id = f.memory_id
             LEFT JOIN thread_messages t ON t.feedback_id = f.id
             WHERE f.has_thread = 1
             GROUP BY f.id, f.thread_title, f.memory_id, m.question, f.created_at
             ORDER BY f.created_at DESC",
        )?;

        let threads = stmt
            .query_map([], |row| {
                Ok(ThreadSummary {
                    id: row.get(0)?,
                    title: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                    memory_id: row.get(2)?,
                    original_query: row.get(3)?,
                    message_count: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(threads)
    }

    /// Thread info plus ordered messages, or None when the id is not an
    /// active thread.
    pub fn thread_get(
        &self,
        feedback_id: i64,
    ) -> Result<Option<(i64, String, i64, String, String, String)>, QueryError> {
        let info = self
            .conn
            .query_row(
                "SELECT f.id, f.thread_title, f.memory_id, m.question, m.answer, f.created_at
                 FROM feedback f
                 JOIN memory m ON m.id = f.memory_id
                 WHERE f.id = ?1 AND f.has_thread = 1",
                params![feedback_id],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                    ))
                },
            )
            .optional()?;
        Ok(info)
    }

    pub fn thread_messages(&self, feedback_id: i64) -> Result<Vec<ThreadMessage>, QueryError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, feedback_id, message, is_user, refs, chunk_ids, created_at
             FROM thread_messages
             WHERE feedback_id = ?1
             ORDER BY id ASC",
        )?;

        let messages = stmt
            .query_map(params![feedback_id], row_to_thread_message)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(messages)
    }

    pub fn append_thread_message(
        &self,
        feedback_id: i64,
        message: &str,
        is_user: bool,
        references: &[String],
        chunk_ids: &[i64],
    ) -> Result<ThreadMessage, QueryError> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO thread_messages (feedback_id, message, is_user, refs, chunk_ids, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                feedback_id,
                message,
                is_user as i64,
                serde_json::to_string(references)?,
                serde_json::to_string(chunk_ids)?,
                now
            ],
        )?;

        Ok(ThreadMessage {
            id: self.conn.last_insert_rowid(),
            feedback_id,
            message: message.to_string(),
            is_user,
            references: references.to_vec(),
            chunk_ids: chunk_ids.to_vec(),
            created_at: now,
        })
    }
}

// ============================================================================
// Row mappers and vector encoding
// ============================================================================

fn row_to_chunk(row: &Row) -> rusqlite::Result<Chunk> {
    let source_json: String = row.get(2)?;
    Ok(Chunk {
        id: row.get(0)?,
        text: row.get(1)?,
        source: serde_json::from_str(&source_json).unwrap_or_default(),
        created_at: row.get(3)?,
    })
}

fn row_to_memory(row: &Row) -> rusqlite::Result<MemoryEntry> {
    let embedding_blob: Vec<u8> = row.get(2)?;
    let refs_json: String = row.get(4)?;
    let chunk_ids_json: String = row.get(5)?;
    let entities_json: String = row.get(6)?;
    let communities_json: String = row.get(7)?;

    Ok(MemoryEntry {
        id: row.get(0)?,
        question: row.get(1)?,
        embedding: blob_to_vec(&embedding_blob),
        answer: row.get(3)?,
        references: serde_json::from_str(&refs_json).unwrap_or_default(),
        chunk_ids: serde_json::from_str(&chunk_ids_json).unwrap_or_default(),
        entities: serde_json::from_str(&entities_json).unwrap_or_default(),
        communities: serde_json::from_str(&communities_json).unwrap_or_default(),
        access_count: row.get(8)?,
        created_at: row.get(9)?,
        last_accessed: row.get(10)?,
    })
}

fn row_to_feedback(row: &Row) -> rusqlite::Result<Feedback> {
    Ok(Feedback {
        id: row.get(0)?,
        memory_id: row.get(1)?,
        feedback_text: row.get(2)?,
        rating: row.get(3)?,
        is_favorite: row.get::<_, i64>(4)? != 0,
        has_thread: row.get::<_, i64>(5)? != 0,
        thread_title: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn row_to_thread_message(row: &Row) -> rusqlite::Result<ThreadMessage> {
    let refs_json: String = row.get(4)?;
    let chunk_ids_json: String = row.get(5)?;
    Ok(ThreadMessage {
        id: row.get(0)?,
        feedback_id: row.get(1)?,
        message: row.get(2)?,
        is_user: row.get::<_, i64>(3)? != 0,
        references: serde_json::from_str(&refs_json).unwrap_or_default(),
        chunk_ids: serde_json::from_str(&chunk_ids_json).unwrap_or_default(),
        created_at: row.get(6)?,
    })
}

/// Encode an embedding as a little-endian f32 blob.
pub fn vec_to_blob(vector: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        blob.extend_from_slice(&value.to_le_bytes());
    }
    blob
}

/// Decode a little-endian f32 blob back into an embedding.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|bytes| f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path().join("test.db")).unwrap();
        (dir, store)
    }

    fn seed_chunk(store: &Store, text: &str, source: &str, vec: &[f32]) -> i64 {
        store
            .insert_chunk(text, &SourceMeta::named(source), vec)
            .unwrap()
    }

    #[test]
    fn test_vector_blob_round_trip() {
        let vector = vec![0.5f32, -1.25, 3.0];
        assert_eq!(blob_to_vec(&vec_to_blob(&vector)), vector);
        assert!(blob_to_vec(&[]).is_empty());
    }

    #[test]
    fn test_vector_search_orders_by_similarity_then_id() {
        let (_dir, store) = test_store();
        let a = seed_chunk(&store, "heartbeats", "raft.pdf", &[1.0, 0.0, 0.0]);
        let b = seed_chunk(&store, "elections", "raft.pdf", &[0.0, 1.0, 0.0]);
        let c = seed_chunk(&store, "also heartbeats", "raft.pdf", &[1.0, 0.0, 0.0]);

        let results = store.vector_search(&[1.0, 0.0, 0.0], 3, None).unwrap();
        assert_eq!(results.len(), 3);
        // Two exact matches tie; the lower chunk id comes first.
        assert_eq!(results[0].0.id, a);
        assert_eq!(results[1].0.id, c);
        assert_eq!(results[2].0.id, b);
        assert!(results[0].1 > results[2].1);
    }

    #[test]
    fn test_vector_search_clamps_k() {
        let (_dir, store) = test_store();
        seed_chunk(&store, "one", "doc", &[1.0, 0.0]);
        seed_chunk(&store, "two", "doc", &[0.0, 1.0]);

        let results = store.vector_search(&[1.0, 0.0], 0, None).unwrap();
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn test_vector_search_source_filter() {
        let (_dir, store) = test_store();
        seed_chunk(&store, "raft text", "raft.pdf", &[1.0, 0.0]);
        seed_chunk(&store, "paxos text", "paxos.pdf", &[1.0, 0.0]);

        let results = store
            .vector_search(&[1.0, 0.0], 5, Some("paxos.pdf"))
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0.source.source, "paxos.pdf");
    }

    #[test]
    fn test_fetch_chunks_preserves_order_and_skips_missing() {
        let (_dir, store) = test_store();
        let a = seed_chunk(&store, "a", "doc", &[1.0]);
        let b = seed_chunk(&store, "b", "doc", &[1.0]);

        let chunks = store.fetch_chunks(&[b, 999, a]).unwrap();
        let ids: Vec<i64> = chunks.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![b, a]);
    }

    fn sample_memory(question: &str, normalized: &str, vec: Vec<f32>) -> NewMemory {
        NewMemory {
            question: question.to_string(),
            normalized_question: normalized.to_string(),
            embedding: vec,
            answer: "Answer [1].".to_string(),
            references: vec!["doc.pdf".to_string()],
            chunk_ids: vec![1],
            entities: vec![],
            communities: vec![],
        }
    }

    #[test]
    fn test_memory_insert_then_exact_lookup_and_touch() {
        let (_dir, store) = test_store();
        let new = sample_memory("What is Raft?", "what is raft?", vec![1.0, 0.0]);

        let (id, inserted) = store.memory_insert_or_touch(&new, 0.95).unwrap();
        assert!(inserted);

        let entry = store.memory_lookup_exact("what is raft?").unwrap().unwrap();
        assert_eq!(entry.id, id);
        assert_eq!(entry.access_count, 0);

        store.memory_touch(id).unwrap();
        let touched = store.memory_get(id).unwrap().unwrap();
        assert_eq!(touched.access_count, 1);
        assert!(touched.last_accessed >= touched.created_at);
    }

    #[test]
    fn test_memory_duplicate_insert_touches_existing() {
        let (_dir, store) = test_store();
        let new = sample_memory("What is Raft?", "what is raft?", vec![1.0, 0.0]);

        let (first_id, _) = store.memory_insert_or_touch(&new, 0.95).unwrap();
        let (second_id, inserted) = store.memory_insert_or_touch(&new, 0.95).unwrap();

        assert_eq!(first_id, second_id);
        assert!(!inserted);

        let entry = store.memory_get(first_id).unwrap().unwrap();
        assert_eq!(entry.access_count, 1);

        // Still a single row.
        let stats = store.memory_stats().unwrap();
        assert_eq!(stats.total_entries, 1);
    }

    #[test]
    fn test_memory_semantic_duplicate_insert_touches_existing() {
        let (_dir, store) = test_store();
        let first = sample_memory("What is Raft?", "what is raft?", vec![1.0, 0.0]);
        let (first_id, _) = store.memory_insert_or_touch(&first, 0.95).unwrap();

        // Different text, nearly identical embedding.
        let second = sample_memory(
            "Explain the Raft protocol",
            "explain the raft protocol",
            vec![0.999, 0.001],
        );
        let (second_id, inserted) = store.memory_insert_or_touch(&second, 0.95).unwrap();
        assert_eq!(second_id, first_id);
        assert!(!inserted);
    }

    #[test]
    fn test_memory_semantic_lookup_threshold() {
        let (_dir, store) = test_store();
        let new = sample_memory("What is Raft?", "what is raft?", vec![1.0, 0.0]);
        store.memory_insert_or_touch(&new, 0.95).unwrap();

        let hit = store
            .memory_lookup_semantic(&[0.98, 0.02], 0.9)
            .unwrap();
        assert!(hit.is_some());

        let miss = store.memory_lookup_semantic(&[0.0, 1.0], 0.9).unwrap();
        assert!(miss.is_none());
    }

    #[test]
    fn test_memory_delete_and_clear() {
        let (_dir, store) = test_store();
        let (id, _) = store
            .memory_insert_or_touch(&sample_memory("q1", "q1", vec![1.0]), 0.95)
            .unwrap();
        store
            .memory_insert_or_touch(&sample_memory("q2", "q2", vec![0.0, 1.0]), 0.95)
            .unwrap();

        assert!(store.memory_delete(id).unwrap());
        assert!(!store.memory_delete(id).unwrap());
        assert_eq!(store.memory_clear().unwrap(), 1);
    }

    #[test]
    fn test_graph_reads_use_latest_view() {
        let (_dir, store) = test_store();
        let chunk_id = seed_chunk(&store, "raft text", "raft.pdf", &[1.0]);
        let chunk_node = format!("chunk:{chunk_id}");

        // Older run connects the chunk to a stale entity.
        store
            .insert_graph_node(&chunk_node, "chunk", None, None, "2025-01-01T00:00:00Z")
            .unwrap();
        store
            .insert_graph_node(
                "e:old",
                "entity",
                Some("ORG"),
                Some("Old Entity"),
                "2025-01-01T00:00:00Z",
            )
            .unwrap();
        store
            .insert_graph_edge(&chunk_node, "e:old", 1.0, None, "2025-01-01T00:00:00Z")
            .unwrap();

        // Latest run.
        store
            .insert_graph_node(&chunk_node, "chunk", None, None, "2025-02-01T00:00:00Z")
            .unwrap();
        store
            .insert_graph_node(
                "e:raft",
                "entity",
                Some("CONCEPT"),
                Some("Raft"),
                "2025-02-01T00:00:00Z",
            )
            .unwrap();
        store
            .insert_graph_edge(
                &chunk_node,
                "e:raft",
                2.0,
                Some("mentions"),
                "2025-02-01T00:00:00Z",
            )
            .unwrap();
        store
            .insert_graph_edge(
                "e:raft",
                &chunk_node,
                1.5,
                Some("appears_in"),
                "2025-02-01T00:00:00Z",
            )
            .unwrap();

        let entities = store.entities_for_chunks(&[chunk_id]).unwrap();
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].0, "Raft");
        assert_eq!(entities[0].1, "CONCEPT");
        assert!((entities[0].2 - 3.5).abs() < 1e-9);
    }

    #[test]
    fn test_communities_for_entities() {
        let (_dir, store) = test_store();
        store
            .insert_community(
                &Community {
                    community_id: 1,
                    summary: "Consensus algorithms".into(),
                    entities: vec!["Raft".into(), "Paxos".into()],
                    key_relations: vec!["Raft -> elects -> Leader".into()],
                    num_entities: 2,
                    num_chunks: 4,
                },
                "2025-02-01T00:00:00Z",
            )
            .unwrap();
        store
            .insert_community(
                &Community {
                    community_id: 2,
                    summary: "Storage engines".into(),
                    entities: vec!["LSM".into()],
                    key_relations: vec![],
                    num_entities: 1,
                    num_chunks: 2,
                },
                "2025-02-01T00:00:00Z",
            )
            .unwrap();

        let hits = store
            .communities_for_entities(&["Raft".to_string()])
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].community_id, 1);
    }

    #[test]
    fn test_feedback_upsert_partial_updates() {
        let (_dir, store) = test_store();
        let (memory_id, _) = store
            .memory_insert_or_touch(&sample_memory("q", "q", vec![1.0]), 0.95)
            .unwrap();

        let id = store
            .feedback_upsert(memory_id, None, Some(4), Some(true))
            .unwrap();
        let again = store
            .feedback_upsert(memory_id, Some("useful"), None, None)
            .unwrap();
        assert_eq!(id, again);

        let feedback = store.feedback_get(id).unwrap().unwrap();
        assert_eq!(feedback.rating, Some(4));
        assert!(feedback.is_favorite);
        assert_eq!(feedback.feedback_text.as_deref(), Some("useful"));
    }

    #[test]
    fn test_feedback_requires_memory() {
        let (_dir, store) = test_store();
        let err = store.feedback_upsert(42, None, None, None).unwrap_err();
        assert!(matches!(err, QueryError::NotFound(_)));
    }

    #[test]
    fn test_favorites_round_trip() {
        let (_dir, store) = test_store();
        let (memory_id, _) = store
            .memory_insert_or_touch(&sample_memory("q", "q", vec![1.0]), 0.95)
            .unwrap();

        store
            .feedback_upsert(memory_id, None, None, Some(true))
            .unwrap();
        assert_eq!(store.favorites().unwrap().len(), 1);

        store
            .feedback_upsert(memory_id, None, None, Some(false))
            .unwrap();
        assert!(store.favorites().unwrap().is_empty());
    }

    #[test]
    fn test_thread_create_conflict_and_not_found() {
        let (_dir, store) = test_store();
        let (memory_id, _) = store
            .memory_insert_or_touch(&sample_memory("q", "q", vec![1.0]), 0.95)
            .unwrap();

        assert!(matches!(
            store.thread_create(999, "t").unwrap_err(),
            QueryError::NotFound(_)
        ));

        let thread_id = store.thread_create(memory_id, "raft-dive").unwrap();
        assert!(store.thread_exists(thread_id).unwrap());

        assert!(matches!(
            store.thread_create(memory_id, "again").unwrap_err(),
            QueryError::Conflict(_)
        ));
    }

    #[test]
    fn test_thread_messages_monotonic_ids() {
        let (_dir, store) = test_store();
        let (memory_id, _) = store
            .memory_insert_or_touch(&sample_memory("q", "q", vec![1.0]), 0.95)
            .unwrap();
        let thread_id = store.thread_create(memory_id, "t").unwrap();

        store
            .append_thread_message(thread_id, "first", true, &[], &[])
            .unwrap();
        store
            .append_thread_message(thread_id, "second", false, &["doc".into()], &[1])
            .unwrap();

        let messages = store.thread_messages(thread_id).unwrap();
        assert_eq!(messages.len(), 2);
        assert!(messages[0].id < messages[1].id);
        assert!(messages[0].is_user);
        assert_eq!(messages[1].references, vec!["doc".to_string()]);
    }

    #[test]
    fn test_memory_cascade_deletes_feedback_and_messages() {
        let (_dir, store) = test_store();
        let (memory_id, _) = store
            .memory_insert_or_touch(&sample_memory("q", "q", vec![1.0]), 0.95)
            .unwrap();
        let thread_id = store.thread_create(memory_id, "t").unwrap();
        store
            .append_thread_message(thread_id, "hello", true, &[], &[])
            .unwrap();

        store.memory_delete(memory_id).unwrap();
        assert!(store.feedback_get(thread_id).unwrap().is_none());
        assert!(store.thread_messages(thread_id).unwrap().is_empty());
    }
}
