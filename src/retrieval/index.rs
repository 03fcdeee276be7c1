//! Similarity index and embedding seams.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::IndexError;
use crate::store::{Database, StoredEmbedding};

/// How a candidate's score should be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreKind {
    /// Higher is closer, in [0, 1].
    Similarity,
    /// Lower is closer; converted as `1 - distance`.
    Distance,
}

/// A ranked candidate returned by the index.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub item_id: String,
    pub sender: String,
    pub subject: String,
    pub snippet: String,
    pub received_at: DateTime<Utc>,
    pub score: f64,
    pub score_kind: ScoreKind,
}

impl Candidate {
    /// Score as a similarity in [0, 1].
    pub fn similarity(&self) -> f64 {
        let raw = match self.score_kind {
            ScoreKind::Similarity => self.score,
            ScoreKind::Distance => 1.0 - self.score,
        };
        raw.clamp(0.0, 1.0)
    }
}

/// Restricts which documents a query may return.
#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    pub user_id: String,
    pub exclude_item_id: Option<String>,
    pub received_after: Option<DateTime<Utc>>,
}

/// A document to add to the index.
#[derive(Debug, Clone)]
pub struct IndexedDocument {
    pub item_id: String,
    pub user_id: String,
    pub thread_ref: Option<String>,
    pub sender: String,
    pub subject: String,
    pub snippet: String,
    pub received_at: DateTime<Utc>,
    pub vector: Vec<f32>,
}

/// Vector similarity search.
#[async_trait]
pub trait SimilarityIndex: Send + Sync {
    /// Return at most `k` candidates, closest first.
    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: &QueryFilter,
    ) -> Result<Vec<Candidate>, IndexError>;

    /// Insert or replace a document.
    async fn upsert(&self, document: IndexedDocument) -> Result<(), IndexError>;
}

/// Turns text into a vector.
pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> Vec<f32>;
}

static TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\p{L}\p{N}]+").expect("token regex is valid"));

/// Deterministic signed feature-hashing embedder.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimensions: usize,
}

impl HashingEmbedder {
    pub const DEFAULT_DIMENSIONS: usize = 256;

    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(Self::DEFAULT_DIMENSIONS)
    }
}

impl Embedder for HashingEmbedder {
    fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        let lower = text.to_lowercase();
        for token in TOKEN_RE.find_iter(&lower) {
            let h = fnv1a(token.as_str().as_bytes());
            let idx = (h % self.dimensions as u64) as usize;
            let sign = if h >> 63 == 1 { -1.0 } else { 1.0 };
            vector[idx] += sign;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Cosine similarity; 0 when either vector is zero.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    let dot: f64 = a.iter().zip(b).map(|(x, y)| (*x as f64) * (*y as f64)).sum();
    let na: f64 = a.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    let nb: f64 = b.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

/// Brute-force cosine index over the `message_embeddings` table.
///
/// Reports cosine *distance*, the way most vector stores do.
pub struct StoreIndex {
    db: Arc<dyn Database>,
}

impl StoreIndex {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl SimilarityIndex for StoreIndex {
    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: &QueryFilter,
    ) -> Result<Vec<Candidate>, IndexError> {
        let rows = self
            .db
            .list_embeddings(
                &filter.user_id,
                filter.received_after,
                filter.exclude_item_id.as_deref(),
            )
            .await?;

        let mut scored: Vec<(f64, StoredEmbedding)> = rows
            .into_iter()
            .filter(|row| {
                let ok = row.vector.len() == vector.len();
                if !ok {
                    debug!(item_id = %row.item_id, "Skipping embedding with mismatched dimensions");
                }
                ok
            })
            .map(|row| (1.0 - cosine_similarity(vector, &row.vector), row))
            .collect();
        scored.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(distance, row)| Candidate {
                item_id: row.item_id,
                sender: row.sender,
                subject: row.subject,
                snippet: row.snippet,
                received_at: row.received_at,
                score: distance,
                score_kind: ScoreKind::Distance,
            })
            .collect())
    }

    async fn upsert(&self, document: IndexedDocument) -> Result<(), IndexError> {
        let row = StoredEmbedding {
            item_id: document.item_id,
            user_id: document.user_id,
            thread_ref: document.thread_ref,
            sender: document.sender,
            subject: document.subject,
            snippet: document.snippet,
            received_at: document.received_at,
            vector: document.vector,
        };
        self.db.upsert_embedding(&row).await?;
        Ok(())
    }
}
