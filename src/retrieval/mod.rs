//! Context retrieval for draft generation.
//!
//! Two sources are merged:
//! 1. prior messages in the same conversation thread (always, up to a cap)
//! 2. semantically similar history from the [`SimilarityIndex`]
//!
//! Semantic candidates are restricted to a temporal window that tightens for
//! young threads, scored with a 14-day half-life recency weight, fused with
//! their similarity, and truncated to a token budget.

pub mod index;

pub use index::{
    Candidate, Embedder, HashingEmbedder, IndexedDocument, QueryFilter, ScoreKind,
    SimilarityIndex, StoreIndex,
};

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::retry::{RetryPolicy, retry_with_backoff};
use crate::store::{Database, HistoryMessage};

/// Retrieval tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalConfig {
    /// Weight of semantic similarity in the fused score.
    pub alpha: f64,
    /// Recency half-life in days.
    pub half_life_days: f64,
    /// `k` when the thread has at most one prior message.
    pub sparse_k: usize,
    /// `k` otherwise.
    pub default_k: usize,
    /// Maximum same-thread messages included.
    pub thread_cap: usize,
    /// Token budget for the whole bundle.
    pub token_budget: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            alpha: 0.7,
            half_life_days: 14.0,
            sparse_k: 7,
            default_k: 4,
            thread_cap: 5,
            token_budget: 1500,
        }
    }
}

/// Temporal window in days for a thread of the given length.
pub fn window_days(thread_length: usize) -> i64 {
    match thread_length {
        0 => 30,
        1..=3 => 60,
        _ => 90,
    }
}

/// Number of semantic results to request.
pub fn adaptive_k(thread_length: usize, config: &RetrievalConfig) -> usize {
    if thread_length <= 1 {
        config.sparse_k
    } else {
        config.default_k
    }
}

/// `0.5^(age_days / half_life)`; future timestamps count as age 0.
pub fn recency_weight(age_days: f64, half_life_days: f64) -> f64 {
    0.5f64.powf(age_days.max(0.0) / half_life_days)
}

/// `alpha·similarity + (1-alpha)·recency`, inputs clamped to [0, 1].
pub fn fused_score(similarity: f64, recency: f64, alpha: f64) -> f64 {
    let alpha = alpha.clamp(0.0, 1.0);
    alpha * similarity.clamp(0.0, 1.0) + (1.0 - alpha) * recency.clamp(0.0, 1.0)
}

/// Rough token estimate (4 chars per token, rounded up).
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// What to retrieve context for.
#[derive(Debug, Clone)]
pub struct RetrievalQuery {
    pub item_id: String,
    pub user_id: String,
    pub thread_ref: Option<String>,
    /// Subject and body of the message being answered.
    pub text: String,
    pub now: DateTime<Utc>,
}

/// A semantic result with its component scores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedContext {
    pub item_id: String,
    pub sender: String,
    pub subject: String,
    pub snippet: String,
    pub received_at: DateTime<Utc>,
    pub similarity: f64,
    pub recency: f64,
    pub fused: f64,
}

/// Context assembled for one generation step.
#[derive(Debug, Clone, Default)]
pub struct ContextBundle {
    /// Oldest first.
    pub thread_history: Vec<HistoryMessage>,
    /// Highest fused score first.
    pub semantic_results: Vec<RankedContext>,
    pub retrieval_window_days: i64,
    pub token_budget_used: usize,
}

/// Compact record of a bundle, persisted in the workflow snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSummary {
    pub thread_messages: usize,
    pub semantic_item_ids: Vec<String>,
    pub retrieval_window_days: i64,
    pub token_budget_used: usize,
}

impl ContextBundle {
    pub fn summary(&self) -> ContextSummary {
        ContextSummary {
            thread_messages: self.thread_history.len(),
            semantic_item_ids: self
                .semantic_results
                .iter()
                .map(|r| r.item_id.clone())
                .collect(),
            retrieval_window_days: self.retrieval_window_days,
            token_budget_used: self.token_budget_used,
        }
    }
}

/// Ranks thread history and semantic neighbours for generation.
pub struct ContextRetriever {
    db: Arc<dyn Database>,
    index: Arc<dyn SimilarityIndex>,
    embedder: Arc<dyn Embedder>,
    config: RetrievalConfig,
    retry: RetryPolicy,
}

impl ContextRetriever {
    pub fn new(
        db: Arc<dyn Database>,
        index: Arc<dyn SimilarityIndex>,
        embedder: Arc<dyn Embedder>,
        config: RetrievalConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            db,
            index,
            embedder,
            config,
            retry,
        }
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    pub fn index(&self) -> &Arc<dyn SimilarityIndex> {
        &self.index
    }

    /// Count prior messages in the query's thread.
    pub async fn thread_length(&self, query: &RetrievalQuery) -> usize {
        let Some(thread_ref) = query.thread_ref.as_deref() else {
            return 0;
        };
        match self
            .db
            .count_thread_messages(&query.user_id, thread_ref, &query.item_id)
            .await
        {
            Ok(n) => n,
            Err(e) => {
                warn!(item_id = %query.item_id, error = %e, "Thread length lookup failed");
                0
            }
        }
    }

    /// Assemble the context bundle. Never fails; sources that error are skipped.
    pub async fn retrieve(&self, query: &RetrievalQuery, thread_length: usize) -> ContextBundle {
        let thread_history = self.load_thread_history(query).await;
        let history_tokens: usize = thread_history
            .iter()
            .map(|m| estimate_tokens(&m.subject) + estimate_tokens(&m.body))
            .sum();

        let window = window_days(thread_length);
        let candidates = self.query_index(query, thread_length, window).await;
        let ranked = self.rank(candidates, query.now, window);

        let mut used = history_tokens;
        let mut semantic_results = Vec::new();
        for result in ranked {
            let cost = estimate_tokens(&result.subject) + estimate_tokens(&result.snippet);
            if used + cost > self.config.token_budget {
                break;
            }
            used += cost;
            semantic_results.push(result);
        }

        debug!(
            item_id = %query.item_id,
            thread_length,
            window_days = window,
            thread_messages = thread_history.len(),
            semantic = semantic_results.len(),
            tokens = used,
            "Context retrieved"
        );

        ContextBundle {
            thread_history,
            semantic_results,
            retrieval_window_days: window,
            token_budget_used: used,
        }
    }

    /// Score and sort candidates, dropping those outside the window.
    pub fn rank(
        &self,
        candidates: Vec<Candidate>,
        now: DateTime<Utc>,
        window: i64,
    ) -> Vec<RankedContext> {
        let since = now - chrono::Duration::days(window);
        let mut ranked: Vec<RankedContext> = candidates
            .into_iter()
            .filter(|c| c.received_at >= since)
            .map(|c| {
                let age_days = (now - c.received_at).num_seconds() as f64 / 86_400.0;
                let similarity = c.similarity();
                let recency = recency_weight(age_days, self.config.half_life_days);
                RankedContext {
                    fused: fused_score(similarity, recency, self.config.alpha),
                    item_id: c.item_id,
                    sender: c.sender,
                    subject: c.subject,
                    snippet: c.snippet,
                    received_at: c.received_at,
                    similarity,
                    recency,
                }
            })
            .collect();
        ranked.sort_by(|a, b| {
            b.fused
                .partial_cmp(&a.fused)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        ranked
    }

    async fn load_thread_history(&self, query: &RetrievalQuery) -> Vec<HistoryMessage> {
        let Some(thread_ref) = query.thread_ref.as_deref() else {
            return Vec::new();
        };
        match self
            .db
            .thread_history(&query.user_id, thread_ref, &query.item_id, self.config.thread_cap)
            .await
        {
            Ok(history) => history,
            Err(e) => {
                warn!(item_id = %query.item_id, error = %e, "Thread history unavailable");
                Vec::new()
            }
        }
    }

    async fn query_index(
        &self,
        query: &RetrievalQuery,
        thread_length: usize,
        window: i64,
    ) -> Vec<Candidate> {
        let k = adaptive_k(thread_length, &self.config);
        let vector = self.embedder.embed(&query.text);
        let filter = QueryFilter {
            user_id: query.user_id.clone(),
            exclude_item_id: Some(query.item_id.clone()),
            received_after: Some(query.now - chrono::Duration::days(window)),
        };

        match retry_with_backoff(&self.retry, "similarity_query", || {
            self.index.query(&vector, k, &filter)
        })
        .await
        {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(
                    item_id = %query.item_id,
                    error = %e,
                    "Similarity index unavailable, using thread history only"
                );
                Vec::new()
            }
        }
    }
}
