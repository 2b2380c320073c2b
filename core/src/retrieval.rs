//! Pull relevant past chat, journal and meal text for prompt context.
//!
//! Similarity search is preferred. When the query cannot be embedded, or no
//! search backend is configured, every store falls back to its most recent
//! items. Only expired credentials ever surface as an error.

use std::cmp::Ordering;
use std::collections::HashSet;

use crate::error::StoreError;
use crate::llm::{EmbeddingService, GenerationOptions, TextGenerationService};
use crate::models::{ContentKind, ContextItem};
use crate::retry::{RetryPolicy, best_effort, degrade};
use crate::store::{HealthStore, SimilaritySearch};

pub const PERSONAL_CONTEXT_K: usize = 6;
pub const SNIPPETS_K: usize = 8;
pub const CONTEXT_CHAR_LIMIT: usize = 2000;
/// Chat turns fed to the summarizer when no summary is cached.
pub const SUMMARY_SOURCE_TURNS: usize = 50;
pub const DEFAULT_QUERY_HINT: &str = "nudges";

const SUMMARIZER_SYSTEM: &str = "You are a concise memory summarizer.";

/// Lowercased, whitespace-collapsed form used to spot duplicate texts.
fn normalized(text: &str) -> String {
    text.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

fn rank(a: &ContextItem, b: &ContextItem) -> Ordering {
    let by_score = match (a.similarity, b.similarity) {
        (Some(x), Some(y)) => y.partial_cmp(&x).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    by_score.then_with(|| b.timestamp.cmp(&a.timestamp))
}

/// Sort by similarity (scored first) then recency, drop repeated texts and
/// keep the top `k`.
#[must_use]
pub fn merge_ranked(mut items: Vec<ContextItem>, k: usize) -> Vec<ContextItem> {
    items.sort_by(rank);
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| {
            let key = normalized(&item.text);
            !key.is_empty() && seen.insert(key)
        })
        .take(k)
        .collect()
}

/// The first `limit` characters of `text`.
#[must_use]
pub fn truncate_chars(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

pub struct ContextRetriever<'a> {
    store: &'a dyn HealthStore,
    search: Option<&'a dyn SimilaritySearch>,
    embedder: Option<&'a dyn EmbeddingService>,
    generator: Option<&'a dyn TextGenerationService>,
    retry: &'a RetryPolicy,
}

impl<'a> ContextRetriever<'a> {
    #[must_use]
    pub fn new(store: &'a dyn HealthStore, retry: &'a RetryPolicy) -> Self {
        Self {
            store,
            search: None,
            embedder: None,
            generator: None,
            retry,
        }
    }

    #[must_use]
    pub fn with_search(
        mut self,
        search: Option<&'a dyn SimilaritySearch>,
        embedder: Option<&'a dyn EmbeddingService>,
    ) -> Self {
        self.search = search;
        self.embedder = embedder;
        self
    }

    #[must_use]
    pub fn with_generator(mut self, generator: Option<&'a dyn TextGenerationService>) -> Self {
        self.generator = generator;
        self
    }

    fn recent(&self, uid: &str, kind: ContentKind, k: usize) -> Result<Vec<ContextItem>, StoreError> {
        degrade(
            self.retry
                .run("recent context read", || self.store.recent_context(uid, kind, k)),
            kind.as_str(),
        )
    }

    fn query_vector(&self, query: &str) -> Option<Vec<f32>> {
        let embedder = self.embedder?;
        match embedder.embed(query) {
            Ok(v) if !v.is_empty() => Some(v),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!("query embedding failed, using recent items: {e}");
                None
            }
        }
    }

    /// Top `k` items across chat, journal and meals.
    pub fn retrieve(&self, uid: &str, query: &str, k: usize) -> Result<Vec<ContextItem>, StoreError> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let vector = match self.search {
            Some(_) => self.query_vector(query),
            None => None,
        };

        let mut pooled = Vec::new();
        for kind in ContentKind::ALL {
            let items = match (self.search, vector.as_deref()) {
                (Some(search), Some(v)) => match search.search(uid, kind, v, k) {
                    // Rows saved without an embedding never score; top up
                    // with recent ones so they can still be seen.
                    Ok(mut found) => {
                        if found.len() < k {
                            found.extend(self.recent(uid, kind, k)?);
                        }
                        found
                    }
                    Err(StoreError::AuthExpired) => return Err(StoreError::AuthExpired),
                    Err(e) => {
                        tracing::warn!("{} search failed, using recent items: {e}", kind.as_str());
                        self.recent(uid, kind, k)?
                    }
                },
                _ => self.recent(uid, kind, k)?,
            };
            pooled.extend(items);
        }

        let merged = merge_ranked(pooled, k);
        tracing::debug!(uid, found = merged.len(), "context retrieved");
        Ok(merged)
    }

    /// Retrieved texts on one line, bounded for prompt use.
    pub fn context_snippets(&self, uid: &str, query: &str, k: usize) -> Result<String, StoreError> {
        let joined = self
            .retrieve(uid, query, k)?
            .iter()
            .map(|item| item.text.split_whitespace().collect::<Vec<_>>().join(" "))
            .collect::<Vec<_>>()
            .join(" | ");
        Ok(truncate_chars(&joined, CONTEXT_CHAR_LIMIT).to_string())
    }

    /// Build and cache a long-term summary from recent chat. `None` when
    /// there is no history or no generator.
    pub fn refresh_summary(&self, uid: &str) -> Result<Option<String>, StoreError> {
        let Some(generator) = self.generator else {
            return Ok(None);
        };
        let turns = degrade(
            self.retry
                .run("chat history read", || self.store.chat_history(uid, SUMMARY_SOURCE_TURNS)),
            "chat history",
        )?;
        if turns.is_empty() {
            return Ok(None);
        }

        let convo = turns
            .iter()
            .map(|t| format!("{}: {}", t.role.as_str(), t.text))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            "Summarize stable preferences, routines, constraints, and health goals from the chat below.\n\
             Return <=10 lines, no PII.\n\nConversation:\n{convo}\n"
        );

        let summary = match generator.generate(SUMMARIZER_SYSTEM, &prompt, &GenerationOptions::default()) {
            Ok(s) if !s.trim().is_empty() => s.trim().to_string(),
            Ok(_) => return Ok(None),
            Err(e) => {
                tracing::warn!("summary generation failed: {e}");
                return Ok(None);
            }
        };

        let embedding = self.embedder.and_then(|e| match e.embed(&summary) {
            Ok(v) => Some(v),
            Err(err) => {
                tracing::warn!("summary embedding failed (ignored): {err}");
                None
            }
        });
        best_effort(
            self.retry.run("summary save", || {
                self.store.save_user_summary(uid, &summary, embedding.as_deref())
            }),
            "summary cache",
        );
        tracing::info!(uid, "user summary refreshed");
        Ok(Some(summary))
    }

    /// Long-term summary plus a few recent notes, bounded for prompt use.
    pub fn personal_context(&self, uid: &str, query_hint: &str) -> Result<String, StoreError> {
        let cached = degrade(
            self.retry.run("summary read", || self.store.user_summary(uid)),
            "user summary",
        )?
        .filter(|s| !s.trim().is_empty());
        let summary = match cached {
            Some(s) => s,
            None => self.refresh_summary(uid)?.unwrap_or_default(),
        };

        let notes = self
            .retrieve(uid, query_hint, PERSONAL_CONTEXT_K)?
            .into_iter()
            .map(|item| format!("- {}", item.text.trim()))
            .collect::<Vec<_>>()
            .join("\n");

        let text = format!("Long-term summary:\n{summary}\n\nRecent notes:\n{notes}");
        Ok(truncate_chars(text.trim(), CONTEXT_CHAR_LIMIT).to_string())
    }
}
