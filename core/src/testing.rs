//! Shared test doubles.

use std::cell::Cell;
use std::sync::Mutex;

use chrono::{DateTime, NaiveDate, Utc};

use crate::db::Database;
use crate::error::{GenerationError, StoreError};
use crate::llm::{EmbeddingService, GenerationOptions, TextGenerationService};
use crate::models::{
    Badge, ChatTurn, ContentKind, ContextItem, JournalEntry, MealRecord, MetricRecord, NewChatTurn,
    NewJournalEntry, NewMeal, NewMetricLog, NudgeRecord, Preferences, Profile,
};
use crate::store::{HealthStore, SimilaritySearch};

/// A store where every call fails with the same error.
pub struct FailingStore {
    error: fn() -> StoreError,
    calls: Cell<u32>,
}

impl FailingStore {
    pub fn transient() -> Self {
        Self {
            error: || StoreError::Transient("database is locked".to_string()),
            calls: Cell::new(0),
        }
    }

    pub fn auth_expired() -> Self {
        Self {
            error: || StoreError::AuthExpired,
            calls: Cell::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.get()
    }

    fn fail<T>(&self) -> Result<T, StoreError> {
        self.calls.set(self.calls.get() + 1);
        Err((self.error)())
    }
}

impl HealthStore for FailingStore {
    fn preferences(&self, _: &str) -> Result<Option<Preferences>, StoreError> {
        self.fail()
    }
    fn save_preferences(&self, _: &Preferences) -> Result<(), StoreError> {
        self.fail()
    }
    fn profile(&self, _: &str) -> Result<Option<Profile>, StoreError> {
        self.fail()
    }
    fn save_profile(&self, _: &Profile) -> Result<(), StoreError> {
        self.fail()
    }
    fn upsert_metrics(&self, _: &NewMetricLog) -> Result<MetricRecord, StoreError> {
        self.fail()
    }
    fn metrics_between(
        &self,
        _: &str,
        _: DateTime<Utc>,
        _: DateTime<Utc>,
    ) -> Result<Vec<MetricRecord>, StoreError> {
        self.fail()
    }
    fn insert_meal(&self, _: &NewMeal) -> Result<MealRecord, StoreError> {
        self.fail()
    }
    fn meals_between(
        &self,
        _: &str,
        _: DateTime<Utc>,
        _: DateTime<Utc>,
    ) -> Result<Vec<MealRecord>, StoreError> {
        self.fail()
    }
    fn upsert_badge(&self, _: &str, _: &str, _: NaiveDate) -> Result<bool, StoreError> {
        self.fail()
    }
    fn badges(&self, _: &str) -> Result<Vec<Badge>, StoreError> {
        self.fail()
    }
    fn insert_chat(&self, _: &NewChatTurn) -> Result<(), StoreError> {
        self.fail()
    }
    fn chat_history(&self, _: &str, _: usize) -> Result<Vec<ChatTurn>, StoreError> {
        self.fail()
    }
    fn insert_journal(&self, _: &NewJournalEntry) -> Result<JournalEntry, StoreError> {
        self.fail()
    }
    fn insert_nudge(&self, _: &str, _: &str, _: DateTime<Utc>) -> Result<(), StoreError> {
        self.fail()
    }
    fn recent_nudges(&self, _: &str, _: usize) -> Result<Vec<NudgeRecord>, StoreError> {
        self.fail()
    }
    fn user_summary(&self, _: &str) -> Result<Option<String>, StoreError> {
        self.fail()
    }
    fn save_user_summary(&self, _: &str, _: &str, _: Option<&[f32]>) -> Result<(), StoreError> {
        self.fail()
    }
    fn recent_context(
        &self,
        _: &str,
        _: ContentKind,
        _: usize,
    ) -> Result<Vec<ContextItem>, StoreError> {
        self.fail()
    }
}

/// A real database with selected writes failing (non-transient, so no retry).
pub struct WriteFaults<'a> {
    db: &'a Database,
    fail_journal: bool,
    badge_failures: Cell<u32>,
}

impl<'a> WriteFaults<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self {
            db,
            fail_journal: false,
            badge_failures: Cell::new(0),
        }
    }

    pub fn failing_journal(mut self) -> Self {
        self.fail_journal = true;
        self
    }

    /// Fail the next `n` badge upserts.
    pub fn failing_badges(self, n: u32) -> Self {
        self.badge_failures.set(n);
        self
    }

    fn broken<T>() -> Result<T, StoreError> {
        Err(StoreError::Backend("disk I/O error".to_string()))
    }
}

impl HealthStore for WriteFaults<'_> {
    fn preferences(&self, uid: &str) -> Result<Option<Preferences>, StoreError> {
        self.db.preferences(uid)
    }
    fn save_preferences(&self, prefs: &Preferences) -> Result<(), StoreError> {
        self.db.save_preferences(prefs)
    }
    fn profile(&self, uid: &str) -> Result<Option<Profile>, StoreError> {
        self.db.profile(uid)
    }
    fn save_profile(&self, profile: &Profile) -> Result<(), StoreError> {
        self.db.save_profile(profile)
    }
    fn upsert_metrics(&self, log: &NewMetricLog) -> Result<MetricRecord, StoreError> {
        self.db.upsert_metrics(log)
    }
    fn metrics_between(
        &self,
        uid: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<MetricRecord>, StoreError> {
        self.db.metrics_between(uid, start, end)
    }
    fn insert_meal(&self, meal: &NewMeal) -> Result<MealRecord, StoreError> {
        self.db.insert_meal(meal)
    }
    fn meals_between(
        &self,
        uid: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<MealRecord>, StoreError> {
        self.db.meals_between(uid, start, end)
    }
    fn upsert_badge(&self, uid: &str, code: &str, on: NaiveDate) -> Result<bool, StoreError> {
        let left = self.badge_failures.get();
        if left > 0 {
            self.badge_failures.set(left - 1);
            return Self::broken();
        }
        self.db.upsert_badge(uid, code, on)
    }
    fn badges(&self, uid: &str) -> Result<Vec<Badge>, StoreError> {
        self.db.badges(uid)
    }
    fn insert_chat(&self, turn: &NewChatTurn) -> Result<(), StoreError> {
        self.db.insert_chat(turn)
    }
    fn chat_history(&self, uid: &str, limit: usize) -> Result<Vec<ChatTurn>, StoreError> {
        self.db.chat_history(uid, limit)
    }
    fn insert_journal(&self, entry: &NewJournalEntry) -> Result<JournalEntry, StoreError> {
        if self.fail_journal {
            return Self::broken();
        }
        self.db.insert_journal(entry)
    }
    fn insert_nudge(&self, uid: &str, message: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.db.insert_nudge(uid, message, at)
    }
    fn recent_nudges(&self, uid: &str, limit: usize) -> Result<Vec<NudgeRecord>, StoreError> {
        self.db.recent_nudges(uid, limit)
    }
    fn user_summary(&self, uid: &str) -> Result<Option<String>, StoreError> {
        self.db.user_summary(uid)
    }
    fn save_user_summary(
        &self,
        uid: &str,
        summary: &str,
        embedding: Option<&[f32]>,
    ) -> Result<(), StoreError> {
        self.db.save_user_summary(uid, summary, embedding)
    }
    fn recent_context(
        &self,
        uid: &str,
        kind: ContentKind,
        k: usize,
    ) -> Result<Vec<ContextItem>, StoreError> {
        self.db.recent_context(uid, kind, k)
    }
}

/// Similarity search that always errors.
pub struct BrokenSearch;

impl SimilaritySearch for BrokenSearch {
    fn search(
        &self,
        _: &str,
        _: ContentKind,
        _: &[f32],
        _: usize,
    ) -> Result<Vec<ContextItem>, StoreError> {
        Err(StoreError::Backend("index offline".to_string()))
    }
}

/// Bag-of-keywords embedding: one dimension per keyword, so texts sharing
/// keywords score high.
pub struct KeywordEmbedder {
    pub keywords: Vec<&'static str>,
}

impl KeywordEmbedder {
    pub fn health() -> Self {
        Self {
            keywords: vec!["sleep", "run", "water", "stress", "eat", "pizza"],
        }
    }
}

impl EmbeddingService for KeywordEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, GenerationError> {
        let lower = text.to_lowercase();
        let mut v: Vec<f32> = self
            .keywords
            .iter()
            .map(|k| if lower.contains(k) { 1.0 } else { 0.0 })
            .collect();
        // Constant bias keeps every vector non-zero.
        v.push(0.1);
        Ok(v)
    }

    fn dimensions(&self) -> usize {
        self.keywords.len() + 1
    }
}

pub struct FailingEmbedder;

impl EmbeddingService for FailingEmbedder {
    fn embed(&self, _: &str) -> Result<Vec<f32>, GenerationError> {
        Err(GenerationError::Unavailable("embedding quota exceeded".to_string()))
    }
}

/// Returns queued replies in order and records every prompt it saw.
pub struct ScriptedGenerator {
    replies: Mutex<Vec<Result<String, GenerationError>>>,
    pub prompts: Mutex<Vec<(String, String)>>,
}

impl ScriptedGenerator {
    pub fn new(replies: Vec<Result<String, GenerationError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().rev().collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn replying(text: &str) -> Self {
        Self::new(vec![Ok(text.to_string())])
    }

    pub fn failing() -> Self {
        Self::new(vec![])
    }

    pub fn prompt_count(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    pub fn last_prompt(&self) -> Option<(String, String)> {
        self.prompts.lock().unwrap().last().cloned()
    }
}

impl TextGenerationService for ScriptedGenerator {
    fn generate_with(
        &self,
        system: &str,
        prompt: &str,
        _options: &GenerationOptions,
    ) -> Result<String, GenerationError> {
        self.prompts
            .lock()
            .unwrap()
            .push((system.to_string(), prompt.to_string()));
        self.replies
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| Err(GenerationError::Unavailable("no scripted reply".to_string())))
    }
}
