use chrono::{DateTime, NaiveDate, Utc};

use crate::error::StoreError;
use crate::models::{
    Badge, ChatTurn, ContentKind, ContextItem, JournalEntry, MealRecord, MetricRecord, NewChatTurn,
    NewJournalEntry, NewMeal, NewMetricLog, NudgeRecord, Preferences, Profile,
};

/// Typed persistence for everything the engine reads and writes.
///
/// Range queries are half-open: `start <= timestamp < end`.
pub trait HealthStore {
    fn preferences(&self, uid: &str) -> Result<Option<Preferences>, StoreError>;
    fn save_preferences(&self, prefs: &Preferences) -> Result<(), StoreError>;

    fn profile(&self, uid: &str) -> Result<Option<Profile>, StoreError>;
    fn save_profile(&self, profile: &Profile) -> Result<(), StoreError>;

    /// Upsert on `(uid, source, log_date)`.
    fn upsert_metrics(&self, log: &NewMetricLog) -> Result<MetricRecord, StoreError>;
    fn metrics_between(
        &self,
        uid: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<MetricRecord>, StoreError>;

    fn insert_meal(&self, meal: &NewMeal) -> Result<MealRecord, StoreError>;
    fn meals_between(
        &self,
        uid: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<MealRecord>, StoreError>;

    /// Returns `true` when the badge was newly earned.
    fn upsert_badge(&self, uid: &str, code: &str, earned_on: NaiveDate)
    -> Result<bool, StoreError>;
    fn badges(&self, uid: &str) -> Result<Vec<Badge>, StoreError>;

    fn insert_chat(&self, turn: &NewChatTurn) -> Result<(), StoreError>;
    /// The most recent `limit` turns, oldest first.
    fn chat_history(&self, uid: &str, limit: usize) -> Result<Vec<ChatTurn>, StoreError>;

    fn insert_journal(&self, entry: &NewJournalEntry) -> Result<JournalEntry, StoreError>;

    fn insert_nudge(&self, uid: &str, message: &str, at: DateTime<Utc>) -> Result<(), StoreError>;
    /// Most recent first.
    fn recent_nudges(&self, uid: &str, limit: usize) -> Result<Vec<NudgeRecord>, StoreError>;

    fn user_summary(&self, uid: &str) -> Result<Option<String>, StoreError>;
    fn save_user_summary(
        &self,
        uid: &str,
        summary: &str,
        embedding: Option<&[f32]>,
    ) -> Result<(), StoreError>;

    /// The `k` most recent items of one kind, unscored. Used when similarity
    /// search is unavailable.
    fn recent_context(
        &self,
        uid: &str,
        kind: ContentKind,
        k: usize,
    ) -> Result<Vec<ContextItem>, StoreError>;
}

/// Nearest-neighbour lookup over stored embeddings of one content kind.
pub trait SimilaritySearch {
    fn search(
        &self,
        uid: &str,
        kind: ContentKind,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<ContextItem>, StoreError>;
}
