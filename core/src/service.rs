use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::aggregate::{MealsView, MetricsAggregator, Snapshot, window_averages};
use crate::context::RequestContext;
use crate::goals::{GoalEvaluator, GoalReport, Goals};
use crate::llm::{EmbeddingService, TextGenerationService};
use crate::models::{
    Badge, DailyAggregate, JournalEntry, MealRecord, MetricRecord, MetricValues, NewJournalEntry,
    NewMeal, NewMetricLog, Preferences, PreferencesUpdate, Profile, ProfileUpdate, validate_meal_type, validate_metric_values,
    validate_preferences, validate_profile, validate_source,
};
use crate::nudge::{NudgeComposer, Reply, nudge_due};
use crate::nutrition::{self, MealEstimate, meal_blurb, parse_items_kcal};
use crate::retry::{RetryPolicy, degrade};
use crate::store::{HealthStore, SimilaritySearch};
use crate::timewindow::TimeWindow;
use crate::twin::{self, Body, Habits, PlanDeltas, Projection};

/// Days of history behind the digital twin's habit averages.
pub const TWIN_HISTORY_DAYS: u32 = 30;
pub const DEFAULT_SUMMARY_DAYS: u32 = 7;
pub const MAX_SUMMARY_DAYS: u32 = 90;
/// Days evaluated for streaks and badges.
pub const GOAL_HISTORY_DAYS: u32 = 30;

/// Inputs for a metric log. Fields left `None` keep any value already
/// logged for the same day and source.
#[derive(Debug, Clone, Default)]
pub struct MetricEntry {
    pub source: String,
    pub values: MetricValues,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct MealEntry {
    pub meal_type: String,
    pub text: String,
    /// Ask the language model for items and macros.
    pub estimate: bool,
    pub at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub days: Vec<DailyAggregate>,
    pub averages: MetricValues,
}

/// Entry point for binaries. Every operation takes a [`RequestContext`]
/// built by [`WhisperService::context`].
pub struct WhisperService<'a> {
    store: &'a dyn HealthStore,
    search: Option<&'a dyn SimilaritySearch>,
    embedder: Option<&'a dyn EmbeddingService>,
    generator: Option<&'a dyn TextGenerationService>,
    retry: RetryPolicy,
}

impl<'a> WhisperService<'a> {
    pub fn new(store: &'a dyn HealthStore) -> Self {
        Self {
            store,
            search: None,
            embedder: None,
            generator: None,
            retry: RetryPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_search(mut self, search: &'a dyn SimilaritySearch) -> Self {
        self.search = Some(search);
        self
    }

    #[must_use]
    pub fn with_language_model(
        mut self,
        embedder: Option<&'a dyn EmbeddingService>,
        generator: Option<&'a dyn TextGenerationService>,
    ) -> Self {
        self.embedder = embedder;
        self.generator = generator;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn aggregator(&self) -> MetricsAggregator<'_> {
        MetricsAggregator::new(self.store, &self.retry)
    }

    fn composer(&self) -> NudgeComposer<'_> {
        NudgeComposer::new(
            self.store,
            self.search,
            self.embedder,
            self.generator,
            &self.retry,
        )
    }

    fn embed_best_effort(&self, text: &str) -> Option<Vec<f32>> {
        match self.embedder?.embed(text) {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!("embedding failed, saving without it: {e}");
                None
            }
        }
    }

    // --- Request scope ---

    pub fn context(&self, uid: &str) -> Result<RequestContext> {
        self.context_at(uid, Utc::now())
    }

    /// Resolve the user's time zone from preferences.
    pub fn context_at(&self, uid: &str, now: DateTime<Utc>) -> Result<RequestContext> {
        let prefs = self.preferences(uid)?;
        Ok(RequestContext::new(
            uid,
            TimeWindow::from_name(Some(&prefs.timezone)),
            now,
        ))
    }

    // --- Preferences & profile ---

    /// Stored preferences, or defaults when none are saved or unreadable.
    pub fn preferences(&self, uid: &str) -> Result<Preferences> {
        let stored = degrade(
            self.retry.run("preferences read", || self.store.preferences(uid)),
            "preferences",
        )?;
        Ok(stored.unwrap_or_else(|| Preferences::defaults(uid)))
    }

    pub fn save_preferences(&self, prefs: &Preferences) -> Result<Preferences> {
        validate_preferences(prefs)?;
        self.retry
            .run("preferences save", || self.store.save_preferences(prefs))
            .context("Failed to save preferences")?;
        tracing::info!(uid = %prefs.uid, "preferences saved");
        Ok(prefs.clone())
    }

    /// Merge a partial change onto the stored (or default) preferences.
    pub fn update_preferences(&self, uid: &str, update: PreferencesUpdate) -> Result<Preferences> {
        let mut prefs = update.apply(self.preferences(uid)?);
        prefs.uid = uid.to_string();
        self.save_preferences(&prefs)
    }

    pub fn profile(&self, uid: &str) -> Result<Profile> {
        let stored = degrade(
            self.retry.run("profile read", || self.store.profile(uid)),
            "profile",
        )?;
        Ok(stored.unwrap_or_else(|| Profile::empty(uid)))
    }

    pub fn save_profile(&self, profile: &Profile) -> Result<Profile> {
        validate_profile(profile)?;
        self.retry
            .run("profile save", || self.store.save_profile(profile))
            .context("Failed to save profile")?;
        tracing::info!(uid = %profile.uid, "profile saved");
        Ok(profile.clone())
    }

    pub fn update_profile(&self, uid: &str, update: ProfileUpdate) -> Result<Profile> {
        let mut profile = update.apply(self.profile(uid)?);
        profile.uid = uid.to_string();
        self.save_profile(&profile)
    }

    // --- Logging ---

    /// Upsert today's metrics for one source. Notes are also kept as a
    /// journal entry so they can be retrieved later.
    pub fn log_metrics(&self, ctx: &RequestContext, entry: &MetricEntry) -> Result<MetricRecord> {
        let source = validate_source(&entry.source)?;
        if entry.values.is_empty() && entry.notes.as_deref().is_none_or(|n| n.trim().is_empty()) {
            bail!("Nothing to log: provide at least one metric or a note");
        }
        validate_metric_values(&entry.values)?;

        let notes = entry
            .notes
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string);
        let log = NewMetricLog {
            uid: ctx.uid.clone(),
            source,
            log_date: ctx.today(),
            timestamp: ctx.now,
            values: entry.values.clone(),
            notes: notes.clone(),
        };
        let record = self
            .retry
            .run("metrics upsert", || self.store.upsert_metrics(&log))
            .context("Failed to save metrics")?;
        tracing::info!(uid = %ctx.uid, day = %record.log_date, "metrics logged");

        if let Some(text) = notes {
            if let Err(err) = self.journal(ctx, &text, &["checkin".to_string()]) {
                tracing::warn!("check-in note not journaled (ignored): {err:#}");
            }
        }
        Ok(record)
    }

    pub fn journal(&self, ctx: &RequestContext, text: &str, tags: &[String]) -> Result<JournalEntry> {
        let text = text.trim();
        if text.is_empty() {
            bail!("Journal entry cannot be empty");
        }
        let entry = NewJournalEntry {
            uid: ctx.uid.clone(),
            timestamp: ctx.now,
            text: text.to_string(),
            tags: tags.to_vec(),
            embedding: self.embed_best_effort(text),
        };
        let saved = self
            .retry
            .run("journal insert", || self.store.insert_journal(&entry))
            .context("Failed to save journal entry")?;
        Ok(saved)
    }

    pub fn estimate_meal(&self, text: &str) -> Result<MealEstimate> {
        let Some(generator) = self.generator else {
            bail!("Meal estimation needs a language model. Set OPENAI_API_KEY");
        };
        nutrition::estimate_meal(generator, text).context("Failed to estimate meal")
    }

    /// Save a meal. With `estimate`, items and macros come from the model,
    /// falling back to the quick "items; kcal" form when estimation fails.
    pub fn log_meal(&self, ctx: &RequestContext, entry: &MealEntry) -> Result<MealRecord> {
        let meal_type = validate_meal_type(&entry.meal_type)?;
        let raw_text = entry.text.trim();
        if raw_text.is_empty() {
            bail!("Meal description cannot be empty");
        }

        let estimate = if entry.estimate {
            match self.estimate_meal(raw_text) {
                Ok(est) => Some(est),
                Err(e) => {
                    tracing::warn!("meal estimation failed, saving as entered: {e:#}");
                    None
                }
            }
        } else {
            None
        };
        let (raw_text, estimate) = match estimate {
            Some(est) => (raw_text.to_string(), est),
            None => {
                let quick = parse_items_kcal(raw_text);
                let mut est = MealEstimate::default();
                est.totals.calories = quick.calories;
                (quick.items.unwrap_or_else(|| raw_text.to_string()), est)
            }
        };

        let blurb = meal_blurb(&meal_type, &estimate.items, &raw_text, &estimate.totals);
        let meal = NewMeal {
            uid: ctx.uid.clone(),
            timestamp: entry.at.unwrap_or(ctx.now),
            meal_type,
            raw_text,
            items: estimate.items,
            totals: estimate.totals,
            embedding: self.embed_best_effort(&blurb),
            blurb: Some(blurb),
        };
        let saved = self
            .retry
            .run("meal insert", || self.store.insert_meal(&meal))
            .context("Failed to save meal")?;
        tracing::info!(uid = %ctx.uid, meal = %saved.meal_type, "meal logged");
        Ok(saved)
    }

    // --- Views ---

    pub fn summary(&self, ctx: &RequestContext, days: u32) -> Result<Summary> {
        if days == 0 || days > MAX_SUMMARY_DAYS {
            bail!("days must be between 1 and {MAX_SUMMARY_DAYS}");
        }
        let days = self.aggregator().recent_days(ctx, days.saturating_sub(1))?;
        let averages = window_averages(&days);
        Ok(Summary { days, averages })
    }

    pub fn snapshot(&self, ctx: &RequestContext) -> Result<Option<Snapshot>> {
        Ok(self.aggregator().snapshot(ctx)?)
    }

    pub fn recent_meals(&self, ctx: &RequestContext) -> Result<Option<MealsView>> {
        Ok(self.aggregator().recent_meals(ctx)?)
    }

    pub fn goals(&self, ctx: &RequestContext) -> Result<GoalReport> {
        let prefs = self.preferences(&ctx.uid)?;
        let days = self.aggregator().recent_days(ctx, GOAL_HISTORY_DAYS - 1)?;
        let evaluator = GoalEvaluator::new(self.store, &self.retry);
        Ok(evaluator.report(&ctx.uid, &days, Goals::from(&prefs), ctx.today()))
    }

    pub fn badges(&self, uid: &str) -> Result<Vec<Badge>> {
        Ok(degrade(
            self.retry.run("badges read", || self.store.badges(uid)),
            "badges",
        )?)
    }

    /// Project weight and wellbeing from the last 30 days of habits.
    pub fn twin(&self, ctx: &RequestContext, plan: &PlanDeltas, horizon_days: u32) -> Result<Projection> {
        let days = self.aggregator().recent_days(ctx, TWIN_HISTORY_DAYS - 1)?;
        let habits = Habits::from_averages(&window_averages(&days));
        let profile = degrade(
            self.retry.run("profile read", || self.store.profile(&ctx.uid)),
            "profile",
        )?;
        let body = Body::from_profile(profile.as_ref());
        Ok(twin::project(&body, &habits, plan, horizon_days))
    }

    // --- Conversation ---

    pub fn chat(&self, ctx: &RequestContext, text: &str) -> Result<Reply> {
        Ok(self.composer().respond(ctx, text)?)
    }

    pub fn nudge(&self, ctx: &RequestContext, ask: Option<&str>) -> Result<Reply> {
        Ok(self.composer().compose_nudge(ctx, ask)?)
    }

    /// Whether a proactive nudge may go out right now for this user.
    pub fn nudge_due(&self, ctx: &RequestContext) -> Result<bool> {
        let prefs = self.preferences(&ctx.uid)?;
        Ok(nudge_due(&prefs, ctx.window.local_time(ctx.now)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::error::StoreError;
    use crate::goals::BadgeRule;
    use crate::nudge::ReplySource;
    use crate::testing::{
        FailingEmbedder, FailingStore, KeywordEmbedder, ScriptedGenerator, WriteFaults,
    };
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        // 10:00 in New York.
        Utc.with_ymd_and_hms(2024, 6, 10, 14, 0, 0).unwrap()
    }

    fn service(db: &Database) -> WhisperService<'_> {
        WhisperService::new(db).with_retry(RetryPolicy::immediate())
    }

    /// Context for a log made `back` days ago, shortly before `now()`.
    fn logged_ctx(svc: &WhisperService<'_>, back: i64) -> RequestContext {
        svc.context_at("u1", now() - Duration::days(back) - Duration::minutes(5))
            .unwrap()
    }

    fn steps(n: f64) -> MetricEntry {
        MetricEntry {
            source: "manual".to_string(),
            values: MetricValues {
                steps: Some(n),
                ..MetricValues::default()
            },
            notes: None,
        }
    }

    #[test]
    fn test_context_uses_preferred_timezone() {
        let db = Database::open_in_memory().unwrap();
        let svc = service(&db);
        let mut prefs = Preferences::defaults("u1");
        prefs.timezone = "Asia/Tokyo".to_string();
        svc.save_preferences(&prefs).unwrap();

        // 2024-06-10 20:00Z is June 11 in Tokyo.
        let ctx = svc
            .context_at("u1", Utc.with_ymd_and_hms(2024, 6, 10, 20, 0, 0).unwrap())
            .unwrap();
        assert_eq!(ctx.today().to_string(), "2024-06-11");

        let other = svc.context_at("u2", now()).unwrap();
        assert_eq!(other.window.tz(), chrono_tz::America::New_York);
    }

    #[test]
    fn test_invalid_preferences_rejected() {
        let db = Database::open_in_memory().unwrap();
        let mut prefs = Preferences::defaults("u1");
        prefs.timezone = "Mars/Olympus".to_string();
        assert!(service(&db).save_preferences(&prefs).is_err());
    }

    #[test]
    fn test_partial_updates_merge_onto_defaults() {
        let db = Database::open_in_memory().unwrap();
        let svc = service(&db);
        let prefs = svc
            .update_preferences(
                "u1",
                PreferencesUpdate {
                    daily_water_ml: Some(2500.0),
                    ..PreferencesUpdate::default()
                },
            )
            .unwrap();
        assert_eq!(prefs.daily_water_ml, 2500.0);
        assert_eq!(svc.preferences("u1").unwrap(), prefs);

        let bad = PreferencesUpdate {
            timezone: Some("Nowhere/Land".to_string()),
            ..PreferencesUpdate::default()
        };
        assert!(svc.update_preferences("u1", bad).is_err());
        assert_eq!(svc.preferences("u1").unwrap().daily_water_ml, 2500.0);

        let profile = svc
            .update_profile(
                "u1",
                ProfileUpdate {
                    weight_kg: Some(68.0),
                    ..ProfileUpdate::default()
                },
            )
            .unwrap();
        assert_eq!(profile.uid, "u1");
        assert_eq!(svc.profile("u1").unwrap().weight_kg, Some(68.0));
    }

    #[test]
    fn test_log_metrics_validates_and_merges() {
        let db = Database::open_in_memory().unwrap();
        let svc = service(&db);
        let ctx = svc.context_at("u1", now()).unwrap();

        assert!(svc.log_metrics(&ctx, &MetricEntry::default()).is_err());
        let bad = MetricEntry {
            source: "manual".to_string(),
            values: MetricValues {
                mood: Some(9.0),
                ..MetricValues::default()
            },
            notes: None,
        };
        assert!(svc.log_metrics(&ctx, &bad).is_err());

        svc.log_metrics(&ctx, &steps(4000.0)).unwrap();
        let record = svc
            .log_metrics(
                &ctx,
                &MetricEntry {
                    source: "manual".to_string(),
                    values: MetricValues {
                        mood: Some(4.0),
                        ..MetricValues::default()
                    },
                    notes: Some("felt rested after a long walk".to_string()),
                },
            )
            .unwrap();
        assert_eq!(record.values.steps, Some(4000.0));
        assert_eq!(record.values.mood, Some(4.0));
        let journal = db.journal_entries("u1", 5).unwrap();
        assert_eq!(journal.len(), 1);
        assert_eq!(journal[0].tags, vec!["checkin".to_string()]);
    }

    #[test]
    fn test_log_metrics_succeeds_when_note_journal_fails() {
        let db = Database::open_in_memory().unwrap();
        let store = WriteFaults::new(&db).failing_journal();
        let svc = WhisperService::new(&store).with_retry(RetryPolicy::immediate());
        let ctx = logged_ctx(&svc, 0);
        let entry = MetricEntry {
            notes: Some("slept badly".to_string()),
            ..steps(3000.0)
        };

        let record = svc.log_metrics(&ctx, &entry).unwrap();
        assert_eq!(record.values.steps, Some(3000.0));
        assert_eq!(record.notes.as_deref(), Some("slept badly"));
        assert!(db.journal_entries("u1", 5).unwrap().is_empty());
    }

    #[test]
    fn test_log_meal_quick_entry_and_blurb() {
        let db = Database::open_in_memory().unwrap();
        let svc = service(&db);
        let ctx = svc.context_at("u1", now()).unwrap();
        let meal = svc
            .log_meal(
                &ctx,
                &MealEntry {
                    meal_type: "Snack".to_string(),
                    text: "apple; 95".to_string(),
                    ..MealEntry::default()
                },
            )
            .unwrap();
        assert_eq!(meal.meal_type, "snacks");
        assert_eq!(meal.raw_text, "apple");
        assert_eq!(meal.totals.calories, Some(95.0));
        assert_eq!(
            meal.blurb.as_deref(),
            Some("Snacks • apple → kcal 95; P unkg; C unkg; F unkg; Na unkmg; Sug unkg")
        );
    }

    #[test]
    fn test_log_meal_with_estimate_and_failing_embedder() {
        let db = Database::open_in_memory().unwrap();
        let generator = ScriptedGenerator::replying(
            r#"{"items":[{"name":"eggs","portion":"2","calories":156,"protein_g":12}],"totals":{"calories":156,"protein_g":12}}"#,
        );
        let svc = service(&db).with_language_model(Some(&FailingEmbedder), Some(&generator));
        let ctx = svc.context_at("u1", now()).unwrap();
        let meal = svc
            .log_meal(
                &ctx,
                &MealEntry {
                    meal_type: "breakfast".to_string(),
                    text: "2 eggs".to_string(),
                    estimate: true,
                    at: None,
                },
            )
            .unwrap();
        assert_eq!(meal.items.len(), 1);
        assert_eq!(meal.totals.protein_g, Some(12.0));
        assert!(meal.blurb.unwrap().starts_with("Breakfast • eggs (2) → kcal 156"));
    }

    #[test]
    fn test_estimation_failure_still_saves_meal() {
        let db = Database::open_in_memory().unwrap();
        let generator = ScriptedGenerator::failing();
        let svc = service(&db).with_language_model(None, Some(&generator));
        let ctx = svc.context_at("u1", now()).unwrap();
        let meal = svc
            .log_meal(
                &ctx,
                &MealEntry {
                    meal_type: "dinner".to_string(),
                    text: "pasta 700".to_string(),
                    estimate: true,
                    at: None,
                },
            )
            .unwrap();
        assert_eq!(meal.totals.calories, Some(700.0));
        assert!(svc.estimate_meal("x").is_err());
    }

    #[test]
    fn test_goals_award_badges_once() {
        let db = Database::open_in_memory().unwrap();
        let svc = service(&db);
        for back in 0..7 {
            let ctx = logged_ctx(&svc, back);
            svc.log_metrics(
                &ctx,
                &MetricEntry {
                    source: "manual".to_string(),
                    values: MetricValues {
                        water_ml: Some(2500.0),
                        steps: Some(10_500.0),
                        ..MetricValues::default()
                    },
                    notes: None,
                },
            )
            .unwrap();
        }
        let ctx = svc.context_at("u1", now()).unwrap();
        let report = svc.goals(&ctx).unwrap();
        assert_eq!(report.streak, 7);
        assert!(report.newly_earned.contains(&BadgeRule::Water7d));
        assert!(report.newly_earned.contains(&BadgeRule::Steps10k));

        let again = svc.goals(&ctx).unwrap();
        assert!(again.newly_earned.is_empty());
        assert_eq!(svc.badges("u1").unwrap().len(), 2);
    }

    #[test]
    fn test_summary_and_twin() {
        let db = Database::open_in_memory().unwrap();
        let svc = service(&db);
        for (back, n) in [(0, 9000.0), (1, 7000.0), (9, 1000.0)] {
            let ctx = logged_ctx(&svc, back);
            svc.log_metrics(&ctx, &steps(n)).unwrap();
        }
        let ctx = svc.context_at("u1", now()).unwrap();
        let summary = svc.summary(&ctx, 7).unwrap();
        assert_eq!(summary.days.len(), 2);
        assert_eq!(summary.averages.steps, Some(8000.0));

        let projection = svc.twin(&ctx, &PlanDeltas::suggested(), 30).unwrap();
        assert_eq!(projection.baseline.weights.len(), 31);
        assert!((projection.baseline.habits.steps - 17_000.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_summary_rejects_out_of_range_days() {
        let db = Database::open_in_memory().unwrap();
        let svc = service(&db);
        let ctx = svc.context_at("u1", now()).unwrap();
        assert!(svc.summary(&ctx, 0).is_err());
        assert!(svc.summary(&ctx, 4_000_000_000).is_err());
        assert!(svc.summary(&ctx, MAX_SUMMARY_DAYS).is_ok());
    }

    #[test]
    fn test_chat_and_nudge_without_model_fall_back() {
        let db = Database::open_in_memory().unwrap();
        let svc = service(&db).with_search(&db);
        let ctx = svc.context_at("u1", now()).unwrap();
        let reply = svc.chat(&ctx, "give me a tip").unwrap();
        assert_eq!(reply.source, ReplySource::Fallback);
        let nudge = svc.nudge(&ctx, Some("water")).unwrap();
        assert_eq!(nudge.source, ReplySource::Fallback);
        assert!(db.recent_nudges("u1", 5).unwrap().is_empty());
    }

    #[test]
    fn test_chat_with_model_and_embeddings() {
        let db = Database::open_in_memory().unwrap();
        let embedder = KeywordEmbedder::health();
        let generator = ScriptedGenerator::replying("- Try lights out by 10:30pm.");
        let svc = service(&db)
            .with_search(&db)
            .with_language_model(Some(&embedder), Some(&generator));
        let ctx = svc.context_at("u1", now()).unwrap();
        svc.journal(&ctx, "Late nights are wrecking my routine", &[]).unwrap();
        let reply = svc.chat(&ctx, "tips for getting to bed earlier?").unwrap();
        assert_eq!(reply.text, "- Try lights out by 10:30pm.");
        let (_, prompt) = generator.last_prompt().unwrap();
        assert!(prompt.contains("Late nights are wrecking my routine"));
    }

    #[test]
    fn test_nudge_due_uses_local_quiet_hours() {
        let db = Database::open_in_memory().unwrap();
        let svc = service(&db);
        // 10:00 New York.
        assert!(svc.nudge_due(&svc.context_at("u1", now()).unwrap()).unwrap());
        // 23:00 New York.
        let late = Utc.with_ymd_and_hms(2024, 6, 11, 3, 0, 0).unwrap();
        assert!(!svc.nudge_due(&svc.context_at("u1", late).unwrap()).unwrap());
    }

    #[test]
    fn test_auth_expiry_reaches_caller() {
        let store = FailingStore::auth_expired();
        let svc = WhisperService::new(&store).with_retry(RetryPolicy::immediate());
        let err = svc.context_at("u1", now()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::AuthExpired)
        ));
    }

    #[test]
    fn test_reads_degrade_on_transient_outage() {
        let store = FailingStore::transient();
        let svc = WhisperService::new(&store).with_retry(RetryPolicy::immediate());
        let ctx = svc.context_at("u1", now()).unwrap();
        assert!(svc.snapshot(&ctx).unwrap().is_none());
        assert_eq!(svc.profile("u1").unwrap(), Profile::empty("u1"));
        assert!(svc.log_metrics(&ctx, &steps(10.0)).is_err());
    }
}
