//! Goal hits, streaks, weekly tallies and badge rules.

use chrono::NaiveDate;
use serde::Serialize;

use crate::models::{DailyAggregate, Preferences};
use crate::retry::{RetryPolicy, best_effort};
use crate::store::HealthStore;

/// Trailing window the badge rules and weekly tally look at.
pub const BADGE_WINDOW_DAYS: usize = 7;
pub const TEN_K_STEPS: f64 = 10_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Goals {
    pub steps: f64,
    pub water_ml: f64,
    pub sleep_minutes: f64,
    pub calories: f64,
    pub protein_g: f64,
}

impl From<&Preferences> for Goals {
    fn from(p: &Preferences) -> Self {
        Self {
            steps: p.daily_step_goal,
            water_ml: p.daily_water_ml,
            sleep_minutes: p.sleep_goal_min,
            calories: p.daily_calorie_goal,
            protein_g: p.protein_target_g,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GoalHit {
    pub day: NaiveDate,
    pub steps: Option<f64>,
    pub steps_hit: bool,
    pub water_hit: bool,
    pub sleep_hit: bool,
    pub any_hit: bool,
}

fn reached(value: Option<f64>, goal: f64) -> bool {
    value.is_some_and(|v| v >= goal)
}

/// Hit flags per day, in the order given. An absent value is a miss.
#[must_use]
pub fn evaluate(days: &[DailyAggregate], goals: &Goals) -> Vec<GoalHit> {
    days.iter()
        .map(|d| {
            let steps_hit = reached(d.values.steps, goals.steps);
            let water_hit = reached(d.values.water_ml, goals.water_ml);
            let sleep_hit = reached(d.values.sleep_minutes, goals.sleep_minutes);
            GoalHit {
                day: d.day,
                steps: d.values.steps,
                steps_hit,
                water_hit,
                sleep_hit,
                any_hit: steps_hit || water_hit || sleep_hit,
            }
        })
        .collect()
}

/// Consecutive trailing days with any goal hit. A missing calendar day
/// between two present days breaks the run.
#[must_use]
pub fn current_streak(hits: &[GoalHit]) -> u32 {
    let mut streak = 0;
    let mut expected: Option<NaiveDate> = None;
    for hit in hits.iter().rev() {
        if expected.is_some_and(|d| d != hit.day) || !hit.any_hit {
            break;
        }
        streak += 1;
        expected = hit.day.pred_opt();
    }
    streak
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WeeklyTally {
    pub days: usize,
    pub steps_days: usize,
    pub water_days: usize,
    pub sleep_days: usize,
}

#[must_use]
pub fn weekly_tally(hits: &[GoalHit]) -> WeeklyTally {
    let tail = trailing(hits);
    WeeklyTally {
        days: tail.len(),
        steps_days: tail.iter().filter(|h| h.steps_hit).count(),
        water_days: tail.iter().filter(|h| h.water_hit).count(),
        sleep_days: tail.iter().filter(|h| h.sleep_hit).count(),
    }
}

fn trailing(hits: &[GoalHit]) -> &[GoalHit] {
    &hits[hits.len().saturating_sub(BADGE_WINDOW_DAYS)..]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BadgeRule {
    #[serde(rename = "WATER_7D")]
    Water7d,
    #[serde(rename = "STEPS_10K")]
    Steps10k,
    #[serde(rename = "SLEEP_7x")]
    Sleep7x,
}

impl BadgeRule {
    pub const ALL: [BadgeRule; 3] = [Self::Water7d, Self::Steps10k, Self::Sleep7x];

    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::Water7d => "WATER_7D",
            Self::Steps10k => "STEPS_10K",
            Self::Sleep7x => "SLEEP_7x",
        }
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Water7d => "Hydration Hero (7-day)",
            Self::Steps10k => "10k Steps Day",
            Self::Sleep7x => "Sleep Consistency",
        }
    }

    #[must_use]
    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|b| b.code() == code)
    }

    /// Whether the rule fires for the trailing days of `hits`.
    #[must_use]
    pub fn is_earned(self, hits: &[GoalHit]) -> bool {
        let tail = trailing(hits);
        match self {
            Self::Water7d => tail.iter().filter(|h| h.water_hit).count() >= 7,
            Self::Steps10k => tail
                .last()
                .is_some_and(|h| h.steps_hit || h.steps.is_some_and(|s| s >= TEN_K_STEPS)),
            Self::Sleep7x => tail.iter().filter(|h| h.sleep_hit).count() >= 5,
        }
    }
}

#[must_use]
pub fn eligible_badges(hits: &[GoalHit]) -> Vec<BadgeRule> {
    BadgeRule::ALL
        .into_iter()
        .filter(|b| b.is_earned(hits))
        .collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct GoalReport {
    pub goals: Goals,
    pub days: Vec<GoalHit>,
    pub streak: u32,
    pub weekly: WeeklyTally,
    pub eligible: Vec<BadgeRule>,
    /// Badges awarded by this evaluation for the first time.
    pub newly_earned: Vec<BadgeRule>,
}

pub struct GoalEvaluator<'a> {
    store: &'a dyn HealthStore,
    retry: &'a RetryPolicy,
}

impl<'a> GoalEvaluator<'a> {
    #[must_use]
    pub fn new(store: &'a dyn HealthStore, retry: &'a RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Persist eligible badges, each on its own. Re-earning an owned badge
    /// changes nothing; a failed write is logged and the rest still land.
    #[must_use]
    pub fn award(&self, uid: &str, badges: &[BadgeRule], earned_on: NaiveDate) -> Vec<BadgeRule> {
        badges
            .iter()
            .filter(|badge| {
                let inserted = best_effort(
                    self.retry.run("badge upsert", || {
                        self.store.upsert_badge(uid, badge.code(), earned_on)
                    }),
                    "badge upsert",
                );
                if inserted == Some(true) {
                    tracing::info!(uid, badge = badge.code(), "badge earned");
                }
                inserted == Some(true)
            })
            .copied()
            .collect()
    }

    /// Evaluate days against goals and award badges.
    #[must_use]
    pub fn report(
        &self,
        uid: &str,
        days: &[DailyAggregate],
        goals: Goals,
        today: NaiveDate,
    ) -> GoalReport {
        let hits = evaluate(days, &goals);
        let eligible = eligible_badges(&hits);
        let newly_earned = self.award(uid, &eligible, today);
        GoalReport {
            goals,
            streak: current_streak(&hits),
            weekly: weekly_tally(&hits),
            days: hits,
            eligible,
            newly_earned,
        }
    }
}
