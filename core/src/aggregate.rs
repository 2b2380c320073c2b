//! Reduce raw metric and meal records into per-day rows and snapshots.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

use crate::context::RequestContext;
use crate::error::StoreError;
use crate::models::{DailyAggregate, MealRecord, MetricField, MetricRecord, MetricValues};
use crate::retry::{RetryPolicy, degrade};
use crate::store::HealthStore;
use crate::timewindow::TimeWindow;

/// Rolling fallback when nothing was logged today.
pub const SNAPSHOT_FALLBACK_HOURS: u32 = 48;
/// Rolling fallback for the meal listing.
pub const MEALS_FALLBACK_HOURS: u32 = 36;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum Scope {
    Today,
    Rolling { hours: u32 },
}

impl Scope {
    #[must_use]
    pub fn label(self) -> String {
        match self {
            Self::Today => "today".to_string(),
            Self::Rolling { hours } => format!("last {hours}h"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    #[serde(flatten)]
    pub scope: Scope,
    #[serde(flatten)]
    pub values: MetricValues,
    pub meal_count: usize,
    pub last_logged_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MealsView {
    #[serde(flatten)]
    pub scope: Scope,
    pub meals: Vec<MealRecord>,
}

fn max_opt(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.max(y)),
        (x, None) => x,
        (None, y) => y,
    }
}

/// Sum of meal calories, or `None` when no meal carries a calorie value.
fn meal_calories<'a>(meals: impl IntoIterator<Item = &'a MealRecord>) -> Option<f64> {
    meals
        .into_iter()
        .filter_map(|m| m.totals.calories)
        .fold(None, |acc, c| Some(acc.unwrap_or(0.0) + c))
}

/// One row per local day that has any data, sorted by day.
///
/// Metric fields take the day's max. Calories are the sum of that day's meals,
/// falling back to the day's max recorded calorie total when no meal has one.
#[must_use]
pub fn reduce_days(
    metrics: &[MetricRecord],
    meals: &[MealRecord],
    window: &TimeWindow,
) -> Vec<DailyAggregate> {
    let mut days: BTreeMap<NaiveDate, MetricValues> = BTreeMap::new();

    for record in metrics {
        let day = window.local_day(record.timestamp);
        let entry = days.entry(day).or_default();
        for field in MetricField::ALL {
            let slot = entry.slot(field);
            *slot = max_opt(*slot, record.values.get(field));
        }
    }

    let mut meals_by_day: BTreeMap<NaiveDate, Vec<&MealRecord>> = BTreeMap::new();
    for meal in meals {
        meals_by_day
            .entry(window.local_day(meal.timestamp))
            .or_default()
            .push(meal);
    }
    for (day, day_meals) in meals_by_day {
        let entry = days.entry(day).or_default();
        if let Some(total) = meal_calories(day_meals) {
            entry.calories = Some(total);
        }
    }

    days.into_iter()
        .map(|(day, values)| DailyAggregate { day, values })
        .collect()
}

/// Current-state view of a set of records.
///
/// Cumulative counters keep their max; point readings such as heart rate or
/// mood keep the most recent value.
#[must_use]
pub fn snapshot_values(metrics: &[MetricRecord], meals: &[MealRecord]) -> MetricValues {
    let mut ordered: Vec<&MetricRecord> = metrics.iter().collect();
    ordered.sort_by_key(|r| r.timestamp);

    let mut values = MetricValues::default();
    for record in ordered {
        for field in MetricField::ALL {
            let incoming = record.values.get(field);
            let slot = values.slot(field);
            if field.is_cumulative() || field == MetricField::Calories {
                *slot = max_opt(*slot, incoming);
            } else if incoming.is_some() {
                *slot = incoming;
            }
        }
    }
    if let Some(total) = meal_calories(meals) {
        values.calories = Some(total);
    }
    values
}

/// Mean of the present values of each field across days.
#[must_use]
pub fn window_averages(days: &[DailyAggregate]) -> MetricValues {
    let mut out = MetricValues::default();
    for field in MetricField::ALL {
        let present: Vec<f64> = days.iter().filter_map(|d| d.values.get(field)).collect();
        if !present.is_empty() {
            #[allow(clippy::cast_precision_loss)]
            let mean = present.iter().sum::<f64>() / present.len() as f64;
            out.set(field, Some(mean));
        }
    }
    out
}

pub struct MetricsAggregator<'a> {
    store: &'a dyn HealthStore,
    retry: &'a RetryPolicy,
}

impl<'a> MetricsAggregator<'a> {
    #[must_use]
    pub fn new(store: &'a dyn HealthStore, retry: &'a RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Both record kinds for `[start, end)`. Failed reads come back empty.
    fn load(
        &self,
        uid: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<(Vec<MetricRecord>, Vec<MealRecord>), StoreError> {
        let metrics = degrade(
            self.retry
                .run("metrics read", || self.store.metrics_between(uid, start, end)),
            "metrics",
        )?;
        let meals = degrade(
            self.retry
                .run("meals read", || self.store.meals_between(uid, start, end)),
            "meals",
        )?;
        Ok((metrics, meals))
    }

    pub fn daily(
        &self,
        ctx: &RequestContext,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<DailyAggregate>, StoreError> {
        let (metrics, meals) = self.load(&ctx.uid, start, end)?;
        Ok(reduce_days(&metrics, &meals, &ctx.window))
    }

    /// Daily rows from local midnight `days_back` days ago up to now.
    pub fn recent_days(
        &self,
        ctx: &RequestContext,
        days_back: u32,
    ) -> Result<Vec<DailyAggregate>, StoreError> {
        let (start, end) = ctx.window.window_bounds(days_back, ctx.now);
        self.daily(ctx, start, end)
    }

    /// Today's values, else the last 48 hours, else `None`.
    pub fn snapshot(&self, ctx: &RequestContext) -> Result<Option<Snapshot>, StoreError> {
        let today = ctx.window.day_bounds(ctx.today());
        let rolling = ctx.window.rolling_since(SNAPSHOT_FALLBACK_HOURS, ctx.now);
        let tiers = [
            (Scope::Today, today),
            (
                Scope::Rolling {
                    hours: SNAPSHOT_FALLBACK_HOURS,
                },
                rolling,
            ),
        ];

        for (scope, (start, end)) in tiers {
            let (metrics, meals) = self.load(&ctx.uid, start, end)?;
            if metrics.is_empty() && meals.is_empty() {
                continue;
            }
            let last_logged_at = metrics
                .iter()
                .map(|m| m.timestamp)
                .chain(meals.iter().map(|m| m.timestamp))
                .max();
            return Ok(Some(Snapshot {
                scope,
                values: snapshot_values(&metrics, &meals),
                meal_count: meals.len(),
                last_logged_at,
            }));
        }
        tracing::debug!(uid = %ctx.uid, "no metrics in snapshot tiers");
        Ok(None)
    }

    /// Today's meals, else the last 36 hours, else `None`.
    pub fn recent_meals(&self, ctx: &RequestContext) -> Result<Option<MealsView>, StoreError> {
        let tiers = [
            (Scope::Today, ctx.window.day_bounds(ctx.today())),
            (
                Scope::Rolling {
                    hours: MEALS_FALLBACK_HOURS,
                },
                ctx.window.rolling_since(MEALS_FALLBACK_HOURS, ctx.now),
            ),
        ];
        for (scope, (start, end)) in tiers {
            let meals = degrade(
                self.retry.run("meals read", || {
                    self.store.meals_between(&ctx.uid, start, end)
                }),
                "meals",
            )?;
            if !meals.is_empty() {
                return Ok(Some(MealsView { scope, meals }));
            }
        }
        Ok(None)
    }
}
