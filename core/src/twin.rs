//! Digital twin: project weight and wellbeing from current habits.
//!
//! Energy expenditure uses Mifflin-St Jeor (Mifflin et al., 1990) scaled by
//! the usual activity factors, nudged by steps, sleep and hydration. The
//! weight model assumes 7700 kcal per kg of body mass. Everything here is
//! pure and deterministic.

use serde::{Deserialize, Serialize};

use crate::models::{MetricValues, Profile};

pub const KCAL_PER_KG: f64 = 7700.0;
pub const MIN_WEIGHT_KG: f64 = 35.0;
pub const DEFAULT_HORIZON_DAYS: u32 = 180;
pub const ADHERENCE_MIN: f64 = 0.88;
pub const ADHERENCE_MAX: f64 = 1.08;

const DEFAULT_AGE: u32 = 30;
const DEFAULT_HEIGHT_CM: f64 = 170.0;
const DEFAULT_WEIGHT_KG: f64 = 75.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sex {
    Male,
    Female,
    Unspecified,
}

impl Sex {
    /// First letter decides: "m…" is male, "f…" is female, anything else unspecified.
    #[must_use]
    pub fn parse(raw: Option<&str>) -> Self {
        match raw
            .map(str::trim)
            .and_then(|s| s.chars().next())
            .map(|c| c.to_ascii_lowercase())
        {
            Some('m') => Self::Male,
            Some('f') => Self::Female,
            _ => Self::Unspecified,
        }
    }

    #[must_use]
    pub fn bmr_offset(self) -> f64 {
        match self {
            Self::Male => 5.0,
            Self::Female => -161.0,
            Self::Unspecified => -78.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivityLevel {
    Sedentary,
    LightlyActive,
    ModeratelyActive,
    VeryActive,
    Athlete,
}

impl ActivityLevel {
    /// Case-insensitive substring match on the stored label; unknown is sedentary.
    #[must_use]
    pub fn parse(raw: Option<&str>) -> Self {
        let Some(lower) = raw.map(str::to_lowercase) else {
            return Self::Sedentary;
        };
        [
            ("lightly active", Self::LightlyActive),
            ("moderately active", Self::ModeratelyActive),
            ("very active", Self::VeryActive),
            ("athlete", Self::Athlete),
            ("sedentary", Self::Sedentary),
        ]
        .into_iter()
        .find(|(label, _)| lower.contains(label))
        .map_or(Self::Sedentary, |(_, level)| level)
    }

    #[must_use]
    pub fn factor(self) -> f64 {
        match self {
            Self::Sedentary => 1.2,
            Self::LightlyActive => 1.375,
            Self::ModeratelyActive => 1.55,
            Self::VeryActive => 1.725,
            Self::Athlete => 1.9,
        }
    }
}

/// Body parameters with defaults filled in.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Body {
    pub age: u32,
    pub height_cm: f64,
    pub weight_kg: f64,
    pub sex: Sex,
    pub activity: ActivityLevel,
}

fn positive_or(value: Option<f64>, fallback: f64) -> f64 {
    value.filter(|v| v.is_finite() && *v > 0.0).unwrap_or(fallback)
}

impl Body {
    #[must_use]
    pub fn from_profile(profile: Option<&Profile>) -> Self {
        Self {
            age: profile.and_then(|p| p.age).filter(|a| *a > 0).unwrap_or(DEFAULT_AGE),
            height_cm: positive_or(profile.and_then(|p| p.height_cm), DEFAULT_HEIGHT_CM),
            weight_kg: positive_or(profile.and_then(|p| p.weight_kg), DEFAULT_WEIGHT_KG),
            sex: Sex::parse(profile.and_then(|p| p.gender.as_deref())),
            activity: ActivityLevel::parse(profile.and_then(|p| p.activity_level.as_deref())),
        }
    }

    #[must_use]
    pub fn bmr(&self) -> f64 {
        10.0 * self.weight_kg + 6.25 * self.height_cm - 5.0 * f64::from(self.age)
            + self.sex.bmr_offset()
    }

    #[must_use]
    pub fn bmi_at(&self, weight_kg: f64) -> f64 {
        let m = self.height_cm / 100.0;
        weight_kg / (m * m)
    }
}

/// Average daily behaviour over the observation window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Habits {
    pub intake_kcal: f64,
    pub steps: f64,
    pub sleep_minutes: f64,
    pub water_ml: f64,
    pub mood: f64,
    pub stress: f64,
    pub anxiety: f64,
    pub focus: f64,
}

impl Default for Habits {
    fn default() -> Self {
        Self {
            intake_kcal: 2000.0,
            steps: 6000.0,
            sleep_minutes: 360.0,
            water_ml: 1200.0,
            mood: 3.0,
            stress: 3.0,
            anxiety: 3.0,
            focus: 3.0,
        }
    }
}

impl Habits {
    /// Absent, zero or non-finite averages fall back to the defaults.
    #[must_use]
    pub fn from_averages(avg: &MetricValues) -> Self {
        let d = Self::default();
        Self {
            intake_kcal: positive_or(avg.calories, d.intake_kcal),
            steps: positive_or(avg.steps, d.steps),
            sleep_minutes: positive_or(avg.sleep_minutes, d.sleep_minutes),
            water_ml: positive_or(avg.water_ml, d.water_ml),
            mood: positive_or(avg.mood, d.mood),
            stress: positive_or(avg.stress_level, d.stress),
            anxiety: positive_or(avg.anxiety_level, d.anxiety),
            focus: positive_or(avg.focus_level, d.focus),
        }
    }

    #[must_use]
    pub fn with_plan(&self, plan: &PlanDeltas) -> Self {
        Self {
            intake_kcal: (self.intake_kcal + plan.intake_kcal).max(0.0),
            steps: (self.steps + plan.steps).max(0.0),
            sleep_minutes: (self.sleep_minutes + plan.sleep_minutes).max(0.0),
            water_ml: (self.water_ml + plan.water_ml).max(0.0),
            ..*self
        }
    }
}

/// Changes the user is considering. Zero everywhere means "keep going as is".
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanDeltas {
    #[serde(default)]
    pub steps: f64,
    #[serde(default)]
    pub sleep_minutes: f64,
    #[serde(default)]
    pub water_ml: f64,
    #[serde(default)]
    pub intake_kcal: f64,
}

impl PlanDeltas {
    /// A modest starting plan for interactive use.
    #[must_use]
    pub fn suggested() -> Self {
        Self {
            steps: 2000.0,
            sleep_minutes: 30.0,
            water_ml: 400.0,
            intake_kcal: -150.0,
        }
    }
}

#[must_use]
pub fn tdee(body: &Body, habits: &Habits) -> f64 {
    let steps_bonus = 80.0 * ((habits.steps - 6000.0) / 2000.0).max(0.0);
    let sleep_penalty = if habits.sleep_minutes < 360.0 {
        -100.0
    } else if habits.sleep_minutes < 420.0 {
        -50.0
    } else {
        0.0
    };
    let water_penalty = if habits.water_ml < 1000.0 { -40.0 } else { 0.0 };
    body.bmr() * body.activity.factor() + steps_bonus + sleep_penalty + water_penalty
}

/// How closely intake is likely to track the plan, from mood and load.
#[must_use]
pub fn adherence(habits: &Habits) -> f64 {
    let mut m: f64 = 1.0;
    m *= if habits.mood >= 3.5 { 1.02 } else { 0.98 };
    m *= if habits.focus >= 3.5 { 1.02 } else { 0.98 };
    if habits.stress >= 3.5 {
        m *= 0.97;
    }
    if habits.anxiety >= 3.5 {
        m *= 0.97;
    }
    if habits.sleep_minutes < 360.0 {
        m *= 0.97;
    }
    m.clamp(ADHERENCE_MIN, ADHERENCE_MAX)
}

/// Daily weights for days `0..=days`. The first entry already includes one
/// day of change.
#[must_use]
pub fn simulate_weight(body: &Body, habits: &Habits, adherence: f64, days: u32) -> Vec<f64> {
    let daily_tdee = tdee(body, habits);
    let delta = (habits.intake_kcal - daily_tdee) / KCAL_PER_KG * adherence;
    let mut weight = body.weight_kg;
    (0..=days)
        .map(|_| {
            weight = (weight + delta).max(MIN_WEIGHT_KG);
            weight
        })
        .collect()
}

fn normalize(v: f64) -> f64 {
    (v.clamp(1.0, 5.0) - 1.0) / 4.0
}

/// 0–100 wellbeing from 1–5 self reports, rounded to one decimal.
#[must_use]
pub fn wellbeing_score(mood: f64, stress: f64, anxiety: f64, focus: f64) -> f64 {
    let raw = 0.30 * normalize(mood)
        + 0.30 * normalize(focus)
        + 0.20 * (1.0 - normalize(stress))
        + 0.20 * (1.0 - normalize(anxiety));
    (raw * 1000.0).round() / 10.0
}

#[derive(Debug, Clone, Serialize)]
pub struct Scenario {
    pub habits: Habits,
    pub tdee: f64,
    pub weights: Vec<f64>,
    pub final_weight_kg: f64,
    pub final_bmi: f64,
    pub wellbeing: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Projection {
    pub body: Body,
    pub bmr: f64,
    pub adherence: f64,
    pub days: u32,
    pub plan: PlanDeltas,
    pub baseline: Scenario,
    pub planned: Scenario,
}

/// Run both scenarios. Adherence is computed once, from current habits.
#[must_use]
pub fn project(body: &Body, habits: &Habits, plan: &PlanDeltas, days: u32) -> Projection {
    let adherence = adherence(habits);
    let planned_habits = habits.with_plan(plan);

    let scenario = |h: &Habits, wellbeing: f64| {
        let weights = simulate_weight(body, h, adherence, days);
        let final_weight_kg = weights.last().copied().unwrap_or(body.weight_kg);
        Scenario {
            habits: *h,
            tdee: tdee(body, h),
            final_bmi: body.bmi_at(final_weight_kg),
            final_weight_kg,
            weights,
            wellbeing,
        }
    };

    let baseline_wb = wellbeing_score(habits.mood, habits.stress, habits.anxiety, habits.focus);
    let planned_wb = wellbeing_score(
        (habits.mood + 0.5).min(5.0),
        (habits.stress - 0.5).max(1.0),
        (habits.anxiety - 0.5).max(1.0),
        (habits.focus + 0.5).min(5.0),
    );

    Projection {
        body: *body,
        bmr: body.bmr(),
        adherence,
        days,
        plan: *plan,
        baseline: scenario(habits, baseline_wb),
        planned: scenario(&planned_habits, planned_wb),
    }
}
