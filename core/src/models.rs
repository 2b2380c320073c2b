use std::fmt;
use std::str::FromStr;

use anyhow::{Result, bail};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_TIMEZONE: &str = "America/New_York";
pub const MEAL_TYPES: &[&str] = &["breakfast", "lunch", "dinner", "snacks"];
pub const METRIC_SOURCES: &[&str] = &["manual", "bot", "import"];

// --- Metrics ---

/// One numeric health signal. Everything is stored as a real number; counters
/// like steps are whole in practice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricField {
    Steps,
    SleepMinutes,
    HeartRate,
    WaterMl,
    Mood,
    StressLevel,
    AnxietyLevel,
    FocusLevel,
    EnergyLevel,
    PainLevel,
    Calories,
}

impl MetricField {
    pub const ALL: [MetricField; 11] = [
        Self::Steps,
        Self::SleepMinutes,
        Self::HeartRate,
        Self::WaterMl,
        Self::Mood,
        Self::StressLevel,
        Self::AnxietyLevel,
        Self::FocusLevel,
        Self::EnergyLevel,
        Self::PainLevel,
        Self::Calories,
    ];

    #[must_use]
    pub fn column(self) -> &'static str {
        match self {
            Self::Steps => "steps",
            Self::SleepMinutes => "sleep_minutes",
            Self::HeartRate => "heart_rate",
            Self::WaterMl => "water_ml",
            Self::Mood => "mood",
            Self::StressLevel => "stress_level",
            Self::AnxietyLevel => "anxiety_level",
            Self::FocusLevel => "focus_level",
            Self::EnergyLevel => "energy_level",
            Self::PainLevel => "pain_level",
            Self::Calories => "calories",
        }
    }

    /// Self-reported 1–5 scales.
    #[must_use]
    pub fn is_scale(self) -> bool {
        matches!(
            self,
            Self::Mood
                | Self::StressLevel
                | Self::AnxietyLevel
                | Self::FocusLevel
                | Self::EnergyLevel
                | Self::PainLevel
        )
    }

    /// Counters that only grow over a day; today's snapshot keeps their max.
    #[must_use]
    pub fn is_cumulative(self) -> bool {
        matches!(self, Self::Steps | Self::SleepMinutes | Self::WaterMl)
    }
}

impl fmt::Display for MetricField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricValues {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sleep_minutes: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heart_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub water_ml: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mood: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stress_level: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anxiety_level: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub focus_level: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub energy_level: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pain_level: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calories: Option<f64>,
}

impl MetricValues {
    #[must_use]
    pub fn get(&self, field: MetricField) -> Option<f64> {
        match field {
            MetricField::Steps => self.steps,
            MetricField::SleepMinutes => self.sleep_minutes,
            MetricField::HeartRate => self.heart_rate,
            MetricField::WaterMl => self.water_ml,
            MetricField::Mood => self.mood,
            MetricField::StressLevel => self.stress_level,
            MetricField::AnxietyLevel => self.anxiety_level,
            MetricField::FocusLevel => self.focus_level,
            MetricField::EnergyLevel => self.energy_level,
            MetricField::PainLevel => self.pain_level,
            MetricField::Calories => self.calories,
        }
    }

    pub fn slot(&mut self, field: MetricField) -> &mut Option<f64> {
        match field {
            MetricField::Steps => &mut self.steps,
            MetricField::SleepMinutes => &mut self.sleep_minutes,
            MetricField::HeartRate => &mut self.heart_rate,
            MetricField::WaterMl => &mut self.water_ml,
            MetricField::Mood => &mut self.mood,
            MetricField::StressLevel => &mut self.stress_level,
            MetricField::AnxietyLevel => &mut self.anxiety_level,
            MetricField::FocusLevel => &mut self.focus_level,
            MetricField::EnergyLevel => &mut self.energy_level,
            MetricField::PainLevel => &mut self.pain_level,
            MetricField::Calories => &mut self.calories,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        MetricField::ALL.iter().all(|f| self.get(*f).is_none())
    }

    pub fn set(&mut self, field: MetricField, value: Option<f64>) {
        *self.slot(field) = value;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricRecord {
    pub id: String,
    pub uid: String,
    pub timestamp: DateTime<Utc>,
    pub log_date: NaiveDate,
    pub source: String,
    #[serde(flatten)]
    pub values: MetricValues,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// A metrics write. Fields left `None` keep whatever the day's record already has.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMetricLog {
    pub uid: String,
    pub source: String,
    pub log_date: NaiveDate,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub values: MetricValues,
    pub notes: Option<String>,
}

// --- Meals ---

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Macros {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calories: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protein_g: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub carbs_g: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fat_g: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sodium_mg: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sugar_g: Option<f64>,
}

impl Macros {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MealItem {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub portion: Option<String>,
    #[serde(flatten)]
    pub macros: Macros,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MealRecord {
    pub id: String,
    pub uid: String,
    pub timestamp: DateTime<Utc>,
    pub meal_type: String,
    pub raw_text: String,
    pub items: Vec<MealItem>,
    pub totals: Macros,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blurb: Option<String>,
}

impl MealRecord {
    /// Text used for retrieval and listings.
    #[must_use]
    pub fn display_text(&self) -> &str {
        self.blurb.as_deref().unwrap_or(&self.raw_text)
    }
}

#[derive(Debug, Clone)]
pub struct NewMeal {
    pub uid: String,
    pub timestamp: DateTime<Utc>,
    pub meal_type: String,
    pub raw_text: String,
    pub items: Vec<MealItem>,
    pub totals: Macros,
    pub blurb: Option<String>,
    pub embedding: Option<Vec<f32>>,
}

// --- Preferences & profile ---

macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
        pub enum $name {
            #[default]
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub const ALL: &'static [&'static str] = &[$($text),+];

            #[must_use]
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = anyhow::Error;

            fn from_str(s: &str) -> Result<Self> {
                match s.trim().to_lowercase().as_str() {
                    $($text => Ok(Self::$variant),)+
                    other => bail!(
                        "Invalid {} '{other}'. Must be one of: {}",
                        stringify!($name),
                        Self::ALL.join(", ")
                    ),
                }
            }
        }
    };
}

text_enum!(
    /// Where nudges are delivered.
    NudgeChannel { Telegram => "telegram", InApp => "inapp", Email => "email", Disabled => "none" }
);
text_enum!(NudgeCadence { Smart => "smart", Frequent => "frequent", Sparse => "sparse", Off => "off" });
text_enum!(NudgeTone { Gentle => "gentle", Direct => "direct", Cheerful => "cheerful", Clinical => "clinical" });

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preferences {
    pub uid: String,
    pub timezone: String,
    pub daily_calorie_goal: f64,
    pub daily_step_goal: f64,
    pub daily_water_ml: f64,
    pub protein_target_g: f64,
    pub sleep_goal_min: f64,
    pub nudge_channel: NudgeChannel,
    pub nudge_cadence: NudgeCadence,
    pub nudge_tone: NudgeTone,
    pub quiet_start: NaiveTime,
    pub quiet_end: NaiveTime,
    pub remind_hydration: bool,
    pub remind_steps: bool,
    pub remind_sleep: bool,
}

impl Preferences {
    #[must_use]
    pub fn defaults(uid: &str) -> Self {
        Self {
            uid: uid.to_string(),
            timezone: DEFAULT_TIMEZONE.to_string(),
            daily_calorie_goal: 2000.0,
            daily_step_goal: 8000.0,
            daily_water_ml: 2000.0,
            protein_target_g: 80.0,
            sleep_goal_min: 420.0,
            nudge_channel: NudgeChannel::Telegram,
            nudge_cadence: NudgeCadence::Smart,
            nudge_tone: NudgeTone::Gentle,
            quiet_start: NaiveTime::from_hms_opt(22, 0, 0).unwrap_or_default(),
            quiet_end: NaiveTime::from_hms_opt(7, 0, 0).unwrap_or_default(),
            remind_hydration: true,
            remind_steps: true,
            remind_sleep: false,
        }
    }

    /// Quiet hours may wrap midnight (22:00 → 07:00). Equal bounds mean no quiet window.
    #[must_use]
    pub fn in_quiet_hours(&self, local: NaiveTime) -> bool {
        let (start, end) = (self.quiet_start, self.quiet_end);
        if start == end {
            false
        } else if start < end {
            local >= start && local < end
        } else {
            local >= start || local < end
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height_cm: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight_kg: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity_level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goals: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub medications: Option<String>,
}

impl Profile {
    #[must_use]
    pub fn empty(uid: &str) -> Self {
        Self {
            uid: uid.to_string(),
            ..Self::default()
        }
    }
}

/// Partial preference change; absent fields keep their stored value.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PreferencesUpdate {
    pub timezone: Option<String>,
    pub daily_calorie_goal: Option<f64>,
    pub daily_step_goal: Option<f64>,
    pub daily_water_ml: Option<f64>,
    pub protein_target_g: Option<f64>,
    pub sleep_goal_min: Option<f64>,
    pub nudge_channel: Option<NudgeChannel>,
    pub nudge_cadence: Option<NudgeCadence>,
    pub nudge_tone: Option<NudgeTone>,
    pub quiet_start: Option<NaiveTime>,
    pub quiet_end: Option<NaiveTime>,
    pub remind_hydration: Option<bool>,
    pub remind_steps: Option<bool>,
    pub remind_sleep: Option<bool>,
}

impl PreferencesUpdate {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.timezone.is_none()
            && self.daily_calorie_goal.is_none()
            && self.daily_step_goal.is_none()
            && self.daily_water_ml.is_none()
            && self.protein_target_g.is_none()
            && self.sleep_goal_min.is_none()
            && self.nudge_channel.is_none()
            && self.nudge_cadence.is_none()
            && self.nudge_tone.is_none()
            && self.quiet_start.is_none()
            && self.quiet_end.is_none()
            && self.remind_hydration.is_none()
            && self.remind_steps.is_none()
            && self.remind_sleep.is_none()
    }

    #[must_use]
    pub fn apply(self, mut prefs: Preferences) -> Preferences {
        if let Some(tz) = self.timezone {
            prefs.timezone = tz.trim().to_string();
        }
        prefs.daily_calorie_goal = self.daily_calorie_goal.unwrap_or(prefs.daily_calorie_goal);
        prefs.daily_step_goal = self.daily_step_goal.unwrap_or(prefs.daily_step_goal);
        prefs.daily_water_ml = self.daily_water_ml.unwrap_or(prefs.daily_water_ml);
        prefs.protein_target_g = self.protein_target_g.unwrap_or(prefs.protein_target_g);
        prefs.sleep_goal_min = self.sleep_goal_min.unwrap_or(prefs.sleep_goal_min);
        prefs.nudge_channel = self.nudge_channel.unwrap_or(prefs.nudge_channel);
        prefs.nudge_cadence = self.nudge_cadence.unwrap_or(prefs.nudge_cadence);
        prefs.nudge_tone = self.nudge_tone.unwrap_or(prefs.nudge_tone);
        prefs.quiet_start = self.quiet_start.unwrap_or(prefs.quiet_start);
        prefs.quiet_end = self.quiet_end.unwrap_or(prefs.quiet_end);
        prefs.remind_hydration = self.remind_hydration.unwrap_or(prefs.remind_hydration);
        prefs.remind_steps = self.remind_steps.unwrap_or(prefs.remind_steps);
        prefs.remind_sleep = self.remind_sleep.unwrap_or(prefs.remind_sleep);
        prefs
    }
}

/// Partial profile change. Blank strings clear a text field.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProfileUpdate {
    pub full_name: Option<String>,
    pub age: Option<u32>,
    pub height_cm: Option<f64>,
    pub weight_kg: Option<f64>,
    pub gender: Option<String>,
    pub activity_level: Option<String>,
    pub goals: Option<String>,
    pub conditions: Option<String>,
    pub medications: Option<String>,
}

fn merge_text(current: Option<String>, update: Option<String>) -> Option<String> {
    match update {
        Some(s) if s.trim().is_empty() => None,
        Some(s) => Some(s.trim().to_string()),
        None => current,
    }
}

impl ProfileUpdate {
    #[must_use]
    pub fn apply(self, profile: Profile) -> Profile {
        Profile {
            uid: profile.uid,
            full_name: merge_text(profile.full_name, self.full_name),
            age: self.age.or(profile.age),
            height_cm: self.height_cm.or(profile.height_cm),
            weight_kg: self.weight_kg.or(profile.weight_kg),
            gender: merge_text(profile.gender, self.gender),
            activity_level: merge_text(profile.activity_level, self.activity_level),
            goals: merge_text(profile.goals, self.goals),
            conditions: merge_text(profile.conditions, self.conditions),
            medications: merge_text(profile.medications, self.medications),
        }
    }
}

// --- Derived day rows ---

/// One local day of reduced signals. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyAggregate {
    pub day: NaiveDate,
    #[serde(flatten)]
    pub values: MetricValues,
}

// --- Badges ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Badge {
    pub uid: String,
    pub code: String,
    pub earned_on: NaiveDate,
}

// --- Conversation, journal, nudges ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

impl ChatRole {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "assistant" | "bot" => Some(Self::Assistant),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewChatTurn {
    pub uid: String,
    pub role: ChatRole,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub embedding: Option<Vec<f32>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub id: String,
    pub uid: String,
    pub timestamp: DateTime<Utc>,
    pub text: String,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct NewJournalEntry {
    pub uid: String,
    pub timestamp: DateTime<Utc>,
    pub text: String,
    pub tags: Vec<String>,
    pub embedding: Option<Vec<f32>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NudgeRecord {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

// --- Retrieval ---

/// Which free-text store a context item came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Chat,
    Journal,
    Meal,
}

impl ContentKind {
    pub const ALL: [ContentKind; 3] = [Self::Chat, Self::Journal, Self::Meal];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Journal => "journal",
            Self::Meal => "meal",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextItem {
    pub text: String,
    pub kind: ContentKind,
    /// `None` for items returned by the recency fallback.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f32>,
    pub timestamp: DateTime<Utc>,
}

// --- Validation ---

/// Normalise a meal type; "snack" is accepted for "snacks".
pub fn validate_meal_type(meal: &str) -> Result<String> {
    let lower = meal.trim().to_lowercase();
    let lower = if lower == "snack" {
        "snacks".to_string()
    } else {
        lower
    };
    if MEAL_TYPES.contains(&lower.as_str()) {
        Ok(lower)
    } else {
        bail!(
            "Invalid meal type '{meal}'. Must be one of: {}",
            MEAL_TYPES.join(", ")
        )
    }
}

pub fn validate_source(source: &str) -> Result<String> {
    let lower = source.trim().to_lowercase();
    if METRIC_SOURCES.contains(&lower.as_str()) {
        Ok(lower)
    } else {
        bail!(
            "Invalid source '{source}'. Must be one of: {}",
            METRIC_SOURCES.join(", ")
        )
    }
}

pub fn validate_metric_values(values: &MetricValues) -> Result<()> {
    for field in MetricField::ALL {
        let Some(v) = values.get(field) else {
            continue;
        };
        if !v.is_finite() {
            bail!("{field} must be a finite number");
        }
        if field.is_scale() {
            if !(1.0..=5.0).contains(&v) {
                bail!("{field} must be between 1 and 5 (got {v})");
            }
        } else if v < 0.0 {
            bail!("{field} must not be negative");
        }
    }
    if values.sleep_minutes.is_some_and(|v| v > 24.0 * 60.0) {
        bail!("sleep_minutes cannot exceed a full day");
    }
    if values.heart_rate.is_some_and(|v| v > 250.0) {
        bail!("heart_rate must be at most 250 bpm");
    }
    Ok(())
}

pub fn validate_timezone(tz: &str) -> Result<()> {
    if tz.parse::<chrono_tz::Tz>().is_err() {
        bail!("Unknown time zone '{tz}'. Use an IANA name such as Europe/Berlin");
    }
    Ok(())
}

pub fn validate_preferences(prefs: &Preferences) -> Result<()> {
    validate_timezone(&prefs.timezone)?;
    let ranges = [
        ("daily_calorie_goal", prefs.daily_calorie_goal, 0.0, 10_000.0),
        ("daily_step_goal", prefs.daily_step_goal, 0.0, 100_000.0),
        ("daily_water_ml", prefs.daily_water_ml, 0.0, 10_000.0),
        ("protein_target_g", prefs.protein_target_g, 0.0, 500.0),
        ("sleep_goal_min", prefs.sleep_goal_min, 0.0, 24.0 * 60.0),
    ];
    for (name, value, min, max) in ranges {
        if !value.is_finite() || value < min || value > max {
            bail!("{name} must be between {min} and {max} (got {value})");
        }
    }
    Ok(())
}

pub fn validate_profile(profile: &Profile) -> Result<()> {
    if profile.age.is_some_and(|a| a > 120) {
        bail!("age must be at most 120");
    }
    if profile
        .height_cm
        .is_some_and(|h| !h.is_finite() || h <= 0.0 || h > 300.0)
    {
        bail!("height_cm must be between 0 and 300");
    }
    if profile
        .weight_kg
        .is_some_and(|w| !w.is_finite() || w <= 0.0 || w > 500.0)
    {
        bail!("weight_kg must be between 0 and 500");
    }
    Ok(())
}
