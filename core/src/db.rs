use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveTime, SecondsFormat, Utc};
use rusqlite::types::{Type, Value, ValueRef};
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use uuid::Uuid;

use crate::error::StoreError;
use crate::llm::cosine_similarity;
use crate::models::{
    Badge, ChatRole, ChatTurn, ContentKind, ContextItem, JournalEntry, Macros, MealItem,
    MealRecord, MetricField, MetricRecord, MetricValues, NewChatTurn, NewJournalEntry, NewMeal,
    NewMetricLog, NudgeRecord, Preferences, Profile,
};
use crate::store::{HealthStore, SimilaritySearch};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

type StoreResult<T> = std::result::Result<T, StoreError>;

pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))
            .context("Failed to enable WAL journal")?;
        let db = Database { conn };
        db.configure()?;
        db.migrate()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Database { conn };
        db.configure()?;
        db.migrate()?;
        Ok(db)
    }

    fn configure(&self) -> Result<()> {
        self.conn.busy_timeout(BUSY_TIMEOUT)?;
        self.conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(())
    }

    fn migrate(&self) -> Result<()> {
        let version: i64 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))?;

        if version < 1 {
            self.conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS preferences (
                    uid TEXT PRIMARY KEY,
                    tz TEXT,
                    daily_calorie_goal REAL,
                    daily_step_goal REAL,
                    daily_water_ml REAL,
                    protein_target_g REAL,
                    sleep_goal_min REAL,
                    nudge_channel TEXT,
                    nudge_cadence TEXT,
                    nudge_tone TEXT,
                    quiet_start TEXT,
                    quiet_end TEXT,
                    remind_hydration INTEGER,
                    remind_steps INTEGER,
                    remind_sleep INTEGER,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS profiles (
                    uid TEXT PRIMARY KEY,
                    full_name TEXT,
                    age INTEGER,
                    height_cm REAL,
                    weight_kg REAL,
                    gender TEXT,
                    activity_level TEXT,
                    goals TEXT,
                    conditions TEXT,
                    medications TEXT,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS metrics (
                    id TEXT PRIMARY KEY,
                    uid TEXT NOT NULL,
                    source TEXT NOT NULL,
                    log_date TEXT NOT NULL,
                    ts TEXT NOT NULL,
                    steps REAL,
                    sleep_minutes REAL,
                    heart_rate REAL,
                    water_ml REAL,
                    mood REAL,
                    stress_level REAL,
                    anxiety_level REAL,
                    focus_level REAL,
                    energy_level REAL,
                    pain_level REAL,
                    calories REAL,
                    notes TEXT,
                    UNIQUE (uid, source, log_date)
                );

                CREATE TABLE IF NOT EXISTS meals (
                    id TEXT PRIMARY KEY,
                    uid TEXT NOT NULL,
                    ts TEXT NOT NULL,
                    meal_type TEXT NOT NULL,
                    raw_text TEXT NOT NULL,
                    items_json TEXT NOT NULL DEFAULT '[]',
                    calories REAL,
                    protein_g REAL,
                    carbs_g REAL,
                    fat_g REAL,
                    sodium_mg REAL,
                    sugar_g REAL,
                    blurb TEXT,
                    embedding TEXT
                );

                CREATE TABLE IF NOT EXISTS badges (
                    uid TEXT NOT NULL,
                    code TEXT NOT NULL,
                    earned_on TEXT NOT NULL,
                    PRIMARY KEY (uid, code)
                );

                CREATE TABLE IF NOT EXISTS chat_history (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    uid TEXT NOT NULL,
                    role TEXT NOT NULL,
                    text TEXT NOT NULL,
                    ts TEXT NOT NULL,
                    embedding TEXT
                );

                CREATE TABLE IF NOT EXISTS journal_entries (
                    id TEXT PRIMARY KEY,
                    uid TEXT NOT NULL,
                    ts TEXT NOT NULL,
                    text TEXT NOT NULL,
                    tags_json TEXT NOT NULL DEFAULT '[]',
                    embedding TEXT
                );

                CREATE TABLE IF NOT EXISTS nudges_log (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    uid TEXT NOT NULL,
                    ts TEXT NOT NULL,
                    message TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS user_summaries (
                    uid TEXT PRIMARY KEY,
                    summary TEXT NOT NULL,
                    embedding TEXT,
                    updated_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_metrics_uid_ts ON metrics(uid, ts);
                CREATE INDEX IF NOT EXISTS idx_meals_uid_ts ON meals(uid, ts);
                CREATE INDEX IF NOT EXISTS idx_chat_uid ON chat_history(uid, id);
                CREATE INDEX IF NOT EXISTS idx_journal_uid_ts ON journal_entries(uid, ts);
                CREATE INDEX IF NOT EXISTS idx_nudges_uid ON nudges_log(uid, id);

                PRAGMA user_version = 1;",
            )?;
        }

        Ok(())
    }

    /// Most recent journal entries, newest first.
    #[cfg(test)]
    pub(crate) fn journal_entries(&self, uid: &str, limit: usize) -> StoreResult<Vec<JournalEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, uid, ts, text, tags_json FROM journal_entries
             WHERE uid = ?1 ORDER BY ts DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![uid, limit_param(limit)], journal_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn metric_by_key(&self, uid: &str, source: &str, log_date: NaiveDate) -> StoreResult<MetricRecord> {
        let sql = format!(
            "SELECT {} FROM metrics WHERE uid = ?1 AND source = ?2 AND log_date = ?3",
            metric_select_columns()
        );
        let record = self
            .conn
            .query_row(&sql, params![uid, source, date_str(log_date)], metric_from_row)
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("metrics for {log_date}")))?;
        Ok(record)
    }

    fn meal_by_id(&self, id: &str) -> StoreResult<MealRecord> {
        let sql = format!("SELECT {MEAL_COLUMNS} FROM meals WHERE id = ?1");
        self.conn
            .query_row(&sql, params![id], meal_from_row)
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("meal {id}")))
    }
}

// --- Column helpers ---

const MEAL_COLUMNS: &str = "id, uid, ts, meal_type, raw_text, items_json, calories, protein_g, carbs_g, fat_g, sodium_mg, sugar_g, blurb";

fn metric_select_columns() -> String {
    let values: Vec<&str> = MetricField::ALL.iter().map(|f| f.column()).collect();
    format!("id, uid, ts, log_date, source, {}, notes", values.join(", "))
}

fn ts_str(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn date_str(d: NaiveDate) -> String {
    d.format("%Y-%m-%d").to_string()
}

fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn conversion_error(idx: usize, err: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn ts_at(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn date_at(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<NaiveDate> {
    let raw: String = row.get(idx)?;
    NaiveDate::parse_from_str(&raw, "%Y-%m-%d").map_err(|e| conversion_error(idx, e))
}

/// Read a numeric column leniently. Non-numeric text, blobs and non-finite
/// values are treated as absent.
fn num_at(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<Option<f64>> {
    #[allow(clippy::cast_precision_loss)]
    let value = match row.get_ref(idx)? {
        ValueRef::Integer(i) => Some(i as f64),
        ValueRef::Real(f) => Some(f),
        ValueRef::Text(bytes) => std::str::from_utf8(bytes)
            .ok()
            .and_then(|s| s.trim().parse::<f64>().ok()),
        ValueRef::Null | ValueRef::Blob(_) => None,
    };
    Ok(value.filter(|v| v.is_finite()))
}

fn opt_value(v: Option<f64>) -> Value {
    v.map_or(Value::Null, Value::Real)
}

fn opt_text(v: Option<&str>) -> Value {
    v.map_or(Value::Null, |s| Value::Text(s.to_string()))
}

fn embedding_json(embedding: Option<&[f32]>) -> StoreResult<Option<String>> {
    embedding
        .filter(|e| !e.is_empty())
        .map(serde_json::to_string)
        .transpose()
        .map_err(StoreError::from)
}

fn time_or(raw: Option<String>, fallback: NaiveTime) -> NaiveTime {
    raw.and_then(|s| {
        NaiveTime::parse_from_str(&s, "%H:%M:%S")
            .or_else(|_| NaiveTime::parse_from_str(&s, "%H:%M"))
            .ok()
    })
    .unwrap_or(fallback)
}

// --- Row mappers ---

fn metric_from_row(row: &rusqlite::Row) -> rusqlite::Result<MetricRecord> {
    let mut values = MetricValues::default();
    for (i, field) in MetricField::ALL.iter().enumerate() {
        values.set(*field, num_at(row, 5 + i)?);
    }
    Ok(MetricRecord {
        id: row.get(0)?,
        uid: row.get(1)?,
        timestamp: ts_at(row, 2)?,
        log_date: date_at(row, 3)?,
        source: row.get(4)?,
        values,
        notes: row.get(5 + MetricField::ALL.len())?,
    })
}

fn meal_from_row(row: &rusqlite::Row) -> rusqlite::Result<MealRecord> {
    let items_json: String = row.get(5)?;
    let items: Vec<MealItem> = serde_json::from_str(&items_json).unwrap_or_default();
    Ok(MealRecord {
        id: row.get(0)?,
        uid: row.get(1)?,
        timestamp: ts_at(row, 2)?,
        meal_type: row.get(3)?,
        raw_text: row.get(4)?,
        items,
        totals: Macros {
            calories: num_at(row, 6)?,
            protein_g: num_at(row, 7)?,
            carbs_g: num_at(row, 8)?,
            fat_g: num_at(row, 9)?,
            sodium_mg: num_at(row, 10)?,
            sugar_g: num_at(row, 11)?,
        },
        blurb: row.get(12)?,
    })
}

#[cfg(test)]
fn journal_from_row(row: &rusqlite::Row) -> rusqlite::Result<JournalEntry> {
    let tags_json: String = row.get(4)?;
    Ok(JournalEntry {
        id: row.get(0)?,
        uid: row.get(1)?,
        timestamp: ts_at(row, 2)?,
        text: row.get(3)?,
        tags: serde_json::from_str(&tags_json).unwrap_or_default(),
    })
}

fn preferences_from_row(row: &rusqlite::Row) -> rusqlite::Result<Preferences> {
    let uid: String = row.get(0)?;
    let d = Preferences::defaults(&uid);
    let tz: Option<String> = row.get(1)?;
    let parse_or = |idx: usize| -> rusqlite::Result<Option<String>> { row.get(idx) };
    Ok(Preferences {
        timezone: tz.filter(|t| !t.trim().is_empty()).unwrap_or(d.timezone),
        daily_calorie_goal: num_at(row, 2)?.unwrap_or(d.daily_calorie_goal),
        daily_step_goal: num_at(row, 3)?.unwrap_or(d.daily_step_goal),
        daily_water_ml: num_at(row, 4)?.unwrap_or(d.daily_water_ml),
        protein_target_g: num_at(row, 5)?.unwrap_or(d.protein_target_g),
        sleep_goal_min: num_at(row, 6)?.unwrap_or(d.sleep_goal_min),
        nudge_channel: parse_or(7)?
            .and_then(|s| s.parse().ok())
            .unwrap_or(d.nudge_channel),
        nudge_cadence: parse_or(8)?
            .and_then(|s| s.parse().ok())
            .unwrap_or(d.nudge_cadence),
        nudge_tone: parse_or(9)?
            .and_then(|s| s.parse().ok())
            .unwrap_or(d.nudge_tone),
        quiet_start: time_or(row.get(10)?, d.quiet_start),
        quiet_end: time_or(row.get(11)?, d.quiet_end),
        remind_hydration: row.get::<_, Option<bool>>(12)?.unwrap_or(d.remind_hydration),
        remind_steps: row.get::<_, Option<bool>>(13)?.unwrap_or(d.remind_steps),
        remind_sleep: row.get::<_, Option<bool>>(14)?.unwrap_or(d.remind_sleep),
        uid,
    })
}

fn profile_from_row(row: &rusqlite::Row) -> rusqlite::Result<Profile> {
    Ok(Profile {
        uid: row.get(0)?,
        full_name: row.get(1)?,
        age: num_at(row, 2)?
            .filter(|a| *a >= 0.0)
            .map(|a| a.round() as u32),
        height_cm: num_at(row, 3)?,
        weight_kg: num_at(row, 4)?,
        gender: row.get(5)?,
        activity_level: row.get(6)?,
        goals: row.get(7)?,
        conditions: row.get(8)?,
        medications: row.get(9)?,
    })
}

fn context_from_row(kind: ContentKind) -> impl Fn(&rusqlite::Row) -> rusqlite::Result<ContextItem> {
    move |row| {
        Ok(ContextItem {
            text: row.get(0)?,
            kind,
            similarity: None,
            timestamp: ts_at(row, 1)?,
        })
    }
}

/// `(text expression, table)` for a content kind. Meals surface their blurb.
fn content_source(kind: ContentKind) -> (&'static str, &'static str) {
    match kind {
        ContentKind::Chat => ("text", "chat_history"),
        ContentKind::Journal => ("text", "journal_entries"),
        ContentKind::Meal => ("COALESCE(blurb, raw_text)", "meals"),
    }
}

// --- HealthStore ---

impl HealthStore for Database {
    fn preferences(&self, uid: &str) -> StoreResult<Option<Preferences>> {
        let prefs = self
            .conn
            .query_row(
                "SELECT uid, tz, daily_calorie_goal, daily_step_goal, daily_water_ml,
                        protein_target_g, sleep_goal_min, nudge_channel, nudge_cadence,
                        nudge_tone, quiet_start, quiet_end, remind_hydration, remind_steps,
                        remind_sleep
                 FROM preferences WHERE uid = ?1",
                params![uid],
                preferences_from_row,
            )
            .optional()?;
        Ok(prefs)
    }

    fn save_preferences(&self, prefs: &Preferences) -> StoreResult<()> {
        self.conn.execute(
            "INSERT INTO preferences (uid, tz, daily_calorie_goal, daily_step_goal, daily_water_ml,
                protein_target_g, sleep_goal_min, nudge_channel, nudge_cadence, nudge_tone,
                quiet_start, quiet_end, remind_hydration, remind_steps, remind_sleep, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
             ON CONFLICT(uid) DO UPDATE SET
                tz = excluded.tz,
                daily_calorie_goal = excluded.daily_calorie_goal,
                daily_step_goal = excluded.daily_step_goal,
                daily_water_ml = excluded.daily_water_ml,
                protein_target_g = excluded.protein_target_g,
                sleep_goal_min = excluded.sleep_goal_min,
                nudge_channel = excluded.nudge_channel,
                nudge_cadence = excluded.nudge_cadence,
                nudge_tone = excluded.nudge_tone,
                quiet_start = excluded.quiet_start,
                quiet_end = excluded.quiet_end,
                remind_hydration = excluded.remind_hydration,
                remind_steps = excluded.remind_steps,
                remind_sleep = excluded.remind_sleep,
                updated_at = excluded.updated_at",
            params![
                prefs.uid,
                prefs.timezone,
                prefs.daily_calorie_goal,
                prefs.daily_step_goal,
                prefs.daily_water_ml,
                prefs.protein_target_g,
                prefs.sleep_goal_min,
                prefs.nudge_channel.as_str(),
                prefs.nudge_cadence.as_str(),
                prefs.nudge_tone.as_str(),
                prefs.quiet_start.format("%H:%M:%S").to_string(),
                prefs.quiet_end.format("%H:%M:%S").to_string(),
                prefs.remind_hydration,
                prefs.remind_steps,
                prefs.remind_sleep,
                ts_str(Utc::now()),
            ],
        )?;
        Ok(())
    }

    fn profile(&self, uid: &str) -> StoreResult<Option<Profile>> {
        let profile = self
            .conn
            .query_row(
                "SELECT uid, full_name, age, height_cm, weight_kg, gender, activity_level,
                        goals, conditions, medications
                 FROM profiles WHERE uid = ?1",
                params![uid],
                profile_from_row,
            )
            .optional()?;
        Ok(profile)
    }

    fn save_profile(&self, profile: &Profile) -> StoreResult<()> {
        self.conn.execute(
            "INSERT INTO profiles (uid, full_name, age, height_cm, weight_kg, gender,
                activity_level, goals, conditions, medications, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(uid) DO UPDATE SET
                full_name = excluded.full_name,
                age = excluded.age,
                height_cm = excluded.height_cm,
                weight_kg = excluded.weight_kg,
                gender = excluded.gender,
                activity_level = excluded.activity_level,
                goals = excluded.goals,
                conditions = excluded.conditions,
                medications = excluded.medications,
                updated_at = excluded.updated_at",
            params![
                profile.uid,
                profile.full_name,
                profile.age,
                profile.height_cm,
                profile.weight_kg,
                profile.gender,
                profile.activity_level,
                profile.goals,
                profile.conditions,
                profile.medications,
                ts_str(Utc::now()),
            ],
        )?;
        Ok(())
    }

    fn upsert_metrics(&self, log: &NewMetricLog) -> StoreResult<MetricRecord> {
        let columns: Vec<&str> = MetricField::ALL.iter().map(|f| f.column()).collect();
        let placeholders: Vec<String> = (6..6 + columns.len()).map(|i| format!("?{i}")).collect();
        let notes_idx = 6 + columns.len();
        let updates: Vec<String> = columns
            .iter()
            .map(|c| format!("{c} = COALESCE(excluded.{c}, metrics.{c})"))
            .collect();
        let sql = format!(
            "INSERT INTO metrics (id, uid, source, log_date, ts, {cols}, notes)
             VALUES (?1, ?2, ?3, ?4, ?5, {ph}, ?{notes_idx})
             ON CONFLICT(uid, source, log_date) DO UPDATE SET
                ts = excluded.ts,
                {updates},
                notes = COALESCE(excluded.notes, metrics.notes)",
            cols = columns.join(", "),
            ph = placeholders.join(", "),
            updates = updates.join(",\n                "),
        );

        let mut values: Vec<Value> = vec![
            Value::Text(Uuid::new_v4().to_string()),
            Value::Text(log.uid.clone()),
            Value::Text(log.source.clone()),
            Value::Text(date_str(log.log_date)),
            Value::Text(ts_str(log.timestamp)),
        ];
        values.extend(MetricField::ALL.iter().map(|f| opt_value(log.values.get(*f))));
        values.push(opt_text(log.notes.as_deref()));

        self.conn.execute(&sql, params_from_iter(values))?;
        self.metric_by_key(&log.uid, &log.source, log.log_date)
    }

    fn metrics_between(
        &self,
        uid: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<MetricRecord>> {
        let sql = format!(
            "SELECT {} FROM metrics WHERE uid = ?1 AND ts >= ?2 AND ts < ?3 ORDER BY ts",
            metric_select_columns()
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![uid, ts_str(start), ts_str(end)], metric_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn insert_meal(&self, meal: &NewMeal) -> StoreResult<MealRecord> {
        let id = Uuid::new_v4().to_string();
        let items_json = serde_json::to_string(&meal.items)?;
        let embedding = embedding_json(meal.embedding.as_deref())?;
        self.conn.execute(
            "INSERT INTO meals (id, uid, ts, meal_type, raw_text, items_json, calories,
                protein_g, carbs_g, fat_g, sodium_mg, sugar_g, blurb, embedding)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                id,
                meal.uid,
                ts_str(meal.timestamp),
                meal.meal_type,
                meal.raw_text,
                items_json,
                meal.totals.calories,
                meal.totals.protein_g,
                meal.totals.carbs_g,
                meal.totals.fat_g,
                meal.totals.sodium_mg,
                meal.totals.sugar_g,
                meal.blurb,
                embedding,
            ],
        )?;
        self.meal_by_id(&id)
    }

    fn meals_between(
        &self,
        uid: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<MealRecord>> {
        let sql = format!(
            "SELECT {MEAL_COLUMNS} FROM meals WHERE uid = ?1 AND ts >= ?2 AND ts < ?3 ORDER BY ts"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![uid, ts_str(start), ts_str(end)], meal_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn upsert_badge(&self, uid: &str, code: &str, earned_on: NaiveDate) -> StoreResult<bool> {
        let changed = self.conn.execute(
            "INSERT INTO badges (uid, code, earned_on) VALUES (?1, ?2, ?3)
             ON CONFLICT(uid, code) DO NOTHING",
            params![uid, code, date_str(earned_on)],
        )?;
        Ok(changed > 0)
    }

    fn badges(&self, uid: &str) -> StoreResult<Vec<Badge>> {
        let mut stmt = self.conn.prepare(
            "SELECT uid, code, earned_on FROM badges WHERE uid = ?1 ORDER BY earned_on, code",
        )?;
        let rows = stmt
            .query_map(params![uid], |row| {
                Ok(Badge {
                    uid: row.get(0)?,
                    code: row.get(1)?,
                    earned_on: date_at(row, 2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn insert_chat(&self, turn: &NewChatTurn) -> StoreResult<()> {
        let embedding = embedding_json(turn.embedding.as_deref())?;
        self.conn.execute(
            "INSERT INTO chat_history (uid, role, text, ts, embedding) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                turn.uid,
                turn.role.as_str(),
                turn.text,
                ts_str(turn.timestamp),
                embedding
            ],
        )?;
        Ok(())
    }

    fn chat_history(&self, uid: &str, limit: usize) -> StoreResult<Vec<ChatTurn>> {
        let mut stmt = self.conn.prepare(
            "SELECT role, text, ts FROM chat_history WHERE uid = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let mut turns = stmt
            .query_map(params![uid, limit_param(limit)], |row| {
                let role: String = row.get(0)?;
                Ok((role, row.get::<_, String>(1)?, ts_at(row, 2)?))
            })?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .filter_map(|(role, text, timestamp)| {
                ChatRole::parse(&role).map(|role| ChatTurn {
                    role,
                    text,
                    timestamp,
                })
            })
            .collect::<Vec<_>>();
        turns.reverse();
        Ok(turns)
    }

    fn insert_journal(&self, entry: &NewJournalEntry) -> StoreResult<JournalEntry> {
        let id = Uuid::new_v4().to_string();
        let tags_json = serde_json::to_string(&entry.tags)?;
        let embedding = embedding_json(entry.embedding.as_deref())?;
        self.conn.execute(
            "INSERT INTO journal_entries (id, uid, ts, text, tags_json, embedding)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![id, entry.uid, ts_str(entry.timestamp), entry.text, tags_json, embedding],
        )?;
        Ok(JournalEntry {
            id,
            uid: entry.uid.clone(),
            timestamp: entry.timestamp,
            text: entry.text.clone(),
            tags: entry.tags.clone(),
        })
    }

    fn insert_nudge(&self, uid: &str, message: &str, at: DateTime<Utc>) -> StoreResult<()> {
        self.conn.execute(
            "INSERT INTO nudges_log (uid, ts, message) VALUES (?1, ?2, ?3)",
            params![uid, ts_str(at), message],
        )?;
        Ok(())
    }

    fn recent_nudges(&self, uid: &str, limit: usize) -> StoreResult<Vec<NudgeRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT ts, message FROM nudges_log WHERE uid = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![uid, limit_param(limit)], |row| {
                Ok(NudgeRecord {
                    timestamp: ts_at(row, 0)?,
                    message: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn user_summary(&self, uid: &str) -> StoreResult<Option<String>> {
        let summary: Option<String> = self
            .conn
            .query_row(
                "SELECT summary FROM user_summaries WHERE uid = ?1",
                params![uid],
                |row| row.get(0),
            )
            .optional()?;
        Ok(summary.filter(|s| !s.trim().is_empty()))
    }

    fn save_user_summary(
        &self,
        uid: &str,
        summary: &str,
        embedding: Option<&[f32]>,
    ) -> StoreResult<()> {
        let embedding = embedding_json(embedding)?;
        self.conn.execute(
            "INSERT INTO user_summaries (uid, summary, embedding, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(uid) DO UPDATE SET
                summary = excluded.summary,
                embedding = excluded.embedding,
                updated_at = excluded.updated_at",
            params![uid, summary, embedding, ts_str(Utc::now())],
        )?;
        Ok(())
    }

    fn recent_context(&self, uid: &str, kind: ContentKind, k: usize) -> StoreResult<Vec<ContextItem>> {
        let (text, table) = content_source(kind);
        let sql = format!("SELECT {text}, ts FROM {table} WHERE uid = ?1 ORDER BY ts DESC LIMIT ?2");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![uid, limit_param(k)], context_from_row(kind))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

// --- SimilaritySearch ---

impl SimilaritySearch for Database {
    /// Brute-force cosine ranking over every stored embedding for the user.
    fn search(
        &self,
        uid: &str,
        kind: ContentKind,
        query: &[f32],
        k: usize,
    ) -> StoreResult<Vec<ContextItem>> {
        let (text, table) = content_source(kind);
        let sql = format!(
            "SELECT {text}, ts, embedding FROM {table} WHERE uid = ?1 AND embedding IS NOT NULL"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![uid], |row| {
                let item = context_from_row(kind)(row)?;
                let embedding: String = row.get(2)?;
                Ok((item, embedding))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut scored: Vec<ContextItem> = rows
            .into_iter()
            .filter_map(|(mut item, raw)| {
                let vector: Vec<f32> = serde_json::from_str(&raw).ok()?;
                if vector.len() != query.len() {
                    return None;
                }
                item.similarity = Some(cosine_similarity(query, &vector));
                Some(item)
            })
            .collect();

        scored.sort_by(|a, b| {
            let sa = a.similarity.unwrap_or(f32::MIN);
            let sb = b.similarity.unwrap_or(f32::MIN);
            sb.total_cmp(&sa).then_with(|| b.timestamp.cmp(&a.timestamp))
        });
        scored.truncate(k);
        Ok(scored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, h, 0, 0).unwrap()
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()
    }

    fn metric_log(values: MetricValues, ts: DateTime<Utc>) -> NewMetricLog {
        NewMetricLog {
            uid: "u1".to_string(),
            source: "manual".to_string(),
            log_date: day(),
            timestamp: ts,
            values,
            notes: None,
        }
    }

    fn sample_meal(raw: &str, calories: Option<f64>, ts: DateTime<Utc>) -> NewMeal {
        NewMeal {
            uid: "u1".to_string(),
            timestamp: ts,
            meal_type: "lunch".to_string(),
            raw_text: raw.to_string(),
            items: vec![],
            totals: Macros {
                calories,
                ..Macros::default()
            },
            blurb: None,
            embedding: None,
        }
    }

    #[test]
    fn test_preferences_roundtrip_and_defaults() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.preferences("u1").unwrap().is_none());

        let mut prefs = Preferences::defaults("u1");
        prefs.timezone = "Europe/Berlin".to_string();
        prefs.daily_step_goal = 10_000.0;
        prefs.quiet_start = NaiveTime::from_hms_opt(21, 30, 0).unwrap();
        db.save_preferences(&prefs).unwrap();

        let loaded = db.preferences("u1").unwrap().unwrap();
        assert_eq!(loaded, prefs);
    }

    #[test]
    fn test_preferences_with_null_columns_use_defaults() {
        let db = Database::open_in_memory().unwrap();
        db.conn
            .execute(
                "INSERT INTO preferences (uid, nudge_cadence, updated_at) VALUES ('u1', 'weird', 'x')",
                [],
            )
            .unwrap();
        let loaded = db.preferences("u1").unwrap().unwrap();
        assert_eq!(loaded, Preferences::defaults("u1"));
    }

    #[test]
    fn test_profile_roundtrip() {
        let db = Database::open_in_memory().unwrap();
        let profile = Profile {
            uid: "u1".to_string(),
            age: Some(30),
            height_cm: Some(170.0),
            weight_kg: Some(75.0),
            gender: Some("Female".to_string()),
            activity_level: Some("Sedentary".to_string()),
            ..Profile::default()
        };
        db.save_profile(&profile).unwrap();
        assert_eq!(db.profile("u1").unwrap().unwrap(), profile);
        assert!(db.profile("u2").unwrap().is_none());
    }

    #[test]
    fn test_upsert_metrics_merges_fields_for_same_day() {
        let db = Database::open_in_memory().unwrap();
        let first = db
            .upsert_metrics(&metric_log(
                MetricValues {
                    steps: Some(4000.0),
                    mood: Some(3.0),
                    ..MetricValues::default()
                },
                at(10),
            ))
            .unwrap();
        let second = db
            .upsert_metrics(&metric_log(
                MetricValues {
                    steps: Some(6500.0),
                    stress_level: Some(2.0),
                    ..MetricValues::default()
                },
                at(18),
            ))
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.values.steps, Some(6500.0));
        assert_eq!(second.values.mood, Some(3.0));
        assert_eq!(second.values.stress_level, Some(2.0));
        assert_eq!(second.timestamp, at(18));

        let all = db.metrics_between("u1", at(0), at(23)).unwrap();
        assert_eq!(all.len(), 1);
    }

    #[test]
    fn test_metrics_between_is_half_open() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_metrics(&metric_log(
            MetricValues {
                steps: Some(1.0),
                ..MetricValues::default()
            },
            at(12),
        ))
        .unwrap();
        assert_eq!(db.metrics_between("u1", at(12), at(13)).unwrap().len(), 1);
        assert!(db.metrics_between("u1", at(11), at(12)).unwrap().is_empty());
        assert!(db.metrics_between("u2", at(0), at(23)).unwrap().is_empty());
    }

    #[test]
    fn test_malformed_numeric_values_read_as_absent() {
        let db = Database::open_in_memory().unwrap();
        db.conn
            .execute(
                "INSERT INTO metrics (id, uid, source, log_date, ts, steps, water_ml, mood)
                 VALUES ('m1', 'u1', 'bot', '2024-06-01', ?1, 'lots', '1500', X'00')",
                params![ts_str(at(9))],
            )
            .unwrap();
        let rows = db.metrics_between("u1", at(0), at(23)).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].values.steps, None);
        assert_eq!(rows[0].values.water_ml, Some(1500.0));
        assert_eq!(rows[0].values.mood, None);
    }

    #[test]
    fn test_meal_roundtrip() {
        let db = Database::open_in_memory().unwrap();
        let mut meal = sample_meal("2 eggs, toast", Some(350.0), at(8));
        meal.totals.protein_g = Some(20.0);
        meal.items = vec![MealItem {
            name: "eggs".to_string(),
            portion: Some("2 large".to_string()),
            macros: Macros {
                calories: Some(140.0),
                ..Macros::default()
            },
        }];
        let saved = db.insert_meal(&meal).unwrap();

        let loaded = db.meals_between("u1", at(0), at(23)).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, saved.id);
        assert_eq!(loaded[0].raw_text, "2 eggs, toast");
        assert_eq!(loaded[0].totals.calories, Some(350.0));
        assert_eq!(loaded[0].totals.protein_g, Some(20.0));
        assert_eq!(loaded[0].items, meal.items);
    }

    #[test]
    fn test_badge_upsert_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.upsert_badge("u1", "STEPS_10K", day()).unwrap());
        let later = day() + Duration::days(3);
        assert!(!db.upsert_badge("u1", "STEPS_10K", later).unwrap());

        let badges = db.badges("u1").unwrap();
        assert_eq!(badges.len(), 1);
        assert_eq!(badges[0].earned_on, day());
    }

    #[test]
    fn test_chat_history_is_chronological_tail() {
        let db = Database::open_in_memory().unwrap();
        for i in 0..5 {
            db.insert_chat(&NewChatTurn {
                uid: "u1".to_string(),
                role: if i % 2 == 0 {
                    ChatRole::User
                } else {
                    ChatRole::Assistant
                },
                text: format!("turn {i}"),
                timestamp: at(i),
                embedding: None,
            })
            .unwrap();
        }
        let tail = db.chat_history("u1", 3).unwrap();
        let texts: Vec<&str> = tail.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, vec!["turn 2", "turn 3", "turn 4"]);
        assert_eq!(tail[0].role, ChatRole::User);
    }

    #[test]
    fn test_nudges_most_recent_first() {
        let db = Database::open_in_memory().unwrap();
        db.insert_nudge("u1", "drink water", at(8)).unwrap();
        db.insert_nudge("u1", "take a walk", at(12)).unwrap();
        let recent = db.recent_nudges("u1", 1).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].message, "take a walk");
    }

    #[test]
    fn test_user_summary_upsert() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.user_summary("u1").unwrap().is_none());
        db.save_user_summary("u1", "likes running", None).unwrap();
        db.save_user_summary("u1", "likes swimming", Some(&[0.1, 0.2]))
            .unwrap();
        assert_eq!(db.user_summary("u1").unwrap().as_deref(), Some("likes swimming"));
    }

    #[test]
    fn test_recent_context_uses_meal_blurb() {
        let db = Database::open_in_memory().unwrap();
        let mut meal = sample_meal("oats", Some(300.0), at(7));
        meal.blurb = Some("Breakfast • oats → kcal 300".to_string());
        db.insert_meal(&meal).unwrap();
        db.insert_meal(&sample_meal("salad", None, at(12))).unwrap();

        let items = db.recent_context("u1", ContentKind::Meal, 5).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].text, "salad");
        assert_eq!(items[1].text, "Breakfast • oats → kcal 300");
        assert!(items.iter().all(|i| i.similarity.is_none()));
    }

    #[test]
    fn test_similarity_search_ranks_by_cosine() {
        let db = Database::open_in_memory().unwrap();
        let entries = [
            ("slept badly", vec![1.0_f32, 0.0, 0.0]),
            ("went running", vec![0.0, 1.0, 0.0]),
            ("tired after bad sleep", vec![0.9, 0.1, 0.0]),
        ];
        for (i, (text, emb)) in entries.iter().enumerate() {
            db.insert_journal(&NewJournalEntry {
                uid: "u1".to_string(),
                timestamp: at(u32::try_from(i).unwrap()),
                text: (*text).to_string(),
                tags: vec![],
                embedding: Some(emb.clone()),
            })
            .unwrap();
        }
        // Entries without embeddings are invisible to search.
        db.insert_journal(&NewJournalEntry {
            uid: "u1".to_string(),
            timestamp: at(5),
            text: "no vector".to_string(),
            tags: vec!["misc".to_string()],
            embedding: None,
        })
        .unwrap();

        let hits = db
            .search("u1", ContentKind::Journal, &[1.0, 0.0, 0.0], 2)
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].text, "slept badly");
        assert_eq!(hits[1].text, "tired after bad sleep");
        assert!(hits[0].similarity.unwrap() >= hits[1].similarity.unwrap());

        let journal = db.journal_entries("u1", 10).unwrap();
        assert_eq!(journal.len(), 4);
        assert_eq!(journal[0].tags, vec!["misc".to_string()]);
    }

    #[test]
    fn test_open_file_database_enables_wal() {
        let dir = std::env::temp_dir().join(format!("whisper-db-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("whisper.db");
        {
            let db = Database::open(&path).unwrap();
            db.save_profile(&Profile::empty("u1")).unwrap();
        }
        let reopened = Database::open(&path).unwrap();
        assert!(reopened.profile("u1").unwrap().is_some());
        let mode: String = reopened
            .conn
            .pragma_query_value(None, "journal_mode", |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
        std::fs::remove_dir_all(&dir).ok();
    }
}
