//! Conversational replies and standalone nudges.
//!
//! Simple factual questions ("how many steps today?") are answered straight
//! from the snapshot without calling the model. Everything else gets a
//! prompt built from profile, metrics, recent nudges, the conversation tail
//! and retrieved context.

use std::sync::LazyLock;

use chrono::NaiveTime;
use regex::Regex;
use serde::Serialize;

use crate::aggregate::{MealsView, MetricsAggregator, Snapshot};
use crate::context::RequestContext;
use crate::error::StoreError;
use crate::llm::{EmbeddingService, GenerationOptions, TextGenerationService};
use crate::models::{
    ChatRole, ChatTurn, MetricField, MetricValues, NewChatTurn, NudgeCadence, NudgeChannel,
    NudgeRecord, Preferences, Profile,
};
use crate::retrieval::{ContextRetriever, DEFAULT_QUERY_HINT, SNIPPETS_K, truncate_chars};
use crate::retry::{RetryPolicy, best_effort, degrade};
use crate::store::{HealthStore, SimilaritySearch};
use crate::timewindow::TimeWindow;

pub const MAX_REPLY_WORDS: usize = 80;
pub const RECENT_NUDGES: usize = 3;
pub const CONVERSATION_TURNS: usize = 8;
/// Upper bound on the rendered chat prompt.
pub const PROMPT_CHAR_BUDGET: usize = 6000;
/// Longer chat messages are stored without an embedding.
pub const EMBED_CHAR_LIMIT: usize = 2000;

pub const EMPTY_REPLY: &str = "I'm here for you.";
pub const GENERATION_FALLBACK: &str =
    "I couldn't generate a tip right now. Please try again later.";
pub const NO_MEALS_REPLY: &str = "I don't see meals for today (or the last 36h).";

const REPLY_SYSTEM: &str =
    "You are Personalized Health Whisperer. Keep replies under 80 words; no medical diagnosis.";
const NUDGE_SYSTEM: &str = "You are Personalized Health Whisperer. Concise, safe, <80 words.";
const DEFAULT_NUDGE_ASK: &str = "Give me one helpful nudge based on my recent habits.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuickIntent {
    Steps,
    Sleep,
    HeartRate,
    Physical,
    Mental,
    Meals,
}

static INTENT_PATTERNS: LazyLock<Vec<(QuickIntent, Regex)>> = LazyLock::new(|| {
    [
        (QuickIntent::Steps, r"(?i)\b(steps?|step\s*count)\b"),
        (QuickIntent::Sleep, r"(?i)\b(sleep|minutes\s*of\s*sleep)\b"),
        (QuickIntent::HeartRate, r"(?i)\b(heart\s*rate|hr)\b"),
        (
            QuickIntent::Physical,
            r"(?i)\b(physical\s*health|fitness|how\s*am\s*i\s*physically)\b",
        ),
        (
            QuickIntent::Mental,
            r"(?i)\b(mental\s*health|mood|stress|anxiety|focus|how\s*am\s*i\s*mentally)\b",
        ),
        (
            QuickIntent::Meals,
            r"(?i)\b(what\s+did\s+i\s+eat|meals?\s+today|today'?s\s+meals?)\b",
        ),
    ]
    .into_iter()
    .filter_map(|(intent, pattern)| match Regex::new(pattern) {
        Ok(re) => Some((intent, re)),
        Err(e) => {
            tracing::error!("intent pattern failed to compile: {e}");
            None
        }
    })
    .collect()
});

/// First matching intent, checked in a fixed order.
#[must_use]
pub fn detect_intent(text: &str) -> Option<QuickIntent> {
    INTENT_PATTERNS
        .iter()
        .find(|(_, re)| re.is_match(text))
        .map(|(intent, _)| *intent)
}

#[allow(clippy::cast_possible_truncation)]
fn reading(value: Option<f64>, unit: &str) -> String {
    match value {
        Some(v) => format!("{}{unit}", v.trunc() as i64),
        None => "—".to_string(),
    }
}

#[must_use]
pub fn summarize_physical(values: Option<&MetricValues>) -> String {
    let Some(v) = values else {
        return "No physical metrics logged today.".to_string();
    };
    let mut parts = vec![
        format!("Steps: {}", reading(v.steps, "")),
        format!("Sleep: {}", reading(v.sleep_minutes, " min")),
    ];
    if v.heart_rate.is_some() {
        parts.push(format!("HR: {}", reading(v.heart_rate, " bpm")));
    }
    if v.pain_level.is_some() {
        parts.push(format!("Pain: {}/5", reading(v.pain_level, "")));
    }
    if v.energy_level.is_some() {
        parts.push(format!("Energy: {}/5", reading(v.energy_level, "")));
    }
    parts.join(" | ")
}

#[must_use]
pub fn summarize_mental(values: Option<&MetricValues>) -> String {
    let parts: Vec<String> = values
        .map(|v| {
            [
                ("Mood", v.mood),
                ("Stress", v.stress_level),
                ("Anxiety", v.anxiety_level),
                ("Focus", v.focus_level),
            ]
            .into_iter()
            .filter(|(_, value)| value.is_some())
            .map(|(label, value)| format!("{label}: {}/5", reading(value, "")))
            .collect()
        })
        .unwrap_or_default();
    if parts.is_empty() {
        "No mental metrics logged today.".to_string()
    } else {
        parts.join(" | ")
    }
}

fn meal_lines(view: &MealsView, window: &TimeWindow) -> String {
    let lines: Vec<String> = view
        .meals
        .iter()
        .map(|m| {
            let mut chars = m.meal_type.chars();
            let label: String = chars
                .next()
                .map(|c| c.to_uppercase().chain(chars).collect())
                .unwrap_or_default();
            let kcal = m
                .totals
                .calories
                .map(|c| format!(" • ~{} kcal", c.round()))
                .unwrap_or_default();
            let when = window.local_time(m.timestamp).format("%H:%M");
            format!("- {label}: {}{kcal} • {when}", m.raw_text.trim())
        })
        .collect();
    format!("Meals ({}):\n{}", view.scope.label(), lines.join("\n"))
}

/// Answer a quick intent from already-loaded data.
#[must_use]
pub fn quick_reply(
    intent: QuickIntent,
    snapshot: Option<&Snapshot>,
    meals: Option<&MealsView>,
    window: &TimeWindow,
) -> String {
    let values = snapshot.map(|s| &s.values);
    let field = |f: MetricField| values.and_then(|v| v.get(f));
    match intent {
        QuickIntent::Steps => format!("Steps today: {}.", reading(field(MetricField::Steps), "")),
        QuickIntent::Sleep => format!(
            "Sleep last night: {}.",
            reading(field(MetricField::SleepMinutes), " min")
        ),
        QuickIntent::HeartRate => format!(
            "Current HR (last log): {}.",
            reading(field(MetricField::HeartRate), " bpm")
        ),
        QuickIntent::Physical => format!("Physical snapshot — {}", summarize_physical(values)),
        QuickIntent::Mental => format!("Mental snapshot — {}", summarize_mental(values)),
        QuickIntent::Meals => match meals {
            Some(view) if !view.meals.is_empty() => meal_lines(view, window),
            _ => NO_MEALS_REPLY.to_string(),
        },
    }
}

/// Profile facts for the prompt. The name is left out.
#[must_use]
pub fn profile_summary(profile: Option<&Profile>) -> String {
    let Some(p) = profile else {
        return "not provided".to_string();
    };
    let mut parts = Vec::new();
    if let Some(age) = p.age {
        parts.push(format!("age {age}"));
    }
    if let Some(h) = p.height_cm {
        parts.push(format!("height {h} cm"));
    }
    if let Some(w) = p.weight_kg {
        parts.push(format!("weight {w} kg"));
    }
    for (label, value) in [
        ("gender", &p.gender),
        ("activity", &p.activity_level),
        ("goals", &p.goals),
        ("conditions", &p.conditions),
        ("medications", &p.medications),
    ] {
        if let Some(v) = value.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
            parts.push(format!("{label}: {v}"));
        }
    }
    if parts.is_empty() {
        "not provided".to_string()
    } else {
        parts.join("; ")
    }
}

#[must_use]
pub fn metrics_summary(snapshot: Option<&Snapshot>) -> String {
    let Some(s) = snapshot else {
        return "none logged in the last 48h".to_string();
    };
    let fields: Vec<String> = MetricField::ALL
        .iter()
        .filter_map(|f| s.values.get(*f).map(|v| format!("{f} {v}")))
        .collect();
    if fields.is_empty() {
        format!("{}: meals only ({} logged)", s.scope.label(), s.meal_count)
    } else {
        format!("{}: {}", s.scope.label(), fields.join(", "))
    }
}

/// Inputs for one chat prompt.
pub struct PromptParts<'p> {
    pub profile: Option<&'p Profile>,
    pub snapshot: Option<&'p Snapshot>,
    pub nudges: &'p [NudgeRecord],
    pub conversation: &'p [ChatTurn],
    pub snippets: &'p str,
    pub user_text: &'p str,
}

fn render_prompt(parts: &PromptParts<'_>, conversation: &[ChatTurn], snippets: &str) -> String {
    let nudges = parts
        .nudges
        .iter()
        .map(|n| n.message.trim())
        .collect::<Vec<_>>()
        .join(" / ");
    let convo = conversation
        .iter()
        .filter_map(|t| {
            let text = t.text.split_whitespace().collect::<Vec<_>>().join(" ");
            if text.is_empty() {
                return None;
            }
            let who = match t.role {
                ChatRole::User => "User",
                ChatRole::Assistant => "Coach",
            };
            Some(format!("{who}: {text}"))
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "You are Health Whisperer, a supportive wellness coach. Be brief, actionable, and safe.\n\
         No medical diagnosis; if serious symptoms, advise seeing a clinician.\n\n\
         User profile: {profile}\n\
         Latest metrics (prefer today; else last 48h): {metrics}\n\
         Recent nudges: {nudges}\n\
         Conversation so far:\n{convo}\n\n\
         Recent context (journal/meals/chat blurbs): {snippets}\n\n\
         User says: {user}\n\n\
         Reply with 1–2 short bullet points (<80 words total).",
        profile = profile_summary(parts.profile),
        metrics = metrics_summary(parts.snapshot),
        user = parts.user_text.trim(),
    )
}

/// Render the chat prompt within [`PROMPT_CHAR_BUDGET`]. The oldest
/// conversation turns go first, then retrieved context is shortened.
#[must_use]
pub fn build_prompt(parts: &PromptParts<'_>) -> String {
    let tail_start = parts.conversation.len().saturating_sub(CONVERSATION_TURNS);
    let mut conversation = &parts.conversation[tail_start..];
    let mut snippets = parts.snippets;

    loop {
        let prompt = render_prompt(parts, conversation, snippets);
        let size = prompt.chars().count();
        if size <= PROMPT_CHAR_BUDGET {
            return prompt;
        }
        if !conversation.is_empty() {
            conversation = &conversation[1..];
        } else if !snippets.is_empty() {
            let over = size - PROMPT_CHAR_BUDGET;
            let keep = snippets.chars().count().saturating_sub(over);
            snippets = truncate_chars(snippets, keep);
        } else {
            tracing::debug!(size, "prompt still over budget, truncating");
            return truncate_chars(&prompt, PROMPT_CHAR_BUDGET).to_string();
        }
    }
}

fn cap_words(text: &str, max: usize) -> String {
    let mut words = 0;
    let mut in_word = false;
    for (i, c) in text.char_indices() {
        if c.is_whitespace() {
            in_word = false;
        } else if !in_word {
            in_word = true;
            words += 1;
            if words > max {
                return format!("{}…", text[..i].trim_end());
            }
        }
    }
    text.to_string()
}

/// Trim, substitute the empty reply, and cap the word count.
#[must_use]
pub fn post_process(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return EMPTY_REPLY.to_string();
    }
    cap_words(trimmed, MAX_REPLY_WORDS)
}

/// Whether a proactive nudge may be sent at this local time.
#[must_use]
pub fn nudge_due(prefs: &Preferences, local: NaiveTime) -> bool {
    prefs.nudge_cadence != NudgeCadence::Off
        && prefs.nudge_channel != NudgeChannel::Disabled
        && !prefs.in_quiet_hours(local)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplySource {
    Quick,
    Generated,
    Fallback,
}

#[derive(Debug, Clone, Serialize)]
pub struct Reply {
    pub text: String,
    pub source: ReplySource,
}

pub struct NudgeComposer<'a> {
    store: &'a dyn HealthStore,
    embedder: Option<&'a dyn EmbeddingService>,
    generator: Option<&'a dyn TextGenerationService>,
    retriever: ContextRetriever<'a>,
    aggregator: MetricsAggregator<'a>,
    retry: &'a RetryPolicy,
}

impl<'a> NudgeComposer<'a> {
    #[must_use]
    pub fn new(
        store: &'a dyn HealthStore,
        search: Option<&'a dyn SimilaritySearch>,
        embedder: Option<&'a dyn EmbeddingService>,
        generator: Option<&'a dyn TextGenerationService>,
        retry: &'a RetryPolicy,
    ) -> Self {
        Self {
            store,
            embedder,
            generator,
            retriever: ContextRetriever::new(store, retry)
                .with_search(search, embedder)
                .with_generator(generator),
            aggregator: MetricsAggregator::new(store, retry),
            retry,
        }
    }

    /// Store a chat turn. Failures are logged and dropped.
    pub fn log_chat(&self, ctx: &RequestContext, role: ChatRole, text: &str) {
        let embedding = if text.chars().count() < EMBED_CHAR_LIMIT {
            self.embedder.and_then(|e| match e.embed(text) {
                Ok(v) => Some(v),
                Err(err) => {
                    tracing::warn!("chat embedding failed (ignored): {err}");
                    None
                }
            })
        } else {
            None
        };
        let turn = NewChatTurn {
            uid: ctx.uid.clone(),
            role,
            text: text.to_string(),
            timestamp: ctx.now,
            embedding,
        };
        best_effort(
            self.retry.run("chat log", || self.store.insert_chat(&turn)),
            "chat log",
        );
    }

    fn generate(&self, system: &str, prompt: &str) -> Reply {
        let Some(generator) = self.generator else {
            tracing::warn!("no text generator configured");
            return Reply {
                text: GENERATION_FALLBACK.to_string(),
                source: ReplySource::Fallback,
            };
        };
        let options = GenerationOptions {
            temperature: Some(0.7),
            max_tokens: Some(220),
            json: false,
        };
        match generator.generate(system, prompt, &options) {
            Ok(text) => Reply {
                text: post_process(&text),
                source: ReplySource::Generated,
            },
            Err(e) => {
                tracing::warn!("reply generation failed: {e}");
                Reply {
                    text: GENERATION_FALLBACK.to_string(),
                    source: ReplySource::Fallback,
                }
            }
        }
    }

    /// Reply to a free-text message. Both sides of the exchange are logged.
    pub fn respond(&self, ctx: &RequestContext, text: &str) -> Result<Reply, StoreError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(Reply {
                text: EMPTY_REPLY.to_string(),
                source: ReplySource::Quick,
            });
        }

        let conversation = degrade(
            self.retry.run("chat history read", || {
                self.store.chat_history(&ctx.uid, CONVERSATION_TURNS)
            }),
            "chat history",
        )?;
        self.log_chat(ctx, ChatRole::User, text);

        let snapshot = self.aggregator.snapshot(ctx)?;
        let reply = if let Some(intent) = detect_intent(text) {
            let meals = if intent == QuickIntent::Meals {
                self.aggregator.recent_meals(ctx)?
            } else {
                None
            };
            Reply {
                text: quick_reply(intent, snapshot.as_ref(), meals.as_ref(), &ctx.window),
                source: ReplySource::Quick,
            }
        } else {
            let profile = degrade(
                self.retry.run("profile read", || self.store.profile(&ctx.uid)),
                "profile",
            )?;
            let nudges = degrade(
                self.retry
                    .run("nudge log read", || self.store.recent_nudges(&ctx.uid, RECENT_NUDGES)),
                "recent nudges",
            )?;
            let snippets = self.retriever.context_snippets(&ctx.uid, text, SNIPPETS_K)?;
            let prompt = build_prompt(&PromptParts {
                profile: profile.as_ref(),
                snapshot: snapshot.as_ref(),
                nudges: &nudges,
                conversation: &conversation,
                snippets: &snippets,
                user_text: text,
            });
            tracing::debug!(chars = prompt.chars().count(), "chat prompt built");
            self.generate(REPLY_SYSTEM, &prompt)
        };

        self.log_chat(ctx, ChatRole::Assistant, &reply.text);
        Ok(reply)
    }

    /// A single micro-nudge, appended to the nudge log when generated.
    pub fn compose_nudge(&self, ctx: &RequestContext, ask: Option<&str>) -> Result<Reply, StoreError> {
        let ask = ask.map(str::trim).filter(|a| !a.is_empty()).unwrap_or(DEFAULT_NUDGE_ASK);
        let personal = self.retriever.personal_context(&ctx.uid, DEFAULT_QUERY_HINT)?;
        let prompt = format!(
            "You are generating a single, kind micro-nudge for a health app user.\n\n\
             User request (verbatim):\n{ask}\n\n\
             Personal context (summaries + recent notes):\n{personal}\n\n\
             Constraints:\n\
             - 1 actionable suggestion, plain English, max 80 words.\n\
             - Be specific (time, duration, quantity). Avoid generic platitudes."
        );
        let reply = self.generate(NUDGE_SYSTEM, &prompt);
        if reply.source == ReplySource::Generated {
            best_effort(
                self.retry.run("nudge log", || {
                    self.store.insert_nudge(&ctx.uid, &reply.text, ctx.now)
                }),
                "nudge log",
            );
            tracing::info!(uid = %ctx.uid, "nudge composed");
        }
        Ok(reply)
    }
}
