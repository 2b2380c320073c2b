mod goals;
mod helpers;
mod log;
mod meal;
mod nudge;
mod settings;
mod summary;
mod twin;

use whisper_core::db::Database;
use whisper_core::llm::{EmbeddingService, TextGenerationService};
use whisper_core::service::WhisperService;

use crate::openai::OpenAiClient;

pub(crate) use goals::cmd_goals;
pub(crate) use helpers::{hours_to_minutes, parse_time};
pub(crate) use log::{cmd_journal, cmd_log_metrics};
pub(crate) use meal::{cmd_meal_add, cmd_meal_estimate, cmd_meal_today};
pub(crate) use nudge::{cmd_chat, cmd_nudge};
pub(crate) use settings::{cmd_prefs_set, cmd_prefs_show, cmd_profile_set, cmd_profile_show};
pub(crate) use summary::{cmd_snapshot, cmd_summary};
pub(crate) use twin::{build_plan, cmd_twin, validate_horizon};

/// Wire the store, similarity search and optional language model together.
pub(crate) fn build_service<'a>(
    db: &'a Database,
    llm: Option<&'a OpenAiClient>,
) -> WhisperService<'a> {
    WhisperService::new(db).with_search(db).with_language_model(
        llm.map(|c| c as &dyn EmbeddingService),
        llm.map(|c| c as &dyn TextGenerationService),
    )
}
