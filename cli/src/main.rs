mod commands;
mod config;
mod openai;
mod server;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::process;
use tracing_subscriber::EnvFilter;

use crate::commands::{
    build_plan, build_service, cmd_chat, cmd_goals, cmd_journal, cmd_log_metrics, cmd_meal_add,
    cmd_meal_estimate, cmd_meal_today, cmd_nudge, cmd_prefs_set, cmd_prefs_show,
    cmd_profile_set, cmd_profile_show, cmd_snapshot, cmd_summary, cmd_twin, hours_to_minutes,
    parse_time,
};
use crate::config::{Config, DEFAULT_UID};
use crate::openai::OpenAiClient;
use whisper_core::db::Database;
use whisper_core::models::{
    MetricValues, NudgeCadence, NudgeChannel, NudgeTone, PreferencesUpdate, ProfileUpdate,
};
use whisper_core::service::{DEFAULT_SUMMARY_DAYS, MAX_SUMMARY_DAYS, WhisperService};
use whisper_core::twin::DEFAULT_HORIZON_DAYS;

#[derive(Parser)]
#[command(
    name = "whisper",
    version,
    about = "A personal health whisperer: log, summarize, project and nudge",
    long_about = "\n\n  whisper: small nudges from your own numbers.\n"
)]
struct Cli {
    /// User to act as
    #[arg(long, global = true, env = "WHISPER_UID", default_value = DEFAULT_UID)]
    uid: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Log today's metrics
    Log {
        #[command(subcommand)]
        command: LogCommands,
    },
    /// Write a free-text journal note
    Journal {
        /// Note text
        text: String,
        /// Comma-separated tags
        #[arg(long)]
        tags: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Log and review meals
    Meal {
        #[command(subcommand)]
        command: MealCommands,
    },
    /// Show per-day metrics for the last N days
    Summary {
        /// Number of days to show
        #[arg(
            short,
            long,
            default_value_t = DEFAULT_SUMMARY_DAYS,
            value_parser = clap::value_parser!(u32).range(1..=i64::from(MAX_SUMMARY_DAYS))
        )]
        days: u32,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show today's snapshot (or the last 48 hours if today is empty)
    Snapshot {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show goal hits, streak and badges
    Goals {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Project weight and wellbeing with and without a plan
    Twin {
        /// Extra daily steps
        #[arg(long, allow_negative_numbers = true)]
        steps: Option<f64>,
        /// Extra sleep per night, in minutes
        #[arg(long, allow_negative_numbers = true)]
        sleep: Option<f64>,
        /// Extra water per day, in ml
        #[arg(long, allow_negative_numbers = true)]
        water: Option<f64>,
        /// Change in daily intake, in kcal (e.g. -150)
        #[arg(long, allow_negative_numbers = true)]
        kcal: Option<f64>,
        /// Start from a modest suggested plan
        #[arg(long)]
        suggested: bool,
        /// Projection horizon in days
        #[arg(short, long, default_value_t = DEFAULT_HORIZON_DAYS)]
        days: u32,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Get a short nudge based on your recent data
    Nudge {
        /// Optional question or focus for the nudge
        ask: Option<String>,
        /// Ignore quiet hours and cadence settings
        #[arg(long)]
        force: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Send a chat message and get a reply
    Chat {
        /// Message text
        text: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show or change preferences (goals, nudges, time zone)
    Prefs {
        #[command(subcommand)]
        command: PrefsCommands,
    },
    /// Show or change your profile
    Profile {
        #[command(subcommand)]
        command: ProfileCommands,
    },
    /// Start the REST API server
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "8080")]
        port: u16,
        /// Address to bind to (default: 127.0.0.1, use 0.0.0.0 to expose to network)
        #[arg(short, long, default_value = "127.0.0.1")]
        bind: String,
        /// Disable API key authentication (for development/testing)
        #[arg(long)]
        no_auth: bool,
    },
}

#[derive(Subcommand)]
enum LogCommands {
    /// Steps, sleep, heart rate, water and calories
    Physical {
        #[arg(long)]
        steps: Option<f64>,
        /// Hours slept (e.g. 7.5)
        #[arg(long)]
        sleep: Option<f64>,
        /// Resting heart rate in bpm
        #[arg(long)]
        heart_rate: Option<f64>,
        /// Water in ml
        #[arg(long)]
        water: Option<f64>,
        #[arg(long)]
        calories: Option<f64>,
        /// Optional notes (also saved to the journal)
        #[arg(long)]
        notes: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Mood, stress, anxiety, focus, energy and pain on a 1-5 scale
    Mental {
        #[arg(long)]
        mood: Option<f64>,
        #[arg(long)]
        stress: Option<f64>,
        #[arg(long)]
        anxiety: Option<f64>,
        #[arg(long)]
        focus: Option<f64>,
        #[arg(long)]
        energy: Option<f64>,
        #[arg(long)]
        pain: Option<f64>,
        /// Optional notes (also saved to the journal)
        #[arg(long)]
        notes: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum MealCommands {
    /// Log a meal from a description ("2 eggs and toast", or "oats; 350")
    Add {
        /// What you ate
        text: String,
        /// Meal type: breakfast, lunch, dinner, snacks
        #[arg(short, long, default_value = "snacks")]
        meal: String,
        /// Skip the language model and save the text as entered
        #[arg(long)]
        no_estimate: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List today's meals (or the last 36 hours if today is empty)
    Today {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Estimate macros for a description without saving
    Estimate {
        /// Meal description
        text: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum PrefsCommands {
    /// Show preferences
    Show {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Change one or more preferences
    Set {
        /// IANA time zone (e.g. Europe/Berlin)
        #[arg(long)]
        timezone: Option<String>,
        /// Daily calorie goal
        #[arg(long)]
        calories: Option<f64>,
        /// Daily step goal
        #[arg(long)]
        steps: Option<f64>,
        /// Daily water goal in ml
        #[arg(long)]
        water: Option<f64>,
        /// Daily protein target in grams
        #[arg(long)]
        protein: Option<f64>,
        /// Nightly sleep goal in minutes
        #[arg(long)]
        sleep: Option<f64>,
        /// Nudge channel: telegram, inapp, email, none
        #[arg(long)]
        channel: Option<String>,
        /// Nudge cadence: smart, frequent, sparse, off
        #[arg(long)]
        cadence: Option<String>,
        /// Nudge tone: gentle, direct, cheerful, clinical
        #[arg(long)]
        tone: Option<String>,
        /// Start of quiet hours (HH:MM)
        #[arg(long)]
        quiet_start: Option<String>,
        /// End of quiet hours (HH:MM)
        #[arg(long)]
        quiet_end: Option<String>,
        #[arg(long)]
        remind_hydration: Option<bool>,
        #[arg(long)]
        remind_steps: Option<bool>,
        #[arg(long)]
        remind_sleep: Option<bool>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum ProfileCommands {
    /// Show profile
    Show {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Change profile fields (an empty string clears a text field)
    Set {
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        age: Option<u32>,
        /// Height in cm
        #[arg(long)]
        height: Option<f64>,
        /// Weight in kg
        #[arg(long)]
        weight: Option<f64>,
        #[arg(long)]
        gender: Option<String>,
        /// e.g. sedentary, lightly active, moderately active, very active, athlete
        #[arg(long)]
        activity: Option<String>,
        #[arg(long)]
        goals: Option<String>,
        #[arg(long)]
        conditions: Option<String>,
        #[arg(long)]
        medications: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing(if matches!(cli.command, Commands::Serve { .. }) {
        "info"
    } else {
        "warn"
    });

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;
    let db = Database::open(&config.db_path)?;
    let llm = OpenAiClient::from_config(&config.llm)?;
    let Cli { uid, command } = cli;

    match command {
        Commands::Serve {
            port,
            bind,
            no_auth,
        } => {
            let api_key = if no_auth {
                None
            } else {
                Some(config.load_or_create_api_key()?)
            };
            server::start_server(db, config.db_path, llm, port, &bind, api_key).await
        }
        // The language model client blocks on the runtime handle, so the
        // rest of the work runs off the async worker threads.
        command => tokio::task::spawn_blocking(move || {
            let svc = build_service(&db, llm.as_ref());
            run_command(&svc, &uid, command)
        })
        .await
        .context("command task failed")?,
    }
}

#[allow(clippy::too_many_lines)]
fn run_command(svc: &WhisperService<'_>, uid: &str, command: Commands) -> Result<()> {
    match command {
        Commands::Log { command } => match command {
            LogCommands::Physical {
                steps,
                sleep,
                heart_rate,
                water,
                calories,
                notes,
                json,
            } => {
                let values = MetricValues {
                    steps,
                    sleep_minutes: hours_to_minutes(sleep)?,
                    heart_rate,
                    water_ml: water,
                    calories,
                    ..MetricValues::default()
                };
                cmd_log_metrics(svc, uid, values, notes, json)
            }
            LogCommands::Mental {
                mood,
                stress,
                anxiety,
                focus,
                energy,
                pain,
                notes,
                json,
            } => {
                let values = MetricValues {
                    mood,
                    stress_level: stress,
                    anxiety_level: anxiety,
                    focus_level: focus,
                    energy_level: energy,
                    pain_level: pain,
                    ..MetricValues::default()
                };
                cmd_log_metrics(svc, uid, values, notes, json)
            }
        },
        Commands::Journal { text, tags, json } => cmd_journal(svc, uid, &text, tags.as_deref(), json),
        Commands::Meal { command } => match command {
            MealCommands::Add {
                text,
                meal,
                no_estimate,
                json,
            } => cmd_meal_add(svc, uid, &meal, &text, no_estimate, json),
            MealCommands::Today { json } => cmd_meal_today(svc, uid, json),
            MealCommands::Estimate { text, json } => cmd_meal_estimate(svc, &text, json),
        },
        Commands::Summary { days, json } => cmd_summary(svc, uid, days, json),
        Commands::Snapshot { json } => cmd_snapshot(svc, uid, json),
        Commands::Goals { json } => cmd_goals(svc, uid, json),
        Commands::Twin {
            steps,
            sleep,
            water,
            kcal,
            suggested,
            days,
            json,
        } => {
            let plan = build_plan(steps, sleep, water, kcal, suggested)?;
            cmd_twin(svc, uid, &plan, days, json)
        }
        Commands::Nudge { ask, force, json } => cmd_nudge(svc, uid, ask.as_deref(), force, json),
        Commands::Chat { text, json } => cmd_chat(svc, uid, &text, json),
        Commands::Prefs { command } => match command {
            PrefsCommands::Show { json } => cmd_prefs_show(svc, uid, json),
            PrefsCommands::Set {
                timezone,
                calories,
                steps,
                water,
                protein,
                sleep,
                channel,
                cadence,
                tone,
                quiet_start,
                quiet_end,
                remind_hydration,
                remind_steps,
                remind_sleep,
                json,
            } => {
                let update = PreferencesUpdate {
                    timezone,
                    daily_calorie_goal: calories,
                    daily_step_goal: steps,
                    daily_water_ml: water,
                    protein_target_g: protein,
                    sleep_goal_min: sleep,
                    nudge_channel: channel.as_deref().map(str::parse::<NudgeChannel>).transpose()?,
                    nudge_cadence: cadence.as_deref().map(str::parse::<NudgeCadence>).transpose()?,
                    nudge_tone: tone.as_deref().map(str::parse::<NudgeTone>).transpose()?,
                    quiet_start: quiet_start.as_deref().map(parse_time).transpose()?,
                    quiet_end: quiet_end.as_deref().map(parse_time).transpose()?,
                    remind_hydration,
                    remind_steps,
                    remind_sleep,
                };
                cmd_prefs_set(svc, uid, update, json)
            }
        },
        Commands::Profile { command } => match command {
            ProfileCommands::Show { json } => cmd_profile_show(svc, uid, json),
            ProfileCommands::Set {
                name,
                age,
                height,
                weight,
                gender,
                activity,
                goals,
                conditions,
                medications,
                json,
            } => {
                let update = ProfileUpdate {
                    full_name: name,
                    age,
                    height_cm: height,
                    weight_kg: weight,
                    gender,
                    activity_level: activity,
                    goals,
                    conditions,
                    medications,
                };
                cmd_profile_set(svc, uid, update, json)
            }
        },
        Commands::Serve { .. } => bail!("`serve` must be started on its own"),
    }
}
