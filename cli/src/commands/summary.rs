use anyhow::Result;
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use whisper_core::models::{MetricField, MetricValues};
use whisper_core::service::WhisperService;

use super::helpers::{exit_no_data, fmt_minutes, fmt_opt, print_json};

#[derive(Tabled)]
struct DayRow {
    #[tabled(rename = "Day")]
    day: String,
    #[tabled(rename = "Steps")]
    steps: String,
    #[tabled(rename = "Sleep")]
    sleep: String,
    #[tabled(rename = "Water (ml)")]
    water: String,
    #[tabled(rename = "kcal")]
    calories: String,
    #[tabled(rename = "Mood")]
    mood: String,
    #[tabled(rename = "Stress")]
    stress: String,
}

fn day_row(label: String, v: &MetricValues) -> DayRow {
    DayRow {
        day: label,
        steps: fmt_opt(v.steps, 0),
        sleep: fmt_minutes(v.sleep_minutes),
        water: fmt_opt(v.water_ml, 0),
        calories: fmt_opt(v.calories, 0),
        mood: fmt_opt(v.mood, 1),
        stress: fmt_opt(v.stress_level, 1),
    }
}

pub(crate) fn cmd_summary(svc: &WhisperService<'_>, uid: &str, days: u32, json: bool) -> Result<()> {
    let ctx = svc.context(uid)?;
    let summary = svc.summary(&ctx, days)?;

    if json {
        return print_json(&summary);
    }

    if summary.days.is_empty() {
        exit_no_data(&format!("No entries in the last {days} days"), false);
    }

    let mut rows: Vec<DayRow> = summary
        .days
        .iter()
        .map(|d| day_row(d.day.format("%a %Y-%m-%d").to_string(), &d.values))
        .collect();
    rows.push(day_row("AVERAGE".to_string(), &summary.averages));

    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(1..)).with(Alignment::right()))
        .to_string();
    println!("{table}");

    Ok(())
}

pub(crate) fn cmd_snapshot(svc: &WhisperService<'_>, uid: &str, json: bool) -> Result<()> {
    let ctx = svc.context(uid)?;
    let Some(snapshot) = svc.snapshot(&ctx)? else {
        exit_no_data("Nothing logged in the last two days", json);
    };

    if json {
        return print_json(&snapshot);
    }

    println!("=== {} ===\n", snapshot.scope.label());
    for field in MetricField::ALL {
        let Some(v) = snapshot.values.get(field) else {
            continue;
        };
        let shown = match field {
            MetricField::SleepMinutes => fmt_minutes(Some(v)),
            f if f.is_scale() => format!("{v:.1}/5"),
            _ => format!("{v:.0}"),
        };
        println!("  {field}: {shown}");
    }
    println!("  meals: {}", snapshot.meal_count);
    if let Some(at) = snapshot.last_logged_at {
        let local = at.with_timezone(&ctx.window.tz());
        println!("\n  last logged {}", local.format("%a %H:%M"));
    }
    Ok(())
}
