use anyhow::Result;

use whisper_core::models::{MetricField, MetricValues};
use whisper_core::service::{MetricEntry, WhisperService};

use super::helpers::{fmt_minutes, parse_tags, print_json};

pub(crate) fn cmd_log_metrics(
    svc: &WhisperService<'_>,
    uid: &str,
    values: MetricValues,
    notes: Option<String>,
    json: bool,
) -> Result<()> {
    let ctx = svc.context(uid)?;
    let entry = MetricEntry {
        source: "manual".to_string(),
        values,
        notes,
    };
    let record = svc.log_metrics(&ctx, &entry)?;

    if json {
        return print_json(&record);
    }

    println!("Logged for {}:", record.log_date.format("%Y-%m-%d"));
    for field in MetricField::ALL {
        let Some(v) = entry.values.get(field) else {
            continue;
        };
        let shown = match field {
            MetricField::SleepMinutes => fmt_minutes(Some(v)),
            f if f.is_scale() => format!("{v:.0}/5"),
            _ => format!("{v:.0}"),
        };
        println!("  {field}: {shown}");
    }
    if let Some(ref n) = record.notes {
        println!("  Notes: {n}");
    }
    Ok(())
}

pub(crate) fn cmd_journal(
    svc: &WhisperService<'_>,
    uid: &str,
    text: &str,
    tags: Option<&str>,
    json: bool,
) -> Result<()> {
    let ctx = svc.context(uid)?;
    let entry = svc.journal(&ctx, text, &parse_tags(tags))?;

    if json {
        print_json(&entry)
    } else {
        let tags = if entry.tags.is_empty() {
            String::new()
        } else {
            format!(" [{}]", entry.tags.join(", "))
        };
        println!("Journal entry saved{tags}");
        Ok(())
    }
}
