use anyhow::{Context, Result, bail};
use chrono::NaiveTime;
use serde::Serialize;
use std::process;

/// Accepts "22:00" and "22:00:00".
pub(crate) fn parse_time(s: &str) -> Result<NaiveTime> {
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .with_context(|| format!("Invalid time '{s}'. Use HH:MM (24-hour)"))
}

/// Split "a, b,,c" into trimmed, lowercase, non-empty tags.
pub(crate) fn parse_tags(tags: Option<&str>) -> Vec<String> {
    tags.unwrap_or_default()
        .split(',')
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

pub(crate) fn hours_to_minutes(hours: Option<f64>) -> Result<Option<f64>> {
    match hours {
        Some(h) if !h.is_finite() || !(0.0..=24.0).contains(&h) => {
            bail!("Sleep must be between 0 and 24 hours")
        }
        Some(h) => Ok(Some((h * 60.0).round())),
        None => Ok(None),
    }
}

pub(crate) fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// "Nothing to show": a JSON error on stdout or a message on stderr, then exit code 2.
pub(crate) fn exit_no_data(message: &str, json: bool) -> ! {
    if json {
        println!("{}", json_error(message));
    } else {
        eprintln!("{message}");
    }
    process::exit(2);
}

pub(crate) fn json_error(message: &str) -> String {
    #[derive(Serialize)]
    struct CliError<'a> {
        error: &'a str,
    }
    serde_json::to_string(&CliError { error: message })
        .unwrap_or_else(|_| format!("{{\"error\":\"{message}\"}}"))
}

pub(crate) fn no_neg_zero(v: f64) -> f64 {
    if v == 0.0 { 0.0 } else { v }
}

/// `"-"` for absent values.
pub(crate) fn fmt_opt(value: Option<f64>, decimals: usize) -> String {
    value.map_or_else(
        || "-".to_string(),
        |v| format!("{:.*}", decimals, no_neg_zero(v)),
    )
}

/// 450 → "7h 30m".
pub(crate) fn fmt_minutes(minutes: Option<f64>) -> String {
    match minutes {
        Some(m) if m.is_finite() && m >= 0.0 => {
            let total = m.round() as i64;
            format!("{}h {:02}m", total / 60, total % 60)
        }
        _ => "-".to_string(),
    }
}

/// Signed delta for plan display, e.g. "+2000" or "-150".
pub(crate) fn fmt_delta(v: f64) -> String {
    let v = no_neg_zero(v);
    if v > 0.0 {
        format!("+{v:.0}")
    } else {
        format!("{v:.0}")
    }
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let end = s.char_indices().nth(max - 3).map_or(s.len(), |(i, _)| i);
        format!("{}...", &s[..end])
    }
}
