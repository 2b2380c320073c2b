use anyhow::{Result, bail};

use whisper_core::models::{Preferences, PreferencesUpdate, Profile, ProfileUpdate};
use whisper_core::service::WhisperService;

use super::helpers::{fmt_minutes, print_json};

fn print_preferences(p: &Preferences) {
    println!("Time zone:      {}", p.timezone);
    println!("Calorie goal:   {:.0} kcal", p.daily_calorie_goal);
    println!("Step goal:      {:.0}", p.daily_step_goal);
    println!("Water goal:     {:.0} ml", p.daily_water_ml);
    println!("Protein target: {:.0} g", p.protein_target_g);
    println!("Sleep goal:     {}", fmt_minutes(Some(p.sleep_goal_min)));
    println!(
        "Nudges:         {} via {}, {} tone",
        p.nudge_cadence, p.nudge_channel, p.nudge_tone
    );
    println!(
        "Quiet hours:    {} to {}",
        p.quiet_start.format("%H:%M"),
        p.quiet_end.format("%H:%M")
    );
    let reminders: Vec<&str> = [
        (p.remind_hydration, "hydration"),
        (p.remind_steps, "steps"),
        (p.remind_sleep, "sleep"),
    ]
    .into_iter()
    .filter_map(|(on, name)| on.then_some(name))
    .collect();
    if reminders.is_empty() {
        println!("Reminders:      none");
    } else {
        println!("Reminders:      {}", reminders.join(", "));
    }
}

pub(crate) fn cmd_prefs_show(svc: &WhisperService<'_>, uid: &str, json: bool) -> Result<()> {
    let prefs = svc.preferences(uid)?;
    if json {
        print_json(&prefs)
    } else {
        print_preferences(&prefs);
        Ok(())
    }
}

pub(crate) fn cmd_prefs_set(
    svc: &WhisperService<'_>,
    uid: &str,
    update: PreferencesUpdate,
    json: bool,
) -> Result<()> {
    if update.is_empty() {
        bail!("Nothing to change. See `whisper prefs set --help`");
    }
    let prefs = svc.update_preferences(uid, update)?;
    if json {
        print_json(&prefs)
    } else {
        println!("Preferences saved\n");
        print_preferences(&prefs);
        Ok(())
    }
}

fn print_profile(p: &Profile) {
    let text = |v: &Option<String>| v.clone().unwrap_or_else(|| "-".to_string());
    println!("Name:       {}", text(&p.full_name));
    println!(
        "Age:        {}",
        p.age.map_or_else(|| "-".to_string(), |a| a.to_string())
    );
    println!(
        "Height:     {}",
        p.height_cm.map_or_else(|| "-".to_string(), |h| format!("{h:.0} cm"))
    );
    println!(
        "Weight:     {}",
        p.weight_kg.map_or_else(|| "-".to_string(), |w| format!("{w:.1} kg"))
    );
    println!("Gender:     {}", text(&p.gender));
    println!("Activity:   {}", text(&p.activity_level));
    println!("Goals:      {}", text(&p.goals));
    println!("Conditions: {}", text(&p.conditions));
    println!("Meds:       {}", text(&p.medications));
}

pub(crate) fn cmd_profile_show(svc: &WhisperService<'_>, uid: &str, json: bool) -> Result<()> {
    let profile = svc.profile(uid)?;
    if json {
        print_json(&profile)
    } else {
        print_profile(&profile);
        Ok(())
    }
}

pub(crate) fn cmd_profile_set(
    svc: &WhisperService<'_>,
    uid: &str,
    update: ProfileUpdate,
    json: bool,
) -> Result<()> {
    let profile = svc.update_profile(uid, update)?;
    if json {
        print_json(&profile)
    } else {
        println!("Profile saved\n");
        print_profile(&profile);
        Ok(())
    }
}
