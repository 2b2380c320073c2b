use anyhow::Result;
use serde::Serialize;

use whisper_core::goals::{BadgeRule, GoalReport};
use whisper_core::models::Badge;
use whisper_core::service::WhisperService;

use super::helpers::print_json;

fn tick(hit: bool) -> &'static str {
    if hit { "✓" } else { "·" }
}

pub(crate) fn cmd_goals(svc: &WhisperService<'_>, uid: &str, json: bool) -> Result<()> {
    #[derive(Serialize)]
    struct GoalsOutput<'a> {
        #[serde(flatten)]
        report: &'a GoalReport,
        badges: &'a [Badge],
    }

    let ctx = svc.context(uid)?;
    let report = svc.goals(&ctx)?;
    let badges = svc.badges(uid)?;

    if json {
        return print_json(&GoalsOutput {
            report: &report,
            badges: &badges,
        });
    }

    let g = &report.goals;
    println!(
        "Goals: {:.0} steps | {:.0} ml water | {:.1}h sleep",
        g.steps,
        g.water_ml,
        g.sleep_minutes / 60.0
    );
    println!("Current streak: {} day(s)\n", report.streak);

    let w = &report.weekly;
    println!("Last {} day(s):", w.days);
    println!("  steps  {}/{}", w.steps_days, w.days);
    println!("  water  {}/{}", w.water_days, w.days);
    println!("  sleep  {}/{}", w.sleep_days, w.days);

    let recent = &report.days[report.days.len().saturating_sub(7)..];
    if !recent.is_empty() {
        println!();
        for h in recent {
            println!(
                "  {}  steps {}  water {}  sleep {}",
                h.day.format("%a %m-%d"),
                tick(h.steps_hit),
                tick(h.water_hit),
                tick(h.sleep_hit)
            );
        }
    }

    for rule in &report.newly_earned {
        println!("\nNew badge: {}!", rule.label());
    }

    if !badges.is_empty() {
        println!("\nBadges:");
        for b in &badges {
            let label = BadgeRule::from_code(&b.code).map_or(b.code.as_str(), |r| r.label());
            println!("  {label} (earned {})", b.earned_on.format("%Y-%m-%d"));
        }
    }

    Ok(())
}
