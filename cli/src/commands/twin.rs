use anyhow::{Result, bail};
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use whisper_core::service::WhisperService;
use whisper_core::twin::{PlanDeltas, Projection, Scenario};

use super::helpers::{fmt_delta, fmt_minutes, print_json};

const MAX_HORIZON_DAYS: u32 = 3650;

/// Explicit deltas win; `--suggested` fills in the ones left unset.
pub(crate) fn build_plan(
    steps: Option<f64>,
    sleep_minutes: Option<f64>,
    water_ml: Option<f64>,
    intake_kcal: Option<f64>,
    suggested: bool,
) -> Result<PlanDeltas> {
    let base = if suggested {
        PlanDeltas::suggested()
    } else {
        PlanDeltas::default()
    };
    let plan = PlanDeltas {
        steps: steps.unwrap_or(base.steps),
        sleep_minutes: sleep_minutes.unwrap_or(base.sleep_minutes),
        water_ml: water_ml.unwrap_or(base.water_ml),
        intake_kcal: intake_kcal.unwrap_or(base.intake_kcal),
    };
    if [plan.steps, plan.sleep_minutes, plan.water_ml, plan.intake_kcal]
        .iter()
        .any(|v| !v.is_finite())
    {
        bail!("Plan deltas must be finite numbers");
    }
    Ok(plan)
}

pub(crate) fn validate_horizon(days: u32) -> Result<()> {
    if days == 0 || days > MAX_HORIZON_DAYS {
        bail!("Horizon must be between 1 and {MAX_HORIZON_DAYS} days");
    }
    Ok(())
}

fn weight_at(scenario: &Scenario, day: usize) -> String {
    scenario
        .weights
        .get(day)
        .map_or_else(|| "-".to_string(), |w| format!("{w:.1}"))
}

#[derive(Tabled)]
struct ScenarioRow {
    #[tabled(rename = "")]
    label: String,
    #[tabled(rename = "Current habits")]
    baseline: String,
    #[tabled(rename = "With plan")]
    planned: String,
}

fn scenario_row(label: &str, p: &Projection, f: impl Fn(&Scenario) -> String) -> ScenarioRow {
    ScenarioRow {
        label: label.to_string(),
        baseline: f(&p.baseline),
        planned: f(&p.planned),
    }
}

fn print_projection(p: &Projection) {
    let b = &p.body;
    println!(
        "Body: {} y, {:.0} cm, {:.1} kg, {:?}, {:?}",
        b.age, b.height_cm, b.weight_kg, b.sex, b.activity
    );
    println!("BMR {:.0} kcal | adherence {:.2}", p.bmr, p.adherence);
    println!(
        "Plan: steps {} | sleep {} min | water {} ml | intake {} kcal\n",
        fmt_delta(p.plan.steps),
        fmt_delta(p.plan.sleep_minutes),
        fmt_delta(p.plan.water_ml),
        fmt_delta(p.plan.intake_kcal)
    );

    let mut rows = vec![
        scenario_row("Intake (kcal)", p, |s| format!("{:.0}", s.habits.intake_kcal)),
        scenario_row("Steps", p, |s| format!("{:.0}", s.habits.steps)),
        scenario_row("Sleep", p, |s| fmt_minutes(Some(s.habits.sleep_minutes))),
        scenario_row("Water (ml)", p, |s| format!("{:.0}", s.habits.water_ml)),
        scenario_row("TDEE (kcal)", p, |s| format!("{:.0}", s.tdee)),
    ];
    for day in [30_u32, 90] {
        if day < p.days {
            let label = format!("Weight day {day} (kg)");
            rows.push(scenario_row(&label, p, |s| weight_at(s, day as usize)));
        }
    }
    let label = format!("Weight day {} (kg)", p.days);
    rows.push(scenario_row(&label, p, |s| format!("{:.1}", s.final_weight_kg)));
    rows.push(scenario_row("BMI", p, |s| format!("{:.1}", s.final_bmi)));
    rows.push(scenario_row("Wellbeing (0-100)", p, |s| {
        format!("{:.0}", s.wellbeing)
    }));

    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(1..)).with(Alignment::right()))
        .to_string();
    println!("{table}");
}

pub(crate) fn cmd_twin(
    svc: &WhisperService<'_>,
    uid: &str,
    plan: &PlanDeltas,
    days: u32,
    json: bool,
) -> Result<()> {
    validate_horizon(days)?;
    let ctx = svc.context(uid)?;
    let projection = svc.twin(&ctx, plan, days)?;

    if json {
        print_json(&projection)
    } else {
        print_projection(&projection);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_plan_defaults_to_no_change() {
        let plan = build_plan(None, None, None, None, false).unwrap();
        assert_eq!(plan, PlanDeltas::default());
    }

    #[test]
    fn test_build_plan_explicit_overrides_suggested() {
        let plan = build_plan(Some(500.0), None, None, None, true).unwrap();
        assert_eq!(plan.steps, 500.0);
        assert_eq!(plan.sleep_minutes, 30.0);
        assert_eq!(plan.intake_kcal, -150.0);
    }

    #[test]
    fn test_horizon_bounds() {
        assert!(validate_horizon(0).is_err());
        assert!(validate_horizon(1).is_ok());
        assert!(validate_horizon(MAX_HORIZON_DAYS + 1).is_err());
    }

    #[test]
    fn test_build_plan_rejects_nan() {
        assert!(build_plan(Some(f64::NAN), None, None, None, false).is_err());
    }
}
