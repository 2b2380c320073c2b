use anyhow::Result;
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use whisper_core::models::{Macros, MealItem};
use whisper_core::nutrition::fmt_num;
use whisper_core::service::{MealEntry, WhisperService};

use super::helpers::{exit_no_data, print_json, truncate};

pub(crate) fn cmd_meal_add(
    svc: &WhisperService<'_>,
    uid: &str,
    meal: &str,
    text: &str,
    no_estimate: bool,
    json: bool,
) -> Result<()> {
    let ctx = svc.context(uid)?;
    let entry = MealEntry {
        meal_type: meal.to_string(),
        text: text.to_string(),
        estimate: !no_estimate,
        at: None,
    };
    let record = svc.log_meal(&ctx, &entry)?;

    if json {
        print_json(&record)
    } else {
        println!("Logged {}", record.display_text());
        Ok(())
    }
}

pub(crate) fn cmd_meal_today(svc: &WhisperService<'_>, uid: &str, json: bool) -> Result<()> {
    #[derive(Tabled)]
    struct MealRow {
        #[tabled(rename = "Time")]
        time: String,
        #[tabled(rename = "Meal")]
        meal: String,
        #[tabled(rename = "What")]
        what: String,
        #[tabled(rename = "kcal")]
        calories: String,
        #[tabled(rename = "P")]
        protein: String,
        #[tabled(rename = "C")]
        carbs: String,
        #[tabled(rename = "F")]
        fat: String,
    }

    let ctx = svc.context(uid)?;
    let Some(view) = svc.recent_meals(&ctx)? else {
        exit_no_data("No meals logged recently", json);
    };

    if json {
        return print_json(&view);
    }

    println!("Meals ({})\n", view.scope.label());
    let rows: Vec<MealRow> = view
        .meals
        .iter()
        .map(|m| MealRow {
            time: m
                .timestamp
                .with_timezone(&ctx.window.tz())
                .format("%a %H:%M")
                .to_string(),
            meal: m.meal_type.clone(),
            what: truncate(&m.raw_text, 40),
            calories: fmt_num(m.totals.calories),
            protein: fmt_num(m.totals.protein_g),
            carbs: fmt_num(m.totals.carbs_g),
            fat: fmt_num(m.totals.fat_g),
        })
        .collect();

    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(3..)).with(Alignment::right()))
        .to_string();
    println!("{table}");

    let kcal: f64 = view.meals.iter().filter_map(|m| m.totals.calories).sum();
    println!("  TOTAL: {kcal:.0} kcal");
    Ok(())
}

pub(crate) fn cmd_meal_estimate(svc: &WhisperService<'_>, text: &str, json: bool) -> Result<()> {
    #[derive(Tabled)]
    struct ItemRow {
        #[tabled(rename = "Item")]
        name: String,
        #[tabled(rename = "Portion")]
        portion: String,
        #[tabled(rename = "kcal")]
        calories: String,
        #[tabled(rename = "P (g)")]
        protein: String,
        #[tabled(rename = "C (g)")]
        carbs: String,
        #[tabled(rename = "F (g)")]
        fat: String,
        #[tabled(rename = "Na (mg)")]
        sodium: String,
    }

    fn row(name: &str, portion: &str, m: &Macros) -> ItemRow {
        ItemRow {
            name: truncate(name, 30),
            portion: portion.to_string(),
            calories: fmt_num(m.calories),
            protein: fmt_num(m.protein_g),
            carbs: fmt_num(m.carbs_g),
            fat: fmt_num(m.fat_g),
            sodium: fmt_num(m.sodium_mg),
        }
    }

    let estimate = svc.estimate_meal(text)?;

    if json {
        return print_json(&estimate);
    }

    if estimate.items.is_empty() {
        exit_no_data(&format!("Could not identify any foods in '{text}'"), false);
    }

    let mut rows: Vec<ItemRow> = estimate
        .items
        .iter()
        .map(|MealItem { name, portion, macros }| {
            row(name, portion.as_deref().unwrap_or_default(), macros)
        })
        .collect();
    rows.push(row("TOTAL", "", &estimate.totals));

    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(2..)).with(Alignment::right()))
        .to_string();
    println!("{table}");
    eprintln!("Estimates only. Nothing was saved; use `whisper meal add` to log it.");
    Ok(())
}
