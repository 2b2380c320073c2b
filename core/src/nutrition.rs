//! Meal text to structured macros, and the compact blurb stored with each meal.

use serde::Serialize;
use serde_json::Value;

use crate::error::GenerationError;
use crate::llm::TextGenerationService;
use crate::models::{Macros, MealItem};

const ESTIMATOR_SYSTEM: &str = "You are a careful nutrition estimator. \
Return ONLY JSON with fields: items[], totals. \
Each item has: name, portion, calories, protein_g, carbs_g, fat_g, sodium_mg, sugar_g. \
Use null when unsure; never invent unrealistic values.";

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MealEstimate {
    pub items: Vec<MealItem>,
    pub totals: Macros,
}

/// Numbers or numeric strings. `null`, `""` and anything unparseable are absent.
#[must_use]
pub fn num_or_none(value: Option<&Value>) -> Option<f64> {
    let n = match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() || s.eq_ignore_ascii_case("null") || s == "None" {
                None
            } else {
                s.parse::<f64>().ok()
            }
        }
        _ => None,
    }?;
    n.is_finite().then_some(n)
}

fn macros_from(obj: &Value) -> Macros {
    Macros {
        calories: num_or_none(obj.get("calories")),
        protein_g: num_or_none(obj.get("protein_g")),
        carbs_g: num_or_none(obj.get("carbs_g")),
        fat_g: num_or_none(obj.get("fat_g")),
        sodium_mg: num_or_none(obj.get("sodium_mg")),
        sugar_g: num_or_none(obj.get("sugar_g")),
    }
}

fn sum_present(values: impl Iterator<Item = Option<f64>>) -> Option<f64> {
    let total = values.flatten().fold(None, |acc: Option<f64>, v| Some(acc.unwrap_or(0.0) + v))?;
    Some((total * 100.0).round() / 100.0)
}

/// Column-wise sum over items; a field is absent when no item carries it.
#[must_use]
pub fn sum_items(items: &[MealItem]) -> Macros {
    let col = |f: fn(&Macros) -> Option<f64>| sum_present(items.iter().map(|i| f(&i.macros)));
    Macros {
        calories: col(|m| m.calories),
        protein_g: col(|m| m.protein_g),
        carbs_g: col(|m| m.carbs_g),
        fat_g: col(|m| m.fat_g),
        sodium_mg: col(|m| m.sodium_mg),
        sugar_g: col(|m| m.sugar_g),
    }
}

/// Shape a model response into items and totals.
#[must_use]
pub fn parse_estimate(data: &Value) -> MealEstimate {
    let items: Vec<MealItem> = data
        .get("items")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|it| {
                    let name = it.get("name")?.as_str()?.trim();
                    if name.is_empty() {
                        return None;
                    }
                    let portion = match it.get("portion") {
                        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
                        Some(Value::Number(n)) => Some(n.to_string()),
                        _ => None,
                    };
                    Some(MealItem {
                        name: name.to_string(),
                        portion,
                        macros: macros_from(it),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let totals = match data.get("totals") {
        Some(t) if t.as_object().is_some_and(|m| !m.is_empty()) => macros_from(t),
        _ => sum_items(&items),
    };
    MealEstimate { items, totals }
}

pub fn estimate_meal(
    generator: &dyn TextGenerationService,
    text: &str,
) -> Result<MealEstimate, GenerationError> {
    let prompt = format!("Estimate this meal: {text}\nReturn valid JSON.");
    let data = generator.generate_json(ESTIMATOR_SYSTEM, &prompt)?;
    let estimate = parse_estimate(&data);
    tracing::debug!(items = estimate.items.len(), "meal estimated");
    Ok(estimate)
}

/// A quick "items; kcal" entry.
#[derive(Debug, Clone, PartialEq)]
pub struct QuickEntry {
    pub items: Option<String>,
    pub calories: Option<f64>,
}

/// Accepts `"oats; 350"`, `"oats 350"`, `"oats"` and `"none"`.
#[must_use]
pub fn parse_items_kcal(text: &str) -> QuickEntry {
    let t = text.trim();
    if ["none", "no", "nil", "na"].iter().any(|w| t.eq_ignore_ascii_case(w)) {
        return QuickEntry {
            items: None,
            calories: Some(0.0),
        };
    }

    let (items, calories) = match t.split(';').collect::<Vec<_>>().as_slice() {
        [items, kcal] => (items.trim().to_string(), kcal.trim().parse::<u32>().ok().map(f64::from)),
        _ => {
            let mut toks: Vec<&str> = t.split_whitespace().collect();
            match toks.last().and_then(|last| last.parse::<u32>().ok()) {
                Some(kcal) => {
                    toks.pop();
                    (toks.join(" "), Some(f64::from(kcal)))
                }
                None => (t.to_string(), None),
            }
        }
    };
    QuickEntry {
        items: (!items.is_empty()).then_some(items),
        calories,
    }
}

/// Whole numbers print bare, others with one decimal; absent is "unk".
#[must_use]
pub fn fmt_num(value: Option<f64>) -> String {
    match value {
        Some(x) if x.is_finite() => {
            if (x - x.round()).abs() < 0.05 {
                format!("{}", x.round())
            } else {
                format!("{x:.1}")
            }
        }
        _ => "unk".to_string(),
    }
}

fn title_case(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

/// `"Lunch • chicken wrap (1) → kcal 520; P 30g; C 45g; F 18g; Na unkmg; Sug 4g"`
#[must_use]
pub fn meal_blurb(meal_type: &str, items: &[MealItem], raw_text: &str, totals: &Macros) -> String {
    let preview = items
        .iter()
        .filter(|it| !it.name.trim().is_empty())
        .map(|it| match &it.portion {
            Some(p) => format!("{} ({p})", it.name.trim()),
            None => it.name.trim().to_string(),
        })
        .collect::<Vec<_>>()
        .join("; ");
    let what = if preview.is_empty() { raw_text.trim() } else { &preview };
    let kcal = totals
        .calories
        .map_or_else(|| "unk".to_string(), |c| format!("{}", c.round()));
    format!(
        "{} • {what} → kcal {kcal}; P {}g; C {}g; F {}g; Na {}mg; Sug {}g",
        title_case(meal_type),
        fmt_num(totals.protein_g),
        fmt_num(totals.carbs_g),
        fmt_num(totals.fat_g),
        fmt_num(totals.sodium_mg),
        fmt_num(totals.sugar_g),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedGenerator;
    use serde_json::json;

    #[test]
    fn test_num_coercion() {
        assert_eq!(num_or_none(Some(&json!(350))), Some(350.0));
        assert_eq!(num_or_none(Some(&json!(" 12.5 "))), Some(12.5));
        assert_eq!(num_or_none(Some(&json!("null"))), None);
        assert_eq!(num_or_none(Some(&json!(""))), None);
        assert_eq!(num_or_none(Some(&json!("lots"))), None);
        assert_eq!(num_or_none(Some(&json!(null))), None);
        assert_eq!(num_or_none(None), None);
    }

    #[test]
    fn test_totals_summed_from_items_when_missing() {
        let est = parse_estimate(&json!({
            "items": [
                {"name": "eggs", "portion": "2", "calories": 156, "protein_g": "12.6"},
                {"name": "toast", "calories": "80", "sodium_mg": null},
                {"name": "", "calories": 999}
            ]
        }));
        assert_eq!(est.items.len(), 2);
        assert_eq!(est.items[0].portion.as_deref(), Some("2"));
        assert_eq!(est.totals.calories, Some(236.0));
        assert_eq!(est.totals.protein_g, Some(12.6));
        assert_eq!(est.totals.sodium_mg, None);
    }

    #[test]
    fn test_explicit_totals_win() {
        let est = parse_estimate(&json!({
            "items": [{"name": "salad", "calories": 100}],
            "totals": {"calories": 120, "fat_g": "7"}
        }));
        assert_eq!(est.totals.calories, Some(120.0));
        assert_eq!(est.totals.fat_g, Some(7.0));
        assert_eq!(est.totals.protein_g, None);
    }

    #[test]
    fn test_estimate_meal_tolerates_prose() {
        let generator = ScriptedGenerator::replying(
            "Sure! {\"items\": [{\"name\": \"banana\", \"calories\": 105}]} Enjoy.",
        );
        let est = estimate_meal(&generator, "a banana").unwrap();
        assert_eq!(est.items[0].name, "banana");
        assert_eq!(est.totals.calories, Some(105.0));
        let (system, prompt) = generator.last_prompt().unwrap();
        assert!(system.starts_with("You are a careful nutrition estimator."));
        assert!(prompt.starts_with("Estimate this meal: a banana"));
    }

    #[test]
    fn test_estimate_meal_propagates_generation_errors() {
        let generator = ScriptedGenerator::replying("no json here");
        assert!(matches!(
            estimate_meal(&generator, "x"),
            Err(GenerationError::Malformed(_))
        ));
    }

    #[test]
    fn test_parse_items_kcal_forms() {
        assert_eq!(
            parse_items_kcal("oats with berries; 350"),
            QuickEntry {
                items: Some("oats with berries".to_string()),
                calories: Some(350.0)
            }
        );
        assert_eq!(
            parse_items_kcal("oats 350"),
            QuickEntry {
                items: Some("oats".to_string()),
                calories: Some(350.0)
            }
        );
        assert_eq!(parse_items_kcal("soup; lots").calories, None);
        assert_eq!(parse_items_kcal("just soup").items.as_deref(), Some("just soup"));
        assert_eq!(
            parse_items_kcal("None"),
            QuickEntry {
                items: None,
                calories: Some(0.0)
            }
        );
    }

    #[test]
    fn test_fmt_num() {
        assert_eq!(fmt_num(Some(30.0)), "30");
        assert_eq!(fmt_num(Some(29.97)), "30");
        assert_eq!(fmt_num(Some(4.26)), "4.3");
        assert_eq!(fmt_num(None), "unk");
    }

    #[test]
    fn test_blurb_format() {
        let items = vec![MealItem {
            name: "chicken wrap".to_string(),
            portion: Some("1".to_string()),
            macros: Macros::default(),
        }];
        let totals = Macros {
            calories: Some(520.0),
            protein_g: Some(30.0),
            carbs_g: Some(45.0),
            fat_g: Some(18.0),
            sodium_mg: None,
            sugar_g: Some(4.0),
        };
        assert_eq!(
            meal_blurb("lunch", &items, "wrap", &totals),
            "Lunch • chicken wrap (1) → kcal 520; P 30g; C 45g; F 18g; Na unkmg; Sug 4g"
        );
        assert_eq!(
            meal_blurb("snacks", &[], " apple ", &Macros::default()),
            "Snacks • apple → kcal unk; P unkg; C unkg; F unkg; Na unkmg; Sug unkg"
        );
    }
}
