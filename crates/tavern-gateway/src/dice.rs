use std::cmp::Ordering;
use std::collections::BTreeMap;

use rand::Rng;
use serde_json::json;

use tavern_types::TavernError;
use tavern_types::models::{DiceResult, DiceRoll, RollResult};

/// Upper bound on dice in a single request.
pub const MAX_DICE: usize = 100;

/// Roll with the thread-local CSPRNG (ChaCha, seeded from the OS).
pub fn roll(request: &[DiceRoll]) -> Result<DiceResult, TavernError> {
    roll_with(&mut rand::rng(), request)
}

pub fn roll_with<R: Rng>(rng: &mut R, request: &[DiceRoll]) -> Result<DiceResult, TavernError> {
    if request.is_empty() {
        return Err(TavernError::validation("At least one die is required"));
    }
    if request.len() > MAX_DICE {
        return Err(TavernError::validation_with(
            "Too many dice in one request",
            json!({ "max": MAX_DICE, "received": request.len() }),
        ));
    }

    let mut ordered = request.to_vec();
    ordered.sort_by(display_order);

    let mut aggregated_rolls = BTreeMap::new();
    let mut total = 0;
    let results = ordered
        .into_iter()
        .map(|roll| {
            let result = rng.random_range(1..=roll.dice.sides());
            *aggregated_rolls.entry(roll.dice).or_insert(0) += 1;
            total += result;
            RollResult {
                dice: roll.dice,
                color: roll.color,
                result,
            }
        })
        .collect();

    Ok(DiceResult {
        rolls: request.to_vec(),
        aggregated_rolls,
        results,
        total,
    })
}

/// Smaller dice first; within a size, colored dice by name, uncolored last.
fn display_order(a: &DiceRoll, b: &DiceRoll) -> Ordering {
    a.dice.cmp(&b.dice).then_with(|| match (&a.color, &b.color) {
        (Some(x), Some(y)) => x.cmp(y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    })
}
