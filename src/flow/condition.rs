use crate::node::{ConditionConfig, ConditionOperator};

/// Evaluates a condition node against the current variable value.
///
/// A missing variable compares as the empty string. `equals` is numeric when
/// both sides parse as numbers and case-insensitive otherwise; `greater` and
/// `less` are numeric only and false when either side is not a number.
pub fn evaluate(config: &ConditionConfig, actual: Option<&str>) -> bool {
    let actual = actual.unwrap_or("").trim();
    let expected = config.value.trim();

    match config.operator {
        ConditionOperator::Equals => match (number(actual), number(expected)) {
            (Some(a), Some(b)) => a == b,
            _ => actual.to_lowercase() == expected.to_lowercase(),
        },
        ConditionOperator::Contains => actual.to_lowercase().contains(&expected.to_lowercase()),
        ConditionOperator::Greater => match (number(actual), number(expected)) {
            (Some(a), Some(b)) => a > b,
            _ => false,
        },
        ConditionOperator::Less => match (number(actual), number(expected)) {
            (Some(a), Some(b)) => a < b,
            _ => false,
        },
    }
}

fn number(s: &str) -> Option<f64> {
    s.parse::<f64>().ok().filter(|n| n.is_finite())
}
