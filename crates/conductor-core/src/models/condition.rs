//! Conditional-step predicates.
//!
//! A predicate is either a structured rule tree (nested groups combined by
//! AND/OR over typed comparisons) or a legacy template-substituted boolean
//! expression. The legacy form is deprecated and evaluated via safe
//! substitution plus literal parsing — never arbitrary code execution.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// How a group combines its children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Combinator {
    And,
    Or,
}

/// Typed comparison operator for a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparator {
    Eq,
    Ne,
    Contains,
    Gt,
    Gte,
    Lt,
    Lte,
    Exists,
}

/// Recursive predicate evaluated against accumulated step outputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    /// Leaf comparison. `field` names a step id, optionally followed by a
    /// dotted path into that step's JSON output (e.g. `"lint.summary.errors"`).
    Rule {
        field: String,
        op: Comparator,
        #[serde(default)]
        value: serde_json::Value,
    },
    Group {
        combinator: Combinator,
        children: Vec<Condition>,
    },
    /// Deprecated string expression, e.g. `"${steps.lint.output} == clean"`.
    Legacy { expression: String },
}

impl Condition {
    /// Evaluate against a map of step id → output value. Pure.
    pub fn evaluate(
        &self,
        context: &HashMap<String, serde_json::Value>,
    ) -> Result<bool, CoreError> {
        match self {
            Condition::Rule { field, op, value } => {
                let resolved = lookup(context, field);
                Ok(compare(resolved.as_ref(), *op, value))
            }
            Condition::Group {
                combinator,
                children,
            } => {
                if children.is_empty() {
                    return Err(CoreError::Validation(
                        "Condition group has no children".to_string(),
                    ));
                }
                match combinator {
                    Combinator::And => {
                        for child in children {
                            if !child.evaluate(context)? {
                                return Ok(false);
                            }
                        }
                        Ok(true)
                    }
                    Combinator::Or => {
                        for child in children {
                            if child.evaluate(context)? {
                                return Ok(true);
                            }
                        }
                        Ok(false)
                    }
                }
            }
            Condition::Legacy { expression } => {
                tracing::warn!(
                    "[Condition] Legacy string expression in use (deprecated): {}",
                    expression
                );
                Ok(evaluate_legacy(expression, context))
            }
        }
    }
}

/// Resolve `stepId` or `stepId.path.to.field` against the output map.
fn lookup(
    context: &HashMap<String, serde_json::Value>,
    field: &str,
) -> Option<serde_json::Value> {
    let mut parts = field.split('.');
    let step_id = parts.next()?;
    let mut current = context.get(step_id)?.clone();
    for part in parts {
        current = current.get(part)?.clone();
    }
    Some(current)
}

fn compare(actual: Option<&serde_json::Value>, op: Comparator, expected: &serde_json::Value) -> bool {
    if op == Comparator::Exists {
        return actual.is_some();
    }
    let Some(actual) = actual else {
        // Missing fields match nothing except inequality.
        return op == Comparator::Ne;
    };

    match op {
        Comparator::Eq => loosely_equal(actual, expected),
        Comparator::Ne => !loosely_equal(actual, expected),
        Comparator::Contains => match (actual.as_str(), expected.as_str()) {
            (Some(hay), Some(needle)) => hay.contains(needle),
            _ => actual
                .as_array()
                .map(|arr| arr.contains(expected))
                .unwrap_or(false),
        },
        Comparator::Gt | Comparator::Gte | Comparator::Lt | Comparator::Lte => {
            let (Some(a), Some(b)) = (as_number(actual), as_number(expected)) else {
                return false;
            };
            match op {
                Comparator::Gt => a > b,
                Comparator::Gte => a >= b,
                Comparator::Lt => a < b,
                Comparator::Lte => a <= b,
                _ => unreachable!(),
            }
        }
        Comparator::Exists => unreachable!(),
    }
}

/// Equality that tolerates string/number representation drift in outputs.
fn loosely_equal(a: &serde_json::Value, b: &serde_json::Value) -> bool {
    if a == b {
        return true;
    }
    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) => x == y,
        _ => match (a.as_str(), b.as_str()) {
            (Some(x), _) => Some(x) == b.as_str() || x == b.to_string(),
            (_, Some(y)) => a.to_string() == y,
            _ => false,
        },
    }
}

fn as_number(v: &serde_json::Value) -> Option<f64> {
    v.as_f64().or_else(|| v.as_str()?.trim().parse().ok())
}

/// Evaluate a legacy expression: substitute `${steps.<id>.output}` and
/// `${<id>}` references, then parse literally. Supports a single `==`/`!=`
/// comparison of trimmed operands (quotes stripped); anything else is
/// truthiness of the substituted string.
fn evaluate_legacy(expression: &str, context: &HashMap<String, serde_json::Value>) -> bool {
    let substituted = crate::engine::template::resolve(expression, context, &HashMap::new());

    if let Some((lhs, rhs)) = substituted.split_once("!=") {
        return normalize(lhs) != normalize(rhs);
    }
    if let Some((lhs, rhs)) = substituted.split_once("==") {
        return normalize(lhs) == normalize(rhs);
    }

    !matches!(
        substituted.trim().to_lowercase().as_str(),
        "" | "false" | "0" | "null" | "undefined"
    )
}

fn normalize(s: &str) -> String {
    s.trim().trim_matches(|c| c == '"' || c == '\'').to_string()
}
