//! Template substitution for task text.
//!
//! Supported patterns:
//! - `${steps.<id>.output}` — output from a previous step
//! - `${<var>}` — extra variables (e.g. the loop variable), then step outputs
//!
//! Unresolved placeholders are left literal so missing references are
//! visible in the dispatched prompt rather than silently blanked.

use std::collections::HashMap;

/// Render a JSON output value for prompt embedding: bare strings stay bare,
/// everything else is serialized.
fn render(value: &serde_json::Value) -> String {
    match value.as_str() {
        Some(s) => s.to_string(),
        None => value.to_string(),
    }
}

/// Resolve template variables in a string.
pub fn resolve(
    template: &str,
    step_outputs: &HashMap<String, serde_json::Value>,
    vars: &HashMap<String, String>,
) -> String {
    // Replace ${steps.<id>.output}
    let step_re = regex::Regex::new(r"\$\{steps\.([^.}]+)\.output\}").unwrap();
    let result = step_re.replace_all(template, |caps: &regex::Captures| {
        let step_id = &caps[1];
        step_outputs
            .get(step_id)
            .map(render)
            .unwrap_or_else(|| format!("${{steps.{}.output}}", step_id))
    });

    // Replace remaining ${...} with vars, then step outputs by bare id
    let generic_re = regex::Regex::new(r"\$\{([^}]+)\}").unwrap();
    generic_re
        .replace_all(&result, |caps: &regex::Captures| {
            let key = &caps[1];
            vars.get(key)
                .cloned()
                .or_else(|| step_outputs.get(key).map(|v| render(v)))
                .unwrap_or_else(|| format!("${{{}}}", key))
        })
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resolves_step_outputs_and_vars() {
        let mut outputs = HashMap::new();
        outputs.insert("refine".to_string(), json!("refined requirements"));
        outputs.insert("tests".to_string(), json!({"failed": 0}));
        let mut vars = HashMap::new();
        vars.insert("item".to_string(), "us-east-1".to_string());

        assert_eq!(
            resolve("Previous: ${steps.refine.output}", &outputs, &vars),
            "Previous: refined requirements"
        );
        assert_eq!(
            resolve("Deploy to ${item}", &outputs, &vars),
            "Deploy to us-east-1"
        );
        assert_eq!(
            resolve("Report: ${steps.tests.output}", &outputs, &vars),
            "Report: {\"failed\":0}"
        );
    }

    #[test]
    fn unresolved_placeholders_stay_literal() {
        let outputs = HashMap::new();
        let vars = HashMap::new();
        assert_eq!(
            resolve("Use ${steps.missing.output} here", &outputs, &vars),
            "Use ${steps.missing.output} here"
        );
        assert_eq!(resolve("Use ${nothing}", &outputs, &vars), "Use ${nothing}");
    }
}
