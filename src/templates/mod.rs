use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use crate::workflow::{WorkflowContext, WorkflowStep};

/// `{{name}}`, tolerating inner whitespace
static PLACEHOLDER_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z0-9_.-]+)\s*\}\}").expect("Invalid placeholder regex")
});

/// Substitute `{{name}}` placeholders in one pass. Unknown names are left as written.
pub fn render(template: &str, variables: &HashMap<String, String>) -> String {
    PLACEHOLDER_REGEX
        .replace_all(template, |caps: &Captures| {
            variables
                .get(&caps[1])
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Placeholder names in order of first appearance
pub fn placeholders(template: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for caps in PLACEHOLDER_REGEX.captures_iter(template) {
        let name = caps[1].to_string();
        if !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

/// Render a step prompt. Context variables are joined by the built-ins
/// `cwd`, `workflow_id` and `step_id`, which take precedence.
pub fn render_step_prompt(step: &WorkflowStep, context: &WorkflowContext) -> String {
    let mut variables = context.variables.clone();
    variables.insert("cwd".to_string(), context.cwd.display().to_string());
    variables.insert("step_id".to_string(), step.id.clone());
    if let Some(ref workflow_id) = context.workflow_id {
        variables.insert("workflow_id".to_string(), workflow_id.clone());
    }

    let rendered = render(&step.prompt, &variables);
    for name in placeholders(&rendered) {
        tracing::debug!("Step '{}' leaves {{{{{}}}}} unresolved", step.id, name);
    }
    rendered
}
