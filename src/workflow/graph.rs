use std::collections::{HashMap, HashSet};

use super::{WorkflowDefinition, WorkflowError};

/// Validate the step graph and partition it into waves of step indices.
///
/// Wave `k` holds the steps whose dependencies all sit in earlier waves, in
/// declaration order. Every problem found is reported in one error.
pub fn plan(definition: &WorkflowDefinition) -> Result<Vec<Vec<usize>>, WorkflowError> {
    if definition.steps.is_empty() {
        return Err(WorkflowError::Validation {
            issues: vec!["workflow must declare at least one step".to_string()],
        });
    }

    let mut issues = Vec::new();
    let mut index_of: HashMap<&str, usize> = HashMap::new();
    for (index, step) in definition.steps.iter().enumerate() {
        if index_of.insert(step.id.as_str(), index).is_some() {
            issues.push(format!("duplicate step id '{}'", step.id));
        }
    }

    // dependencies[i]: distinct known steps that step i waits for
    let mut dependencies: Vec<HashSet<usize>> = vec![HashSet::new(); definition.steps.len()];
    for (index, step) in definition.steps.iter().enumerate() {
        for dependency in &step.depends_on {
            match index_of.get(dependency.as_str()) {
                Some(&target) => {
                    dependencies[index].insert(target);
                }
                None => issues.push(format!(
                    "step '{}' depends on unknown step '{}'",
                    step.id, dependency
                )),
            }
        }
    }

    let waves = kahn_waves(&dependencies);
    let placed: usize = waves.iter().map(Vec::len).sum();
    if placed < definition.steps.len() {
        let in_wave: HashSet<usize> = waves.iter().flatten().copied().collect();
        let stuck: Vec<&str> = definition
            .steps
            .iter()
            .enumerate()
            .filter(|(index, _)| !in_wave.contains(index))
            .map(|(_, step)| step.id.as_str())
            .collect();
        issues.push(format!(
            "circular dependency between steps: {}",
            stuck.join(", ")
        ));
    }

    if issues.is_empty() {
        Ok(waves)
    } else {
        Err(WorkflowError::Validation { issues })
    }
}

pub fn validate(definition: &WorkflowDefinition) -> Result<(), WorkflowError> {
    plan(definition).map(|_| ())
}

fn kahn_waves(dependencies: &[HashSet<usize>]) -> Vec<Vec<usize>> {
    let mut in_degree: Vec<usize> = dependencies.iter().map(HashSet::len).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); dependencies.len()];
    for (step, deps) in dependencies.iter().enumerate() {
        for &dep in deps {
            dependents[dep].push(step);
        }
    }

    let mut waves = Vec::new();
    let mut current: Vec<usize> = (0..dependencies.len())
        .filter(|&step| in_degree[step] == 0)
        .collect();

    while !current.is_empty() {
        let mut next = Vec::new();
        for &step in &current {
            for &dependent in &dependents[step] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    next.push(dependent);
                }
            }
        }
        next.sort_unstable();
        waves.push(std::mem::replace(&mut current, next));
    }

    waves
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::WorkflowStep;

    fn workflow(steps: Vec<WorkflowStep>) -> WorkflowDefinition {
        WorkflowDefinition {
            id: "wf".to_string(),
            name: "Workflow".to_string(),
            description: None,
            steps,
        }
    }

    fn issues(definition: &WorkflowDefinition) -> Vec<String> {
        match plan(definition) {
            Err(WorkflowError::Validation { issues }) => issues,
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_workflow() {
        let found = issues(&workflow(vec![]));
        assert_eq!(found, vec!["workflow must declare at least one step"]);
    }

    #[test]
    fn test_unknown_dependency() {
        let found = issues(&workflow(vec![WorkflowStep::new("a", "p").after(&["ghost"])]));
        assert_eq!(found.len(), 1);
        assert!(found[0].contains("unknown step"));
        assert!(found[0].contains("ghost"));
    }

    #[test]
    fn test_cycle() {
        let found = issues(&workflow(vec![
            WorkflowStep::new("a", "p").after(&["b"]),
            WorkflowStep::new("b", "p").after(&["a"]),
            WorkflowStep::new("c", "p"),
        ]));
        assert_eq!(found, vec!["circular dependency between steps: a, b"]);
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let found = issues(&workflow(vec![WorkflowStep::new("a", "p").after(&["a"])]));
        assert!(found[0].contains("circular dependency"));
    }

    #[test]
    fn test_all_issues_reported_together() {
        let found = issues(&workflow(vec![
            WorkflowStep::new("a", "p"),
            WorkflowStep::new("a", "p"),
            WorkflowStep::new("b", "p").after(&["missing"]),
        ]));
        assert_eq!(found.len(), 2);
        assert!(found[0].contains("duplicate step id 'a'"));
        assert!(found[1].contains("unknown step"));
    }

    #[test]
    fn test_diamond_waves() {
        let waves = plan(&workflow(vec![
            WorkflowStep::new("a", "p"),
            WorkflowStep::new("b", "p").after(&["a"]),
            WorkflowStep::new("c", "p").after(&["a"]),
            WorkflowStep::new("d", "p").after(&["b", "c"]),
        ]))
        .unwrap();
        assert_eq!(waves, vec![vec![0], vec![1, 2], vec![3]]);
    }

    #[test]
    fn test_repeated_dependency_counts_once() {
        let waves = plan(&workflow(vec![
            WorkflowStep::new("a", "p"),
            WorkflowStep::new("b", "p").after(&["a", "a"]),
        ]))
        .unwrap();
        assert_eq!(waves, vec![vec![0], vec![1]]);
    }
}
