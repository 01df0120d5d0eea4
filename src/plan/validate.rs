//! Plan validation
//!
//! Validation never mutates the plan; it returns a typed set of messages.
//! Errors block execution, warnings and infos are advisory.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use super::{derive_execution_order, Plan};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

/// A single validation finding, optionally anchored to a task and field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationMessage {
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related_ids: Vec<String>,
}

impl ValidationMessage {
    fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            task_id: None,
            field: None,
            suggestion: None,
            related_ids: Vec::new(),
        }
    }

    fn on_task(mut self, task_id: &str) -> Self {
        self.task_id = Some(task_id.to_string());
        self
    }

    fn on_field(mut self, field: &str) -> Self {
        self.field = Some(field.to_string());
        self
    }

    fn suggest(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    fn related(mut self, ids: Vec<String>) -> Self {
        self.related_ids = ids;
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationResult {
    pub messages: Vec<ValidationMessage>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        !self
            .messages
            .iter()
            .any(|m| m.severity == Severity::Error)
    }

    pub fn errors(&self) -> impl Iterator<Item = &ValidationMessage> {
        self.messages
            .iter()
            .filter(|m| m.severity == Severity::Error)
    }

    pub fn summary(&self) -> String {
        self.errors()
            .map(|m| m.message.clone())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Validate a plan. Deterministic: messages are emitted in a fixed order
/// for a given plan.
pub fn validate(plan: &Plan) -> ValidationResult {
    let mut messages = Vec::new();

    if plan.tasks.is_empty() {
        messages.push(ValidationMessage::new(
            Severity::Error,
            "plan contains no tasks",
        ));
        return ValidationResult { messages };
    }

    // Duplicate ids.
    let mut seen: HashSet<&str> = HashSet::new();
    for task in &plan.tasks {
        if !seen.insert(task.id.as_str()) {
            messages.push(
                ValidationMessage::new(
                    Severity::Error,
                    format!("duplicate task id '{}'", task.id),
                )
                .on_task(&task.id)
                .on_field("id"),
            );
        }
    }

    // Dangling references.
    let known: HashSet<&str> = plan.tasks.iter().map(|t| t.id.as_str()).collect();
    for task in &plan.tasks {
        for dep in &task.depends_on {
            if !known.contains(dep.as_str()) {
                messages.push(
                    ValidationMessage::new(
                        Severity::Error,
                        format!("task '{}' depends on unknown task '{}'", task.id, dep),
                    )
                    .on_task(&task.id)
                    .on_field("depends_on")
                    .suggest(format!("remove '{}' or add a task with that id", dep)),
                );
            }
        }
    }

    // Per-task field checks.
    for task in &plan.tasks {
        if task.description.trim().is_empty() {
            messages.push(
                ValidationMessage::new(
                    Severity::Error,
                    format!("task '{}' has an empty description", task.id),
                )
                .on_task(&task.id)
                .on_field("description"),
            );
        }
        if task.title.trim().is_empty() {
            messages.push(
                ValidationMessage::new(
                    Severity::Warning,
                    format!("task '{}' has an empty title", task.id),
                )
                .on_task(&task.id)
                .on_field("title"),
            );
        }
        if task.complexity.is_none() {
            messages.push(
                ValidationMessage::new(
                    Severity::Warning,
                    format!("task '{}' has no complexity tag", task.id),
                )
                .on_task(&task.id)
                .on_field("complexity")
                .suggest("tag as low, medium, or high"),
            );
        }
    }

    // Cycle check, only meaningful once references resolve.
    let has_reference_errors = messages.iter().any(|m| m.severity == Severity::Error);
    if !has_reference_errors {
        if let Err(err) = derive_execution_order(plan) {
            let mut cycle_ids = cycle_members(plan);
            cycle_ids.sort();
            messages.push(
                ValidationMessage::new(Severity::Error, err.to_string()).related(cycle_ids),
            );
        } else {
            soft_checks(plan, &mut messages);
        }
    }

    ValidationResult { messages }
}

/// Tasks that can never become ready: the participants of some cycle
/// (plus anything downstream of one, which is close enough for a report).
fn cycle_members(plan: &Plan) -> Vec<String> {
    let mut scheduled: HashSet<&str> = HashSet::new();
    loop {
        let ready: Vec<&str> = plan
            .tasks
            .iter()
            .filter(|t| !scheduled.contains(t.id.as_str()))
            .filter(|t| t.depends_on.iter().all(|d| scheduled.contains(d.as_str())))
            .map(|t| t.id.as_str())
            .collect();
        if ready.is_empty() {
            break;
        }
        scheduled.extend(ready);
    }
    plan.tasks
        .iter()
        .filter(|t| !scheduled.contains(t.id.as_str()))
        .map(|t| t.id.clone())
        .collect()
}

fn soft_checks(plan: &Plan, messages: &mut Vec<ValidationMessage>) {
    let order = match derive_execution_order(plan) {
        Ok(order) => order,
        Err(_) => return,
    };

    // Two tasks in the same group touching the same file.
    for group in &order {
        let mut file_owners: HashMap<&str, &str> = HashMap::new();
        for id in group {
            let Some(task) = plan.task(id) else { continue };
            for file in &task.files {
                if let Some(other) = file_owners.get(file.as_str()) {
                    messages.push(
                        ValidationMessage::new(
                            Severity::Warning,
                            format!(
                                "tasks '{}' and '{}' run in the same group and both list file '{}'",
                                other, id, file
                            ),
                        )
                        .on_task(id)
                        .on_field("files")
                        .suggest("add a dependency between them or split the file work")
                        .related(vec![other.to_string(), id.clone()]),
                    );
                } else {
                    file_owners.insert(file.as_str(), id.as_str());
                }
            }
        }
    }

    // Fully isolated tasks.
    let has_dependents: HashSet<&str> = plan
        .tasks
        .iter()
        .flat_map(|t| t.depends_on.iter().map(String::as_str))
        .collect();
    for task in &plan.tasks {
        if plan.tasks.len() > 1
            && task.depends_on.is_empty()
            && !has_dependents.contains(task.id.as_str())
        {
            messages.push(
                ValidationMessage::new(
                    Severity::Info,
                    format!(
                        "task '{}' has no dependencies in either direction",
                        task.id
                    ),
                )
                .on_task(&task.id)
                .suggest("consider merging it into a related group"),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{Complexity, PlannedTask};

    fn task(id: &str, deps: &[&str]) -> PlannedTask {
        PlannedTask {
            id: id.to_string(),
            title: format!("task {}", id),
            description: format!("do {}", id),
            files: Vec::new(),
            depends_on: deps.iter().map(|s| s.to_string()).collect(),
            priority: 0,
            complexity: Some(Complexity::Low),
        }
    }

    #[test]
    fn test_valid_plan_passes() {
        let plan = Plan {
            tasks: vec![task("t1", &[]), task("t2", &["t1"])],
            ..Default::default()
        };
        let result = validate(&plan);
        assert!(result.is_valid(), "{:?}", result.messages);
    }

    #[test]
    fn test_cycle_lists_participants() {
        let plan = Plan {
            tasks: vec![task("a", &["b"]), task("b", &["a"]), task("c", &[])],
            ..Default::default()
        };
        let result = validate(&plan);
        assert!(!result.is_valid());
        let cycle_msg = result
            .errors()
            .find(|m| m.message.contains("cycle"))
            .expect("cycle error");
        assert_eq!(cycle_msg.related_ids, vec!["a", "b"]);
    }

    #[test]
    fn test_dangling_reference_is_error() {
        let plan = Plan {
            tasks: vec![task("a", &["missing"])],
            ..Default::default()
        };
        let result = validate(&plan);
        assert!(!result.is_valid());
        let msg = result.errors().next().unwrap();
        assert_eq!(msg.field.as_deref(), Some("depends_on"));
        assert_eq!(msg.task_id.as_deref(), Some("a"));
    }

    #[test]
    fn test_duplicate_ids() {
        let plan = Plan {
            tasks: vec![task("a", &[]), task("a", &[])],
            ..Default::default()
        };
        assert!(!validate(&plan).is_valid());
    }

    #[test]
    fn test_empty_description_error_empty_title_warning() {
        let mut t = task("a", &[]);
        t.description = String::new();
        t.title = String::new();
        let plan = Plan {
            tasks: vec![t],
            ..Default::default()
        };
        let result = validate(&plan);
        assert!(!result.is_valid());
        assert!(result
            .messages
            .iter()
            .any(|m| m.severity == Severity::Warning && m.field.as_deref() == Some("title")));
    }

    #[test]
    fn test_same_group_file_overlap_warns() {
        let mut a = task("a", &[]);
        a.files = vec!["src/lib.rs".to_string()];
        let mut b = task("b", &[]);
        b.files = vec!["src/lib.rs".to_string()];
        let plan = Plan {
            tasks: vec![a, b],
            ..Default::default()
        };
        let result = validate(&plan);
        assert!(result.is_valid());
        assert!(result
            .messages
            .iter()
            .any(|m| m.severity == Severity::Warning && m.message.contains("src/lib.rs")));
    }

    #[test]
    fn test_validation_deterministic() {
        let plan = Plan {
            tasks: vec![task("a", &["b"]), task("b", &["a"])],
            ..Default::default()
        };
        let first = serde_json::to_string(&validate(&plan)).unwrap();
        for _ in 0..3 {
            assert_eq!(serde_json::to_string(&validate(&plan)).unwrap(), first);
        }
    }
}
