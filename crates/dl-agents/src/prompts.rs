//! Prompt provider port.
//!
//! The task runner asks a [`PromptSource`] for the opening messages of each
//! dispatch. [`TemplatePrompts`] is the default adapter: one built-in
//! template per work category, overridable from `<category>.md` files in a
//! project directory, or per task through `properties.template`.
//! Variables are written `{name}`: `{task_id}`, `{name}`, `{category}`,
//! `{description}`, `{acceptance_criteria}`, `{output_path}`, `{workspace}`.

use std::collections::HashMap;
use std::path::Path;

use dl_core::types::{Task, WorkCategory};
use dl_harness::provider::Message;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Prompt
// ---------------------------------------------------------------------------

/// Opening messages for one dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

impl Prompt {
    pub fn into_messages(self) -> Vec<Message> {
        vec![Message::system(self.system), Message::user(self.user)]
    }
}

/// Produces the prompt for a claimed task.
pub trait PromptSource: Send + Sync {
    fn prompt_for(&self, task: &Task, workspace_dir: &Path) -> Prompt;
}

// ---------------------------------------------------------------------------
// TemplatePrompts
// ---------------------------------------------------------------------------

const SYSTEM_PROMPT: &str = "You are an autonomous software engineer working inside an isolated \
checkout at {workspace}. Use the provided tools to inspect and change files. Paths are relative \
to the checkout root. When the work is finished, reply with a short summary and no tool calls.";

const CODING_TEMPLATE: &str = "# Task: {name}

{description}

## Acceptance criteria
{acceptance_criteria}

Make the change, keep the test suite, linter and build green, and do not touch unrelated files.";

const DOCUMENTATION_TEMPLATE: &str = "# Documentation task: {name}

{description}

Write the result to `{output_path}`.

## Acceptance criteria
{acceptance_criteria}";

const OPERATIONS_TEMPLATE: &str = "# Operations task: {name}

{description}

## Acceptance criteria
{acceptance_criteria}";

const PLANNING_TEMPLATE: &str = "# Planning task: {name}

{description}

Produce a concrete, ordered plan. Record it in `{output_path}` if a path is given.

## Acceptance criteria
{acceptance_criteria}";

/// Category templates with `{variable}` expansion.
#[derive(Debug, Clone)]
pub struct TemplatePrompts {
    system: String,
    templates: HashMap<WorkCategory, String>,
}

impl Default for TemplatePrompts {
    fn default() -> Self {
        let templates = HashMap::from([
            (WorkCategory::Coding, CODING_TEMPLATE.to_string()),
            (WorkCategory::Documentation, DOCUMENTATION_TEMPLATE.to_string()),
            (WorkCategory::Operations, OPERATIONS_TEMPLATE.to_string()),
            (WorkCategory::Planning, PLANNING_TEMPLATE.to_string()),
        ]);
        Self {
            system: SYSTEM_PROMPT.to_string(),
            templates,
        }
    }
}

impl TemplatePrompts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, category: WorkCategory, template: impl Into<String>) {
        self.templates.insert(category, template.into());
    }

    pub fn set_system(&mut self, system: impl Into<String>) {
        self.system = system.into();
    }

    /// Load overrides from `<dir>/<category>.md` and `<dir>/system.md`.
    /// Missing files keep the built-in template.
    pub fn load_from_dir(&mut self, dir: &Path) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_none_or(|e| e != "md") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let content = match std::fs::read_to_string(&path) {
                Ok(c) => c,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "unreadable prompt template");
                    continue;
                }
            };
            if stem == "system" {
                self.system = content;
            } else if let Some(category) = WorkCategory::parse(stem) {
                debug!(category = %category, path = %path.display(), "prompt template override");
                self.templates.insert(category, content);
            }
        }
    }

    pub fn template(&self, category: WorkCategory) -> Option<&str> {
        self.templates.get(&category).map(String::as_str)
    }
}

impl PromptSource for TemplatePrompts {
    fn prompt_for(&self, task: &Task, workspace_dir: &Path) -> Prompt {
        let vars = variables(task, workspace_dir);
        let template = task
            .properties
            .template
            .as_deref()
            .or_else(|| self.template(task.category))
            .unwrap_or(CODING_TEMPLATE);
        Prompt {
            system: render(&self.system, &vars),
            user: render(template, &vars),
        }
    }
}

fn variables(task: &Task, workspace_dir: &Path) -> HashMap<&'static str, String> {
    let criteria = if task.properties.acceptance_criteria.is_empty() {
        "- (none given)".to_string()
    } else {
        task.properties
            .acceptance_criteria
            .iter()
            .map(|c| format!("- {c}"))
            .collect::<Vec<_>>()
            .join("\n")
    };
    HashMap::from([
        ("task_id", task.id.to_string()),
        ("name", task.name.clone()),
        ("category", task.category.to_string()),
        (
            "description",
            task.properties.description.clone().unwrap_or_default(),
        ),
        ("acceptance_criteria", criteria),
        (
            "output_path",
            task.properties.output_path.clone().unwrap_or_default(),
        ),
        ("workspace", workspace_dir.display().to_string()),
    ])
}

/// Replace `{key}` for every known variable. Unknown placeholders are kept.
pub fn render(template: &str, vars: &HashMap<&'static str, String>) -> String {
    let mut output = template.to_string();
    for (key, value) in vars {
        output = output.replace(&format!("{{{key}}}"), value);
    }
    output
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use dl_harness::provider::Role;

    #[test]
    fn coding_prompt_carries_task_fields() {
        let mut task = Task::new("Add retry budget", WorkCategory::Coding)
            .with_description("Bound retries per request.");
        task.properties.acceptance_criteria = vec!["tests cover exhaustion".into()];

        let prompt = TemplatePrompts::new().prompt_for(&task, Path::new("/tmp/ws"));
        assert!(prompt.system.contains("/tmp/ws"));
        assert!(prompt.user.contains("# Task: Add retry budget"));
        assert!(prompt.user.contains("Bound retries per request."));
        assert!(prompt.user.contains("- tests cover exhaustion"));
    }

    #[test]
    fn documentation_prompt_names_output_path() {
        let task = Task::new("Usage guide", WorkCategory::Documentation)
            .with_output_path("docs/usage.md");
        let prompt = TemplatePrompts::new().prompt_for(&task, Path::new("."));
        assert!(prompt.user.contains("`docs/usage.md`"));
        assert!(prompt.user.contains("- (none given)"));
    }

    #[test]
    fn task_template_wins_over_category() {
        let mut task = Task::new("Fix lint", WorkCategory::Coding);
        task.properties.template = Some("FIX {name} now; unknown {left_alone}".into());
        let prompt = TemplatePrompts::new().prompt_for(&task, Path::new("."));
        assert_eq!(prompt.user, "FIX Fix lint now; unknown {left_alone}");
    }

    #[test]
    fn overrides_load_from_directory() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("docs.md"), "DOCS {name}").unwrap();
        std::fs::write(tmp.path().join("system.md"), "SYS").unwrap();
        std::fs::write(tmp.path().join("notes.txt"), "ignored").unwrap();
        std::fs::write(tmp.path().join("unknown.md"), "ignored").unwrap();

        let mut prompts = TemplatePrompts::new();
        prompts.load_from_dir(tmp.path());
        assert_eq!(prompts.template(WorkCategory::Documentation), Some("DOCS {name}"));
        assert_eq!(prompts.template(WorkCategory::Coding), Some(CODING_TEMPLATE));

        let task = Task::new("Guide", WorkCategory::Documentation);
        let messages = prompts.prompt_for(&task, Path::new(".")).into_messages();
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[0].content, "SYS");
        assert_eq!(messages[1].content, "DOCS Guide");
    }

    #[test]
    fn missing_directory_keeps_defaults() {
        let mut prompts = TemplatePrompts::new();
        prompts.load_from_dir(Path::new("/definitely/not/here"));
        assert_eq!(prompts.template(WorkCategory::Planning), Some(PLANNING_TEMPLATE));
    }
}
