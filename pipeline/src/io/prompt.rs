//! Prompt builder for deterministic stage input.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::core::types::{Bug, ChangeRecord, PlanResult, StageName, TestResult};

const PLANNER_TEMPLATE: &str = include_str!("prompts/planner.md");
const IMPLEMENTER_TEMPLATE: &str = include_str!("prompts/implementer.md");
const VERIFIER_TEMPLATE: &str = include_str!("prompts/verifier.md");
const FIXER_TEMPLATE: &str = include_str!("prompts/fixer.md");
const SIMPLE_TEMPLATE: &str = include_str!("prompts/simple.md");

/// Drop order under budget pressure. Required sections are never dropped.
const DROP_ORDER: &[&str] = &["targets", "tests", "changes", "plan"];

/// Everything a stage template may reference.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PromptInputs {
    /// Enriched prompt when present, otherwise the original prompt.
    pub task: String,
    pub targets: Vec<String>,
    pub plan: Option<PlanResult>,
    pub changes: Vec<ChangeRecord>,
    pub bugs: Vec<Bug>,
    pub failing_tests: Vec<TestResult>,
    pub tests_dir: Option<String>,
    /// Result schema, embedded verbatim so the model can self-format.
    pub result_schema: String,
}

/// Template engine wrapper around minijinja.
struct PromptEngine {
    env: Environment<'static>,
    section_re: Regex,
}

impl PromptEngine {
    fn new() -> Result<Self> {
        let mut env = Environment::new();
        for stage in StageName::ALL {
            env.add_template(stage.as_str(), template_for(stage))
                .with_context(|| format!("load {stage} prompt template"))?;
        }
        let section_re = Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->")
            .context("compile section marker pattern")?;
        Ok(Self { env, section_re })
    }

    fn render(&self, stage: StageName, input: &PromptInputs) -> Result<String> {
        let template = self.env.get_template(stage.as_str())?;
        let rendered = template.render(context! {
            task => input.task.trim(),
            targets => &input.targets,
            plan => &input.plan,
            changes => &input.changes,
            bugs => &input.bugs,
            failing_tests => &input.failing_tests,
            tests_dir => input.tests_dir.as_deref().unwrap_or("tests"),
            result_schema => input.result_schema.trim(),
        })?;
        Ok(rendered)
    }

    /// Parse sections from rendered template output using HTML comment markers.
    ///
    /// Markers follow format: `<!-- section:KEY required|droppable -->`
    fn parse_sections(&self, rendered: &str) -> Vec<ParsedSection> {
        let markers: Vec<(usize, usize, String, bool)> = self
            .section_re
            .captures_iter(rendered)
            .filter_map(|caps| {
                let whole = caps.get(0)?;
                let key = caps.get(1)?.as_str().to_string();
                let required = caps.get(2)?.as_str() == "required";
                Some((whole.start(), whole.end(), key, required))
            })
            .collect();

        let mut sections = Vec::new();
        for (i, (_, body_start, key, required)) in markers.iter().enumerate() {
            let end = markers
                .get(i + 1)
                .map(|(start, ..)| *start)
                .unwrap_or(rendered.len());
            let content = rendered[*body_start..end].trim().to_string();
            if !content.is_empty() || *required {
                sections.push(ParsedSection {
                    key: key.clone(),
                    required: *required,
                    content,
                });
            }
        }
        sections
    }
}

fn template_for(stage: StageName) -> &'static str {
    match stage {
        StageName::Planner => PLANNER_TEMPLATE,
        StageName::Implementer => IMPLEMENTER_TEMPLATE,
        StageName::Verifier => VERIFIER_TEMPLATE,
        StageName::Fixer => FIXER_TEMPLATE,
        StageName::Simple => SIMPLE_TEMPLATE,
    }
}

/// A parsed section from rendered template output.
#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    /// Required sections survive budget pressure.
    required: bool,
    /// Full section content including header.
    content: String,
}

/// Apply budget to parsed sections, dropping droppable sections as needed.
fn apply_budget_to_sections(sections: &mut Vec<ParsedSection>, budget: usize) {
    let total_len =
        |secs: &[ParsedSection]| -> usize { secs.iter().map(|s| s.content.len()).sum() };

    if total_len(sections) <= budget {
        return;
    }

    for key in DROP_ORDER {
        if total_len(sections) <= budget {
            break;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == *key && !s.required) {
            let dropped_len = sections[idx].content.len();
            debug!(
                section = key,
                bytes_dropped = dropped_len,
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }

    // Still over budget: truncate the last section, which never holds the schema.
    let other_len: usize = sections
        .iter()
        .take(sections.len().saturating_sub(1))
        .map(|s| s.content.len())
        .sum();
    let allowed = budget.saturating_sub(other_len);
    if let Some(last) = sections.last_mut()
        && last.content.len() > allowed
    {
        let before_len = last.content.len();
        let keep = if allowed > 12 { allowed - 12 } else { allowed };
        let mut cut = keep;
        while !last.content.is_char_boundary(cut) {
            cut -= 1;
        }
        last.content.truncate(cut);
        if allowed > 12 {
            last.content.push_str("\n[truncated]");
        }
        debug!(
            section = %last.key,
            before_len,
            after_len = last.content.len(),
            "truncated section for budget"
        );
    }
}

/// Render sections back to a single string.
fn render_sections(sections: &[ParsedSection]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Builds stage prompts within a byte budget, dropping less critical sections first.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        Self { budget_bytes }
    }

    pub fn build(&self, stage: StageName, input: &PromptInputs) -> Result<PromptPack> {
        let engine = PromptEngine::new()?;
        let rendered = engine
            .render(stage, input)
            .with_context(|| format!("render {stage} prompt"))?;

        let mut sections = engine.parse_sections(&rendered);
        apply_budget_to_sections(&mut sections, self.budget_bytes);

        Ok(PromptPack {
            content: render_sections(&sections),
        })
    }
}

/// A rendered prompt ready to send to the gateway.
#[derive(Debug, Clone)]
pub struct PromptPack {
    content: String,
}

impl PromptPack {
    pub fn render(&self) -> String {
        self.content.clone()
    }

    pub fn as_str(&self) -> &str {
        &self.content
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{ChangeAction, PlanAction, PlanStep, Severity};

    fn inputs() -> PromptInputs {
        PromptInputs {
            task: "Add input validation to the signup handler".to_string(),
            targets: vec!["src/signup.ts".to_string()],
            plan: Some(PlanResult {
                plan: vec![PlanStep {
                    step: 1,
                    file: "src/signup.ts".to_string(),
                    action: PlanAction::Modify,
                    description: "validate email".to_string(),
                }],
                files_to_modify: vec!["src/signup.ts".to_string()],
                considerations: "keep error messages stable".to_string(),
            }),
            changes: vec![ChangeRecord {
                file: "src/signup.ts".to_string(),
                action: ChangeAction::Modified,
                summary: "validate email".to_string(),
            }],
            bugs: vec![Bug {
                file: "src/signup.ts".to_string(),
                line: 12,
                description: "empty string accepted".to_string(),
                severity: Severity::High,
            }],
            failing_tests: vec![TestResult {
                name: "rejects empty email".to_string(),
                passed: false,
                output: "expected 400, got 200".to_string(),
            }],
            tests_dir: Some("/repo/tests".to_string()),
            result_schema: r#"{"type":"object"}"#.to_string(),
        }
    }

    /// Verifies every template renders and embeds the result schema.
    #[test]
    fn every_stage_embeds_schema_and_task() {
        let builder = PromptBuilder::new(100_000);
        for stage in StageName::ALL {
            let content = builder.build(stage, &inputs()).expect("build").render();
            assert!(content.contains("### Result Schema"), "{stage} schema");
            assert!(content.contains(r#"{"type":"object"}"#), "{stage} schema body");
            assert!(content.contains("signup handler"), "{stage} task");
        }
    }

    /// Verifies fixer sections appear in deterministic order.
    #[test]
    fn fixer_prompt_ordering_is_stable() {
        let content = PromptBuilder::new(100_000)
            .build(StageName::Fixer, &inputs())
            .expect("build")
            .render();
        let contract = content.find("### Fixer Contract").expect("contract");
        let schema = content.find("### Result Schema").expect("schema");
        let task = content.find("### Task").expect("task");
        let changes = content.find("### Files Already Touched").expect("changes");
        let tests = content.find("### Failing Tests").expect("tests");
        let bugs = content.find("### Bugs").expect("bugs");
        assert!(contract < schema && schema < task && task < changes);
        assert!(changes < tests && tests < bugs);
        assert!(content.contains("[high] `src/signup.ts:12`"));
    }

    #[test]
    fn implementer_prompt_lists_plan_steps() {
        let content = PromptBuilder::new(100_000)
            .build(StageName::Implementer, &inputs())
            .expect("build")
            .render();
        assert!(content.contains("1. [modify] `src/signup.ts`: validate email"));
        assert!(content.contains("keep error messages stable"));
    }

    #[test]
    fn verifier_prompt_names_tests_dir() {
        let content = PromptBuilder::new(100_000)
            .build(StageName::Verifier, &inputs())
            .expect("build")
            .render();
        assert!(content.contains("/repo/tests"));
        assert!(content.contains("`src/signup.ts` (modified)"));
    }

    /// Verifies budget enforcement drops droppable sections but keeps required ones.
    #[test]
    fn budget_drops_less_critical_sections_first() {
        let mut input = inputs();
        input.failing_tests[0].output = "x".repeat(5_000);
        input.changes[0].summary = "y".repeat(2_000);
        let content = PromptBuilder::new(1_500)
            .build(StageName::Fixer, &input)
            .expect("build")
            .render();
        assert!(!content.contains("### Failing Tests"), "tests dropped");
        assert!(!content.contains("### Files Already Touched"), "changes dropped");
        assert!(content.contains("### Fixer Contract"));
        assert!(content.contains("### Result Schema"));
        assert!(content.contains("### Bugs"));
    }

    #[test]
    fn empty_optional_sections_are_omitted() {
        let mut input = inputs();
        input.targets.clear();
        let content = PromptBuilder::new(100_000)
            .build(StageName::Planner, &input)
            .expect("build")
            .render();
        assert!(!content.contains("### Target Paths"));
    }
}
