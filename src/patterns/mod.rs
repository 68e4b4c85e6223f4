//! Pattern extraction: distilling a bounded, reusable workflow from a
//! run's persisted steps.
//!
//! Extraction is total and idempotent — the same steps always produce a
//! byte-identical rendered block — and yields `None` when no usable steps
//! survive filtering, in which case nothing is cached.

pub mod extractors;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::service::models::{PatternRecord, Step, StepRole, TaskType};
use crate::util::{clamp_chars, collapse_whitespace};

/// Maximum steps retained in a pattern; the tail is truncated.
pub const MAX_PATTERN_STEPS: usize = 12;

/// Maximum characters per normalized step instruction and per summary.
pub const INSTRUCTION_CHARS: usize = 160;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PatternStep {
    pub instruction: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VariableSpec {
    #[serde(rename = "type")]
    pub kind: String,
    pub example: String,
    pub description: String,
}

/// A reusable workflow distilled from one successful run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Pattern {
    pub id: String,
    pub source_run_id: String,
    pub name: String,
    pub summary: String,
    pub steps: Vec<PatternStep>,
    pub variables: BTreeMap<String, VariableSpec>,
}

impl Pattern {
    /// Convert into the persistable record, rendering the XML block once.
    pub fn to_record(&self, project_id: &str) -> PatternRecord {
        PatternRecord {
            id: self.id.clone(),
            source_run_id: self.source_run_id.clone(),
            project_id: project_id.to_string(),
            name: self.name.clone(),
            summary: self.summary.clone(),
            steps: self
                .steps
                .iter()
                .map(|s| serde_json::json!({ "instruction": s.instruction }))
                .collect(),
            variables: serde_json::to_value(&self.variables)
                .unwrap_or_else(|_| serde_json::json!({})),
            rendered: render_pattern_block(self),
            created_at: String::new(),
        }
    }
}

fn normalize_instruction(text: &str) -> String {
    clamp_chars(&collapse_whitespace(text), INSTRUCTION_CHARS)
}

/// Only assistant/tool steps with a recorded successful outcome survive;
/// steps with no outcome (e.g. planner reply messages) carry no evidence
/// the action worked and are excluded.
fn keep_step(step: &Step) -> bool {
    matches!(step.role, StepRole::Assistant | StepRole::Tool) && step.outcome_ok == Some(true)
}

/// Distill a pattern from a run's steps. Returns `None` when the filtered
/// step list is empty (empty runs, all-failed runs).
pub fn extract_pattern_from_steps(
    run_id: &str,
    steps: &[Step],
    instructions: &str,
    task_type: TaskType,
) -> Option<Pattern> {
    let mut kept: Vec<(&Step, String)> = Vec::new();
    for step in steps.iter().filter(|s| keep_step(s)) {
        let normalized = normalize_instruction(&step.content);
        if normalized.is_empty() {
            continue;
        }
        kept.push((step, normalized));
    }
    if kept.is_empty() {
        return None;
    }
    kept.truncate(MAX_PATTERN_STEPS);

    let summary = kept
        .iter()
        .find(|(step, _)| step.role == StepRole::Assistant)
        .map(|(_, text)| text.clone())
        .unwrap_or_else(|| kept[0].1.clone());
    let summary = clamp_chars(&summary, INSTRUCTION_CHARS);

    let mut variables = BTreeMap::new();
    extractors::discover_variables(task_type, instructions, &mut variables);
    for (_, text) in &kept {
        extractors::discover_variables(task_type, text, &mut variables);
    }

    Some(Pattern {
        id: format!("pat-{}", run_id),
        source_run_id: run_id.to_string(),
        name: format!("Pattern from {}", run_id),
        summary,
        steps: kept
            .into_iter()
            .map(|(_, instruction)| PatternStep { instruction })
            .collect(),
        variables,
    })
}

/// Render the injectable `<reference_workflow>` block.
pub fn render_pattern_block(pattern: &Pattern) -> String {
    let mut lines = Vec::new();
    lines.push(format!("<reference_workflow id=\"{}\">", pattern.id));
    let summary = if pattern.summary.is_empty() {
        "Follow the proven approach from the reference run."
    } else {
        &pattern.summary
    };
    lines.push(format!("What worked before: {}", summary));
    lines.push(String::new());
    lines.push("Sequence:".to_string());
    for (idx, step) in pattern.steps.iter().enumerate() {
        lines.push(format!("{}. {}", idx + 1, step.instruction));
    }
    lines.push(String::new());
    lines.push("Variables:".to_string());
    if pattern.variables.is_empty() {
        lines.push("- none discovered".to_string());
    } else {
        for (name, spec) in &pattern.variables {
            lines.push(format!("- {}: {} (ex: {})", name, spec.kind, spec.example));
        }
    }
    lines.push(String::new());
    lines.push(
        "Apply the same sequence when it fits. If critical context is missing, ask once, \
         then continue with the user's goal."
            .to_string(),
    );
    lines.push("</reference_workflow>".to_string());
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(seq: i64, role: StepRole, content: &str, ok: Option<bool>) -> Step {
        Step {
            id: format!("step-{}", seq),
            run_id: "run-1".into(),
            seq,
            role,
            content: content.into(),
            files: vec![],
            notes: vec![],
            outcome_ok: ok,
            created_at: "2024-01-01T00:00:00Z".into(),
        }
    }

    #[test]
    fn test_extract_keeps_assistant_and_tool_steps() {
        let steps = vec![
            step(0, StepRole::User, "do the thing", None),
            step(1, StepRole::Tool, "touch hello.txt", Some(true)),
            step(2, StepRole::Assistant, "Created hello.txt", Some(true)),
        ];
        let pattern =
            extract_pattern_from_steps("run-1", &steps, "touch hello.txt", TaskType::Code)
                .unwrap();
        assert_eq!(pattern.steps.len(), 2);
        assert_eq!(pattern.steps[0].instruction, "touch hello.txt");
        assert_eq!(pattern.id, "pat-run-1");
    }

    #[test]
    fn test_extract_drops_failed_steps() {
        let steps = vec![
            step(0, StepRole::Tool, "cat missing", Some(false)),
            step(1, StepRole::Tool, "touch ok.txt", Some(true)),
        ];
        let pattern =
            extract_pattern_from_steps("run-1", &steps, "", TaskType::Code).unwrap();
        assert_eq!(pattern.steps.len(), 1);
        assert_eq!(pattern.steps[0].instruction, "touch ok.txt");
    }

    #[test]
    fn test_extract_returns_none_for_empty_or_all_failed() {
        assert!(extract_pattern_from_steps("run-1", &[], "", TaskType::Code).is_none());

        let failed = vec![step(0, StepRole::Tool, "boom", Some(false))];
        assert!(extract_pattern_from_steps("run-1", &failed, "", TaskType::Code).is_none());

        let user_only = vec![step(0, StepRole::User, "please", None)];
        assert!(extract_pattern_from_steps("run-1", &user_only, "", TaskType::Code).is_none());
    }

    #[test]
    fn test_extract_drops_steps_without_recorded_outcome() {
        let steps = vec![
            step(0, StepRole::Assistant, "planner summary", None),
            step(1, StepRole::Tool, "touch ok.txt", Some(true)),
        ];
        let pattern = extract_pattern_from_steps("run-1", &steps, "", TaskType::Code).unwrap();
        assert_eq!(pattern.steps.len(), 1);
        assert_eq!(pattern.steps[0].instruction, "touch ok.txt");

        let none_only = vec![step(0, StepRole::Assistant, "no outcome", None)];
        assert!(extract_pattern_from_steps("run-1", &none_only, "", TaskType::Code).is_none());
    }

    #[test]
    fn test_extract_caps_at_twelve_steps() {
        let steps: Vec<Step> = (0..20)
            .map(|i| step(i, StepRole::Tool, &format!("cmd {}", i), Some(true)))
            .collect();
        let pattern = extract_pattern_from_steps("run-1", &steps, "", TaskType::Code).unwrap();
        assert_eq!(pattern.steps.len(), MAX_PATTERN_STEPS);
        assert_eq!(pattern.steps[0].instruction, "cmd 0");
        assert_eq!(pattern.steps[11].instruction, "cmd 11");
    }

    #[test]
    fn test_normalization_collapses_and_clamps() {
        let long = "x".repeat(400);
        let steps = vec![step(0, StepRole::Tool, &format!("  a \n b   c {}", long), Some(true))];
        let pattern = extract_pattern_from_steps("run-1", &steps, "", TaskType::Code).unwrap();
        let instruction = &pattern.steps[0].instruction;
        assert!(instruction.starts_with("a b c x"));
        assert_eq!(instruction.chars().count(), INSTRUCTION_CHARS);
    }

    #[test]
    fn test_summary_prefers_first_assistant_step() {
        let steps = vec![
            step(0, StepRole::Tool, "touch out.txt", Some(true)),
            step(1, StepRole::Assistant, "Wrote out.txt with the data", Some(true)),
        ];
        let pattern = extract_pattern_from_steps("run-1", &steps, "", TaskType::Code).unwrap();
        assert_eq!(pattern.summary, "Wrote out.txt with the data");
    }

    #[test]
    fn test_extraction_is_idempotent_byte_for_byte() {
        let steps = vec![
            step(0, StepRole::Tool, "python analyze.py sales.csv", Some(true)),
            step(1, StepRole::Assistant, "Rendered a bar chart", Some(true)),
        ];
        let a = extract_pattern_from_steps("run-1", &steps, "analyze sales.csv", TaskType::DataAnalysis)
            .unwrap();
        let b = extract_pattern_from_steps("run-1", &steps, "analyze sales.csv", TaskType::DataAnalysis)
            .unwrap();
        assert_eq!(render_pattern_block(&a), render_pattern_block(&b));
    }

    #[test]
    fn test_rendered_block_layout() {
        let steps = vec![
            step(0, StepRole::Tool, "touch hello.txt", Some(true)),
            step(1, StepRole::Assistant, "Created hello.txt", Some(true)),
        ];
        let pattern =
            extract_pattern_from_steps("run-1", &steps, "create hello.txt", TaskType::Code)
                .unwrap();
        let block = render_pattern_block(&pattern);

        assert!(block.starts_with("<reference_workflow id=\"pat-run-1\">"));
        assert!(block.ends_with("</reference_workflow>"));
        assert!(block.contains("What worked before: Created hello.txt"));
        assert!(block.contains("Sequence:\n1. touch hello.txt\n2. Created hello.txt"));
        assert!(block.contains("Variables:\n- file: file (ex: hello.txt)"));
        assert!(block.contains("Apply the same sequence when it fits."));
    }

    #[test]
    fn test_rendered_block_without_variables() {
        let steps = vec![step(0, StepRole::Assistant, "thought about it", Some(true))];
        let pattern = extract_pattern_from_steps("run-1", &steps, "", TaskType::Research).unwrap();
        let block = render_pattern_block(&pattern);
        assert!(block.contains("Variables:\n- none discovered"));
    }

    #[test]
    fn test_to_record_round_trips_rendered_block() {
        let steps = vec![step(0, StepRole::Tool, "touch a.txt", Some(true))];
        let pattern = extract_pattern_from_steps("run-1", &steps, "", TaskType::Code).unwrap();
        let record = pattern.to_record("demo");
        assert_eq!(record.project_id, "demo");
        assert_eq!(record.rendered, render_pattern_block(&pattern));
        assert_eq!(record.steps.len(), 1);
        assert_eq!(record.steps[0]["instruction"], "touch a.txt");
    }
}
