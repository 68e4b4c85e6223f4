//! Domain-specific variable discovery for pattern extraction.
//!
//! Each task type gets a pure regex pass over the joined instruction text
//! and step contents. Recognized variable classes: file references, ranges,
//! substitutions, citations, URLs, search queries, document formats,
//! templates, chart types, dataset names, tone/audience markers.
//!
//! Discovery uses first-match-wins semantics per variable name, so the
//! earliest occurrence in the text becomes the recorded example and
//! repeated passes over the same text are idempotent.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::service::models::TaskType;

use super::VariableSpec;

static FILE_REF_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)([\w./-]+\.(?:txt|md|csv|json|py|js|ts|go|rs|java|html))").unwrap()
});

static FILE_RANGE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\w+)-(\d+)\s*(?:to|through|:)\s*(\w+)-?(\d+)").unwrap()
});

static SUBSTITUTION_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)replace\s+(.+?)\s+with\s+(?:contents\s+from\s+)?(\S+)").unwrap()
});

static CITATION_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[(\d+)\]|\(([^)]+,\s*\d{4})\)").unwrap());

static URL_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"https?://\S+").unwrap());

static QUERY_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)search\s+(?:for|query)?:?\s*["']?([^"'\n]+)["']?"#).unwrap()
});

static SOURCE_DOC_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:source|document|paper|article):\s*([^\n,]+)").unwrap()
});

static TOPIC_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(?:topic|subject|area):\s*([^\n,]+)").unwrap());

static TONE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:tone|voice):\s*([^\n,.]+)|in\s+an?\s+(formal|casual|professional|friendly|academic|conversational)\s+tone")
        .unwrap()
});

static AUDIENCE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:audience|readers?):\s*([^\n,.]+)").unwrap()
});

static TEMPLATE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:template|outline|format):\s*([^\n,]+)").unwrap()
});

static DATASET_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)([\w./-]+\.(?:csv|parquet|xlsx|tsv))").unwrap()
});

static CHART_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(bar|line|scatter|pie|histogram|heatmap|box)\s*(?:chart|plot|graph)")
        .unwrap()
});

static DOC_FORMAT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(pdf|docx|markdown|epub|html|latex)\b").unwrap()
});

fn set(
    variables: &mut BTreeMap<String, VariableSpec>,
    name: &str,
    kind: &str,
    example: &str,
    description: &str,
) {
    let example = example.trim();
    if example.is_empty() {
        return;
    }
    variables.entry(name.to_string()).or_insert_with(|| VariableSpec {
        kind: kind.to_string(),
        example: example.chars().take(60).collect(),
        description: description.to_string(),
    });
}

fn discover_files(text: &str, variables: &mut BTreeMap<String, VariableSpec>) {
    if let Some(cap) = FILE_REF_REGEX.captures(text) {
        set(
            variables,
            "file",
            "file",
            &cap[1],
            "File referenced by the workflow",
        );
    }
}

fn discover_code(text: &str, variables: &mut BTreeMap<String, VariableSpec>) {
    if let Some(cap) = FILE_RANGE_REGEX.captures(text) {
        set(
            variables,
            "file_range",
            "range",
            cap.get(0).map(|m| m.as_str()).unwrap_or(""),
            "Range of files or items the workflow spans",
        );
    }
    if let Some(cap) = SUBSTITUTION_REGEX.captures(text) {
        set(
            variables,
            "placeholder",
            "text",
            &cap[1],
            "Text replaced during the workflow",
        );
        set(
            variables,
            "source",
            "text",
            &cap[2],
            "Replacement source used by the workflow",
        );
    }
    discover_files(text, variables);
}

fn discover_research(text: &str, variables: &mut BTreeMap<String, VariableSpec>) {
    if let Some(cap) = CITATION_REGEX.captures(text) {
        let example = cap
            .get(1)
            .or_else(|| cap.get(2))
            .map(|m| m.as_str())
            .unwrap_or("");
        set(
            variables,
            "citation",
            "citation",
            example,
            "Citation style used for sources",
        );
    }
    if let Some(m) = URL_REGEX.find(text) {
        set(
            variables,
            "url",
            "url",
            m.as_str(),
            "Web source consulted during the workflow",
        );
    }
    if let Some(cap) = QUERY_REGEX.captures(text) {
        set(
            variables,
            "search_query",
            "query",
            &cap[1],
            "Search query issued during research",
        );
    }
    if let Some(cap) = SOURCE_DOC_REGEX.captures(text) {
        set(
            variables,
            "source_doc",
            "document",
            &cap[1],
            "Source document analyzed",
        );
    }
    if let Some(cap) = TOPIC_REGEX.captures(text) {
        set(
            variables,
            "research_topic",
            "topic",
            &cap[1],
            "Topic under investigation",
        );
    }
}

fn discover_writing(text: &str, variables: &mut BTreeMap<String, VariableSpec>) {
    if let Some(cap) = TONE_REGEX.captures(text) {
        let example = cap
            .get(1)
            .or_else(|| cap.get(2))
            .map(|m| m.as_str())
            .unwrap_or("");
        set(variables, "tone", "tone", example, "Requested tone of voice");
    }
    if let Some(cap) = AUDIENCE_REGEX.captures(text) {
        set(
            variables,
            "audience",
            "audience",
            &cap[1],
            "Intended audience for the piece",
        );
    }
    if let Some(cap) = TEMPLATE_REGEX.captures(text) {
        set(
            variables,
            "template",
            "template",
            &cap[1],
            "Template or outline the output follows",
        );
    }
    discover_files(text, variables);
}

fn discover_data(text: &str, variables: &mut BTreeMap<String, VariableSpec>) {
    if let Some(cap) = DATASET_REGEX.captures(text) {
        set(
            variables,
            "dataset",
            "dataset",
            &cap[1],
            "Dataset the analysis runs over",
        );
    }
    if let Some(cap) = CHART_REGEX.captures(text) {
        set(
            variables,
            "chart_type",
            "chart",
            &cap[1],
            "Chart type produced by the analysis",
        );
    }
    discover_files(text, variables);
}

fn discover_document(text: &str, variables: &mut BTreeMap<String, VariableSpec>) {
    if let Some(cap) = DOC_FORMAT_REGEX.captures(text) {
        set(
            variables,
            "doc_format",
            "format",
            &cap[1],
            "Document format involved in the workflow",
        );
    }
    if let Some(cap) = TEMPLATE_REGEX.captures(text) {
        set(
            variables,
            "template",
            "template",
            &cap[1],
            "Template or outline the output follows",
        );
    }
    discover_files(text, variables);
}

/// Run the variable discovery pass for the given task type over `text`,
/// filling `variables` with first-match examples.
pub fn discover_variables(
    task_type: TaskType,
    text: &str,
    variables: &mut BTreeMap<String, VariableSpec>,
) {
    match task_type {
        TaskType::Code => discover_code(text, variables),
        TaskType::Research => discover_research(text, variables),
        TaskType::Writing => discover_writing(text, variables),
        TaskType::DataAnalysis => discover_data(text, variables),
        TaskType::DocumentProcessing => discover_document(text, variables),
        TaskType::DocumentWriting => {
            discover_document(text, variables);
            discover_writing(text, variables);
        }
        TaskType::DocumentAnalysis => {
            discover_document(text, variables);
            discover_research(text, variables);
        }
    }
}
