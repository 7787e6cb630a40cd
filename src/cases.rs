//! Test-case generation from a natural-language app description.
//!
//! One decision-service call produces the whole battery. The reply may be
//! wrapped in Markdown fencing and may be either `{"test_cases": [...]}` or a
//! bare array. A reply that does not parse, or yields fewer than
//! [`MIN_CASES`] cases, is a [`GenerationError`]; nothing partial is used.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::conversation::{Content, Conversation};
use crate::vlm::{DecisionService, VlmError};

pub const MIN_CASES: usize = 5;
pub const MAX_CASES: usize = 10;

/// Token cap for the generation call; a full battery is much longer than a
/// single agent decision.
pub const GENERATION_MAX_TOKENS: u32 = 4096;

pub const CASES_FILE: &str = "test_cases.json";

pub const GENERATION_PROMPT: &str = r#"You are a professional software test engineer. Your job is to write comprehensive functional test cases for a website or web app.

Given a description of the app's functionality, write 5-10 independent test cases. Each test case must:
1. Test one clear feature
2. Describe the steps the user performs
3. State a verifiable expected result

Cover as many of these kinds as make sense:
- Core functionality (main business logic)
- User interaction (buttons, forms, navigation)
- Data display (content rendering, data correctness)
- Edge cases (empty input, invalid input)
- UI consistency (style, layout, responsiveness)

Output format (strict JSON):
```json
{
  "test_cases": [
    {
      "id": 1,
      "task": "what the user has to do",
      "expected_result": "what should happen",
      "priority": "high/medium/low",
      "category": "functional/interaction/data/edge/ui"
    }
  ]
}
```

Rules:
- Every test case is independent of the others
- Test core functionality first
- Be specific, avoid vague descriptions
- Expected results must be verifiable
- Write 5-10 test cases depending on the app's complexity"#;

#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("decision service failed: {0}")]
    Service(#[from] VlmError),
    #[error("could not parse test cases: {0}")]
    Parse(String),
    #[error("only {count} test cases generated, at least {} required", MIN_CASES)]
    TooFew { count: usize },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    /// Case-insensitive match; anything unrecognised is `Medium`.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "high" => Priority::High,
            "low" => Priority::Low,
            _ => Priority::Medium,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

impl<'de> Deserialize<'de> for Priority {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(value.as_str().map(Priority::from_label).unwrap_or_default())
    }
}

/// One functional test case. Immutable once generated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub id: u32,
    pub task: String,
    #[serde(alias = "expected")]
    pub expected_result: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub category: String,
}

/// Case as written by the model; ids may be missing, strings or duplicated.
#[derive(Debug, Deserialize)]
struct RawCase {
    #[serde(default)]
    id: Option<Value>,
    task: String,
    #[serde(alias = "expected")]
    expected_result: String,
    #[serde(default)]
    priority: Priority,
    #[serde(default)]
    category: String,
}

impl RawCase {
    fn numeric_id(&self) -> Option<u32> {
        match self.id.as_ref()? {
            Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

/// Generates a battery of test cases through a decision service.
pub struct CaseGenerator<'a> {
    service: &'a dyn DecisionService,
}

impl<'a> CaseGenerator<'a> {
    pub fn new(service: &'a dyn DecisionService) -> Self {
        Self { service }
    }

    pub async fn generate(&self, description: &str) -> Result<Vec<TestCase>, GenerationError> {
        let mut conversation = Conversation::new(GENERATION_PROMPT, 1);
        conversation.push_user(Content::Text(format!(
            "Write comprehensive test cases for the following website or app:\n\n{}\n\n\
             Write {}-{} test cases covering the main features. Output strict JSON.",
            description, MIN_CASES, MAX_CASES
        )));
        info!("generating test cases");
        let response = self.service.complete(&conversation).await?;
        let cases = parse_cases(&response).inspect_err(|e| {
            warn!(error = %e, response = %response, "test case generation failed");
        })?;
        info!(count = cases.len(), "test cases generated");
        Ok(cases)
    }
}

/// Parse a generation reply into at most [`MAX_CASES`] cases with unique ids.
pub fn parse_cases(response: &str) -> Result<Vec<TestCase>, GenerationError> {
    let mut cases = decode(strip_fencing(response))?;
    if cases.len() < MIN_CASES {
        return Err(GenerationError::TooFew { count: cases.len() });
    }
    if cases.len() > MAX_CASES {
        warn!(count = cases.len(), kept = MAX_CASES, "too many test cases, truncating");
        cases.truncate(MAX_CASES);
    }
    Ok(assign_ids(cases))
}

fn decode(body: &str) -> Result<Vec<RawCase>, GenerationError> {
    let value: Value = serde_json::from_str(body).map_err(|e| GenerationError::Parse(e.to_string()))?;
    let list = match value {
        Value::Array(items) => Value::Array(items),
        Value::Object(mut map) => map
            .remove("test_cases")
            .ok_or_else(|| GenerationError::Parse("missing `test_cases` field".to_string()))?,
        _ => return Err(GenerationError::Parse("expected an object or array".to_string())),
    };
    serde_json::from_value(list).map_err(|e| GenerationError::Parse(e.to_string()))
}

/// Keep the model's ids when they are present and unique; otherwise
/// renumber everything 1..n in generation order.
fn assign_ids(raw: Vec<RawCase>) -> Vec<TestCase> {
    let ids: Vec<Option<u32>> = raw.iter().map(RawCase::numeric_id).collect();
    let mut seen = HashSet::new();
    let keep = ids
        .iter()
        .all(|id| matches!(id, Some(n) if *n > 0 && seen.insert(*n)));
    if !keep {
        warn!("test case ids missing or duplicated, renumbering");
    }
    raw.into_iter()
        .zip(ids)
        .enumerate()
        .map(|(i, (case, id))| TestCase {
            id: if keep { id.unwrap_or(i as u32 + 1) } else { i as u32 + 1 },
            task: case.task,
            expected_result: case.expected_result,
            priority: case.priority,
            category: case.category,
        })
        .collect()
}

/// Content of the first fenced block, preferring a ```json fence.
pub fn strip_fencing(text: &str) -> &str {
    let (start, rest) = if let Some(pos) = text.find("```json") {
        (pos + 7, &text[pos + 7..])
    } else if let Some(pos) = text.find("```") {
        (pos + 3, &text[pos + 3..])
    } else {
        return text.trim();
    };
    match rest.find("```") {
        Some(end) => text[start..start + end].trim(),
        None => rest.trim(),
    }
}

pub fn write_cases(path: &Path, cases: &[TestCase]) -> Result<(), GenerationError> {
    let body = serde_json::to_string_pretty(cases).map_err(|e| GenerationError::Parse(e.to_string()))?;
    fs::write(path, body)?;
    Ok(())
}

/// Load a previously written `test_cases.json` (array or wrapped object).
pub fn load_cases(path: &Path) -> Result<Vec<TestCase>, GenerationError> {
    let raw = fs::read_to_string(path)?;
    Ok(assign_ids(decode(strip_fencing(&raw))?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn case_json(id: Option<u32>, n: usize) -> String {
        let id = id.map(|i| format!("\"id\": {},", i)).unwrap_or_default();
        format!(
            r#"{{{} "task": "task {}", "expected_result": "result {}", "priority": "High", "category": "functional"}}"#,
            id, n, n
        )
    }

    fn array(ids: &[Option<u32>]) -> String {
        let items: Vec<String> = ids.iter().enumerate().map(|(n, id)| case_json(*id, n)).collect();
        format!("[{}]", items.join(","))
    }

    #[test]
    fn test_fenced_object_reply() {
        let reply = format!(
            "Here you go:\n```json\n{{\"test_cases\": {}}}\n```\nGood luck",
            array(&[Some(1), Some(2), Some(3), Some(4), Some(5)])
        );
        let cases = parse_cases(&reply).unwrap();
        assert_eq!(cases.len(), 5);
        assert_eq!(cases[0].priority, Priority::High);
        assert_eq!(cases[4].task, "task 4");
    }

    #[test]
    fn test_bare_array_with_plain_fence() {
        let reply = format!("```\n{}\n```", array(&[None; 6]));
        let cases = parse_cases(&reply).unwrap();
        let ids: Vec<u32> = cases.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_duplicate_ids_renumbered() {
        let reply = array(&[Some(1), Some(1), Some(7), Some(2), Some(3)]);
        let ids: Vec<u32> = parse_cases(&reply).unwrap().iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_unique_ids_kept() {
        let reply = array(&[Some(10), Some(20), Some(30), Some(40), Some(50)]);
        let ids: Vec<u32> = parse_cases(&reply).unwrap().iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![10, 20, 30, 40, 50]);
    }

    #[test]
    fn test_too_few_cases_fail() {
        let err = parse_cases(&array(&[Some(1), Some(2)])).unwrap_err();
        assert!(matches!(err, GenerationError::TooFew { count: 2 }));
    }

    #[test]
    fn test_too_many_cases_truncated() {
        let cases = parse_cases(&array(&[None; 13])).unwrap();
        assert_eq!(cases.len(), MAX_CASES);
    }

    #[test]
    fn test_garbage_is_parse_failure() {
        assert!(matches!(
            parse_cases("I cannot help with that"),
            Err(GenerationError::Parse(_))
        ));
        assert!(matches!(
            parse_cases(r#"{"cases": []}"#),
            Err(GenerationError::Parse(_))
        ));
    }

    #[test]
    fn test_priority_lenient() {
        assert_eq!(Priority::from_label("HIGH"), Priority::High);
        assert_eq!(Priority::from_label(" low "), Priority::Low);
        assert_eq!(Priority::from_label("urgent"), Priority::Medium);
        let case: TestCase =
            serde_json::from_str(r#"{"id": 1, "task": "t", "expected": "e", "priority": 3}"#).unwrap();
        assert_eq!(case.priority, Priority::Medium);
        assert_eq!(case.expected_result, "e");
    }

    #[test]
    fn test_cases_file_reloads() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join(CASES_FILE);
        let cases = parse_cases(&array(&[None; 5])).unwrap();
        write_cases(&path, &cases).unwrap();
        assert_eq!(load_cases(&path).unwrap(), cases);
    }
}
