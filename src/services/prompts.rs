//! Prompt catalog.
//!
//! Every purpose has one versioned prompt template. Prompt text is part
//! of the release artifact; strategy semantics live entirely in the
//! implement prompt.

use std::collections::BTreeSet;

use crate::domain::models::{ParsedIntent, Specification, Strategy};

/// Bumped whenever any template below changes meaning.
pub const PROMPT_VERSION: &str = "2";

pub fn parse_prompt(raw_message: &str) -> String {
    format!(
        r#"Parse this feature request into structured form.

Request:
{raw_message}

Return JSON only:
{{
  "core": "one sentence stating what is wanted",
  "must": ["hard requirement"],
  "must_not": ["hard prohibition"],
  "done_when": ["observable completion condition"],
  "unclear": ["question only the requester can answer"],
  "scope": "optional scope note or null"
}}

Put a question in "unclear" only when the request cannot be compiled
without the answer. Each "done_when" entry must be independently
testable."#
    )
}

pub fn analyze_prompt(parsed: &ParsedIntent, file_tree: &str) -> String {
    format!(
        r#"Analyze this codebase for the following change.

Change: {core}
Must: {must}
Must not: {must_not}

Project files:
{file_tree}

Return JSON only:
{{
  "relevant_files": ["existing files the change will read or modify"],
  "patterns": ["conventions this codebase follows that new code should match"],
  "forbidden_zones": ["paths the change must never touch"],
  "integration_points": ["existing files the change plugs into"],
  "new_files": ["files the change should create"]
}}"#,
        core = parsed.core,
        must = parsed.must.join("; "),
        must_not = parsed.must_not.join("; "),
    )
}

pub fn spec_prompt(parsed: &ParsedIntent, patterns: &[String], relevant: &BTreeSet<String>) -> String {
    let done_when = parsed
        .done_when
        .iter()
        .enumerate()
        .map(|(i, d)| format!("{}. {d}", i + 1))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        r#"Write an executable specification for this change.

Change: {core}
Completion conditions:
{done_when}

Relevant files: {relevant}
Codebase patterns: {patterns}

Return JSON only:
{{
  "assertions": [
    {{
      "description": "restatement of one completion condition",
      "test": "complete executable test code for it",
      "weight": 5
    }}
  ],
  "test_suite": "one complete runnable test file covering every assertion",
  "type_contract": "signatures of every public item the change introduces"
}}

Produce exactly one assertion per completion condition, in order.
Weights are 1-10 by importance. Every test must be runnable as written."#,
        core = parsed.core,
        relevant = relevant.iter().cloned().collect::<Vec<_>>().join(", "),
        patterns = patterns.join("; "),
    )
}

pub fn implement_prompt(
    spec: &Specification,
    strategy: Strategy,
    sibling_approach: Option<&str>,
) -> String {
    let assertions = spec
        .assertions
        .iter()
        .map(|a| format!("- [{}] {}", a.weight, a.description))
        .collect::<Vec<_>>()
        .join("\n");
    let may_touch = spec.may_touch.iter().cloned().collect::<Vec<_>>().join(", ");
    let must_not = spec
        .must_not_touch
        .iter()
        .cloned()
        .collect::<Vec<_>>()
        .join(", ");

    let mut prompt = format!(
        r#"Implement this specification.

Assertions that must pass:
{assertions}

Type contract:
{contract}

Test suite your implementation will be run against:
{suite}

You may only touch these paths: {may_touch}
You must never touch: {must_not}

Approach: {flavor}
"#,
        contract = spec.type_contract,
        suite = spec.test_suite,
        flavor = strategy_flavor(strategy),
    );

    if let Some(approach) = sibling_approach {
        prompt.push_str(&format!(
            "\nA sibling attempt took this approach; produce a meaningful variation of it:\n{approach}\n"
        ));
    }

    prompt.push_str(
        r#"
Return JSON only:
{
  "changes": [
    {"path": "relative/path", "action": "create|modify|delete", "content": "full file content, omitted for delete"}
  ],
  "approach": "one sentence describing your approach",
  "confidence": 0.8
}"#,
    );
    prompt
}

pub fn score_prompt(file_contents: &str) -> String {
    format!(
        r#"Rate the readability of this code change on a 0.0-1.0 scale,
considering naming, structure, and how easily a maintainer could
modify it. Return only the number.

{file_contents}"#
    )
}

fn strategy_flavor(strategy: Strategy) -> &'static str {
    match strategy {
        Strategy::Vanilla => "straightforward; the implementation a careful maintainer would write",
        Strategy::Minimal => "the fewest lines that satisfy every assertion",
        Strategy::Defensive => "maximum input validation and error handling at every boundary",
        Strategy::Patterned => "match the codebase's existing style and conventions exactly",
        Strategy::Mutation => "a deliberate variation of the sibling approach shown below",
        Strategy::Adversarial => {
            "satisfy the tests literally and nothing more; expose what the tests fail to pin down"
        }
    }
}

/// Pull the first JSON value out of a completion, tolerating fenced
/// code blocks and surrounding prose.
pub fn extract_json(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if !inner.is_empty() {
                return Some(inner);
            }
        }
    }

    let start = trimmed.find(['{', '['])?;
    let open = trimmed.as_bytes()[start];
    let close = if open == b'{' { b'}' } else { b']' };
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, b) in trimmed.bytes().enumerate().skip(start) {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            _ if in_string => {}
            _ if b == open => depth += 1,
            _ if b == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(&trimmed[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_json_plain_object() {
        assert_eq!(extract_json(r#"{"a": 1}"#), Some(r#"{"a": 1}"#));
    }

    #[test]
    fn extract_json_from_fenced_block() {
        let text = "Here you go:\n```json\n{\"a\": 1}\n```\nDone.";
        assert_eq!(extract_json(text), Some("{\"a\": 1}"));
    }

    #[test]
    fn extract_json_with_surrounding_prose() {
        let text = "The result is {\"a\": {\"b\": \"}\"}} as requested";
        assert_eq!(extract_json(text), Some("{\"a\": {\"b\": \"}\"}}"));
    }

    #[test]
    fn extract_json_array() {
        assert_eq!(extract_json("list: [1, 2, 3] end"), Some("[1, 2, 3]"));
    }

    #[test]
    fn extract_json_none_when_absent() {
        assert_eq!(extract_json("no structured data here"), None);
    }

    #[test]
    fn implement_prompt_carries_strategy_and_paths() {
        use crate::domain::models::Assertion;
        use uuid::Uuid;

        let spec = Specification::new(
            "id".into(),
            Uuid::new_v4(),
            1,
            vec![Assertion::new("works", "assert works()", 5)],
            "suite".into(),
            "contract".into(),
            ["src/auth.rs".to_string()].into(),
            ["migrations".to_string()].into(),
            vec![],
        )
        .unwrap();

        let prompt = implement_prompt(&spec, Strategy::Minimal, None);
        assert!(prompt.contains("fewest lines"));
        assert!(prompt.contains("src/auth.rs"));
        assert!(prompt.contains("migrations"));

        let mutated = implement_prompt(&spec, Strategy::Mutation, Some("used a trait object"));
        assert!(mutated.contains("used a trait object"));
    }
}
