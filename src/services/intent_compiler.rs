//! Intent compiler: raw message → parsed intent → codebase analysis →
//! executable specification.
//!
//! Parsing halts with a clarification result when the parsed form
//! carries open questions. Specification ids are stable hashes of the
//! semantic inputs, so identical inputs compile to identical ids.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{info, instrument};

use crate::domain::errors::{PipelineError, PipelineResult};
use crate::domain::models::{
    stable_spec_id, Assertion, Intent, ParsedIntent, SpecValidationError, Specification,
};
use crate::domain::ports::Purpose;
use crate::infrastructure::ai::AiGateway;

use super::codebase::CodebaseScanner;
use super::prompts;
use super::run_context::RunContext;

/// How many file paths the analyze prompt may carry.
const ANALYZE_TREE_LIMIT: usize = 400;

#[derive(Debug, Deserialize)]
struct CodebaseAnalysis {
    #[serde(default)]
    relevant_files: Vec<String>,
    #[serde(default)]
    patterns: Vec<String>,
    #[serde(default)]
    forbidden_zones: Vec<String>,
    #[serde(default)]
    integration_points: Vec<String>,
    #[serde(default)]
    new_files: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct AssertionDraft {
    description: String,
    test: String,
    #[serde(default = "default_weight")]
    weight: u8,
}

fn default_weight() -> u8 {
    5
}

#[derive(Debug, Deserialize)]
struct SpecDraft {
    #[serde(default)]
    assertions: Vec<AssertionDraft>,
    #[serde(default)]
    test_suite: String,
    #[serde(default)]
    type_contract: String,
}

pub struct IntentCompiler {
    gateway: Arc<AiGateway>,
    scanner: CodebaseScanner,
    call_deadline: Duration,
}

impl IntentCompiler {
    pub fn new(gateway: Arc<AiGateway>, scanner: CodebaseScanner, call_deadline: Duration) -> Self {
        Self {
            gateway,
            scanner,
            call_deadline,
        }
    }

    /// Parse the raw message into structured form. The caller stores the
    /// result on the intent and checks `needs_clarification`.
    #[instrument(skip(self, ctx), fields(intent_id = %intent.id))]
    pub async fn parse(&self, intent: &Intent, ctx: &RunContext) -> PipelineResult<ParsedIntent> {
        if intent.raw_message.trim().is_empty() {
            return Err(PipelineError::EmptyMessage);
        }

        let response = self
            .gateway
            .complete(
                prompts::parse_prompt(&intent.raw_message),
                Purpose::Parse,
                self.call_deadline,
                &ctx.cancel,
                &ctx.ledger,
            )
            .await?;

        let parsed: ParsedIntent = decode(&response)?;
        if parsed.core.trim().is_empty() {
            return Err(PipelineError::MalformedAiResponse(
                "parse produced an empty core sentence".into(),
            ));
        }

        info!(
            done_when = parsed.done_when.len(),
            unclear = parsed.unclear.len(),
            "intent parsed"
        );
        Ok(parsed)
    }

    /// Analyze the codebase and generate a validated specification at
    /// the given version.
    #[instrument(skip(self, ctx), fields(intent_id = %intent.id, version))]
    pub async fn compile(
        &self,
        intent: &Intent,
        version: u32,
        ctx: &RunContext,
    ) -> PipelineResult<Specification> {
        let parsed = intent.parsed.clone().ok_or_else(|| {
            PipelineError::Validation("compile requires a parsed intent".into())
        })?;
        if parsed.needs_clarification() {
            return Err(PipelineError::Validation(
                "compile requires clarifications to be resolved".into(),
            ));
        }
        if parsed.done_when.is_empty() {
            return Err(PipelineError::NoTestableConditions);
        }

        let snapshot = self.scanner.scan().await?;
        let tree = snapshot.render_tree(ANALYZE_TREE_LIMIT);

        let analysis: CodebaseAnalysis = decode(
            &self
                .gateway
                .complete(
                    prompts::analyze_prompt(&parsed, &tree),
                    Purpose::Analyze,
                    self.call_deadline,
                    &ctx.cancel,
                    &ctx.ledger,
                )
                .await?,
        )?;

        let relevant: BTreeSet<String> = analysis.relevant_files.iter().cloned().collect();
        let draft: SpecDraft = decode(
            &self
                .gateway
                .complete(
                    prompts::spec_prompt(&parsed, &analysis.patterns, &relevant),
                    Purpose::Spec,
                    self.call_deadline,
                    &ctx.cancel,
                    &ctx.ledger,
                )
                .await?,
        )?;

        let assertions: Vec<Assertion> = draft
            .assertions
            .into_iter()
            .map(|a| Assertion::new(a.description, a.test, a.weight))
            .collect();
        let assertion_tests: Vec<String> =
            assertions.iter().map(|a| a.test.clone()).collect();

        let may_touch: BTreeSet<String> = analysis
            .integration_points
            .iter()
            .chain(analysis.new_files.iter())
            .cloned()
            .collect();
        let must_not_touch: BTreeSet<String> = analysis.forbidden_zones.iter().cloned().collect();

        let id = stable_spec_id(&parsed.core, &relevant, &assertion_tests);

        Specification::new(
            id,
            intent.id,
            version,
            assertions,
            draft.test_suite,
            draft.type_contract,
            may_touch,
            must_not_touch,
            analysis.patterns,
        )
        .map_err(|err| match err {
            SpecValidationError::OverlappingPaths(path) => {
                PipelineError::ContradictoryConstraints(format!(
                    "'{path}' is both an integration point and a forbidden zone"
                ))
            }
            SpecValidationError::EmptyAssertions | SpecValidationError::EmptyAssertionTest(_) => {
                PipelineError::NoTestableConditions
            }
        })
    }
}

fn decode<T: serde::de::DeserializeOwned>(response: &str) -> PipelineResult<T> {
    let json = prompts::extract_json(response)
        .ok_or_else(|| PipelineError::MalformedAiResponse("no JSON in response".into()))?;
    serde_json::from_str(json)
        .map_err(|e| PipelineError::MalformedAiResponse(format!("bad JSON shape: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_rejects_prose() {
        let err = decode::<ParsedIntent>("I could not understand the request").unwrap_err();
        assert!(matches!(err, PipelineError::MalformedAiResponse(_)));
    }

    #[test]
    fn decode_accepts_fenced_parsed_intent() {
        let response = r#"```json
{"core": "add auth", "must": ["bcrypt"], "done_when": ["login works"]}
```"#;
        let parsed: ParsedIntent = decode(response).unwrap();
        assert_eq!(parsed.core, "add auth");
        assert_eq!(parsed.must, vec!["bcrypt"]);
        assert!(parsed.unclear.is_empty());
    }
}
