//! Shared test fixtures: a scripted completion client and an
//! orchestrator wired to a temp project with shell-stub checkers.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use manifest::domain::models::{
    EventSender, GenerationConfig, ManifestConfig, StageCommand, VerificationConfig,
};
use manifest::domain::ports::{
    CompletionClient, CompletionError, CompletionRequest, CompletionResponse, Purpose,
};
use manifest::infrastructure::ai::AiGateway;
use manifest::infrastructure::sqlite::{
    all_embedded_migrations, DatabaseConnection, Migrator, SqliteStore,
};
use manifest::infrastructure::workspace::WorkspaceManager;
use manifest::services::{
    ChangeApplier, CodebaseScanner, GenerationSwarm, IntentCompiler, Orchestrator, RankingEngine,
    ScanFilters, VerificationHarness,
};

/// Completion client that replays scripted responses per purpose.
/// Queued responses are consumed first; a per-purpose default answers
/// the rest; anything unscripted is a permanent error.
pub struct MockCompletionClient {
    queued: Mutex<HashMap<Purpose, VecDeque<String>>>,
    defaults: Mutex<HashMap<Purpose, String>>,
}

impl MockCompletionClient {
    pub fn new() -> Self {
        Self {
            queued: Mutex::new(HashMap::new()),
            defaults: Mutex::new(HashMap::new()),
        }
    }

    pub fn queue(&self, purpose: Purpose, response: impl Into<String>) {
        self.queued
            .lock()
            .unwrap()
            .entry(purpose)
            .or_default()
            .push_back(response.into());
    }

    pub fn set_default(&self, purpose: Purpose, response: impl Into<String>) {
        self.defaults
            .lock()
            .unwrap()
            .insert(purpose, response.into());
    }
}

#[async_trait]
impl CompletionClient for MockCompletionClient {
    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, CompletionError> {
        let text = {
            let mut queued = self.queued.lock().unwrap();
            match queued.get_mut(&request.purpose).and_then(|q| q.pop_front()) {
                Some(text) => text,
                None => self
                    .defaults
                    .lock()
                    .unwrap()
                    .get(&request.purpose)
                    .cloned()
                    .ok_or_else(|| {
                        CompletionError::Permanent(format!(
                            "no scripted response for purpose {}",
                            request.purpose
                        ))
                    })?,
            }
        };

        Ok(CompletionResponse {
            text,
            model: "mock-model".into(),
            input_tokens: 100,
            output_tokens: 100,
        })
    }
}

// ---------------------------------------------------------------------------
// Canned responses
// ---------------------------------------------------------------------------

pub fn parse_response(core: &str, done_when: &[&str], unclear: &[&str]) -> String {
    serde_json::json!({
        "core": core,
        "must": ["use bcrypt"],
        "must_not": ["touch migrations"],
        "done_when": done_when,
        "unclear": unclear,
        "scope": null,
    })
    .to_string()
}

pub fn analyze_response() -> String {
    serde_json::json!({
        "relevant_files": ["src/main.rs"],
        "patterns": ["module per feature"],
        "forbidden_zones": ["migrations"],
        "integration_points": ["src/main.rs"],
        "new_files": ["src/auth.rs"],
    })
    .to_string()
}

pub fn spec_response(assertion_count: usize) -> String {
    let assertions: Vec<_> = (0..assertion_count)
        .map(|i| {
            serde_json::json!({
                "description": format!("condition {i} holds"),
                "test": format!("assert condition_{i}()"),
                "weight": 5,
            })
        })
        .collect();
    serde_json::json!({
        "assertions": assertions,
        "test_suite": "// spec suite\n",
        "type_contract": "fn register(); fn login();",
    })
    .to_string()
}

/// One implementation answer writing `src/auth.rs` with the given body.
pub fn implement_response(body: &str, approach: &str, confidence: f64) -> String {
    serde_json::json!({
        "changes": [
            {"path": "src/auth.rs", "action": "create", "content": body}
        ],
        "approach": approach,
        "confidence": confidence,
    })
    .to_string()
}

/// An implementation body with the requested number of lines.
pub fn body_of_lines(lines: usize, marker: &str) -> String {
    let mut body = format!("// {marker}\n");
    for i in 0..lines {
        body.push_str(&format!("fn f{i}() {{}}\n"));
    }
    body
}

// ---------------------------------------------------------------------------
// Orchestrator fixture
// ---------------------------------------------------------------------------

pub struct Fixture {
    pub orchestrator: Orchestrator<SqliteStore>,
    pub store: Arc<SqliteStore>,
    pub workspaces_root: std::path::PathBuf,
}

/// Stage commands that always pass, with a lint stage that rejects any
/// workspace containing the `LINT_FAIL` marker.
pub fn passing_stages() -> VerificationConfig {
    VerificationConfig {
        typecheck: sh("true"),
        lint: sh("! grep -rq LINT_FAIL ."),
        unit_tests: sh("true"),
        spec_tests: sh("echo 'test result: ok. 3 passed; 0 failed'"),
        flaky_retries: 0,
        harness_concurrency: 2,
        ..VerificationConfig::default()
    }
}

pub fn sh(script: &str) -> StageCommand {
    StageCommand {
        argv: vec!["sh".into(), "-c".into(), script.into()],
        deadline_secs: 30,
    }
}

pub fn generation(distribution: &[(&str, u32)], ceiling: f64, estimate: f64) -> GenerationConfig {
    let mut dist = BTreeMap::new();
    for (name, count) in distribution {
        dist.insert(name.to_string(), *count);
    }
    GenerationConfig {
        default_count: distribution.iter().map(|(_, n)| n).sum(),
        max_count: 20,
        distribution: dist,
        cost_ceiling_usd: ceiling,
        estimated_call_cost_usd: estimate,
    }
}

/// Build a full orchestrator over a temp project directory.
pub async fn fixture(
    project: &Path,
    data: &Path,
    client: Arc<MockCompletionClient>,
    generation_config: GenerationConfig,
    verification_config: VerificationConfig,
) -> Fixture {
    std::fs::create_dir_all(project.join("src")).unwrap();
    if !project.join("src/main.rs").exists() {
        std::fs::write(project.join("src/main.rs"), "fn main() {}\n").unwrap();
    }

    let db = DatabaseConnection::new("sqlite::memory:", 5).await.unwrap();
    Migrator::new(db.pool().clone())
        .run_embedded_migrations(all_embedded_migrations())
        .await
        .unwrap();
    let store = Arc::new(SqliteStore::new(db.pool().clone()));

    let mut config = ManifestConfig::default();
    config.data_dir = data.to_string_lossy().into_owned();
    config.generation = generation_config;
    config.verification = verification_config.clone();

    let call_deadline = std::time::Duration::from_secs(10);
    let gateway = Arc::new(AiGateway::new(
        client,
        &config.ai,
        config.generation.estimated_call_cost_usd,
    ));

    let scanner = CodebaseScanner::new(project.to_path_buf(), ScanFilters::default());
    let workspaces_root = data.join("workspaces");
    let workspaces = Arc::new(
        WorkspaceManager::new(
            project.to_path_buf(),
            workspaces_root.clone(),
            config.workspace.clone(),
        )
        .await
        .unwrap(),
    );

    let compiler = IntentCompiler::new(gateway.clone(), scanner, call_deadline);
    let swarm = GenerationSwarm::new(gateway.clone(), config.generation.clone(), call_deadline);
    let harness = Arc::new(VerificationHarness::new(
        workspaces.clone(),
        verification_config,
    ));
    let ranking = RankingEngine::new(config.ranking.clone());
    let applier = ChangeApplier::new(project.to_path_buf());

    let orchestrator = Orchestrator::new(
        store.clone(),
        compiler,
        swarm,
        harness,
        ranking,
        applier,
        workspaces,
        config,
        EventSender::disabled(),
    );

    Fixture {
        orchestrator,
        store,
        workspaces_root,
    }
}
