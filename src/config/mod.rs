use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use crate::agents::{Persona, PersonaCatalog};
use crate::error::AppError;
use crate::workflow::WorkflowStage;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub langbase: LangbaseConfig,
    /// `None` when `DATABASE_PATH` is unset (persistence disabled).
    pub database: Option<DatabaseConfig>,
    pub logging: LoggingConfig,
    pub request: RequestConfig,
    pub personas: PersonaSettings,
    pub orchestration: OrchestrationConfig,
    /// JSON file of per-persona knowledge snippets.
    pub knowledge_base_path: Option<PathBuf>,
}

/// Langbase API configuration
#[derive(Debug, Clone)]
pub struct LangbaseConfig {
    pub api_key: String,
    pub base_url: String,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub max_connections: u32,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Log output format
#[derive(Debug, Clone, PartialEq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Model request configuration: HTTP timeout plus the agent retry policy.
#[derive(Debug, Clone)]
pub struct RequestConfig {
    pub timeout_ms: u64,
    pub max_retries: u32,
    /// Backoff base; the delay doubles with each retry.
    pub retry_delay_ms: u64,
}

/// Persona pipe settings
#[derive(Debug, Clone)]
pub struct PersonaSettings {
    pub model: String,
    pub pipe_prefix: String,
}

impl PersonaSettings {
    /// Build the persona catalogue from these settings.
    pub fn catalog(&self) -> PersonaCatalog {
        PersonaCatalog::new(&self.model, &self.pipe_prefix)
    }
}

impl Default for PersonaSettings {
    fn default() -> Self {
        Self {
            model: "openai:gpt-4o-mini".to_string(),
            pipe_prefix: "think-tank".to_string(),
        }
    }
}

// ============================================================================
// Orchestration
// ============================================================================

/// How the active agents of a stage are invoked within a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationMode {
    /// All agents run concurrently against one snapshot.
    Parallel,
    /// Agents run one after another in priority order, each seeing the
    /// previous agents' proposals.
    Sequential,
}

impl InvocationMode {
    /// Get the mode name as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            InvocationMode::Parallel => "parallel",
            InvocationMode::Sequential => "sequential",
        }
    }
}

impl std::fmt::Display for InvocationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for InvocationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "parallel" => Ok(InvocationMode::Parallel),
            "sequential" => Ok(InvocationMode::Sequential),
            _ => Err(format!("Unknown invocation mode: {}", s)),
        }
    }
}

/// How a round's proposals are resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcceptanceRule {
    /// Accept every proposal scoring at least the minimum.
    Threshold,
    /// Accept only the best qualifying proposal per contested parent.
    BestPerParent,
}

impl AcceptanceRule {
    /// Get the rule name as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            AcceptanceRule::Threshold => "threshold",
            AcceptanceRule::BestPerParent => "best_per_parent",
        }
    }
}

impl std::fmt::Display for AcceptanceRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for AcceptanceRule {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "threshold" => Ok(AcceptanceRule::Threshold),
            "best_per_parent" | "best" => Ok(AcceptanceRule::BestPerParent),
            _ => Err(format!("Unknown acceptance rule: {}", s)),
        }
    }
}

/// Per-stage scheduling and acceptance settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagePlan {
    pub stage: WorkflowStage,
    /// Active agents, kept sorted by persona priority.
    pub agents: Vec<Persona>,
    pub mode: InvocationMode,
    pub acceptance: AcceptanceRule,
    pub max_rounds: u32,
    pub min_score: f64,
    pub min_frontier: usize,
    pub backtrack_to: Option<WorkflowStage>,
}

impl StagePlan {
    /// Default plan for `stage` using the global thresholds.
    pub fn default_for(stage: WorkflowStage, min_score: f64, max_rounds: u32) -> Self {
        use Persona::*;
        let (agents, mode, acceptance, backtrack_to) = match stage {
            WorkflowStage::ProblemDefinition => (
                vec![Strategist, Analyst],
                InvocationMode::Sequential,
                AcceptanceRule::Threshold,
                None,
            ),
            WorkflowStage::Brainstorming => (
                vec![CreativeThinker, Researcher, Strategist],
                InvocationMode::Parallel,
                AcceptanceRule::Threshold,
                None,
            ),
            WorkflowStage::Analysis => (
                vec![Analyst, Researcher, Challenger],
                InvocationMode::Parallel,
                AcceptanceRule::Threshold,
                Some(WorkflowStage::Brainstorming),
            ),
            WorkflowStage::Synthesis => (
                vec![Synthesizer, Strategist],
                InvocationMode::Sequential,
                AcceptanceRule::Threshold,
                Some(WorkflowStage::Analysis),
            ),
            WorkflowStage::Evaluation => (
                vec![Challenger, Analyst],
                InvocationMode::Parallel,
                AcceptanceRule::BestPerParent,
                Some(WorkflowStage::Brainstorming),
            ),
            WorkflowStage::Decision => (
                vec![Strategist, Synthesizer],
                InvocationMode::Sequential,
                AcceptanceRule::BestPerParent,
                Some(WorkflowStage::Evaluation),
            ),
            WorkflowStage::Action => (
                vec![Implementer],
                InvocationMode::Sequential,
                AcceptanceRule::Threshold,
                None,
            ),
        };

        Self {
            stage,
            agents,
            mode,
            acceptance,
            max_rounds,
            min_score,
            min_frontier: 1,
            backtrack_to,
        }
        .normalized()
    }

    /// Set the active agents
    pub fn with_agents(mut self, agents: Vec<Persona>) -> Self {
        self.agents = agents;
        self.normalized()
    }

    /// Set the invocation mode
    pub fn with_mode(mut self, mode: InvocationMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the acceptance rule
    pub fn with_acceptance(mut self, acceptance: AcceptanceRule) -> Self {
        self.acceptance = acceptance;
        self
    }

    /// Set the round cap
    pub fn with_max_rounds(mut self, max_rounds: u32) -> Self {
        self.max_rounds = max_rounds.max(1);
        self
    }

    /// Set the acceptance threshold (clamped to 0.0-1.0)
    pub fn with_min_score(mut self, min_score: f64) -> Self {
        self.min_score = min_score.clamp(0.0, 1.0);
        self
    }

    /// Set the minimum frontier size for exit
    pub fn with_min_frontier(mut self, min_frontier: usize) -> Self {
        self.min_frontier = min_frontier.max(1);
        self
    }

    /// Set the backtrack target
    pub fn with_backtrack_to(mut self, target: Option<WorkflowStage>) -> Self {
        self.backtrack_to = target;
        self
    }

    fn normalized(mut self) -> Self {
        self.agents.sort();
        self.agents.dedup();
        self
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.agents.is_empty() {
            return Err(AppError::Config {
                message: format!("Stage {} has no active agents", self.stage),
            });
        }
        if let Some(target) = self.backtrack_to {
            if target >= self.stage {
                return Err(AppError::Config {
                    message: format!(
                        "Stage {} cannot backtrack to {}: target must be earlier",
                        self.stage, target
                    ),
                });
            }
        }
        Ok(())
    }
}

/// Stage plans for every workflow stage.
#[derive(Debug, Clone, PartialEq)]
pub struct StagePlans {
    plans: Vec<StagePlan>,
}

impl StagePlans {
    /// Default plans for all stages.
    pub fn defaults(min_score: f64, max_rounds: u32) -> Self {
        Self {
            plans: WorkflowStage::ALL
                .iter()
                .map(|s| StagePlan::default_for(*s, min_score, max_rounds))
                .collect(),
        }
    }

    /// Plan for `stage`.
    pub fn get(&self, stage: WorkflowStage) -> &StagePlan {
        // One plan per stage, indexed by stage order.
        &self.plans[stage.index()]
    }

    /// Replace the plan for its stage.
    pub fn set(&mut self, plan: StagePlan) {
        let index = plan.stage.index();
        self.plans[index] = plan;
    }

    /// All plans in stage order.
    pub fn iter(&self) -> impl Iterator<Item = &StagePlan> {
        self.plans.iter()
    }

    /// Check every plan for consistency.
    pub fn validate(&self) -> Result<(), AppError> {
        self.plans.iter().try_for_each(StagePlan::validate)
    }
}

impl Default for StagePlans {
    fn default() -> Self {
        Self::defaults(0.6, 5)
    }
}

/// Run configuration for the orchestration core.
#[derive(Debug, Clone)]
pub struct OrchestrationConfig {
    /// Default acceptance threshold.
    pub min_accept_score: f64,
    /// Critique density above which a backtrack is requested.
    pub critique_ratio: f64,
    pub max_rounds_per_stage: u32,
    /// Global round budget.
    pub max_total_rounds: u32,
    pub max_backtracks: u32,
    pub round_timeout_ms: u64,
    pub run_timeout_ms: u64,
    /// Fan-out limit for parallel rounds.
    pub max_concurrent_agents: usize,
    pub action_stage_enabled: bool,
    pub stages: StagePlans,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            min_accept_score: 0.6,
            critique_ratio: 0.5,
            max_rounds_per_stage: 5,
            max_total_rounds: 40,
            max_backtracks: 3,
            round_timeout_ms: 120_000,
            run_timeout_ms: 900_000,
            max_concurrent_agents: 3,
            action_stage_enabled: true,
            stages: StagePlans::default(),
        }
    }
}

impl OrchestrationConfig {
    /// Load orchestration settings (including per-stage overrides) from the environment.
    pub fn from_env() -> Result<Self, AppError> {
        let min_accept_score = parse_env("MIN_ACCEPT_SCORE", 0.6_f64).clamp(0.0, 1.0);
        let max_rounds_per_stage = parse_env("MAX_ROUNDS_PER_STAGE", 5_u32).max(1);

        let mut stages = StagePlans::defaults(min_accept_score, max_rounds_per_stage);
        for stage in WorkflowStage::ALL {
            let plan = stage_plan_from_env(stages.get(stage).clone())?;
            stages.set(plan);
        }
        stages.validate()?;

        Ok(Self {
            min_accept_score,
            critique_ratio: parse_env("CRITIQUE_RATIO", 0.5_f64).max(0.0),
            max_rounds_per_stage,
            max_total_rounds: parse_env("MAX_TOTAL_ROUNDS", 40_u32).max(1),
            max_backtracks: parse_env("MAX_BACKTRACKS", 3_u32),
            round_timeout_ms: parse_env("ROUND_TIMEOUT_MS", 120_000_u64),
            run_timeout_ms: parse_env("RUN_TIMEOUT_MS", 900_000_u64),
            max_concurrent_agents: parse_env("MAX_CONCURRENT_AGENTS", 3_usize).max(1),
            action_stage_enabled: parse_bool_env("ACTION_STAGE_ENABLED", true),
            stages,
        })
    }
}

fn stage_plan_from_env(mut plan: StagePlan) -> Result<StagePlan, AppError> {
    let prefix = format!("STAGE_{}", plan.stage.as_str().to_uppercase());

    if let Ok(agents) = env::var(format!("{}_AGENTS", prefix)) {
        let personas = agents
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| s.parse::<Persona>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|message| AppError::Config { message })?;
        plan = plan.with_agents(personas);
    }
    if let Ok(mode) = env::var(format!("{}_MODE", prefix)) {
        plan = plan.with_mode(mode.parse().map_err(|message| AppError::Config { message })?);
    }
    if let Ok(rule) = env::var(format!("{}_ACCEPTANCE", prefix)) {
        plan = plan.with_acceptance(rule.parse().map_err(|message| AppError::Config { message })?);
    }
    if let Ok(target) = env::var(format!("{}_BACKTRACK_TO", prefix)) {
        let target = match target.trim().to_lowercase().as_str() {
            "" | "none" => None,
            name => Some(
                name.parse::<WorkflowStage>()
                    .map_err(|message| AppError::Config { message })?,
            ),
        };
        plan = plan.with_backtrack_to(target);
    }

    let max_rounds = parse_env(&format!("{}_MAX_ROUNDS", prefix), plan.max_rounds);
    let min_score = parse_env(&format!("{}_MIN_SCORE", prefix), plan.min_score);
    let min_frontier = parse_env(&format!("{}_MIN_FRONTIER", prefix), plan.min_frontier);

    Ok(plan
        .with_max_rounds(max_rounds)
        .with_min_score(min_score)
        .with_min_frontier(min_frontier))
}

/// Parse an env var, falling back to `default` when unset or invalid.
fn parse_env<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_bool_env(key: &str, default: bool) -> bool {
    match env::var(key).map(|s| s.trim().to_lowercase()) {
        Ok(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => true,
        Ok(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => false,
        _ => default,
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, AppError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let langbase = LangbaseConfig {
            api_key: env::var("LANGBASE_API_KEY").map_err(|_| AppError::Config {
                message: "LANGBASE_API_KEY is required".to_string(),
            })?,
            base_url: env::var("LANGBASE_BASE_URL")
                .unwrap_or_else(|_| "https://api.langbase.com".to_string()),
        };

        let database = env::var("DATABASE_PATH")
            .ok()
            .filter(|p| !p.trim().is_empty())
            .map(|path| DatabaseConfig {
                path: PathBuf::from(path),
                max_connections: parse_env("DATABASE_MAX_CONNECTIONS", 5),
            });

        let logging = LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            format: match env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "pretty".to_string())
                .to_lowercase()
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
        };

        let request = RequestConfig {
            timeout_ms: parse_env("REQUEST_TIMEOUT_MS", 30000),
            max_retries: parse_env("MAX_RETRIES", 3),
            retry_delay_ms: parse_env("RETRY_DELAY_MS", 1000),
        };

        let personas = PersonaSettings {
            model: env::var("PERSONA_MODEL").unwrap_or_else(|_| "openai:gpt-4o-mini".to_string()),
            pipe_prefix: env::var("PIPE_PREFIX").unwrap_or_else(|_| "think-tank".to_string()),
        };

        let knowledge_base_path = env::var("KNOWLEDGE_BASE_PATH")
            .ok()
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from);

        Ok(Config {
            langbase,
            database,
            logging,
            request,
            personas,
            orchestration: OrchestrationConfig::from_env()?,
            knowledge_base_path,
        })
    }
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30000,
            max_retries: 3,
            retry_delay_ms: 1000,
        }
    }
}
