//! Persona catalogue: the seven think-tank roles and their configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::prompts;

/// One of the seven fixed agent personas.
///
/// Declaration order is the submission priority: proposals from
/// `Strategist` are admitted before those of `Analyst`, and so on.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Persona {
    /// Long-term planning and direction.
    Strategist,
    /// Data-driven pattern recognition.
    Analyst,
    /// Novel idea generation.
    CreativeThinker,
    /// Concept connection and integration.
    Synthesizer,
    /// Practical execution planning.
    Implementer,
    /// Deep knowledge exploration.
    Researcher,
    /// Critical evaluation.
    Challenger,
}

impl Persona {
    /// All personas in priority order.
    pub const ALL: [Persona; 7] = [
        Persona::Strategist,
        Persona::Analyst,
        Persona::CreativeThinker,
        Persona::Synthesizer,
        Persona::Implementer,
        Persona::Researcher,
        Persona::Challenger,
    ];

    /// Get the persona id as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            Persona::Strategist => "strategist",
            Persona::Analyst => "analyst",
            Persona::CreativeThinker => "creative_thinker",
            Persona::Synthesizer => "synthesizer",
            Persona::Implementer => "implementer",
            Persona::Researcher => "researcher",
            Persona::Challenger => "challenger",
        }
    }

    /// Submission priority (lower is admitted first).
    pub fn priority(&self) -> u8 {
        *self as u8
    }

    /// Human-readable display name.
    pub fn display_name(&self) -> &'static str {
        match self {
            Persona::Strategist => "Strategist",
            Persona::Analyst => "Analyst",
            Persona::CreativeThinker => "Creative Thinker",
            Persona::Synthesizer => "Synthesizer",
            Persona::Implementer => "Implementer",
            Persona::Researcher => "Researcher",
            Persona::Challenger => "Challenger",
        }
    }
}

impl std::fmt::Display for Persona {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Persona {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace(['-', ' '], "_").as_str() {
            "strategist" => Ok(Persona::Strategist),
            "analyst" => Ok(Persona::Analyst),
            "creative_thinker" | "creative" => Ok(Persona::CreativeThinker),
            "synthesizer" => Ok(Persona::Synthesizer),
            "implementer" => Ok(Persona::Implementer),
            "researcher" => Ok(Persona::Researcher),
            "challenger" => Ok(Persona::Challenger),
            _ => Err(format!("Unknown persona: {}", s)),
        }
    }
}

/// How a persona's raw model output is turned into graph proposals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostProcess {
    /// Each thought extends the highest-scored prior node (or its `builds_on`).
    Extend,
    /// Each thought merges every prior node.
    Aggregate,
    /// Each thought is a critique of the prior node it targets.
    Critique,
}

/// Model-facing configuration of a single persona.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonaConfig {
    /// Which persona this configures.
    pub persona: Persona,
    /// Role summary used in the system prompt.
    pub role: String,
    /// Trait weights (0.0-1.0), e.g. `creative: 0.95`.
    pub traits: BTreeMap<String, f64>,
    /// Areas of expertise.
    pub expertise: Vec<String>,
    /// Model identifier passed when provisioning the pipe.
    pub model: String,
    /// Sampling temperature (creativity bias).
    pub temperature: f64,
    /// Completion token cap.
    pub max_tokens: u32,
    /// Langbase pipe name for this persona.
    pub pipe_name: String,
    /// Output post-processing.
    pub post_process: PostProcess,
}

impl PersonaConfig {
    /// Default configuration for `persona`.
    pub fn default_for(persona: Persona) -> Self {
        let (role, traits, expertise, temperature): (&str, &[(&str, f64)], &[&str], f64) =
            match persona {
                Persona::Strategist => (
                    "Long-term planning and direction",
                    &[("analytical", 0.8), ("strategic", 0.9), ("creative", 0.6)],
                    &["strategic planning", "goal setting", "risk assessment"],
                    0.7,
                ),
                Persona::Analyst => (
                    "Data-driven pattern recognition",
                    &[("analytical", 0.95), ("detail_oriented", 0.9), ("systematic", 0.85)],
                    &["data analysis", "pattern recognition", "statistical inference"],
                    0.3,
                ),
                Persona::CreativeThinker => (
                    "Novel idea generation",
                    &[("creative", 0.95), ("intuitive", 0.8), ("open_minded", 0.9)],
                    &["brainstorming", "innovation", "lateral thinking"],
                    0.9,
                ),
                Persona::Synthesizer => (
                    "Concept connection and integration",
                    &[("analytical", 0.7), ("creative", 0.7), ("systematic", 0.8)],
                    &["concept integration", "pattern synthesis", "knowledge mapping"],
                    0.6,
                ),
                Persona::Implementer => (
                    "Practical execution planning",
                    &[("practical", 0.9), ("detail_oriented", 0.85), ("systematic", 0.8)],
                    &["execution planning", "resource allocation", "task management"],
                    0.4,
                ),
                Persona::Researcher => (
                    "Deep knowledge exploration",
                    &[("analytical", 0.85), ("thorough", 0.9), ("curious", 0.8)],
                    &["research methodology", "information synthesis", "knowledge discovery"],
                    0.5,
                ),
                Persona::Challenger => (
                    "Critical evaluation",
                    &[("critical", 0.9), ("analytical", 0.8), ("objective", 0.85)],
                    &["critical analysis", "risk assessment", "assumption testing"],
                    0.6,
                ),
            };

        let post_process = match persona {
            Persona::Synthesizer => PostProcess::Aggregate,
            Persona::Challenger => PostProcess::Critique,
            _ => PostProcess::Extend,
        };

        Self {
            persona,
            role: role.to_string(),
            traits: traits.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            expertise: expertise.iter().map(|s| s.to_string()).collect(),
            model: "openai:gpt-4o-mini".to_string(),
            temperature,
            max_tokens: 1000,
            pipe_name: format!("think-tank-{}", persona.as_str().replace('_', "-")),
            post_process,
        }
    }

    /// Set the model
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Set the pipe name
    pub fn with_pipe_name(mut self, pipe_name: impl Into<String>) -> Self {
        self.pipe_name = pipe_name.into();
        self
    }

    /// Set temperature (clamped to 0.0-2.0)
    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature.clamp(0.0, 2.0);
        self
    }

    /// Full system prompt for this persona.
    pub fn system_prompt(&self) -> String {
        let traits = self
            .traits
            .iter()
            .map(|(k, v)| format!("{} ({:.2})", k, v))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "You are the {name} of a multi-agent think tank. Role: {role}.\n\
             Traits: {traits}.\nExpertise: {expertise}.\n\n{specialization}\n\n{format}",
            name = self.persona.display_name(),
            role = self.role,
            traits = traits,
            expertise = self.expertise.join(", "),
            specialization = prompts::persona_guidance(self.persona),
            format = prompts::THOUGHT_RESPONSE_FORMAT,
        )
    }
}

/// Configuration for all seven personas.
#[derive(Debug, Clone, PartialEq)]
pub struct PersonaCatalog {
    personas: BTreeMap<Persona, PersonaConfig>,
}

impl PersonaCatalog {
    /// Catalog with every persona using `model` and pipes named `{prefix}-{persona}`.
    pub fn new(model: &str, pipe_prefix: &str) -> Self {
        let personas = Persona::ALL
            .iter()
            .map(|p| {
                let config = PersonaConfig::default_for(*p)
                    .with_model(model)
                    .with_pipe_name(format!(
                        "{}-{}",
                        pipe_prefix,
                        p.as_str().replace('_', "-")
                    ));
                (*p, config)
            })
            .collect();
        Self { personas }
    }

    /// Configuration for `persona`.
    pub fn get(&self, persona: Persona) -> &PersonaConfig {
        // Every persona is inserted at construction.
        &self.personas[&persona]
    }

    /// Replace the configuration for one persona.
    pub fn set(&mut self, config: PersonaConfig) {
        self.personas.insert(config.persona, config);
    }

    /// All persona configurations in priority order.
    pub fn iter(&self) -> impl Iterator<Item = &PersonaConfig> {
        self.personas.values()
    }
}

impl Default for PersonaCatalog {
    fn default() -> Self {
        Self::new("openai:gpt-4o-mini", "think-tank")
    }
}
