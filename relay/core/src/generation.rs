//! Generation Config Builder
//!
//! Turns a model identifier and the session's settings into the request
//! configuration for one generation. The builder is pure: the same inputs
//! always produce the same config, so it serves both dispatch and the
//! token-count probe.
//!
//! # Model Profiles
//!
//! | Profile          | Text tuning | Thinking | Tools | Output        |
//! |------------------|-------------|----------|-------|---------------|
//! | `Standard`       | yes         | no       | yes   | text          |
//! | `Reasoning`      | yes         | yes      | yes   | text          |
//! | `ImageGeneration`| no          | no       | no    | image         |
//! | `Speech`         | no          | no       | no    | audio         |

use serde::Serialize;

use crate::session::{MediaResolution, SafetyThreshold, SessionSettings, ThinkingLevel};

/// Instruction appended to the system prompt in deep search mode
pub const DEEP_SEARCH_SYSTEM_SUFFIX: &str = "You are in deep research mode. Search the web \
extensively before answering, consult several independent sources, reconcile \
disagreements between them, and cite the sources you relied on.";

/// Harm categories that receive the session's safety threshold
pub const HARM_CATEGORIES: [&str; 4] = [
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
];

/// Capability class of a model
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModelProfile {
    /// Plain text model
    Standard,
    /// Model with a reasoning phase
    Reasoning {
        /// Accepts a discrete thinking level in addition to a budget
        levels: bool,
    },
    /// Image generation model
    ImageGeneration,
    /// Text-to-speech model
    Speech,
}

impl ModelProfile {
    /// Classify a model by its identifier
    pub fn for_model(model_id: &str) -> Self {
        let id = model_id.to_ascii_lowercase();
        if id.contains("imagen") || id.contains("-image") {
            Self::ImageGeneration
        } else if id.contains("tts") {
            Self::Speech
        } else if id.contains("gemini-3") {
            Self::Reasoning { levels: true }
        } else if id.contains("gemini-2.5") || id.contains("thinking") {
            Self::Reasoning { levels: false }
        } else {
            Self::Standard
        }
    }

    /// Whether a turn with files but no text may be sent
    #[must_use]
    pub fn allows_media_only_turn(self) -> bool {
        !matches!(self, Self::Speech)
    }
}

/// Reasoning control; a budget and a level are never sent together
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ThinkingControl {
    /// Explicit token budget
    Budget(u32),
    /// Discrete level
    Level(ThinkingLevel),
}

/// Server-side tool attached to a request
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ToolDeclaration {
    /// Web search grounding
    GoogleSearch,
    /// Sandboxed code execution
    CodeExecution,
    /// Fetch and read URLs from the prompt
    UrlContext,
}

/// Output modality
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Modality {
    /// Text output
    Text,
    /// Image output
    Image,
    /// Audio output
    Audio,
}

impl Modality {
    /// Wire representation
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "TEXT",
            Self::Image => "IMAGE",
            Self::Audio => "AUDIO",
        }
    }
}

/// Request configuration for one generation
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GenerationConfig {
    /// Model profile the config was built for
    #[serde(skip)]
    pub profile: Option<ModelProfile>,
    /// Sampling temperature
    pub temperature: Option<f32>,
    /// Nucleus sampling
    pub top_p: Option<f32>,
    /// Top-k sampling
    pub top_k: Option<u32>,
    /// Output token cap
    pub max_output_tokens: Option<u32>,
    /// Effective system instruction
    pub system_instruction: Option<String>,
    /// Reasoning control
    pub thinking: Option<ThinkingControl>,
    /// Return reasoning text
    pub include_thoughts: bool,
    /// Attached tools
    pub tools: Vec<ToolDeclaration>,
    /// Output modalities, empty for the service default
    pub response_modalities: Vec<Modality>,
    /// Response shape constraint
    pub response_mime_type: Option<String>,
    /// Safety threshold per harm category
    pub safety: Option<SafetyThreshold>,
    /// Image aspect ratio
    pub aspect_ratio: Option<String>,
    /// Speech voice
    pub voice: Option<String>,
    /// Media input resolution
    pub media_resolution: MediaResolution,
}

impl GenerationConfig {
    fn empty(profile: ModelProfile) -> Self {
        Self {
            profile: Some(profile),
            temperature: None,
            top_p: None,
            top_k: None,
            max_output_tokens: None,
            system_instruction: None,
            thinking: None,
            include_thoughts: false,
            tools: Vec::new(),
            response_modalities: Vec::new(),
            response_mime_type: None,
            safety: None,
            aspect_ratio: None,
            voice: None,
            media_resolution: MediaResolution::Unspecified,
        }
    }
}

/// Build the request configuration for `model_id` from `settings`
pub fn build_generation_config(model_id: &str, settings: &SessionSettings) -> GenerationConfig {
    let profile = ModelProfile::for_model(model_id);
    let mut config = GenerationConfig::empty(profile);
    config.safety = Some(settings.safety_threshold);

    match profile {
        ModelProfile::ImageGeneration => {
            config.response_modalities = vec![Modality::Image];
            config.aspect_ratio = Some(settings.image_aspect_ratio.clone());
            return config;
        }
        ModelProfile::Speech => {
            config.response_modalities = vec![Modality::Audio];
            config.voice = Some(settings.tts_voice.clone());
            return config;
        }
        ModelProfile::Standard | ModelProfile::Reasoning { .. } => {}
    }

    config.temperature = settings.temperature;
    config.top_p = settings.top_p;
    config.top_k = settings.top_k;
    config.max_output_tokens = settings.max_output_tokens;
    config.media_resolution = settings.media_resolution;
    config.system_instruction = system_instruction(settings);

    if let ModelProfile::Reasoning { .. } = profile {
        config.thinking = Some(if settings.thinking_budget > 0 {
            ThinkingControl::Budget(settings.thinking_budget.unsigned_abs())
        } else {
            ThinkingControl::Level(settings.thinking_level.unwrap_or_default())
        });
        config.include_thoughts = settings.show_thoughts;
    }

    if settings.use_web_search || settings.deep_search {
        config.tools.push(ToolDeclaration::GoogleSearch);
    }
    if settings.use_code_execution {
        config.tools.push(ToolDeclaration::CodeExecution);
    }
    if settings.use_url_context {
        config.tools.push(ToolDeclaration::UrlContext);
    }

    if settings.json_output && config.tools.is_empty() {
        config.response_mime_type = Some("application/json".to_string());
    }

    config
}

fn system_instruction(settings: &SessionSettings) -> Option<String> {
    let user = settings.system_instruction.trim();
    let text = match (user.is_empty(), settings.deep_search) {
        (true, false) => return None,
        (true, true) => DEEP_SEARCH_SYSTEM_SUFFIX.to_string(),
        (false, false) => user.to_string(),
        (false, true) => format!("{user}\n\n{DEEP_SEARCH_SYSTEM_SUFFIX}"),
    };
    Some(text)
}
