//! Generation requests as submitted by clients.

use serde::{Deserialize, Serialize};

use crate::{CharacterId, MuseError, Result};

/// Largest batch a single request may ask for.
pub const MAX_IMAGE_COUNT: u32 = 8;

/// Longest accepted prompt, in characters.
pub const MAX_PROMPT_CHARS: usize = 2000;

const MIN_DIMENSION: u32 = 128;
const MAX_DIMENSION: u32 = 2048;
const MAX_STEPS: u32 = 100;

/// Default checkpoint used when the client does not pick one.
pub const DEFAULT_MODEL: &str = "sd_xl_base_1.0.safetensors";

/// A text-to-image request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Positive prompt.
    pub prompt: String,

    /// Things the image should avoid.
    #[serde(default)]
    pub negative_prompt: String,

    /// Provider model identifier.
    #[serde(default = "default_model")]
    pub model: String,

    /// Number of images to generate.
    #[serde(default = "default_image_count")]
    pub image_count: u32,

    /// Output width in pixels.
    #[serde(default = "default_width")]
    pub width: u32,

    /// Output height in pixels.
    #[serde(default = "default_height")]
    pub height: u32,

    /// Sampling steps.
    #[serde(default = "default_steps")]
    pub steps: u32,

    /// Classifier-free guidance scale.
    #[serde(default = "default_guidance_scale")]
    pub guidance_scale: f32,

    /// Sampler name understood by the provider.
    #[serde(default = "default_sampler")]
    pub sampler_name: String,

    /// Seed; `-1` lets the provider choose.
    #[serde(default = "default_seed")]
    pub seed: i64,

    /// Character the results are filed under.
    #[serde(default)]
    pub character_id: Option<CharacterId>,
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

const fn default_image_count() -> u32 {
    1
}

const fn default_width() -> u32 {
    512
}

const fn default_height() -> u32 {
    768
}

const fn default_steps() -> u32 {
    25
}

const fn default_guidance_scale() -> f32 {
    7.5
}

fn default_sampler() -> String {
    "DPM++ 2M Karras".to_string()
}

const fn default_seed() -> i64 {
    -1
}

impl GenerationRequest {
    /// A request with default parameters.
    #[must_use]
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            negative_prompt: String::new(),
            model: default_model(),
            image_count: default_image_count(),
            width: default_width(),
            height: default_height(),
            steps: default_steps(),
            guidance_scale: default_guidance_scale(),
            sampler_name: default_sampler(),
            seed: default_seed(),
            character_id: None,
        }
    }

    /// Set the image count.
    #[must_use]
    pub fn with_image_count(mut self, image_count: u32) -> Self {
        self.image_count = image_count;
        self
    }

    /// Set the model.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Check the request before any token or provider work happens.
    ///
    /// # Errors
    ///
    /// Returns `MuseError::InvalidRequest` describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        let prompt = self.prompt.trim();
        if prompt.is_empty() {
            return Err(MuseError::InvalidRequest("prompt must not be empty".into()));
        }
        if prompt.chars().count() > MAX_PROMPT_CHARS {
            return Err(MuseError::InvalidRequest(format!(
                "prompt exceeds {MAX_PROMPT_CHARS} characters"
            )));
        }
        if self.model.trim().is_empty() {
            return Err(MuseError::InvalidRequest("model must not be empty".into()));
        }
        if !(1..=MAX_IMAGE_COUNT).contains(&self.image_count) {
            return Err(MuseError::InvalidRequest(format!(
                "image_count must be between 1 and {MAX_IMAGE_COUNT}"
            )));
        }
        for (name, value) in [("width", self.width), ("height", self.height)] {
            if !(MIN_DIMENSION..=MAX_DIMENSION).contains(&value) || value % 8 != 0 {
                return Err(MuseError::InvalidRequest(format!(
                    "{name} must be a multiple of 8 between {MIN_DIMENSION} and {MAX_DIMENSION}"
                )));
            }
        }
        if !(1..=MAX_STEPS).contains(&self.steps) {
            return Err(MuseError::InvalidRequest(format!(
                "steps must be between 1 and {MAX_STEPS}"
            )));
        }
        if !self.guidance_scale.is_finite() || self.guidance_scale <= 0.0 {
            return Err(MuseError::InvalidRequest(
                "guidance_scale must be positive".into(),
            ));
        }
        Ok(())
    }
}
