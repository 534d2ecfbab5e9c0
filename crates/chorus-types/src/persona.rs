//! Persona catalog entries and resolved voice selections.
//!
//! A `PersonaProfile` maps a persona id to a backend speaker and its styles.
//! A `VoiceSelection` is what the synthesis backend actually receives once a
//! persona, style and speed have been resolved for an utterance.

use crate::PersonaId;
use serde::{Deserialize, Serialize};

/// A speaking style offered by a backend speaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StyleProfile {
    /// Style name as reported by the backend (e.g. "normal").
    pub name: String,
    /// Backend style identifier.
    pub style_id: i64,
    /// Measured speaking speed of this style at speed scale 1.0, in morae per
    /// second. Used to convert a words-per-minute rate into a speed scale.
    #[serde(default)]
    pub morae_per_second: Option<f64>,
}

/// A persona the registry can hand out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonaProfile {
    pub id: PersonaId,
    /// Display name.
    pub name: String,
    /// Backend speaker identifier.
    pub speaker_id: String,
    /// Style used when the caller does not name one.
    #[serde(default)]
    pub default_style: Option<String>,
    #[serde(default)]
    pub styles: Vec<StyleProfile>,
}

impl PersonaProfile {
    /// Looks up a style by name.
    pub fn style(&self, name: &str) -> Option<&StyleProfile> {
        self.styles.iter().find(|s| s.name == name)
    }

    /// The configured default style, or the first style the speaker offers.
    pub fn default_style(&self) -> Option<&StyleProfile> {
        self.default_style
            .as_deref()
            .and_then(|name| self.style(name))
            .or_else(|| self.styles.first())
    }
}

/// Fully resolved voice parameters for one utterance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceSelection {
    pub persona: PersonaId,
    pub speaker_id: String,
    pub style_id: i64,
    pub style_name: String,
    /// Relative speaking speed sent to the backend (1.0 is normal).
    pub speed_scale: f64,
}
