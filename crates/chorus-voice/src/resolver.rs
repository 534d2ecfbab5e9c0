//! Turns caller options into a concrete [`VoiceSelection`].

use crate::error::VoiceError;
use chorus_persona::{PersonaError, PersonaRegistry};
use chorus_types::{PersonaId, SessionId, VoiceSelection};
use serde::{Deserialize, Serialize};

/// Speaking rate that maps to speed scale 1.0.
pub const BASE_WORDS_PER_MINUTE: f64 = 200.0;

/// Morae per second corresponding to [`BASE_WORDS_PER_MINUTE`].
pub const BASE_MORAE_PER_SECOND: f64 = 7.5;

pub const MIN_SPEED_SCALE: f64 = 0.5;
pub const MAX_SPEED_SCALE: f64 = 2.0;

/// Voice options of one request. Everything is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VoiceRequest {
    /// Explicit persona; skips the session lease.
    pub persona: Option<PersonaId>,
    pub style: Option<String>,
    /// Words per minute.
    pub rate: Option<u32>,
    /// Relative speed.
    pub factor: Option<f64>,
}

/// Converts a rate or a relative factor into a backend speed scale.
///
/// With a known `morae_per_second` for the style, `rate` is converted
/// through morae so styles that speak faster get a smaller scale.
///
/// # Errors
///
/// `InvalidOptions` when both `rate` and `factor` are given or either is
/// not a positive number.
pub fn resolve_speed(
    rate: Option<u32>,
    factor: Option<f64>,
    morae_per_second: Option<f64>,
) -> Result<f64, VoiceError> {
    let scale = match (rate, factor) {
        (Some(_), Some(_)) => {
            return Err(VoiceError::InvalidOptions(
                "rate and factor are mutually exclusive".to_string(),
            ))
        }
        (None, None) => return Ok(1.0),
        (None, Some(factor)) => {
            if !factor.is_finite() || factor <= 0.0 {
                return Err(VoiceError::InvalidOptions(format!("invalid speed factor {factor}")));
            }
            factor
        }
        (Some(0), None) => {
            return Err(VoiceError::InvalidOptions("rate must be positive".to_string()));
        }
        (Some(rate), None) => {
            let relative = f64::from(rate) / BASE_WORDS_PER_MINUTE;
            match morae_per_second.filter(|m| *m > 0.0) {
                Some(morae) => relative * BASE_MORAE_PER_SECOND / morae,
                None => relative,
            }
        }
    };
    Ok(scale.clamp(MIN_SPEED_SCALE, MAX_SPEED_SCALE))
}

/// Resolves voices for one session.
#[derive(Debug, Clone)]
pub struct VoiceResolver {
    registry: PersonaRegistry,
    session: SessionId,
    default_persona: Option<PersonaId>,
    allow_fallback: bool,
}

impl VoiceResolver {
    pub fn new(registry: PersonaRegistry, session: SessionId) -> Self {
        Self {
            registry,
            session,
            default_persona: None,
            allow_fallback: false,
        }
    }

    /// Persona used when the session holds none and fallback is allowed.
    pub fn with_fallback(mut self, default_persona: Option<PersonaId>, allow_fallback: bool) -> Self {
        self.default_persona = default_persona;
        self.allow_fallback = allow_fallback;
        self
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    pub fn registry(&self) -> &PersonaRegistry {
        &self.registry
    }

    /// Picks persona, style and speed for `request`.
    ///
    /// Without an explicit persona the session's lease is used and renewed.
    /// Blocks on registry I/O.
    pub fn resolve(&self, request: &VoiceRequest) -> Result<VoiceSelection, VoiceError> {
        let persona_id = match &request.persona {
            Some(id) => id.clone(),
            None => self.leased_persona()?,
        };
        let profile = self.registry.profile(&persona_id)?;

        let style = match request.style.as_deref() {
            Some(name) => Some(profile.style(name).ok_or_else(|| {
                VoiceError::InvalidOptions(format!("persona {persona_id} has no style {name:?}"))
            })?),
            None => profile.default_style(),
        };
        let (style_id, style_name, morae) = match style {
            Some(style) => (style.style_id, style.name.clone(), style.morae_per_second),
            None => (0, "normal".to_string(), None),
        };

        let speed_scale = resolve_speed(request.rate, request.factor, morae)?;
        tracing::debug!(persona = %persona_id, style = %style_name, speed_scale, "voice resolved");

        Ok(VoiceSelection {
            persona: persona_id,
            speaker_id: profile.speaker_id.clone(),
            style_id,
            style_name,
            speed_scale,
        })
    }

    fn leased_persona(&self) -> Result<PersonaId, VoiceError> {
        match self.registry.renew(&self.session) {
            Ok(lease) => Ok(lease.persona_id),
            Err(PersonaError::NotHeld(session)) => match (&self.default_persona, self.allow_fallback) {
                (Some(default), true) => {
                    tracing::debug!(session = %session, persona = %default, "no lease, using default persona");
                    Ok(default.clone())
                }
                _ => Err(PersonaError::NotHeld(session).into()),
            },
            Err(e) => Err(e.into()),
        }
    }
}
