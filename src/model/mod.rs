use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A requested avatar state change. `duration` is in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEvent {
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub revert: bool,
}

impl StateEvent {
    pub fn set(state: impl Into<String>) -> Self {
        Self {
            state: state.into(),
            duration: None,
            revert: false,
        }
    }

    pub fn revert(state: impl Into<String>) -> Self {
        Self {
            revert: true,
            ..Self::set(state)
        }
    }

    pub fn with_duration(mut self, secs: f64) -> Self {
        self.duration = Some(secs);
        self
    }

    pub fn has_valid_duration(&self) -> bool {
        self.duration.map_or(true, |secs| secs_to_duration(secs).is_some())
    }

    /// Callers check [`Self::has_valid_duration`] first; an unrepresentable
    /// duration that slips through is logged and replaced by `default`.
    pub fn effective_duration(&self, default: Duration) -> Duration {
        let Some(secs) = self.duration else {
            return default;
        };
        secs_to_duration(secs).unwrap_or_else(|| {
            tracing::warn!(
                state = %self.state,
                duration = secs,
                ?default,
                "unrepresentable duration, using the default"
            );
            default
        })
    }
}

/// `None` for negative, non-finite or overflowing second counts.
pub fn secs_to_duration(secs: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(secs).ok()
}

/// An external trigger, e.g. a follow or a channel point redeem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub event: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}
