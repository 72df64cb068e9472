use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Event category, also used to tag persisted records.
///
/// Asset and experience events flow through independent coordinators
/// and are never mixed in one delivery batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Asset,
    Experience,
}

impl EventCategory {
    /// Returns the category label for logging and wire rows.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Asset => "asset",
            Self::Experience => "experience",
        }
    }
}

impl std::fmt::Display for EventCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of observed interaction.
///
/// `Definition` is experience-only: it registers the experience and its
/// attributed assets but is not a countable interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionKind {
    Definition,
    View,
    Click,
}

impl InteractionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Definition => "definition",
            Self::View => "view",
            Self::Click => "click",
        }
    }
}

/// Free-form metadata value attached to an event.
///
/// A closed variant type instead of dynamic any-casting so conflict
/// detection can compare stable stringified forms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExtraValue {
    Bool(bool),
    Number(f64),
    String(String),
    List(Vec<ExtraValue>),
    Map(BTreeMap<String, ExtraValue>),
}

impl ExtraValue {
    /// Canonical string form used for conflict detection and wire rows.
    ///
    /// Whole numbers render without a trailing `.0` so `2` and `2.0`
    /// compare equal.
    pub fn to_wire_string(&self) -> String {
        match self {
            Self::Bool(b) => b.to_string(),
            Self::Number(n) => {
                if n.fract() == 0.0 && n.is_finite() {
                    format!("{}", *n as i64)
                } else {
                    n.to_string()
                }
            }
            Self::String(s) => s.clone(),
            Self::List(_) | Self::Map(_) => {
                serde_json::to_string(self).unwrap_or_else(|_| String::new())
            }
        }
    }

    /// Returns the contained string slice, if this is a string value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

/// Extras map carried on an event.
pub type Extras = BTreeMap<String, ExtraValue>;

/// One observed user action.
///
/// Created when a tracking call fires, consumed once merged into an
/// aggregated metric, never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionEvent {
    pub category: EventCategory,
    pub kind: InteractionKind,
    /// Asset URL or experience ID.
    pub identifier: String,
    /// Optional location dimension. Absence is distinct from the empty
    /// string for grouping purposes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extras: Option<Extras>,
}

impl InteractionEvent {
    /// Creates a new event, rejecting empty identifiers.
    pub fn new(
        category: EventCategory,
        kind: InteractionKind,
        identifier: impl Into<String>,
        location: Option<String>,
        extras: Option<Extras>,
    ) -> Result<Self, PipelineError> {
        let identifier = identifier.into();
        if identifier.is_empty() {
            return Err(PipelineError::Validation("empty identifier".to_string()));
        }

        Ok(Self {
            category,
            kind,
            identifier,
            location,
            extras,
        })
    }

    /// Derived aggregation key: identifier plus optional location suffix.
    ///
    /// Unique per (identifier, location) pair; events differing only in
    /// location never share a key.
    pub fn entity_key(&self) -> String {
        if self.identifier.is_empty() {
            return String::new();
        }

        match &self.location {
            Some(location) => format!("{}?location={location}", self.identifier),
            None => self.identifier.clone(),
        }
    }
}
