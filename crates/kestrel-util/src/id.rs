//! ULID-based identifier generation with prefixes.
//!
//! Identifiers in kestrel follow the pattern `prefix_ulid`, for example
//! `call_01hqxyz...` for tool calls. ULIDs are time-ordered, so ids sort
//! chronologically.

use ulid::Ulid;

/// Known identifier prefixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdPrefix {
    /// A conversation message.
    Message,
    /// A tool call issued by the model.
    Call,
    /// A conversation turn.
    Turn,
}

impl IdPrefix {
    /// Get the string prefix for this identifier type.
    pub fn as_str(&self) -> &'static str {
        match self {
            IdPrefix::Message => "msg",
            IdPrefix::Call => "call",
            IdPrefix::Turn => "trn",
        }
    }

    /// Parse a prefix from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "msg" => Some(IdPrefix::Message),
            "call" => Some(IdPrefix::Call),
            "trn" => Some(IdPrefix::Turn),
            _ => None,
        }
    }
}

/// Identifier generation and parsing utilities.
pub struct Identifier;

impl Identifier {
    /// Generate a new identifier with the given prefix.
    pub fn generate(prefix: IdPrefix) -> String {
        let ulid = Ulid::new();
        format!("{}_{}", prefix.as_str(), ulid.to_string().to_lowercase())
    }

    /// Generate a message identifier.
    pub fn message() -> String {
        Self::generate(IdPrefix::Message)
    }

    /// Generate a tool call identifier.
    pub fn call() -> String {
        Self::generate(IdPrefix::Call)
    }

    /// Generate a turn identifier.
    pub fn turn() -> String {
        Self::generate(IdPrefix::Turn)
    }

    /// Extract the prefix from an identifier.
    pub fn prefix_of(id: &str) -> Option<IdPrefix> {
        id.split_once('_').and_then(|(p, _)| IdPrefix::parse(p))
    }
}
