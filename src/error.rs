//! Error types shared by the wizard core and the generation gateway.

use crate::steps::StepId;

/// Errors raised by navigation and generation control on a wizard session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WizardError {
    /// The step graph does not define the requested step. Indicates a malformed graph.
    #[error("unknown step: {0}")]
    UnknownStep(String),

    /// Navigation was requested past a terminal edge or while gating failed.
    #[error("cannot move {direction} from step '{from}': {reason}")]
    InvalidTransition {
        from: StepId,
        direction: Direction,
        reason: String,
    },

    /// A generation is already in flight for this session.
    #[error("a generation is already in progress")]
    GenerationInProgress,

    /// Regeneration needs a finished (or failed) previous generation.
    #[error("nothing to regenerate yet")]
    NotRegenerable,

    /// Regenerating a finished artifact needs some changes to apply.
    #[error("describe the changes first")]
    EmptyPrompt,

    /// The extra prompt exceeds the configured word budget.
    #[error("prompt has {words} words, the limit is {max}")]
    PromptTooLong { words: usize, max: usize },
}

/// Navigation direction, used for error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Next,
    Previous,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Next => write!(f, "forward"),
            Direction::Previous => write!(f, "back"),
        }
    }
}

/// Errors raised by the selection store for programmer mistakes.
///
/// Bound violations are not errors: they come back as a rejected update.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectionError {
    #[error("unknown field: {0}")]
    UnknownField(String),

    #[error("'{value}' is not an option of field '{field}'")]
    UnknownOption { field: String, value: String },
}

/// Failures talking to an external generation service.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GenerationError {
    /// The request could not be sent or the connection dropped.
    #[error("request failed: {0}")]
    Request(String),

    /// The service answered with a non-success status.
    #[error("service returned {status}: {body}")]
    Status { status: u16, body: String },

    /// The response body did not have the expected shape.
    #[error("malformed response: {0}")]
    MalformedPayload(String),

    /// The service reported an error in the middle of a stream.
    #[error("stream error: {0}")]
    Stream(String),
}

impl From<reqwest::Error> for GenerationError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            GenerationError::MalformedPayload(e.to_string())
        } else {
            GenerationError::Request(e.to_string())
        }
    }
}

/// A byte sequence in a text stream that is not valid UTF-8.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid UTF-8 at byte {offset} of the stream")]
pub struct StreamDecodeError {
    /// Offset of the first invalid byte, counted from the start of the stream.
    pub offset: usize,
}
