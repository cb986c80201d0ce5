#![forbid(unsafe_code)]

//! Error type shared by every proptrack operation.

use thiserror::Error;

use crate::PropertyKey;
use crate::hierarchy::TypeKey;

pub type Result<T> = std::result::Result<T, ReactiveError>;

#[derive(Debug, Error)]
pub enum ReactiveError {
    #[error("unknown type: {0}")]
    UnknownType(TypeKey),

    #[error("type limit reached: at most {limit} types per runtime")]
    TypeLimitExceeded { limit: u64 },

    #[error("no change callback registered for property `{property}`")]
    MissingCallbackChain { property: PropertyKey },

    #[error("no accessor installed for property `{property}`")]
    MissingAccessor { property: PropertyKey },

    #[error("microtask drain exceeded {limit} tasks")]
    DrainLimitExceeded { limit: usize },

    #[error("callback failed: {message}")]
    Callback { message: String },

    #[error(transparent)]
    External(#[from] Box<dyn std::error::Error + 'static>),
}

impl ReactiveError {
    /// Failure raised by a user callback.
    #[must_use]
    pub fn callback(message: impl Into<String>) -> Self {
        Self::Callback {
            message: message.into(),
        }
    }

    /// Whether this error signals a broken registration invariant rather
    /// than a failure inside user code.
    #[must_use]
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            Self::UnknownType(_) | Self::MissingCallbackChain { .. } | Self::MissingAccessor { .. }
        )
    }
}
