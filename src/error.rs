use thiserror::Error;

/// Custom error types for the quiz coordinator
#[derive(Debug, Error)]
pub enum QuizError {
    /// Room lookup errors
    #[error("Room {0} not found")]
    RoomNotFound(String),

    /// Role or state mismatch. Records the state the command found the room
    /// in so the rejection can be surfaced to the caller.
    #[error("{action} forbidden: {state}")]
    Forbidden { action: String, state: String },

    /// Malformed input rejected at the boundary before any state mutation
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Second answer from the same participant for the same question
    #[error("Participant {0} already answered this question")]
    DuplicateSubmission(String),

    #[error("Failed to serialize message: {0}")]
    SerializationFailed(#[from] serde_json::Error),
}

/// Convenience type alias for Results using QuizError
pub type Result<T> = std::result::Result<T, QuizError>;

impl QuizError {
    /// Helper to create Forbidden errors with context
    pub fn forbidden(action: impl Into<String>, state: impl Into<String>) -> Self {
        QuizError::Forbidden {
            action: action.into(),
            state: state.into(),
        }
    }

    /// Helper to create InvalidInput errors
    pub fn invalid(msg: impl Into<String>) -> Self {
        QuizError::InvalidInput(msg.into())
    }

    /// Short machine-readable code carried on `command-rejected` replies
    pub fn code(&self) -> &'static str {
        match self {
            QuizError::RoomNotFound(_) => "not-found",
            QuizError::Forbidden { .. } => "forbidden",
            QuizError::InvalidInput(_) => "invalid-input",
            QuizError::DuplicateSubmission(_) => "duplicate-submission",
            QuizError::SerializationFailed(_) => "serialization",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = QuizError::RoomNotFound("ABC123".to_string());
        assert_eq!(err.to_string(), "Room ABC123 not found");
    }

    #[test]
    fn test_error_helpers() {
        let err = QuizError::forbidden("start-quiz", "ended");
        assert!(matches!(err, QuizError::Forbidden { .. }));
        assert_eq!(err.code(), "forbidden");
    }

    #[test]
    fn test_duplicate_code() {
        let err = QuizError::DuplicateSubmission("p1".to_string());
        assert_eq!(err.code(), "duplicate-submission");
    }
}
