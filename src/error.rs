use thiserror::Error;

use crate::backend::StorageError;

/// Every failure `command`, `find_aggregate` and query `build` can return.
///
/// None of these are retried internally; retry policy belongs to the caller.
#[derive(Error, Debug)]
pub enum EsError {
    /// A persisted event type has no registered handler in the dispatch table.
    #[error("No handler registered for event type `{event_type}`")]
    UnknownEventType { event_type: String },

    /// A handler received an aggregate of a different concrete type than the one its event targets.
    #[error("Aggregate type mismatch: expected `{expected}`, found `{found}`")]
    AggregateTypeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    /// A persisted aggregate id could not be parsed back into the typed id.
    #[error("Cannot parse aggregate id `{aggregate_id}` for aggregate `{aggregate_key}`")]
    AggregateIdParse {
        aggregate_key: String,
        aggregate_id: String,
    },

    /// Another writer appended the same step first.
    #[error("Append conflict for aggregate {aggregate_key}/{aggregate_id} at step {step}")]
    AppendConflict {
        aggregate_key: &'static str,
        aggregate_id: String,
        step: u64,
    },

    /// The stored payload could not be decoded into the target type.
    #[error("Failed to decode payload of `{kind}`: {source}")]
    PayloadDecode {
        kind: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to encode payload of `{kind}`: {source}")]
    PayloadEncode {
        kind: String,
        #[source]
        source: anyhow::Error,
    },

    /// The transition produced an event for an aggregate other than the one the command targeted.
    #[error("Command for aggregate `{expected}` produced an event for aggregate `{found}`")]
    EventAggregateMismatch { expected: String, found: String },

    #[error("Transition rejected the command: {0}")]
    Transition(#[source] anyhow::Error),

    /// A query fold rejected an event.
    #[error("Query fold failed on `{event_type}`: {source}")]
    Fold {
        event_type: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Storage operation failed: {0}")]
    Storage(#[from] StorageError),
}

// Result alias within the library
pub type Result<T, E = EsError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_conflict_names_the_stream_and_step() {
        let err = EsError::AppendConflict {
            aggregate_key: "todos",
            aggregate_id: "user1".to_string(),
            step: 3,
        };
        assert_eq!(
            err.to_string(),
            "Append conflict for aggregate todos/user1 at step 3"
        );
    }

    #[test]
    fn payload_decode_keeps_its_source() {
        let err = EsError::PayloadDecode {
            kind: "todoCreated".to_string(),
            source: anyhow::anyhow!("unexpected end of input"),
        };
        assert!(err.to_string().contains("todoCreated"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn storage_errors_convert_into_es_errors() {
        let err: EsError = StorageError::UniqueViolation {
            constraint: "eskit_events_stream_step",
        }
        .into();
        assert!(matches!(err, EsError::Storage(StorageError::UniqueViolation { .. })));
    }
}
