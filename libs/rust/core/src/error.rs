//! Typed failures for every pipeline stage.
//!
//! Each stage has its own failure enum; [`PipelineError`] wraps them together
//! with the participant that caused the failure so callers can branch on cause.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage { Locate, Fetch, Decrypt, Decode, Validate, Aggregate, Evaluate }

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Locate => "locate",
            Stage::Fetch => "fetch",
            Stage::Decrypt => "decrypt",
            Stage::Decode => "decode",
            Stage::Validate => "validate",
            Stage::Aggregate => "aggregate",
            Stage::Evaluate => "evaluate",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LocatorFailure {
    #[error("model {0:?} is not registered")]
    UnknownModel(String),
    #[error("registry unavailable: {0}")]
    Registry(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RetrievalFailure {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("gateway answered with status {0}")]
    BadStatus(u16),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid content hash {0:?}")]
    InvalidContentHash(String),
    #[error("blob of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: u64, limit: u64 },
}

impl RetrievalFailure {
    /// Timeouts, transport errors, throttling and server errors may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            RetrievalFailure::Timeout(_) | RetrievalFailure::Transport(_) => true,
            RetrievalFailure::BadStatus(code) => *code == 429 || (500..600).contains(code),
            RetrievalFailure::InvalidContentHash(_) | RetrievalFailure::TooLarge { .. } => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecryptionFailure {
    #[error("bad key: {0}")]
    BadKey(&'static str),
    #[error("ciphertext rejected: {0}")]
    Tampered(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedFailure {
    #[error("payload is not valid JSON: {0}")]
    Syntax(String),
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("field `{field}` must be {expected}")]
    WrongType { field: &'static str, expected: &'static str },
    #[error("unexpected field `{0}`")]
    UnexpectedField(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationFailure {
    #[error("`{field}` has length {found}, expected {expected}")]
    ShapeMismatch { field: &'static str, expected: usize, found: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AggregationFailure {
    #[error("no packages to aggregate")]
    EmptyInput,
    #[error("quorum not met: {available} of {required} required participants available")]
    QuorumNotMet { required: usize, available: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvaluationFailure {
    #[error("bad dataset: {0}")]
    BadDataset(String),
    #[error("invalid hyperparameter: {0}")]
    InvalidHyperparameter(String),
    #[error("training failed: {0}")]
    Training(String),
    #[error("evaluation task aborted: {0}")]
    Aborted(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PipelineError {
    #[error("locating participants of model {model_id:?} failed: {source}")]
    Locate { model_id: String, source: LocatorFailure },
    #[error("retrieval failed for participant {participant}: {source}")]
    Retrieval { participant: String, source: RetrievalFailure },
    #[error("decryption failed for participant {participant}: {source}")]
    Decryption { participant: String, source: DecryptionFailure },
    #[error("malformed package from participant {participant}: {source}")]
    MalformedPackage { participant: String, source: MalformedFailure },
    #[error("package from participant {participant} failed validation: {source}")]
    Validation { participant: String, source: ValidationFailure },
    #[error("aggregation failed: {0}")]
    Aggregation(#[from] AggregationFailure),
    #[error("evaluation failed: {0}")]
    Evaluation(#[from] EvaluationFailure),
}

impl PipelineError {
    pub fn stage(&self) -> Stage {
        match self {
            PipelineError::Locate { .. } => Stage::Locate,
            PipelineError::Retrieval { .. } => Stage::Fetch,
            PipelineError::Decryption { .. } => Stage::Decrypt,
            PipelineError::MalformedPackage { .. } => Stage::Decode,
            PipelineError::Validation { .. } => Stage::Validate,
            PipelineError::Aggregation(_) => Stage::Aggregate,
            PipelineError::Evaluation(_) => Stage::Evaluate,
        }
    }

    pub fn participant(&self) -> Option<&str> {
        match self {
            PipelineError::Retrieval { participant, .. }
            | PipelineError::Decryption { participant, .. }
            | PipelineError::MalformedPackage { participant, .. }
            | PipelineError::Validation { participant, .. } => Some(participant),
            _ => None,
        }
    }

    /// Stable kebab-case name of the failure cause, suitable for metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Locate { source, .. } => match source {
                LocatorFailure::UnknownModel(_) => "unknown-model",
                LocatorFailure::Registry(_) => "registry",
            },
            PipelineError::Retrieval { source, .. } => match source {
                RetrievalFailure::Timeout(_) => "timeout",
                RetrievalFailure::BadStatus(_) => "bad-status",
                RetrievalFailure::Transport(_) => "transport",
                RetrievalFailure::InvalidContentHash(_) => "invalid-hash",
                RetrievalFailure::TooLarge { .. } => "too-large",
            },
            PipelineError::Decryption { source, .. } => match source {
                DecryptionFailure::BadKey(_) => "bad-key",
                DecryptionFailure::Tampered(_) => "tampered",
            },
            PipelineError::MalformedPackage { source, .. } => match source {
                MalformedFailure::Syntax(_) => "syntax",
                MalformedFailure::MissingField(_) => "missing-field",
                MalformedFailure::WrongType { .. } => "wrong-type",
                MalformedFailure::UnexpectedField(_) => "unexpected-field",
            },
            PipelineError::Validation { source, .. } => match source {
                ValidationFailure::ShapeMismatch { .. } => "shape-mismatch",
            },
            PipelineError::Aggregation(f) => match f {
                AggregationFailure::EmptyInput => "empty-input",
                AggregationFailure::QuorumNotMet { .. } => "quorum-not-met",
            },
            PipelineError::Evaluation(f) => match f {
                EvaluationFailure::BadDataset(_) => "bad-dataset",
                EvaluationFailure::InvalidHyperparameter(_) => "invalid-hyperparameter",
                EvaluationFailure::Training(_) => "training-failed",
                EvaluationFailure::Aborted(_) => "aborted",
            },
        }
    }

    /// Failures tied to one participant's artifact; these are the ones quorum mode may exclude.
    pub fn is_participant_local(&self) -> bool {
        matches!(self, PipelineError::Retrieval { .. } | PipelineError::Decryption { .. } | PipelineError::MalformedPackage { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_participant_and_kind_are_inspectable() {
        let err = PipelineError::Decryption { participant: "p2".into(), source: DecryptionFailure::Tampered("tag mismatch") };
        assert_eq!(err.stage(), Stage::Decrypt);
        assert_eq!(err.participant(), Some("p2"));
        assert_eq!(err.kind(), "tampered");
        assert!(err.to_string().contains("p2"));

        let err: PipelineError = AggregationFailure::EmptyInput.into();
        assert_eq!(err.stage(), Stage::Aggregate);
        assert_eq!(err.participant(), None);
        assert_eq!(err.kind(), "empty-input");
    }

    #[test]
    fn only_transient_retrieval_failures_retry() {
        assert!(RetrievalFailure::Timeout(Duration::from_secs(10)).is_retryable());
        assert!(RetrievalFailure::BadStatus(503).is_retryable());
        assert!(RetrievalFailure::BadStatus(429).is_retryable());
        assert!(!RetrievalFailure::BadStatus(404).is_retryable());
        assert!(!RetrievalFailure::InvalidContentHash("../x".into()).is_retryable());
    }
}
