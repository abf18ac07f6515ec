use thiserror::Error;

use crate::graph::ReviewStatus;
use crate::metadata::MetadataError;

/// Errors raised by the extraction staging and review pipeline.
///
/// None of these are fatal; each is scoped to one story or one pending record.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid relation kind '{0}'")]
    InvalidRelationKind(String),

    #[error("invalid fact status '{0}'")]
    InvalidStatus(String),

    #[error("invalid metadata: {0}")]
    InvalidMetadata(#[from] MetadataError),

    #[error("object label cannot be empty")]
    EmptyObjectLabel,

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("pending extraction {id} was already reviewed ({status})")]
    AlreadyReviewed { id: String, status: ReviewStatus },

    #[error("duplicate of existing fact {existing_id}")]
    DuplicateFact { existing_id: String },

    #[error("extraction collaborator unavailable: {0}")]
    CollaboratorUnavailable(String),

    #[error("ambiguous mentions without a resolution: {}", .0.join(", "))]
    UnresolvedMentions(Vec<String>),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl PipelineError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        PipelineError::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Bad upstream data that should be shown to the user
    pub fn is_actionable(&self) -> bool {
        matches!(
            self,
            PipelineError::InvalidRelationKind(_)
                | PipelineError::InvalidStatus(_)
                | PipelineError::InvalidMetadata(_)
                | PipelineError::EmptyObjectLabel
        )
    }

    /// Outdated action: refresh the pending list and drop it
    pub fn is_stale(&self) -> bool {
        matches!(
            self,
            PipelineError::AlreadyReviewed { .. } | PipelineError::NotFound { .. }
        )
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
