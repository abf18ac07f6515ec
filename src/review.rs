//! Review engine: the only path from a staged extraction into the canonical graph.
//!
//! Every transition runs inside one IMMEDIATE transaction and ends with a
//! conditional `pending -> terminal` write, so a record is committed or
//! rejected at most once no matter how many callers race on it.

use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, PipelineResult};
use crate::graph::{
    FactDraft, FactOverrides, FactSource, Intensity, PendingExtraction, RelationshipFact,
    ReviewStatus,
};
use crate::storage::{self, Database, ReviewStamp};
use crate::validator;

pub const EDITED_NOTE: &str = "edited by user";

/// Result of a successful review action
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReviewOutcome {
    /// A new canonical fact was written
    Committed {
        pending: PendingExtraction,
        fact: RelationshipFact,
    },
    /// The fact already existed; the record was closed without a second row
    Duplicate {
        pending: PendingExtraction,
        #[serde(rename = "existingFactId")]
        existing_fact_id: String,
    },
    Rejected { pending: PendingExtraction },
}

impl ReviewOutcome {
    pub fn pending(&self) -> &PendingExtraction {
        match self {
            ReviewOutcome::Committed { pending, .. }
            | ReviewOutcome::Duplicate { pending, .. }
            | ReviewOutcome::Rejected { pending } => pending,
        }
    }

    pub fn fact(&self) -> Option<&RelationshipFact> {
        match self {
            ReviewOutcome::Committed { fact, .. } => Some(fact),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct ReviewEngine {
    db: Arc<Database>,
}

impl ReviewEngine {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Commit the staged fact as-is, carrying its confidence over
    pub fn approve(&self, user_id: &str, id: &str) -> PipelineResult<ReviewOutcome> {
        self.db.with_immediate_tx(|conn| {
            let payload = open_for_review(conn, user_id, id)?;
            let draft = staged_draft(payload)?;
            let outcome = commit(conn, &self.db, user_id, id, draft, ReviewStatus::Approved, None)?;
            info!(pending_id = %id, outcome = outcome_label(&outcome), "pending extraction approved");
            Ok(outcome)
        })
    }

    /// Close the record without touching the graph
    pub fn reject(
        &self,
        user_id: &str,
        id: &str,
        reason: Option<&str>,
    ) -> PipelineResult<ReviewOutcome> {
        let reason = reason.map(str::trim).filter(|r| !r.is_empty());
        self.db.with_immediate_tx(|conn| {
            open_for_review(conn, user_id, id)?;
            let stamp = ReviewStamp {
                status: ReviewStatus::Rejected,
                reason,
                note: None,
                payload: None,
            };
            if !storage::finish_pending(conn, user_id, id, &stamp)? {
                return Err(already_reviewed(conn, user_id, id));
            }
            info!(pending_id = %id, "pending extraction rejected");
            Ok(ReviewOutcome::Rejected {
                pending: reload(conn, user_id, id)?,
            })
        })
    }

    /// Apply caller corrections, then commit as a user-confirmed fact.
    ///
    /// Overrides are validated exactly like collaborator output; the
    /// resulting fact carries full confidence.
    pub fn edit_and_approve(
        &self,
        user_id: &str,
        id: &str,
        overrides: &FactOverrides,
    ) -> PipelineResult<ReviewOutcome> {
        self.db.with_immediate_tx(|conn| {
            let mut payload = open_for_review(conn, user_id, id)?;
            apply_overrides(&mut payload, overrides);
            let mut draft = staged_draft(payload)?;
            draft.confidence = 1.0;
            let outcome = commit(
                conn,
                &self.db,
                user_id,
                id,
                draft,
                ReviewStatus::Edited,
                Some(EDITED_NOTE),
            )?;
            info!(pending_id = %id, outcome = outcome_label(&outcome), "pending extraction edited and approved");
            Ok(outcome)
        })
    }
}

fn outcome_label(outcome: &ReviewOutcome) -> &'static str {
    match outcome {
        ReviewOutcome::Committed { .. } => "committed",
        ReviewOutcome::Duplicate { .. } => "duplicate",
        ReviewOutcome::Rejected { .. } => "rejected",
    }
}

/// Load the raw payload of a record that is still pending
fn open_for_review(conn: &rusqlite::Connection, user_id: &str, id: &str) -> PipelineResult<Value> {
    match storage::load_pending_raw(conn, user_id, id)? {
        None => Err(PipelineError::not_found("pending extraction", id)),
        Some((status, _)) if status.is_terminal() => Err(PipelineError::AlreadyReviewed {
            id: id.to_string(),
            status,
        }),
        Some((_, payload)) => Ok(payload),
    }
}

fn already_reviewed(conn: &rusqlite::Connection, user_id: &str, id: &str) -> PipelineError {
    match storage::load_pending_raw(conn, user_id, id) {
        Ok(Some((status, _))) => PipelineError::AlreadyReviewed {
            id: id.to_string(),
            status,
        },
        Ok(None) => PipelineError::not_found("pending extraction", id),
        Err(e) => e.into(),
    }
}

fn reload(conn: &rusqlite::Connection, user_id: &str, id: &str) -> PipelineResult<PendingExtraction> {
    storage::load_pending(conn, user_id, id)?
        .ok_or_else(|| PipelineError::not_found("pending extraction", id))
}

/// Re-validate staged JSON: kind and status are checked as strings first so
/// a garbled record surfaces as a validation error, not a decode failure.
fn staged_draft(payload: Value) -> PipelineResult<FactDraft> {
    let kind = payload
        .get("relationKind")
        .and_then(Value::as_str)
        .unwrap_or_default();
    validator::parse_kind(kind)?;
    validator::parse_status(payload.get("status").and_then(Value::as_str))?;
    if payload
        .get("objectLabel")
        .and_then(Value::as_str)
        .map_or(true, |l| l.trim().is_empty())
    {
        return Err(PipelineError::EmptyObjectLabel);
    }

    let draft: FactDraft =
        serde_json::from_value(payload).context("Staged payload could not be decoded")?;
    validator::revalidate(draft)
}

fn apply_overrides(payload: &mut Value, overrides: &FactOverrides) {
    let Some(fields) = payload.as_object_mut() else {
        return;
    };
    if let Some(kind) = &overrides.relation_kind {
        fields.insert("relationKind".into(), Value::String(kind.clone()));
    }
    if let Some(label) = &overrides.object_label {
        fields.insert("objectLabel".into(), Value::String(label.clone()));
    }
    if let Some(raw) = &overrides.intensity {
        match raw.parse::<Intensity>() {
            Ok(intensity) => {
                fields.insert("intensity".into(), Value::String(intensity.as_str().into()));
            }
            Err(_) => {
                warn!(intensity = %raw, "ignoring unknown intensity override");
                fields.remove("intensity");
            }
        }
    }
    if let Some(category) = &overrides.category {
        let category = category.trim();
        if category.is_empty() {
            fields.remove("category");
        } else {
            fields.insert("category".into(), Value::String(category.into()));
        }
    }
}

/// Shared tail of approve and edit-then-approve
fn commit(
    conn: &rusqlite::Connection,
    db: &Database,
    user_id: &str,
    id: &str,
    mut draft: FactDraft,
    status: ReviewStatus,
    note: Option<&str>,
) -> PipelineResult<ReviewOutcome> {
    let subject = storage::canonical_person(conn, user_id, &draft.subject_id)?
        .ok_or_else(|| PipelineError::not_found("person", draft.subject_id.clone()))?;
    draft.subject_id = subject.id;

    match validator::check_duplicate(conn, user_id, &draft) {
        Err(PipelineError::DuplicateFact { existing_id }) => {
            let dup_note = match note {
                Some(n) => format!("{}; duplicate of fact {}", n, existing_id),
                None => format!("duplicate of fact {}", existing_id),
            };
            let stamp = ReviewStamp {
                status,
                reason: None,
                note: Some(&dup_note),
                payload: Some(&draft),
            };
            if !storage::finish_pending(conn, user_id, id, &stamp)? {
                return Err(already_reviewed(conn, user_id, id));
            }
            debug!(pending_id = %id, existing = %existing_id, "approved record matched an existing fact");
            Ok(ReviewOutcome::Duplicate {
                pending: reload(conn, user_id, id)?,
                existing_fact_id: existing_id,
            })
        }
        Err(e) => Err(e),
        Ok(()) => {
            let fact = storage::insert_fact(
                conn,
                &db.next_id(),
                user_id,
                &draft,
                FactSource::AiExtraction,
            )?;
            let stamp = ReviewStamp {
                status,
                reason: None,
                note,
                payload: Some(&draft),
            };
            // Returning an error here rolls the insert back with the transaction
            if !storage::finish_pending(conn, user_id, id, &stamp)? {
                return Err(already_reviewed(conn, user_id, id));
            }
            Ok(ReviewOutcome::Committed {
                pending: reload(conn, user_id, id)?,
                fact,
            })
        }
    }
}
