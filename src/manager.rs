use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use tracing::info;

use crate::config::{AppContext, Settings};
use crate::disambiguation::Resolutions;
use crate::error::{PipelineError, PipelineResult};
use crate::extraction::{ExtractionPipeline, ExtractionReport, Extractor};
use crate::graph::{
    FactOverrides, FactSource, NewPerson, NewStory, PendingExtraction, Person, PersonStatus,
    RelationshipFact, ReviewStatus, Story,
};
use crate::mentions::{self, ParsedText};
use crate::resolver::{self, CandidateSummary, ResolutionPass};
use crate::review::{ReviewEngine, ReviewOutcome};
use crate::storage::{self, Database, MergeSummary};
use crate::validator::{self, CandidateFact};

/// Parse result for text being typed, with suggestions for the live token
#[derive(Debug, Clone, Serialize)]
pub struct MentionPreview {
    #[serde(flatten)]
    pub parsed: ParsedText,
    pub suggestions: Vec<CandidateSummary>,
}

/// Manager for one owner's relationship data.
/// Provides async API wrapping the SQLite store, pipeline and review engine.
pub struct RelationshipManager {
    owner_id: String,
    db: Arc<Database>,
    pipeline: ExtractionPipeline,
    review: ReviewEngine,
    suggestion_limit: usize,
}

impl RelationshipManager {
    /// Open the database at `db_path` and wire the configured collaborator
    pub fn new(db_path: PathBuf, ctx: &AppContext) -> Result<Self> {
        let db = Arc::new(Database::open(&db_path)?);
        let extractor = ctx.build_extractor()?;
        Ok(Self::with_database(db, extractor, ctx.settings()))
    }

    pub fn with_database(
        db: Arc<Database>,
        extractor: Arc<dyn Extractor>,
        settings: &Settings,
    ) -> Self {
        let pipeline = ExtractionPipeline::new(db.clone(), extractor)
            .with_default_confidence(settings.default_confidence)
            .with_suggestion_limit(settings.suggestion_limit);
        Self {
            owner_id: settings.owner_id.clone(),
            review: ReviewEngine::new(db.clone()),
            db,
            pipeline,
            suggestion_limit: settings.suggestion_limit,
        }
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    // Persons

    pub async fn create_person(&self, input: NewPerson) -> Result<Person> {
        self.db.create_person(&self.owner_id, &input)
    }

    pub async fn get_person(&self, id: &str) -> PipelineResult<Person> {
        self.db
            .get_person(&self.owner_id, id)?
            .ok_or_else(|| PipelineError::not_found("person", id))
    }

    pub async fn list_persons(&self, include_merged: bool) -> Result<Vec<Person>> {
        self.db.list_persons(&self.owner_id, include_merged)
    }

    /// Ranked, capped lookup by name or nickname
    pub async fn search_persons(&self, query: &str) -> Result<Vec<Person>> {
        let roster = self.db.list_persons(&self.owner_id, false)?;
        Ok(resolver::search_persons(query, &roster, self.suggestion_limit)
            .into_iter()
            .cloned()
            .collect())
    }

    pub async fn archive_person(&self, id: &str) -> PipelineResult<Person> {
        self.db
            .set_person_status(&self.owner_id, id, PersonStatus::Archived)
    }

    pub async fn merge_persons(&self, source_id: &str, target_id: &str) -> PipelineResult<MergeSummary> {
        self.db.merge_persons(&self.owner_id, source_id, target_id)
    }

    // Stories and mentions

    /// Persist a story. Extraction is a separate step and never undoes this.
    pub async fn create_story(&self, input: NewStory) -> Result<Story> {
        let story = self.db.create_story(&self.owner_id, &input)?;
        info!(story_id = %story.id, "story saved");
        Ok(story)
    }

    pub async fn get_story(&self, id: &str) -> PipelineResult<Story> {
        self.db
            .get_story(&self.owner_id, id)?
            .ok_or_else(|| PipelineError::not_found("story", id))
    }

    pub async fn list_stories(&self) -> Result<Vec<Story>> {
        self.db.list_stories(&self.owner_id)
    }

    pub async fn delete_story(&self, id: &str) -> PipelineResult<()> {
        if self.db.delete_story(&self.owner_id, id)? {
            Ok(())
        } else {
            Err(PipelineError::not_found("story", id))
        }
    }

    /// Mentions in `text` plus lookup suggestions for the token under `caret`
    pub async fn preview_mentions(&self, text: &str, caret: usize) -> Result<MentionPreview> {
        let parsed = mentions::parse(text, caret);
        let suggestions = match &parsed.live {
            Some(live) if !live.forced_create => {
                let roster = self.db.list_persons(&self.owner_id, false)?;
                resolver::suggest(live, &roster, self.suggestion_limit)
                    .into_iter()
                    .map(CandidateSummary::from)
                    .collect()
            }
            _ => Vec::new(),
        };
        Ok(MentionPreview {
            parsed,
            suggestions,
        })
    }

    pub async fn resolve_story(&self, story_id: &str) -> PipelineResult<ResolutionPass> {
        self.pipeline.resolution_pass(&self.owner_id, story_id)
    }

    /// Apply resolutions, run the collaborator and stage what survives validation
    pub async fn process_story(
        &self,
        story_id: &str,
        resolutions: &Resolutions,
    ) -> PipelineResult<ExtractionReport> {
        self.pipeline
            .process_story(&self.owner_id, story_id, resolutions)
            .await
    }

    // Review

    /// Triage listing, lowest confidence first
    pub async fn list_pending(&self, status: Option<ReviewStatus>) -> Result<Vec<PendingExtraction>> {
        self.db.list_pending(&self.owner_id, status)
    }

    pub async fn approve(&self, id: &str) -> PipelineResult<ReviewOutcome> {
        self.review.approve(&self.owner_id, id)
    }

    pub async fn reject(&self, id: &str, reason: Option<&str>) -> PipelineResult<ReviewOutcome> {
        self.review.reject(&self.owner_id, id, reason)
    }

    pub async fn edit_and_approve(
        &self,
        id: &str,
        overrides: &FactOverrides,
    ) -> PipelineResult<ReviewOutcome> {
        self.review.edit_and_approve(&self.owner_id, id, overrides)
    }

    // Facts

    pub async fn list_facts(&self, subject_id: Option<&str>) -> Result<Vec<RelationshipFact>> {
        self.db.list_facts(&self.owner_id, subject_id)
    }

    /// Record a fact entered by hand: provenance `manual`, full confidence
    pub async fn add_fact(&self, subject_id: &str, candidate: &CandidateFact) -> PipelineResult<RelationshipFact> {
        let owner = self.owner_id.as_str();
        let db = &self.db;
        let fact = db.with_immediate_tx(|conn| {
            let subject = storage::canonical_person(conn, owner, subject_id)?
                .ok_or_else(|| PipelineError::not_found("person", subject_id))?;
            let mut draft = validator::validate(conn, owner, candidate, &subject.id, None, 1.0)?;
            draft.confidence = 1.0;
            Ok::<_, PipelineError>(storage::insert_fact(
                conn,
                &db.next_id(),
                owner,
                &draft,
                FactSource::Manual,
            )?)
        })?;
        info!(fact_id = %fact.id, kind = %fact.fact.relation_kind, "manual fact added");
        Ok(fact)
    }

    pub async fn delete_fact(&self, id: &str) -> PipelineResult<()> {
        if self.db.delete_fact(&self.owner_id, id)? {
            Ok(())
        } else {
            Err(PipelineError::not_found("fact", id))
        }
    }
}
