//! Story extraction: collaborator interface and the staging pipeline.
//!
//! The pipeline resolves mentions, asks a collaborator for candidate facts,
//! validates them and stages the survivors as pending extractions. A failing
//! collaborator yields zero candidates; it never fails the story.

use std::collections::{BTreeMap, HashMap};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::disambiguation::{Choice, Resolutions};
use crate::error::{PipelineError, PipelineResult};
use crate::graph::{FactStatus, Intensity, PendingExtraction, Person, RelationKind, Story};
use crate::mentions;
use crate::resolver::{self, Classification, ResolutionPass};
use crate::storage::{self, Database};
use crate::validator::{self, CandidateFact};

/// A mention already bound to a person
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ResolvedMention {
    pub name: String,
    #[serde(rename = "personId")]
    pub person_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RosterEntry {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
}

/// Everything a collaborator receives
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ExtractionRequest {
    #[serde(rename = "storyText")]
    pub story_text: String,
    pub mentions: Vec<ResolvedMention>,
    pub roster: Vec<RosterEntry>,
}

/// A candidate that contradicts or overlaps known information
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Conflict {
    #[serde(rename = "conflictType")]
    pub conflict_type: String,
    pub description: String,
    #[serde(rename = "newFact")]
    pub new_fact: CandidateFact,
    #[serde(default, rename = "existingFactId", skip_serializing_if = "Option::is_none")]
    pub existing_fact_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ExtractionResponse {
    #[serde(default)]
    pub facts: Vec<CandidateFact>,
    #[serde(default)]
    pub conflicts: Vec<Conflict>,
}

/// Natural-language extraction collaborator.
///
/// Implementations report any failure (including timeouts) as
/// `PipelineError::CollaboratorUnavailable`.
#[async_trait]
pub trait Extractor: Send + Sync {
    fn name(&self) -> &str;

    async fn extract(&self, request: &ExtractionRequest) -> PipelineResult<ExtractionResponse>;
}

/// Produces nothing; used when extraction is switched off
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopExtractor;

#[async_trait]
impl Extractor for NoopExtractor {
    fn name(&self) -> &str {
        "none"
    }

    async fn extract(&self, _request: &ExtractionRequest) -> PipelineResult<ExtractionResponse> {
        Ok(ExtractionResponse::default())
    }
}

struct Rule {
    pattern: Regex,
    kind: RelationKind,
    status: Option<FactStatus>,
    intensity: Option<Intensity>,
    person_object: bool,
}

/// Verb phrase, kind, status, intensity, object is a person.
/// Order matters: the first matching phrase wins.
const RULES: &[(&str, RelationKind, Option<FactStatus>, Option<Intensity>, bool)] = &[
    (r"used to (?:like|love)", RelationKind::Likes, Some(FactStatus::Past), None, false),
    (r"(?:doesn't|does not|don't) like", RelationKind::Dislikes, None, None, false),
    (r"(?:is|was) (?:afraid|scared|terrified) of", RelationKind::Fears, None, Some(Intensity::Strong), false),
    (r"fears", RelationKind::Fears, None, None, false),
    (r"avoids", RelationKind::Avoids, None, None, false),
    (r"(?:is|was) (?:good|great|skilled) at", RelationKind::HasSkill, None, None, false),
    (r"knows how to", RelationKind::HasSkill, None, None, false),
    (r"(?:is|are) friends with", RelationKind::FriendOf, None, None, true),
    (r"(?:is married to|is dating|is engaged to)", RelationKind::PartnerOf, None, None, true),
    (r"(?:works|worked) with", RelationKind::WorksWith, None, None, true),
    (r"(?:takes care of|cares for|looks after)", RelationKind::CaresFor, None, None, true),
    (r"is (?:the )?(?:sister|brother|mother|father|cousin|daughter|son|aunt|uncle) of", RelationKind::FamilyOf, None, None, true),
    (r"knows", RelationKind::Knows, None, None, true),
    (r"believes(?: in| that)?", RelationKind::Believes, None, None, false),
    (r"values", RelationKind::Values, None, None, false),
    (r"loves", RelationKind::Loves, None, Some(Intensity::Strong), false),
    (r"hates", RelationKind::Hates, None, Some(Intensity::Strong), false),
    (r"dislikes", RelationKind::Dislikes, None, None, false),
    (r"prefers", RelationKind::Prefers, None, None, false),
    (r"(?:likes|enjoys)", RelationKind::Likes, None, None, false),
    (r"(?:went to|visited|traveled to|travelled to)", RelationKind::Experienced, Some(FactStatus::Past), None, false),
    (r"(?:is planning to|plans to|will)", RelationKind::Plans, Some(FactStatus::Future), None, false),
    (r"(?:wants to|dreams of|hopes to)", RelationKind::Plans, Some(FactStatus::Aspiration), None, false),
    (r"is (?:very|really|so|quite)", RelationKind::HasTrait, None, None, false),
];

const HEDGES: &[&str] = &["maybe", "probably", "i think", "might", "perhaps", "apparently"];

/// Deterministic sentence-pattern extractor: `@Sarah loves sushi`.
pub struct RuleExtractor {
    rules: Vec<Rule>,
    sentence_split: Regex,
}

impl RuleExtractor {
    pub fn new() -> anyhow::Result<Self> {
        let mut rules = Vec::with_capacity(RULES.len());
        for (verb, kind, status, intensity, person_object) in RULES {
            let pattern = Regex::new(&format!(
                r"(?i)^\s*(?:(?:really|also|still|absolutely|truly)\s+)*(?:{})\s+(?P<object>.+)$",
                verb
            ))
            .with_context(|| format!("Invalid extraction rule '{}'", verb))?;
            rules.push(Rule {
                pattern,
                kind: *kind,
                status: *status,
                intensity: *intensity,
                person_object: *person_object,
            });
        }
        let sentence_split = Regex::new(r"[.!?;\n]+").context("Invalid sentence pattern")?;
        Ok(Self {
            rules,
            sentence_split,
        })
    }

    fn byte_offset(text: &str, char_offset: usize) -> usize {
        text.char_indices()
            .nth(char_offset)
            .map(|(b, _)| b)
            .unwrap_or(text.len())
    }

    fn extract_sentence(&self, sentence: &str) -> Option<CandidateFact> {
        let subject = mentions::extract_mentions(sentence).into_iter().next()?;
        let tail = &sentence[Self::byte_offset(sentence, subject.end)..];
        // Keep just the first clause of the object
        let tail = tail.split([',', '(']).next().unwrap_or(tail);

        let (rule, caps) = self
            .rules
            .iter()
            .find_map(|r| r.pattern.captures(tail).map(|c| (r, c)))?;
        let raw_object = caps.name("object")?.as_str();
        let object = mentions::strip_mentions(raw_object)
            .trim()
            .trim_end_matches(|c: char| c.is_ascii_punctuation())
            .trim()
            .to_string();
        if object.is_empty() {
            return None;
        }

        let lowered = sentence.to_lowercase();
        let hedged = HEDGES.iter().any(|h| lowered.contains(h));
        let emphatic = lowered.contains("really") || lowered.contains("absolutely");

        let mut candidate = CandidateFact::new(subject.name, rule.kind.as_str(), object)
            .with_confidence(if hedged { 0.35 } else { 0.65 });
        candidate.status = rule.status.map(|s| s.as_str().to_string());
        candidate.intensity = if emphatic {
            Some(Intensity::VeryStrong.as_str().to_string())
        } else {
            rule.intensity.map(|i| i.as_str().to_string())
        };
        if rule.person_object {
            candidate.object_type = Some("person".to_string());
        }
        Some(candidate)
    }

    pub fn extract_text(&self, text: &str) -> Vec<CandidateFact> {
        self.sentence_split
            .split(text)
            .filter_map(|s| self.extract_sentence(s))
            .collect()
    }
}

#[async_trait]
impl Extractor for RuleExtractor {
    fn name(&self) -> &str {
        "rules"
    }

    async fn extract(&self, request: &ExtractionRequest) -> PipelineResult<ExtractionResponse> {
        Ok(ExtractionResponse {
            facts: self.extract_text(&request.story_text),
            conflicts: Vec::new(),
        })
    }
}

/// Runs an external program: request JSON on stdin, response JSON on stdout.
pub struct CommandExtractor {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandExtractor {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    async fn run(&self, request: &ExtractionRequest) -> anyhow::Result<ExtractionResponse> {
        let input = serde_json::to_vec(request).context("Failed to serialize extraction request")?;
        let mut child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to start '{}'", self.program))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&input)
                .await
                .context("Failed to write extraction request")?;
        }

        let output = child
            .wait_with_output()
            .await
            .context("Failed to read extraction response")?;
        if !output.status.success() {
            anyhow::bail!("'{}' exited with {}", self.program, output.status);
        }
        serde_json::from_slice(&output.stdout).context("Malformed extraction response")
    }
}

#[async_trait]
impl Extractor for CommandExtractor {
    fn name(&self) -> &str {
        &self.program
    }

    async fn extract(&self, request: &ExtractionRequest) -> PipelineResult<ExtractionResponse> {
        match tokio::time::timeout(self.timeout, self.run(request)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(PipelineError::CollaboratorUnavailable(format!("{:#}", e))),
            Err(_) => Err(PipelineError::CollaboratorUnavailable(format!(
                "timed out after {:?}",
                self.timeout
            ))),
        }
    }
}

/// A candidate the user should see: it failed kind, status or metadata checks
#[derive(Debug, Clone, Serialize)]
pub struct RejectedCandidate {
    pub candidate: CandidateFact,
    pub reason: String,
}

/// Outcome of running the pipeline over one story
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExtractionReport {
    #[serde(rename = "storyId")]
    pub story_id: String,
    pub extractor: String,
    pub staged: Vec<PendingExtraction>,
    #[serde(rename = "createdPersons")]
    pub created_persons: Vec<Person>,
    /// Dropped silently: already a fact, or already staged
    pub duplicates: usize,
    /// Dropped silently: subject or object is an ignored name
    pub ignored: usize,
    /// Dropped: subject could not be bound to a person
    #[serde(rename = "unboundSubjects")]
    pub unbound_subjects: Vec<String>,
    pub rejected: Vec<RejectedCandidate>,
    pub conflicts: Vec<Conflict>,
    #[serde(rename = "collaboratorError", skip_serializing_if = "Option::is_none")]
    pub collaborator_error: Option<String>,
}

impl ExtractionReport {
    /// Compact record kept on the story
    fn record(&self, placeholders: &BTreeMap<String, String>) -> serde_json::Value {
        serde_json::json!({
            "extractor": self.extractor,
            "staged": self.staged.iter().map(|p| p.id.clone()).collect::<Vec<_>>(),
            "duplicates": self.duplicates,
            "ignored": self.ignored,
            "rejected": self.rejected.len(),
            "conflicts": self.conflicts,
            "placeholders": placeholders,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Binding {
    Person(String),
    Ignore,
}

/// Name decisions for one run. Nothing in here has been written yet.
#[derive(Debug, Default)]
struct BindingPlan {
    /// Keyed by lowercased name
    bindings: HashMap<String, Binding>,
    /// Distinct names in first-detection order
    order: Vec<String>,
    /// Placeholders to insert with the staged facts
    created: Vec<Person>,
    /// Lowercased name to placeholder id, created or reused
    placeholders: BTreeMap<String, String>,
}

impl BindingPlan {
    fn mentions(&self) -> Vec<ResolvedMention> {
        self.order
            .iter()
            .filter_map(|name| match self.bindings.get(&name.to_lowercase()) {
                Some(Binding::Person(id)) => Some(ResolvedMention {
                    name: name.clone(),
                    person_id: id.clone(),
                }),
                _ => None,
            })
            .collect()
    }
}

/// Placeholder ids an earlier run of this story created
fn recorded_placeholders(story: &Story) -> HashMap<String, String> {
    story
        .extraction
        .as_ref()
        .and_then(|record| record.get("placeholders"))
        .and_then(serde_json::Value::as_object)
        .map(|map| {
            map.iter()
                .filter_map(|(name, id)| Some((name.clone(), id.as_str()?.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

/// Strip a leading `@` / `@+` a collaborator may echo back
fn bare_name(name: &str) -> String {
    name.trim()
        .trim_start_matches('@')
        .trim_start_matches('+')
        .to_lowercase()
}

pub struct ExtractionPipeline {
    db: Arc<Database>,
    extractor: Arc<dyn Extractor>,
    default_confidence: f64,
    suggestion_limit: usize,
}

impl ExtractionPipeline {
    pub fn new(db: Arc<Database>, extractor: Arc<dyn Extractor>) -> Self {
        Self {
            db,
            extractor,
            default_confidence: 0.5,
            suggestion_limit: resolver::DEFAULT_SUGGESTION_LIMIT,
        }
    }

    pub fn with_default_confidence(mut self, confidence: f64) -> Self {
        self.default_confidence = confidence;
        self
    }

    pub fn with_suggestion_limit(mut self, limit: usize) -> Self {
        self.suggestion_limit = limit;
        self
    }

    /// Full-text resolution pass over a stored story
    pub fn resolution_pass(&self, user_id: &str, story_id: &str) -> PipelineResult<ResolutionPass> {
        let story = self
            .db
            .get_story(user_id, story_id)?
            .ok_or_else(|| PipelineError::not_found("story", story_id))?;
        let roster = self.db.list_persons(user_id, false)?;
        Ok(resolver::resolve_text(&story.content, &roster, self.suggestion_limit))
    }

    /// Apply decisions to every detected name.
    ///
    /// Read-only: new names get a planned placeholder, reusing the one an
    /// earlier run of the same story recorded.
    fn bind_names(
        &self,
        user_id: &str,
        story: &Story,
        pass: &ResolutionPass,
        resolutions: &Resolutions,
    ) -> PipelineResult<BindingPlan> {
        let unresolved: Vec<String> = pass
            .ambiguous
            .iter()
            .filter(|a| resolutions.get(&a.name).is_none())
            .map(|a| a.name.clone())
            .collect();
        if !unresolved.is_empty() {
            return Err(PipelineError::UnresolvedMentions(unresolved));
        }

        let recorded = recorded_placeholders(story);
        let mut plan = BindingPlan {
            order: mentions::distinct_names(&pass.mentions)
                .into_iter()
                .map(|m| m.name.clone())
                .collect(),
            ..Default::default()
        };
        let names = pass
            .bound
            .iter()
            .map(|b| (b.name.clone(), Some(b.person_id.clone())))
            .chain(pass.ambiguous.iter().map(|a| (a.name.clone(), None)))
            .chain(pass.forced_new.iter().map(|n| (n.clone(), None)))
            .chain(pass.unknown.iter().map(|n| (n.clone(), None)));

        for (name, bound_id) in names {
            let key = name.to_lowercase();
            let binding = match (resolutions.get(&name), bound_id) {
                (Some(Choice::Ignore), _) => Binding::Ignore,
                (Some(Choice::Existing(id)), _) => {
                    let person = self
                        .db
                        .get_person(user_id, id)?
                        .ok_or_else(|| PipelineError::not_found("person", id.as_str()))?;
                    Binding::Person(person.id)
                }
                (None, Some(id)) => Binding::Person(id),
                (Some(Choice::New), _) | (None, None) => {
                    let earlier = match recorded.get(&key) {
                        Some(id) => self.db.get_person(user_id, id)?,
                        None => None,
                    };
                    let id = match earlier {
                        Some(person) => person.id,
                        None => {
                            let person = self.db.new_placeholder(user_id, &name)?;
                            let id = person.id.clone();
                            plan.created.push(person);
                            id
                        }
                    };
                    plan.placeholders.insert(key.clone(), id.clone());
                    Binding::Person(id)
                }
            };
            plan.bindings.insert(key, binding);
        }
        Ok(plan)
    }

    /// Run extraction for a story and stage the surviving candidates.
    ///
    /// Every ambiguous name must have an entry in `resolutions`. Placeholders,
    /// staged facts and the processed flag are written in one transaction
    /// after the collaborator answers, so a failed run leaves nothing behind.
    pub async fn process_story(
        &self,
        user_id: &str,
        story_id: &str,
        resolutions: &Resolutions,
    ) -> PipelineResult<ExtractionReport> {
        let story = self
            .db
            .get_story(user_id, story_id)?
            .ok_or_else(|| PipelineError::not_found("story", story_id))?;
        let mut roster = self.db.list_persons(user_id, false)?;
        let pass = resolver::resolve_text(&story.content, &roster, self.suggestion_limit);

        let mut report = ExtractionReport {
            story_id: story.id.clone(),
            extractor: self.extractor.name().to_string(),
            ..Default::default()
        };
        let plan = self.bind_names(user_id, &story, &pass, resolutions)?;
        roster.extend(plan.created.iter().cloned());

        let request = ExtractionRequest {
            story_text: story.content.clone(),
            mentions: plan.mentions(),
            roster: roster
                .iter()
                .map(|p| RosterEntry {
                    id: p.id.clone(),
                    name: p.name.clone(),
                    nickname: p.nickname.clone(),
                })
                .collect(),
        };

        let response = match self.extractor.extract(&request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(story_id = %story.id, extractor = %report.extractor, error = %e,
                    "extraction failed, no facts extracted");
                report.collaborator_error = Some(e.to_string());
                return Ok(report);
            }
        };

        report.conflicts = response.conflicts;
        self.stage(user_id, &story.id, &roster, &plan, response.facts, &mut report)?;

        info!(
            story_id = %story.id,
            staged = report.staged.len(),
            created_persons = report.created_persons.len(),
            duplicates = report.duplicates,
            rejected = report.rejected.len(),
            "story processed"
        );
        Ok(report)
    }

    fn subject_for(
        &self,
        user_id: &str,
        candidate: &CandidateFact,
        roster: &[Person],
        bindings: &HashMap<String, Binding>,
    ) -> PipelineResult<Option<Binding>> {
        if let Some(id) = candidate.subject_id.as_deref() {
            // Planned placeholders are only in the roster until staging commits
            if let Some(person) = roster.iter().find(|p| p.id == id) {
                return Ok(Some(Binding::Person(person.id.clone())));
            }
            return Ok(self.db.get_person(user_id, id)?.map(|p| Binding::Person(p.id)));
        }
        let key = bare_name(&candidate.subject);
        if let Some(binding) = bindings.get(&key) {
            return Ok(Some(binding.clone()));
        }
        Ok(match resolver::classify(&key, roster, self.suggestion_limit) {
            Classification::Unambiguous(p) => Some(Binding::Person(p.id.clone())),
            _ => None,
        })
    }

    fn stage(
        &self,
        user_id: &str,
        story_id: &str,
        roster: &[Person],
        plan: &BindingPlan,
        candidates: Vec<CandidateFact>,
        report: &mut ExtractionReport,
    ) -> PipelineResult<()> {
        let mut ready = Vec::new();
        for candidate in candidates {
            let subject_id = match self.subject_for(user_id, &candidate, roster, &plan.bindings)? {
                Some(Binding::Person(id)) => id,
                Some(Binding::Ignore) => {
                    report.ignored += 1;
                    continue;
                }
                None => {
                    debug!(subject = %candidate.subject, "no person for candidate subject");
                    report.unbound_subjects.push(candidate.subject.clone());
                    continue;
                }
            };
            if plan.bindings.get(&bare_name(&candidate.object_label)) == Some(&Binding::Ignore) {
                report.ignored += 1;
                continue;
            }

            match validator::validate_candidate(
                &candidate,
                &subject_id,
                Some(story_id),
                self.default_confidence,
            ) {
                Ok(draft) => ready.push(draft),
                Err(e) => {
                    warn!(relation_kind = %candidate.relation_kind, error = %e,
                        "collaborator produced an invalid candidate");
                    report.rejected.push(RejectedCandidate {
                        candidate,
                        reason: e.to_string(),
                    });
                }
            }
        }

        let db = &self.db;
        db.with_immediate_tx(|conn| {
            for person in &plan.created {
                storage::insert_person(conn, person)?;
                debug!(person_id = %person.id, name = %person.name, "placeholder person created");
            }

            let mut staged = Vec::new();
            let mut duplicates = 0;
            for draft in ready {
                match validator::check_duplicate(conn, user_id, &draft) {
                    Err(PipelineError::DuplicateFact { existing_id }) => {
                        debug!(%existing_id, label = %draft.object_label, "duplicate candidate dropped");
                        duplicates += 1;
                        continue;
                    }
                    other => other?,
                }
                if storage::find_staged(
                    conn,
                    user_id,
                    &draft.subject_id,
                    draft.relation_kind,
                    &draft.object_label,
                )?
                .is_some()
                {
                    duplicates += 1;
                    continue;
                }
                staged.push(storage::insert_pending(conn, &db.next_id(), user_id, &draft)?);
            }

            report.staged = staged;
            report.duplicates = duplicates;
            storage::mark_processed(conn, user_id, story_id, &report.record(&plan.placeholders))?;
            Ok::<_, PipelineError>(())
        })?;

        report.created_persons = plan.created.clone();
        Ok(())
    }
}
