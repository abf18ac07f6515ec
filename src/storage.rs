use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::error::{PipelineError, PipelineResult};
use crate::graph::{
    CompletenessLevel, FactDraft, FactSource, ImportanceLevel, NewPerson, NewStory,
    PendingExtraction, Person, PersonClassification, PersonStatus, RelationKind,
    RelationshipFact, ReviewStatus, Story,
};
use crate::metadata::RelationMetadata;
use crate::validator::FactIndex;

// Validation constants
const MAX_NAME_LENGTH: usize = 256;
const MAX_LABEL_LENGTH: usize = 512;
const MAX_STORY_LENGTH: usize = 65_536;

/// Upper bound on `merged_into` hops when resolving a canonical person
const MAX_MERGE_HOPS: usize = 16;

/// Validate a person name or nickname
fn validate_name(name: &str, field: &str) -> Result<()> {
    if name.trim().is_empty() {
        bail!("{} cannot be empty", field);
    }
    if name.chars().count() > MAX_NAME_LENGTH {
        bail!("{} too long (max {} chars)", field, MAX_NAME_LENGTH);
    }
    if name.chars().any(|c| c.is_control()) {
        bail!("{} contains invalid characters", field);
    }
    Ok(())
}

/// Validate a fact object label
fn validate_label(label: &str) -> Result<()> {
    if label.chars().count() > MAX_LABEL_LENGTH {
        bail!("Object label too long (max {} chars)", MAX_LABEL_LENGTH);
    }
    if label.contains('\0') {
        bail!("Object label contains null bytes");
    }
    Ok(())
}

/// Validate story content
fn validate_story(content: &str) -> Result<()> {
    if content.trim().is_empty() {
        bail!("Story content cannot be empty");
    }
    if content.chars().count() > MAX_STORY_LENGTH {
        bail!("Story too long (max {} chars)", MAX_STORY_LENGTH);
    }
    if content.contains('\0') {
        bail!("Story contains null bytes");
    }
    Ok(())
}

/// Validate database file path
pub fn validate_db_path(path: &Path) -> Result<()> {
    // Check file extension FIRST (before any filesystem operations)
    if let Some(ext) = path.extension() {
        if ext != "db" {
            bail!("Invalid database file extension (must be .db)");
        }
    } else {
        bail!("Database path must have .db extension");
    }
    Ok(())
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS persons (
    id TEXT PRIMARY KEY NOT NULL,
    user_id TEXT NOT NULL,
    name TEXT NOT NULL,
    nickname TEXT,
    classification TEXT NOT NULL,
    completeness TEXT NOT NULL,
    importance TEXT NOT NULL,
    status TEXT NOT NULL,
    date_of_birth TEXT,
    merged_into TEXT,
    created_at TEXT NOT NULL
) STRICT;

CREATE TABLE IF NOT EXISTS stories (
    id TEXT PRIMARY KEY NOT NULL,
    user_id TEXT NOT NULL,
    title TEXT,
    story_date TEXT,
    content TEXT NOT NULL,
    ai_processed INTEGER NOT NULL DEFAULT 0,
    extraction TEXT,
    deleted_at TEXT,
    created_at TEXT NOT NULL
) STRICT;

-- No uniqueness constraint on (subject, kind, label): labels are free text and
-- duplicates are checked with exact-match semantics at commit time.
CREATE TABLE IF NOT EXISTS relationship_facts (
    id TEXT PRIMARY KEY NOT NULL,
    user_id TEXT NOT NULL,
    subject_id TEXT NOT NULL,
    relation_kind TEXT NOT NULL,
    object_label TEXT NOT NULL,
    object_type TEXT,
    intensity TEXT,
    confidence REAL NOT NULL,
    category TEXT,
    metadata TEXT NOT NULL,
    status TEXT NOT NULL,
    valid_from TEXT,
    valid_to TEXT,
    source TEXT NOT NULL,
    story_id TEXT,
    deleted_at TEXT,
    created_at TEXT NOT NULL
) STRICT;

CREATE TABLE IF NOT EXISTS pending_extractions (
    id TEXT PRIMARY KEY NOT NULL,
    user_id TEXT NOT NULL,
    story_id TEXT,
    subject_id TEXT NOT NULL,
    relation_kind TEXT NOT NULL,
    object_label TEXT NOT NULL,
    confidence REAL NOT NULL,
    payload TEXT NOT NULL,
    review_status TEXT NOT NULL DEFAULT 'pending',
    review_reason TEXT,
    review_note TEXT,
    reviewed_at TEXT,
    created_at TEXT NOT NULL
) STRICT;

CREATE INDEX IF NOT EXISTS idx_persons_user ON persons(user_id, status);
CREATE INDEX IF NOT EXISTS idx_stories_user ON stories(user_id, created_at);
CREATE INDEX IF NOT EXISTS idx_facts_triple
    ON relationship_facts(user_id, subject_id, relation_kind, object_label);
CREATE INDEX IF NOT EXISTS idx_pending_triage
    ON pending_extractions(user_id, review_status, confidence);
CREATE INDEX IF NOT EXISTS idx_pending_triple
    ON pending_extractions(user_id, subject_id, relation_kind, object_label);
"#;

/// Source of globally unique record ids
pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> String;
}

/// Random v4 UUIDs
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn next_id(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

// Column conversion helpers

fn conversion_err(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, msg.into())
}

fn col_enum<T: FromStr>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|_| conversion_err(idx, format!("unexpected value '{}'", raw)))
}

fn col_opt_enum<T: FromStr>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        s.parse()
            .map_err(|_| conversion_err(idx, format!("unexpected value '{}'", s)))
    })
    .transpose()
}

fn col_time(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, e.to_string()))
}

fn col_opt_time(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|d| d.with_timezone(&Utc))
            .map_err(|e| conversion_err(idx, e.to_string()))
    })
    .transpose()
}

fn col_opt_date(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<NaiveDate>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        NaiveDate::parse_from_str(&s, "%Y-%m-%d").map_err(|e| conversion_err(idx, e.to_string()))
    })
    .transpose()
}

fn col_json<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_err(idx, e.to_string()))
}

fn date_text(date: Option<NaiveDate>) -> Option<String> {
    date.map(|d| d.format("%Y-%m-%d").to_string())
}

const PERSON_COLUMNS: &str = "id, user_id, name, nickname, classification, completeness, \
     importance, status, date_of_birth, merged_into, created_at";

fn person_from_row(row: &Row<'_>) -> rusqlite::Result<Person> {
    Ok(Person {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        nickname: row.get(3)?,
        classification: col_enum(row, 4)?,
        completeness: col_enum(row, 5)?,
        importance: col_enum(row, 6)?,
        status: col_enum(row, 7)?,
        date_of_birth: col_opt_date(row, 8)?,
        merged_into: row.get(9)?,
        created_at: col_time(row, 10)?,
    })
}

const STORY_COLUMNS: &str =
    "id, user_id, title, story_date, content, ai_processed, extraction, created_at";

fn story_from_row(row: &Row<'_>) -> rusqlite::Result<Story> {
    let extraction: Option<String> = row.get(6)?;
    Ok(Story {
        id: row.get(0)?,
        user_id: row.get(1)?,
        title: row.get(2)?,
        story_date: col_opt_date(row, 3)?,
        content: row.get(4)?,
        ai_processed: row.get::<_, i64>(5)? != 0,
        extraction: extraction
            .map(|s| serde_json::from_str(&s).map_err(|e| conversion_err(6, e.to_string())))
            .transpose()?,
        created_at: col_time(row, 7)?,
    })
}

const FACT_COLUMNS: &str = "id, user_id, subject_id, relation_kind, object_label, object_type, \
     intensity, confidence, category, metadata, status, valid_from, valid_to, source, \
     story_id, deleted_at, created_at";

fn fact_from_row(row: &Row<'_>) -> rusqlite::Result<RelationshipFact> {
    Ok(RelationshipFact {
        id: row.get(0)?,
        user_id: row.get(1)?,
        fact: FactDraft {
            subject_id: row.get(2)?,
            relation_kind: col_enum(row, 3)?,
            object_label: row.get(4)?,
            object_type: row.get(5)?,
            intensity: col_opt_enum(row, 6)?,
            confidence: row.get(7)?,
            category: row.get(8)?,
            metadata: col_json::<RelationMetadata>(row, 9)?,
            status: col_enum(row, 10)?,
            valid_from: col_opt_date(row, 11)?,
            valid_to: col_opt_date(row, 12)?,
            story_id: row.get(14)?,
        },
        source: col_enum(row, 13)?,
        deleted_at: col_opt_time(row, 15)?,
        created_at: col_time(row, 16)?,
    })
}

const PENDING_COLUMNS: &str =
    "id, user_id, payload, review_status, review_reason, review_note, reviewed_at, created_at";

fn pending_from_row(row: &Row<'_>) -> rusqlite::Result<PendingExtraction> {
    Ok(PendingExtraction {
        id: row.get(0)?,
        user_id: row.get(1)?,
        payload: col_json(row, 2)?,
        review_status: col_enum(row, 3)?,
        review_reason: row.get(4)?,
        review_note: row.get(5)?,
        reviewed_at: col_opt_time(row, 6)?,
        created_at: col_time(row, 7)?,
    })
}

// Row-level operations. These take a plain connection so they can run either
// on a pooled connection or inside a transaction.

pub(crate) fn insert_person(conn: &Connection, person: &Person) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO persons ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            PERSON_COLUMNS
        ),
        params![
            person.id,
            person.user_id,
            person.name,
            person.nickname,
            person.classification.as_str(),
            person.completeness.as_str(),
            person.importance.as_str(),
            person.status.as_str(),
            date_text(person.date_of_birth),
            person.merged_into,
            person.created_at.to_rfc3339(),
        ],
    )
    .with_context(|| format!("Failed to insert person '{}'", person.name))?;
    Ok(())
}

pub(crate) fn load_person(conn: &Connection, user_id: &str, id: &str) -> Result<Option<Person>> {
    conn.query_row(
        &format!("SELECT {} FROM persons WHERE user_id = ?1 AND id = ?2", PERSON_COLUMNS),
        params![user_id, id],
        person_from_row,
    )
    .optional()
    .with_context(|| format!("Database error querying person '{}'", id))
}

/// Follow `merged_into` links to the surviving record
pub(crate) fn canonical_person(
    conn: &Connection,
    user_id: &str,
    id: &str,
) -> Result<Option<Person>> {
    let mut current = match load_person(conn, user_id, id)? {
        Some(p) => p,
        None => return Ok(None),
    };
    for _ in 0..MAX_MERGE_HOPS {
        match (&current.status, current.merged_into.clone()) {
            (PersonStatus::Merged, Some(next)) => match load_person(conn, user_id, &next)? {
                Some(p) => current = p,
                None => return Ok(None),
            },
            _ => return Ok(Some(current)),
        }
    }
    bail!("Merge chain for person '{}' is too long", id)
}

pub(crate) fn placeholder_person(user_id: &str, id: String, name: &str) -> Person {
    Person {
        id,
        user_id: user_id.to_string(),
        name: name.trim().to_string(),
        nickname: None,
        classification: PersonClassification::Placeholder,
        completeness: CompletenessLevel::Minimal,
        importance: ImportanceLevel::Low,
        status: PersonStatus::Placeholder,
        date_of_birth: None,
        merged_into: None,
        created_at: Utc::now(),
    }
}

/// Flag a story as processed and keep a record of what was extracted
pub(crate) fn mark_processed(
    conn: &Connection,
    user_id: &str,
    id: &str,
    record: &serde_json::Value,
) -> Result<bool> {
    let record = serde_json::to_string(record).context("Failed to serialize extraction record")?;
    let updated = conn
        .execute(
            "UPDATE stories SET ai_processed = 1, extraction = ?1 \
             WHERE user_id = ?2 AND id = ?3 AND deleted_at IS NULL",
            params![record, user_id, id],
        )
        .with_context(|| format!("Failed to mark story '{}' as processed", id))?;
    Ok(updated == 1)
}

pub(crate) fn insert_fact(
    conn: &Connection,
    id: &str,
    user_id: &str,
    draft: &FactDraft,
    source: FactSource,
) -> Result<RelationshipFact> {
    validate_label(&draft.object_label)?;
    let metadata = serde_json::to_string(&draft.metadata)
        .context("Failed to serialize fact metadata")?;
    let created_at = Utc::now();

    conn.execute(
        &format!(
            "INSERT INTO relationship_facts ({}) VALUES \
             (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, NULL, ?16)",
            FACT_COLUMNS
        ),
        params![
            id,
            user_id,
            draft.subject_id,
            draft.relation_kind.as_str(),
            draft.object_label,
            draft.object_type,
            draft.intensity.map(|i| i.as_str()),
            draft.confidence,
            draft.category,
            metadata,
            draft.status.as_str(),
            date_text(draft.valid_from),
            date_text(draft.valid_to),
            source.as_str(),
            draft.story_id,
            created_at.to_rfc3339(),
        ],
    )
    .with_context(|| {
        format!(
            "Failed to insert fact {} {} '{}'",
            draft.subject_id, draft.relation_kind, draft.object_label
        )
    })?;

    Ok(RelationshipFact {
        id: id.to_string(),
        user_id: user_id.to_string(),
        fact: draft.clone(),
        source,
        deleted_at: None,
        created_at,
    })
}

pub(crate) fn insert_pending(
    conn: &Connection,
    id: &str,
    user_id: &str,
    draft: &FactDraft,
) -> Result<PendingExtraction> {
    validate_label(&draft.object_label)?;
    let payload = serde_json::to_string(draft).context("Failed to serialize staged fact")?;
    let created_at = Utc::now();

    conn.execute(
        "INSERT INTO pending_extractions (id, user_id, story_id, subject_id, relation_kind, \
         object_label, confidence, payload, review_status, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'pending', ?9)",
        params![
            id,
            user_id,
            draft.story_id,
            draft.subject_id,
            draft.relation_kind.as_str(),
            draft.object_label,
            draft.confidence,
            payload,
            created_at.to_rfc3339(),
        ],
    )
    .with_context(|| format!("Failed to stage fact '{}'", draft.object_label))?;

    Ok(PendingExtraction {
        id: id.to_string(),
        user_id: user_id.to_string(),
        payload: draft.clone(),
        review_status: ReviewStatus::Pending,
        review_reason: None,
        review_note: None,
        reviewed_at: None,
        created_at,
    })
}

pub(crate) fn load_pending(
    conn: &Connection,
    user_id: &str,
    id: &str,
) -> Result<Option<PendingExtraction>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM pending_extractions WHERE user_id = ?1 AND id = ?2",
            PENDING_COLUMNS
        ),
        params![user_id, id],
        pending_from_row,
    )
    .optional()
    .with_context(|| format!("Database error querying pending extraction '{}'", id))
}

/// Review status and untyped staged payload, for re-validation before commit
pub(crate) fn load_pending_raw(
    conn: &Connection,
    user_id: &str,
    id: &str,
) -> Result<Option<(ReviewStatus, serde_json::Value)>> {
    conn.query_row(
        "SELECT review_status, payload FROM pending_extractions WHERE user_id = ?1 AND id = ?2",
        params![user_id, id],
        |row| Ok((col_enum(row, 0)?, col_json(row, 1)?)),
    )
    .optional()
    .with_context(|| format!("Database error querying pending extraction '{}'", id))
}

/// Terminal review fields written by a transition
pub(crate) struct ReviewStamp<'a> {
    pub status: ReviewStatus,
    pub reason: Option<&'a str>,
    pub note: Option<&'a str>,
    pub payload: Option<&'a FactDraft>,
}

/// Conditional `pending -> terminal` write. Returns false when the record is no
/// longer pending, which makes the transition exactly-once.
pub(crate) fn finish_pending(
    conn: &Connection,
    user_id: &str,
    id: &str,
    stamp: &ReviewStamp<'_>,
) -> Result<bool> {
    let payload = stamp
        .payload
        .map(serde_json::to_string)
        .transpose()
        .context("Failed to serialize reviewed payload")?;
    let updated = conn
        .execute(
            "UPDATE pending_extractions SET review_status = ?1, review_reason = ?2, \
             review_note = ?3, reviewed_at = ?4, payload = COALESCE(?5, payload) \
             WHERE user_id = ?6 AND id = ?7 AND review_status = 'pending'",
            params![
                stamp.status.as_str(),
                stamp.reason,
                stamp.note,
                Utc::now().to_rfc3339(),
                payload,
                user_id,
                id,
            ],
        )
        .with_context(|| format!("Failed to update review status of '{}'", id))?;
    Ok(updated == 1)
}

/// Id of a still-pending staged record with this exact triple
pub(crate) fn find_staged(
    conn: &Connection,
    user_id: &str,
    subject_id: &str,
    kind: RelationKind,
    object_label: &str,
) -> Result<Option<String>> {
    conn.query_row(
        "SELECT id FROM pending_extractions WHERE user_id = ?1 AND subject_id = ?2 \
         AND relation_kind = ?3 AND object_label = ?4 AND review_status = 'pending' LIMIT 1",
        params![user_id, subject_id, kind.as_str(), object_label],
        |row| row.get(0),
    )
    .optional()
    .context("Database error checking staged extractions")
}

impl FactIndex for Connection {
    fn find_active_fact(
        &self,
        user_id: &str,
        subject_id: &str,
        kind: RelationKind,
        object_label: &str,
    ) -> Result<Option<String>> {
        self.query_row(
            "SELECT id FROM relationship_facts WHERE user_id = ?1 AND subject_id = ?2 \
             AND relation_kind = ?3 AND object_label = ?4 AND deleted_at IS NULL LIMIT 1",
            params![user_id, subject_id, kind.as_str(), object_label],
            |row| row.get(0),
        )
        .optional()
        .context("Database error checking for duplicate facts")
    }
}

/// Outcome of merging one person into another
#[derive(Debug, Clone, Default, Serialize)]
pub struct MergeSummary {
    #[serde(rename = "sourceId")]
    pub source_id: String,
    #[serde(rename = "targetId")]
    pub target_id: String,
    #[serde(rename = "factsMoved")]
    pub facts_moved: usize,
    /// Facts of the source that already existed on the target, now soft-deleted
    #[serde(rename = "factsDeduplicated")]
    pub facts_deduplicated: usize,
    #[serde(rename = "pendingMoved")]
    pub pending_moved: usize,
}

pub struct Database {
    pool: Pool<SqliteConnectionManager>,
    ids: Arc<dyn IdGenerator>,
}

impl Database {
    /// Open or create database with connection pool
    pub fn open(path: &Path) -> Result<Self> {
        // Validate path first
        validate_db_path(path)?;

        // Create parent directory if needed
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Per-connection pragmas; busy_timeout lets concurrent writers queue up
        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")
        });
        let pool = Pool::builder()
            .max_size(15)
            .build(manager)
            .context("Failed to create connection pool")?;

        {
            let conn = pool.get().context("Failed to get connection from pool")?;

            // WAL mode for concurrent reads
            conn.execute_batch("PRAGMA journal_mode = WAL;")?;

            conn.execute_batch(SCHEMA)?;
        }

        info!(path = %path.display(), "database opened");
        Ok(Self {
            pool,
            ids: Arc::new(UuidGenerator),
        })
    }

    /// Replace the id generator (tests use deterministic ids)
    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn next_id(&self) -> String {
        self.ids.next_id()
    }

    fn conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .context("Failed to get database connection from pool")
    }

    /// Run `f` inside an IMMEDIATE transaction.
    ///
    /// The write lock is taken up front, so a read followed by a conditional
    /// write inside `f` cannot interleave with another writer.
    pub fn with_immediate_tx<T, E, F>(&self, f: F) -> Result<T, E>
    where
        E: From<anyhow::Error>,
        F: FnOnce(&Connection) -> Result<T, E>,
    {
        let mut conn = self.conn().map_err(E::from)?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("Failed to start transaction")
            .map_err(E::from)?;
        let out = f(&tx)?;
        tx.commit()
            .context("Failed to commit transaction")
            .map_err(E::from)?;
        Ok(out)
    }

    // Persons

    /// Create a person entered manually
    pub fn create_person(&self, user_id: &str, input: &NewPerson) -> Result<Person> {
        validate_name(&input.name, "Person name")?;
        if let Some(nickname) = &input.nickname {
            validate_name(nickname, "Nickname")?;
        }

        let completeness = if input.nickname.is_some() || input.date_of_birth.is_some() {
            CompletenessLevel::Partial
        } else {
            CompletenessLevel::Minimal
        };
        let person = Person {
            id: self.next_id(),
            user_id: user_id.to_string(),
            name: input.name.trim().to_string(),
            nickname: input.nickname.as_deref().map(str::trim).map(str::to_string),
            classification: input.classification.unwrap_or(PersonClassification::Primary),
            completeness,
            importance: input.importance.unwrap_or(ImportanceLevel::Medium),
            status: PersonStatus::Active,
            date_of_birth: input.date_of_birth,
            merged_into: None,
            created_at: Utc::now(),
        };

        insert_person(&*self.conn()?, &person)?;
        Ok(person)
    }

    /// Build, but do not store, a stub person for a name seen only in text
    pub fn new_placeholder(&self, user_id: &str, name: &str) -> Result<Person> {
        validate_name(name, "Person name")?;
        Ok(placeholder_person(user_id, self.next_id(), name))
    }

    /// Person by id, following merges to the surviving record
    pub fn get_person(&self, user_id: &str, id: &str) -> Result<Option<Person>> {
        canonical_person(&*self.conn()?, user_id, id)
    }

    /// Owner's persons; merged records are left out unless requested
    pub fn list_persons(&self, user_id: &str, include_merged: bool) -> Result<Vec<Person>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM persons WHERE user_id = ?1 AND (?2 OR status != 'merged') \
             ORDER BY name COLLATE NOCASE, id",
            PERSON_COLUMNS
        ))?;
        let rows = stmt.query_map(params![user_id, include_merged], person_from_row)?;

        let mut persons = Vec::new();
        for row in rows {
            persons.push(row?);
        }
        Ok(persons)
    }

    /// Soft status transition (archive, mark deceased, reactivate)
    pub fn set_person_status(
        &self,
        user_id: &str,
        id: &str,
        status: PersonStatus,
    ) -> PipelineResult<Person> {
        if status == PersonStatus::Merged {
            return Err(anyhow::anyhow!("Use merge_persons to merge person '{}'", id).into());
        }
        let conn = self.conn()?;
        let updated = conn
            .execute(
                "UPDATE persons SET status = ?1 WHERE user_id = ?2 AND id = ?3 AND status != 'merged'",
                params![status.as_str(), user_id, id],
            )
            .with_context(|| format!("Failed to update status of person '{}'", id))?;
        if updated == 0 {
            return Err(PipelineError::not_found("person", id));
        }
        load_person(&conn, user_id, id)?.ok_or_else(|| PipelineError::not_found("person", id))
    }

    /// Collapse `source_id` into `target_id`.
    ///
    /// The source becomes inert (`merged`); its active facts and pending
    /// records are re-pointed at the target. A moved fact that the target
    /// already has is soft-deleted instead.
    pub fn merge_persons(
        &self,
        user_id: &str,
        source_id: &str,
        target_id: &str,
    ) -> PipelineResult<MergeSummary> {
        if source_id == target_id {
            return Err(anyhow::anyhow!("Cannot merge person '{}' into itself", source_id).into());
        }

        self.with_immediate_tx(|conn| {
            let source = load_person(conn, user_id, source_id)?
                .filter(Person::is_lookup_target)
                .ok_or_else(|| PipelineError::not_found("person", source_id))?;
            let target = load_person(conn, user_id, target_id)?
                .filter(Person::is_lookup_target)
                .ok_or_else(|| PipelineError::not_found("person", target_id))?;

            let mut summary = MergeSummary {
                source_id: source.id.clone(),
                target_id: target.id.clone(),
                ..Default::default()
            };

            let facts: Vec<(String, String, String)> = {
                let mut stmt = conn.prepare(
                    "SELECT id, relation_kind, object_label FROM relationship_facts \
                     WHERE user_id = ?1 AND subject_id = ?2 AND deleted_at IS NULL",
                ).context("Failed to prepare fact query for merge")?;
                let rows = stmt
                    .query_map(params![user_id, source.id], |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                    })
                    .context("Failed to query facts for merge")?;
                rows.collect::<rusqlite::Result<_>>()
                    .context("Failed to read facts for merge")?
            };

            let now = Utc::now().to_rfc3339();
            for (fact_id, kind, label) in facts {
                let kind: RelationKind = kind
                    .parse()
                    .map_err(|_| PipelineError::InvalidRelationKind(kind.clone()))?;
                if conn.find_active_fact(user_id, &target.id, kind, &label)?.is_some() {
                    conn.execute(
                        "UPDATE relationship_facts SET deleted_at = ?1 WHERE id = ?2",
                        params![now, fact_id],
                    )
                    .with_context(|| format!("Failed to retire duplicate fact '{}'", fact_id))?;
                    summary.facts_deduplicated += 1;
                } else {
                    conn.execute(
                        "UPDATE relationship_facts SET subject_id = ?1 WHERE id = ?2",
                        params![target.id, fact_id],
                    )
                    .with_context(|| format!("Failed to move fact '{}'", fact_id))?;
                    summary.facts_moved += 1;
                }
            }

            let pending: Vec<PendingExtraction> = {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM pending_extractions WHERE user_id = ?1 AND subject_id = ?2 \
                     AND review_status = 'pending'",
                    PENDING_COLUMNS
                )).context("Failed to prepare pending query for merge")?;
                let rows = stmt
                    .query_map(params![user_id, source.id], pending_from_row)
                    .context("Failed to query pending extractions for merge")?;
                rows.collect::<rusqlite::Result<_>>()
                    .context("Failed to read pending extractions for merge")?
            };

            for mut record in pending {
                record.payload.subject_id = target.id.clone();
                let payload = serde_json::to_string(&record.payload)
                    .context("Failed to serialize staged fact")?;
                conn.execute(
                    "UPDATE pending_extractions SET subject_id = ?1, payload = ?2 WHERE id = ?3",
                    params![target.id, payload, record.id],
                )
                .with_context(|| format!("Failed to move pending extraction '{}'", record.id))?;
                summary.pending_moved += 1;
            }

            // Flatten chains: anything merged into the source now points at the target
            conn.execute(
                "UPDATE persons SET merged_into = ?1 WHERE user_id = ?2 AND merged_into = ?3",
                params![target.id, user_id, source.id],
            )
            .context("Failed to re-point earlier merges")?;
            conn.execute(
                "UPDATE persons SET status = 'merged', merged_into = ?1 WHERE user_id = ?2 AND id = ?3",
                params![target.id, user_id, source.id],
            )
            .with_context(|| format!("Failed to mark person '{}' as merged", source.id))?;

            info!(
                source = %summary.source_id,
                target = %summary.target_id,
                moved = summary.facts_moved,
                deduplicated = summary.facts_deduplicated,
                "persons merged"
            );
            Ok(summary)
        })
    }

    // Stories

    /// Persist a story; extraction runs separately and never blocks this
    pub fn create_story(&self, user_id: &str, input: &NewStory) -> Result<Story> {
        validate_story(&input.content)?;
        let story = Story {
            id: self.next_id(),
            user_id: user_id.to_string(),
            title: input.title.as_deref().map(str::trim).filter(|t| !t.is_empty()).map(str::to_string),
            story_date: input.story_date,
            content: input.content.clone(),
            ai_processed: false,
            extraction: None,
            created_at: Utc::now(),
        };

        self.conn()?
            .execute(
                &format!(
                    "INSERT INTO stories ({}) VALUES (?1, ?2, ?3, ?4, ?5, 0, NULL, ?6)",
                    STORY_COLUMNS
                ),
                params![
                    story.id,
                    story.user_id,
                    story.title,
                    date_text(story.story_date),
                    story.content,
                    story.created_at.to_rfc3339(),
                ],
            )
            .context("Failed to insert story")?;
        Ok(story)
    }

    pub fn get_story(&self, user_id: &str, id: &str) -> Result<Option<Story>> {
        self.conn()?
            .query_row(
                &format!(
                    "SELECT {} FROM stories WHERE user_id = ?1 AND id = ?2 AND deleted_at IS NULL",
                    STORY_COLUMNS
                ),
                params![user_id, id],
                story_from_row,
            )
            .optional()
            .with_context(|| format!("Database error querying story '{}'", id))
    }

    /// Newest first
    pub fn list_stories(&self, user_id: &str) -> Result<Vec<Story>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM stories WHERE user_id = ?1 AND deleted_at IS NULL \
             ORDER BY created_at DESC, id",
            STORY_COLUMNS
        ))?;
        let rows = stmt.query_map(params![user_id], story_from_row)?;

        let mut stories = Vec::new();
        for row in rows {
            stories.push(row?);
        }
        Ok(stories)
    }

    pub fn delete_story(&self, user_id: &str, id: &str) -> Result<bool> {
        let updated = self
            .conn()?
            .execute(
                "UPDATE stories SET deleted_at = ?1 WHERE user_id = ?2 AND id = ?3 AND deleted_at IS NULL",
                params![Utc::now().to_rfc3339(), user_id, id],
            )
            .with_context(|| format!("Failed to delete story '{}'", id))?;
        Ok(updated == 1)
    }

    // Facts

    /// Active facts, optionally for one subject
    pub fn list_facts(&self, user_id: &str, subject_id: Option<&str>) -> Result<Vec<RelationshipFact>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM relationship_facts WHERE user_id = ?1 AND deleted_at IS NULL \
             AND (?2 IS NULL OR subject_id = ?2) ORDER BY created_at, id",
            FACT_COLUMNS
        ))?;
        let rows = stmt.query_map(params![user_id, subject_id], fact_from_row)?;

        let mut facts = Vec::new();
        for row in rows {
            facts.push(row?);
        }
        Ok(facts)
    }

    pub fn get_fact(&self, user_id: &str, id: &str) -> Result<Option<RelationshipFact>> {
        self.conn()?
            .query_row(
                &format!(
                    "SELECT {} FROM relationship_facts WHERE user_id = ?1 AND id = ?2",
                    FACT_COLUMNS
                ),
                params![user_id, id],
                fact_from_row,
            )
            .optional()
            .with_context(|| format!("Database error querying fact '{}'", id))
    }

    /// Soft delete (sets the deletion marker, row is kept)
    pub fn delete_fact(&self, user_id: &str, id: &str) -> Result<bool> {
        let updated = self
            .conn()?
            .execute(
                "UPDATE relationship_facts SET deleted_at = ?1 \
                 WHERE user_id = ?2 AND id = ?3 AND deleted_at IS NULL",
                params![Utc::now().to_rfc3339(), user_id, id],
            )
            .with_context(|| format!("Failed to delete fact '{}'", id))?;
        Ok(updated == 1)
    }

    // Pending extractions

    pub fn get_pending(&self, user_id: &str, id: &str) -> Result<Option<PendingExtraction>> {
        load_pending(&*self.conn()?, user_id, id)
    }

    /// Triage listing: lowest confidence first
    pub fn list_pending(
        &self,
        user_id: &str,
        status: Option<ReviewStatus>,
    ) -> Result<Vec<PendingExtraction>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM pending_extractions WHERE user_id = ?1 \
             AND (?2 IS NULL OR review_status = ?2) \
             ORDER BY confidence ASC, created_at ASC, id ASC",
            PENDING_COLUMNS
        ))?;
        let rows = stmt.query_map(params![user_id, status.map(|s| s.as_str())], pending_from_row)?;

        let mut pending = Vec::new();
        for row in rows {
            pending.push(row?);
        }
        Ok(pending)
    }
}

impl FactIndex for Database {
    fn find_active_fact(
        &self,
        user_id: &str,
        subject_id: &str,
        kind: RelationKind,
        object_label: &str,
    ) -> Result<Option<String>> {
        self.conn()?
            .find_active_fact(user_id, subject_id, kind, object_label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open() -> (TempDir, Database) {
        let dir = TempDir::new().unwrap();
        let db = Database::open(&dir.path().join("test.db")).unwrap();
        (dir, db)
    }

    #[test]
    fn rejects_non_db_extension() {
        assert!(validate_db_path(Path::new("/tmp/people.sqlite")).is_err());
        assert!(validate_db_path(Path::new("/tmp/people")).is_err());
        assert!(validate_db_path(Path::new("/tmp/people.db")).is_ok());
    }

    #[test]
    fn persons_are_scoped_by_owner() {
        let (_dir, db) = open();
        db.create_person("u1", &NewPerson::named("Sarah Lee")).unwrap();
        db.create_person("u2", &NewPerson::named("Sarah Kim")).unwrap();

        let mine = db.list_persons("u1", false).unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].name, "Sarah Lee");
        assert_eq!(mine[0].classification, PersonClassification::Primary);
    }

    #[test]
    fn invalid_names_are_refused() {
        let (_dir, db) = open();
        assert!(db.create_person("u1", &NewPerson::named("  ")).is_err());
        assert!(db.create_person("u1", &NewPerson::named("a\u{7}b")).is_err());
        assert!(db.create_person("u1", &NewPerson::named("x".repeat(300))).is_err());
    }

    #[test]
    fn placeholder_has_placeholder_status() {
        let (_dir, db) = open();
        let p = db.new_placeholder("u1", "Marco").unwrap();
        assert!(db.get_person("u1", &p.id).unwrap().is_none());
        insert_person(&*db.conn().unwrap(), &p).unwrap();
        assert_eq!(p.status, PersonStatus::Placeholder);
        assert_eq!(p.classification, PersonClassification::Placeholder);
        assert_eq!(db.get_person("u1", &p.id).unwrap().unwrap(), p);
    }

    #[test]
    fn story_round_trip_and_soft_delete() {
        let (_dir, db) = open();
        let story = db
            .create_story("u1", &NewStory { content: "Lunch with @Ana".into(), ..Default::default() })
            .unwrap();
        assert!(!story.ai_processed);

        assert!(mark_processed(&*db.conn().unwrap(), "u1", &story.id, &serde_json::json!({"staged": 0}))
            .unwrap());
        let loaded = db.get_story("u1", &story.id).unwrap().unwrap();
        assert!(loaded.ai_processed);
        assert_eq!(loaded.extraction, Some(serde_json::json!({"staged": 0})));

        assert!(db.delete_story("u1", &story.id).unwrap());
        assert!(db.get_story("u1", &story.id).unwrap().is_none());
        assert!(db.get_story("u2", &story.id).unwrap().is_none());
    }

    #[test]
    fn archived_person_cannot_be_marked_merged_directly() {
        let (_dir, db) = open();
        let p = db.create_person("u1", &NewPerson::named("Tom")).unwrap();
        let archived = db.set_person_status("u1", &p.id, PersonStatus::Archived).unwrap();
        assert_eq!(archived.status, PersonStatus::Archived);
        assert!(db.set_person_status("u1", &p.id, PersonStatus::Merged).is_err());
        assert!(matches!(
            db.set_person_status("u1", "missing", PersonStatus::Active),
            Err(PipelineError::NotFound { .. })
        ));
    }
}
