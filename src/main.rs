use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use rmcp::{
    ErrorData as McpError, ServerHandler, ServiceExt,
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::{CallToolResult, Content, Implementation, ServerCapabilities, ServerInfo},
    tool, tool_handler, tool_router,
    transport::stdio,
    transport::streamable_http_server::{
        StreamableHttpService, session::local::LocalSessionManager,
    },
};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{info, warn};

use rapport_mcp_rs::config::AppContext;
use rapport_mcp_rs::disambiguation::{Choice, Disambiguation, Resolutions, Step};
use rapport_mcp_rs::extraction::ExtractionReport;
use rapport_mcp_rs::graph::{FactOverrides, NewPerson, NewStory, ReviewStatus};
use rapport_mcp_rs::logging::{self, TransportMode};
use rapport_mcp_rs::resolver::CandidateSummary;
use rapport_mcp_rs::review::ReviewOutcome;
use rapport_mcp_rs::validator::CandidateFact;
use rapport_mcp_rs::{PipelineError, PipelineResult, RelationshipManager};

#[derive(Parser, Debug)]
#[command(name = "rapport-mcp-rs", version, about = "Relationship-tracking MCP server")]
struct Args {
    /// SQLite database file (must end in .db); falls back to RAPPORT_DB_PATH
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Settings file (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Owner id, overrides the settings file
    #[arg(long)]
    user: Option<String>,

    /// Write the effective settings to the settings file and exit
    #[arg(long)]
    init_config: bool,

    /// Serve streamable HTTP instead of stdio
    #[arg(short, long)]
    stream: bool,

    #[arg(short, long, default_value_t = 8000)]
    port: u16,

    #[arg(short, long, default_value = "127.0.0.1")]
    bind: String,

    /// Log file (stdio mode logs nowhere else)
    #[arg(short, long)]
    log: Option<PathBuf>,
}

/// In-progress disambiguation for one story
struct Session {
    protocol: Disambiguation,
    candidates: HashMap<String, Vec<CandidateSummary>>,
}

impl Session {
    fn view(&self, story_id: &str) -> Value {
        let current = self.protocol.current();
        json!({
            "storyId": story_id,
            "index": self.protocol.index(),
            "total": self.protocol.len(),
            "name": current,
            "candidates": current
                .and_then(|n| self.candidates.get(&n.to_lowercase()))
                .cloned()
                .unwrap_or_default(),
            "choice": current.and_then(|n| self.protocol.choice_for(n)).map(Choice::to_string),
            "canAdvance": self.protocol.can_advance(),
        })
    }
}

#[derive(Clone)]
struct RapportServer {
    manager: Arc<RelationshipManager>,
    sessions: Arc<Mutex<HashMap<String, Session>>>,
    tool_router: ToolRouter<Self>,
}

impl RapportServer {
    fn new(manager: Arc<RelationshipManager>) -> Self {
        Self {
            manager,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            tool_router: Self::tool_router(),
        }
    }

    fn server_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: Default::default(),
            capabilities: ServerCapabilities::builder()
                .enable_tools()
                .build(),
            server_info: Implementation {
                name: "rapport-mcp-rs".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                title: None,
                website_url: None,
                icons: None,
            },
            instructions: Some(
                "Write stories with @Name mentions (@+Name always creates a new person). \
                 Ambiguous names are resolved with begin_disambiguation / choose_resolution / \
                 advance_disambiguation. Extracted facts are staged for review; nothing enters \
                 the relationship graph until approve_pending or edit_and_approve_pending."
                    .to_string(),
            ),
        }
    }

    async fn run_extraction(
        &self,
        story_id: &str,
        resolutions: &Resolutions,
    ) -> Result<CallToolResult, McpError> {
        let report = self
            .manager
            .process_story(story_id, resolutions)
            .await
            .map_err(pipeline_err)?;
        Ok(structured(report_summary(&report), json!(report)))
    }

    /// Stale review actions are not errors: return the refreshed triage list
    async fn review_result(
        &self,
        id: &str,
        result: PipelineResult<ReviewOutcome>,
    ) -> Result<CallToolResult, McpError> {
        match result {
            Ok(outcome) => {
                let summary = match &outcome {
                    ReviewOutcome::Committed { fact, .. } => format!(
                        "Committed fact {} ({} {})",
                        fact.id, fact.fact.relation_kind, fact.fact.object_label
                    ),
                    ReviewOutcome::Duplicate { existing_fact_id, .. } => format!(
                        "Already known as fact {}; pending record closed",
                        existing_fact_id
                    ),
                    ReviewOutcome::Rejected { .. } => format!("Rejected {}", id),
                };
                Ok(structured(summary, json!(outcome)))
            }
            Err(e) if e.is_stale() => {
                warn!(pending_id = %id, error = %e, "stale review action ignored");
                let pending = self
                    .manager
                    .list_pending(Some(ReviewStatus::Pending))
                    .await
                    .map_err(internal_err("Failed to list pending extractions"))?;
                Ok(structured(
                    format!("{}; {} extractions still pending", e, pending.len()),
                    json!({ "stale": true, "reason": e.to_string(), "pending": pending }),
                ))
            }
            Err(e) => Err(pipeline_err(e)),
        }
    }
}

#[tool_router]
impl RapportServer {
    #[tool(
        name = "create_person",
        description = "Create a person the owner knows"
    )]
    async fn create_person(
        &self,
        Parameters(args): Parameters<NewPerson>,
    ) -> Result<CallToolResult, McpError> {
        let person = self
            .manager
            .create_person(args)
            .await
            .map_err(internal_err("Failed to create person"))?;
        Ok(structured(
            format!("Created {} ({})", person.name, person.id),
            json!(person),
        ))
    }

    #[tool(
        name = "list_persons",
        description = "List the owner's persons; merged records are hidden unless include_merged is set"
    )]
    async fn list_persons(
        &self,
        Parameters(args): Parameters<ListPersonsArgs>,
    ) -> Result<CallToolResult, McpError> {
        let persons = self
            .manager
            .list_persons(args.include_merged.unwrap_or(false))
            .await
            .map_err(internal_err("Failed to list persons"))?;
        Ok(structured(
            format!("{} persons", persons.len()),
            json!({ "persons": persons }),
        ))
    }

    #[tool(
        name = "search_persons",
        description = "Case-insensitive lookup by name or nickname, best matches first"
    )]
    async fn search_persons(
        &self,
        Parameters(args): Parameters<QueryArgs>,
    ) -> Result<CallToolResult, McpError> {
        let persons = self
            .manager
            .search_persons(&args.query)
            .await
            .map_err(internal_err("Failed to search persons"))?;
        Ok(structured(
            format!("{} matches for '{}'", persons.len(), args.query),
            json!({ "persons": persons }),
        ))
    }

    #[tool(name = "archive_person", description = "Archive a person (soft)")]
    async fn archive_person(
        &self,
        Parameters(args): Parameters<PersonIdArgs>,
    ) -> Result<CallToolResult, McpError> {
        let person = self
            .manager
            .archive_person(&args.person_id)
            .await
            .map_err(pipeline_err)?;
        Ok(structured(format!("Archived {}", person.name), json!(person)))
    }

    #[tool(
        name = "merge_persons",
        description = "Merge a duplicate person into another; facts and pending extractions move to the target"
    )]
    async fn merge_persons(
        &self,
        Parameters(args): Parameters<MergeArgs>,
    ) -> Result<CallToolResult, McpError> {
        let summary = self
            .manager
            .merge_persons(&args.source_id, &args.target_id)
            .await
            .map_err(pipeline_err)?;
        Ok(structured(
            format!(
                "Merged {} into {}: {} facts moved, {} duplicates retired",
                summary.source_id, summary.target_id, summary.facts_moved, summary.facts_deduplicated
            ),
            json!(summary),
        ))
    }

    #[tool(
        name = "create_story",
        description = "Save a story. Unless auto_extract is false, facts are extracted right away when no mention is ambiguous"
    )]
    async fn create_story(
        &self,
        Parameters(args): Parameters<CreateStoryArgs>,
    ) -> Result<CallToolResult, McpError> {
        let story = self
            .manager
            .create_story(args.story)
            .await
            .map_err(internal_err("Failed to save story"))?;

        if !args.auto_extract.unwrap_or(true) {
            return Ok(structured(format!("Saved story {}", story.id), json!({ "story": story })));
        }

        let pass = self
            .manager
            .resolve_story(&story.id)
            .await
            .map_err(pipeline_err)?;
        if pass.needs_disambiguation() {
            return Ok(structured(
                format!(
                    "Saved story {}; resolve {} before extraction",
                    story.id,
                    pass.ambiguous_names().join(", ")
                ),
                json!({ "story": story, "resolution": pass }),
            ));
        }

        // Extraction failures never undo the saved story
        match self.manager.process_story(&story.id, &Resolutions::new()).await {
            Ok(report) => Ok(structured(
                format!("Saved story {}; {}", story.id, report_summary(&report)),
                json!({ "story": story, "extraction": report }),
            )),
            Err(e) => {
                warn!(story_id = %story.id, error = %e, "extraction after save failed");
                Ok(structured(
                    format!("Saved story {}; extraction failed: {}", story.id, e),
                    json!({ "story": story, "extractionError": e.to_string() }),
                ))
            }
        }
    }

    #[tool(name = "list_stories", description = "List stories, newest first")]
    async fn list_stories(&self) -> Result<CallToolResult, McpError> {
        let stories = self
            .manager
            .list_stories()
            .await
            .map_err(internal_err("Failed to list stories"))?;
        Ok(structured(
            format!("{} stories", stories.len()),
            json!({ "stories": stories }),
        ))
    }

    #[tool(name = "delete_story", description = "Delete a story (soft)")]
    async fn delete_story(
        &self,
        Parameters(args): Parameters<StoryIdArgs>,
    ) -> Result<CallToolResult, McpError> {
        self.manager
            .delete_story(&args.story_id)
            .await
            .map_err(pipeline_err)?;
        self.sessions.lock().await.remove(&args.story_id);
        Ok(CallToolResult::success(vec![Content::text(format!(
            "Story {} deleted",
            args.story_id
        ))]))
    }

    #[tool(
        name = "preview_mentions",
        description = "Parse @mentions in text; suggests persons for the token under the caret (character offset, default end of text)"
    )]
    async fn preview_mentions(
        &self,
        Parameters(args): Parameters<PreviewArgs>,
    ) -> Result<CallToolResult, McpError> {
        let caret = args.caret.unwrap_or_else(|| args.text.chars().count());
        let preview = self
            .manager
            .preview_mentions(&args.text, caret)
            .await
            .map_err(internal_err("Failed to look up persons"))?;
        Ok(structured(
            format!(
                "{} mentions, {} suggestions",
                preview.parsed.mentions.len(),
                preview.suggestions.len()
            ),
            json!(preview),
        ))
    }

    #[tool(
        name = "resolve_story",
        description = "Classify every name mentioned in a story as bound, ambiguous, unknown or forced-new"
    )]
    async fn resolve_story(
        &self,
        Parameters(args): Parameters<StoryIdArgs>,
    ) -> Result<CallToolResult, McpError> {
        let pass = self
            .manager
            .resolve_story(&args.story_id)
            .await
            .map_err(pipeline_err)?;
        Ok(structured(
            format!(
                "{} bound, {} ambiguous, {} unknown, {} forced new",
                pass.bound.len(),
                pass.ambiguous.len(),
                pass.unknown.len(),
                pass.forced_new.len()
            ),
            json!(pass),
        ))
    }

    #[tool(
        name = "begin_disambiguation",
        description = "Start resolving the ambiguous names of a story one at a time"
    )]
    async fn begin_disambiguation(
        &self,
        Parameters(args): Parameters<StoryIdArgs>,
    ) -> Result<CallToolResult, McpError> {
        let pass = self
            .manager
            .resolve_story(&args.story_id)
            .await
            .map_err(pipeline_err)?;
        if !pass.needs_disambiguation() {
            return self.run_extraction(&args.story_id, &Resolutions::new()).await;
        }

        let session = Session {
            protocol: Disambiguation::new(pass.ambiguous_names()),
            candidates: pass
                .ambiguous
                .into_iter()
                .map(|a| (a.name.to_lowercase(), a.candidates))
                .collect(),
        };
        let view = session.view(&args.story_id);
        self.sessions.lock().await.insert(args.story_id.clone(), session);
        Ok(structured(step_summary(&view), view))
    }

    #[tool(
        name = "choose_resolution",
        description = "Decide an ambiguous name: a person id, \"NEW\" (create a new person) or \"IGNORE\""
    )]
    async fn choose_resolution(
        &self,
        Parameters(args): Parameters<ChooseArgs>,
    ) -> Result<CallToolResult, McpError> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .get_mut(&args.story_id)
            .ok_or_else(|| no_session(&args.story_id))?;
        session
            .protocol
            .select(&args.name, Choice::from(args.choice.as_str()))
            .map_err(|e| McpError::invalid_params(e.to_string(), None))?;
        let view = session.view(&args.story_id);
        Ok(structured(format!("{} -> {}", args.name, args.choice), view))
    }

    #[tool(
        name = "advance_disambiguation",
        description = "Move to the next ambiguous name; after the last one, extraction runs with all decisions"
    )]
    async fn advance_disambiguation(
        &self,
        Parameters(args): Parameters<StoryIdArgs>,
    ) -> Result<CallToolResult, McpError> {
        let step = {
            let mut sessions = self.sessions.lock().await;
            let session = sessions
                .get_mut(&args.story_id)
                .ok_or_else(|| no_session(&args.story_id))?;
            let step = session
                .protocol
                .advance()
                .map_err(|e| McpError::invalid_params(e.to_string(), None))?;
            match step {
                Step::Next { .. } => {
                    let view = session.view(&args.story_id);
                    return Ok(structured(step_summary(&view), view));
                }
                Step::Complete(resolutions) => {
                    sessions.remove(&args.story_id);
                    resolutions
                }
            }
        };
        self.run_extraction(&args.story_id, &step).await
    }

    #[tool(
        name = "cancel_disambiguation",
        description = "Abandon disambiguation for a story; no decisions are kept"
    )]
    async fn cancel_disambiguation(
        &self,
        Parameters(args): Parameters<StoryIdArgs>,
    ) -> Result<CallToolResult, McpError> {
        let removed = self.sessions.lock().await.remove(&args.story_id);
        let text = match removed {
            Some(mut session) => {
                session.protocol.cancel();
                format!("Disambiguation for {} cancelled", args.story_id)
            }
            None => format!("No disambiguation in progress for {}", args.story_id),
        };
        Ok(CallToolResult::success(vec![Content::text(text)]))
    }

    #[tool(
        name = "extract_story",
        description = "Run extraction for a story. resolutions maps every ambiguous name to a person id, \"NEW\" or \"IGNORE\""
    )]
    async fn extract_story(
        &self,
        Parameters(args): Parameters<ExtractArgs>,
    ) -> Result<CallToolResult, McpError> {
        let resolutions: Resolutions = args
            .resolutions
            .unwrap_or_default()
            .into_iter()
            .map(|(name, choice)| (name, Choice::from(choice)))
            .collect();
        self.run_extraction(&args.story_id, &resolutions).await
    }

    #[tool(
        name = "list_pending",
        description = "Staged extractions, lowest confidence first. status defaults to pending"
    )]
    async fn list_pending(
        &self,
        Parameters(args): Parameters<ListPendingArgs>,
    ) -> Result<CallToolResult, McpError> {
        let status = match args.status.as_deref() {
            None => Some(ReviewStatus::Pending),
            Some("all") => None,
            Some(raw) => Some(raw.parse::<ReviewStatus>().map_err(|_| {
                McpError::invalid_params(format!("unknown review status '{}'", raw), None)
            })?),
        };
        let pending = self
            .manager
            .list_pending(status)
            .await
            .map_err(internal_err("Failed to list pending extractions"))?;
        Ok(structured(
            format!("{} staged extractions", pending.len()),
            json!({ "pending": pending }),
        ))
    }

    #[tool(
        name = "approve_pending",
        description = "Commit a staged extraction to the relationship graph as-is"
    )]
    async fn approve_pending(
        &self,
        Parameters(args): Parameters<PendingIdArgs>,
    ) -> Result<CallToolResult, McpError> {
        let result = self.manager.approve(&args.pending_id).await;
        self.review_result(&args.pending_id, result).await
    }

    #[tool(name = "reject_pending", description = "Discard a staged extraction")]
    async fn reject_pending(
        &self,
        Parameters(args): Parameters<RejectArgs>,
    ) -> Result<CallToolResult, McpError> {
        let result = self
            .manager
            .reject(&args.pending_id, args.reason.as_deref())
            .await;
        self.review_result(&args.pending_id, result).await
    }

    #[tool(
        name = "edit_and_approve_pending",
        description = "Correct kind, label, intensity or category of a staged extraction, then commit it with full confidence"
    )]
    async fn edit_and_approve_pending(
        &self,
        Parameters(args): Parameters<EditArgs>,
    ) -> Result<CallToolResult, McpError> {
        let result = self
            .manager
            .edit_and_approve(&args.pending_id, &args.overrides)
            .await;
        self.review_result(&args.pending_id, result).await
    }

    #[tool(
        name = "list_facts",
        description = "Active relationship facts, optionally for one person"
    )]
    async fn list_facts(
        &self,
        Parameters(args): Parameters<ListFactsArgs>,
    ) -> Result<CallToolResult, McpError> {
        let facts = self
            .manager
            .list_facts(args.subject_id.as_deref())
            .await
            .map_err(internal_err("Failed to list facts"))?;
        Ok(structured(
            format!("{} facts", facts.len()),
            json!({ "facts": facts }),
        ))
    }

    #[tool(
        name = "add_fact",
        description = "Record a fact by hand (bypasses review, same validation)"
    )]
    async fn add_fact(
        &self,
        Parameters(args): Parameters<AddFactArgs>,
    ) -> Result<CallToolResult, McpError> {
        let subject_id = args.subject_id.clone();
        let candidate = args.into_candidate();
        let fact = self
            .manager
            .add_fact(&subject_id, &candidate)
            .await
            .map_err(pipeline_err)?;
        Ok(structured(
            format!(
                "Added fact {} ({} {})",
                fact.id, fact.fact.relation_kind, fact.fact.object_label
            ),
            json!(fact),
        ))
    }

    #[tool(name = "delete_fact", description = "Delete a fact (soft)")]
    async fn delete_fact(
        &self,
        Parameters(args): Parameters<FactIdArgs>,
    ) -> Result<CallToolResult, McpError> {
        self.manager
            .delete_fact(&args.fact_id)
            .await
            .map_err(pipeline_err)?;
        Ok(CallToolResult::success(vec![Content::text(format!(
            "Fact {} deleted",
            args.fact_id
        ))]))
    }
}

#[tool_handler]
impl ServerHandler for RapportServer {
    fn get_info(&self) -> ServerInfo {
        self.server_info()
    }
}

// Tool argument schemas

#[derive(Debug, Deserialize, JsonSchema)]
struct ListPersonsArgs {
    include_merged: Option<bool>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct QueryArgs {
    query: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct PersonIdArgs {
    person_id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct MergeArgs {
    /// Duplicate record to retire
    source_id: String,
    /// Record that survives
    target_id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct CreateStoryArgs {
    #[serde(flatten)]
    story: NewStory,
    auto_extract: Option<bool>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct StoryIdArgs {
    story_id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct PreviewArgs {
    text: String,
    caret: Option<usize>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ChooseArgs {
    story_id: String,
    name: String,
    choice: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ExtractArgs {
    story_id: String,
    resolutions: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ListPendingArgs {
    /// pending (default), approved, rejected, edited or all
    status: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct PendingIdArgs {
    pending_id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct RejectArgs {
    pending_id: String,
    reason: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct EditArgs {
    pending_id: String,
    #[serde(flatten)]
    overrides: FactOverrides,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ListFactsArgs {
    subject_id: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct AddFactArgs {
    subject_id: String,
    relation_kind: String,
    object_label: String,
    object_type: Option<String>,
    intensity: Option<String>,
    category: Option<String>,
    /// current (default), past, future or aspiration
    status: Option<String>,
    metadata: Option<Value>,
}

impl AddFactArgs {
    fn into_candidate(self) -> CandidateFact {
        CandidateFact {
            subject: self.subject_id.clone(),
            subject_id: Some(self.subject_id),
            relation_kind: self.relation_kind,
            object_label: self.object_label,
            object_type: self.object_type,
            intensity: self.intensity,
            category: self.category,
            metadata: self.metadata,
            status: self.status,
            ..Default::default()
        }
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct FactIdArgs {
    fact_id: String,
}

fn structured(summary: String, value: Value) -> CallToolResult {
    CallToolResult {
        content: vec![Content::text(summary)],
        structured_content: Some(value),
        is_error: Some(false),
        meta: None,
    }
}

fn report_summary(report: &ExtractionReport) -> String {
    match &report.collaborator_error {
        Some(e) => format!("no facts extracted ({}); the story is kept", e),
        None => format!(
            "{} facts staged for review, {} duplicates skipped, {} rejected",
            report.staged.len(),
            report.duplicates,
            report.rejected.len()
        ),
    }
}

fn step_summary(view: &Value) -> String {
    format!(
        "Resolve '{}' ({} of {})",
        view["name"].as_str().unwrap_or_default(),
        view["index"].as_u64().unwrap_or_default() + 1,
        view["total"]
    )
}

fn no_session(story_id: &str) -> McpError {
    McpError::invalid_params(
        format!("No disambiguation in progress for story {}", story_id),
        None,
    )
}

// Helpers for error conversion
fn internal_err<T: ToString>(msg: &'static str) -> impl FnOnce(T) -> McpError + Clone {
    move |err| McpError::internal_error(msg, Some(json!({ "error": err.to_string() })))
}

fn pipeline_err(err: PipelineError) -> McpError {
    match &err {
        PipelineError::NotFound { .. } => McpError::resource_not_found(err.to_string(), None),
        PipelineError::Storage(e) => {
            McpError::internal_error("Storage failure", Some(json!({ "error": format!("{:#}", e) })))
        }
        PipelineError::UnresolvedMentions(names) => McpError::invalid_params(
            err.to_string(),
            Some(json!({ "unresolved": names })),
        ),
        _ => McpError::invalid_params(err.to_string(), None),
    }
}

fn default_db_path() -> PathBuf {
    let mut path = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push("rapport");
    path.push("rapport.db");
    path
}

async fn serve_http(server: RapportServer, bind: &str, port: u16) -> anyhow::Result<()> {
    let service = StreamableHttpService::new(
        move || Ok(server.clone()),
        LocalSessionManager::default().into(),
        Default::default(),
    );
    let router = axum::Router::new()
        .route("/health", axum::routing::get(|| async { "OK" }))
        .nest_service("/mcp", service);

    let addr = format!("{}:{}", bind, port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!(%addr, "streamable HTTP transport listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("HTTP server failed")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mode = if args.stream {
        TransportMode::Stream
    } else {
        TransportMode::Stdio
    };
    logging::init_logging(mode, args.log.as_deref())?;

    let mut ctx = AppContext::load(args.config.clone().unwrap_or_else(AppContext::default_path))?;
    if let Some(user) = args.user.clone() {
        ctx.settings_mut().owner_id = user;
    }
    if args.init_config {
        ctx.save()?;
        println!("{}", ctx.path().display());
        return Ok(());
    }

    let db_path = args
        .db_path
        .clone()
        .or_else(|| std::env::var_os("RAPPORT_DB_PATH").map(PathBuf::from))
        .unwrap_or_else(default_db_path);

    let manager = Arc::new(RelationshipManager::new(db_path, &ctx)?);
    info!(owner = %manager.owner_id(), ?mode, "starting server");
    let server = RapportServer::new(manager);

    match mode {
        TransportMode::Stdio => {
            let svc = server.serve(stdio()).await?;
            svc.waiting().await?;
        }
        TransportMode::Stream => serve_http(server, &args.bind, args.port).await?,
    }

    Ok(())
}
