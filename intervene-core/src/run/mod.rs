//! One pipeline invocation: onboard the configured OpenAPI documents, find
//! the operations closest to the objective and ask the model for the call.

pub mod supervisor;

pub use supervisor::RunSupervisor;

use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::config::{Config, ConfigError};
use crate::embedding::openai::OpenAiEmbedder;
use crate::embedding::{EmbedError, Embedder};
use crate::events::RunLogger;
use crate::llm::openai::OpenAiChatModel;
use crate::llm::{ChatModel, LlmError, StructuredCompletionClient, StructuredGenerationRequest};
use crate::mirror::{MirrorError, MirrorStore};
use crate::openapi::{self, ApiCall};
use crate::types::{ChatMessage, MirrorDocument};
use crate::upstream::UpstreamError;
use crate::vector::{AnyVectorStore, VectorStore, VectorStoreError};

/// Texts per embeddings request during onboarding.
pub const EMBED_BATCH_SIZE: usize = 256;

pub const API_CALL_FUNCTION: &str = "api_call";
const API_CALL_DESCRIPTION: &str =
    "Describe the single HTTP request that accomplishes the objective using one of the candidate operations";

const SYSTEM_PROMPT: &str = "You turn a user's objective into exactly one HTTP API call. \
Pick one of the candidate operations listed by the user, copy its id into operation_id, \
and fill in path parameters, query parameters and the request body. \
Only use values stated in the objective or fields described by the context schemas.";

/// Why a run ended without a result.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Configuration(#[from] ConfigError),
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error("embedding failed: {0}")]
    Embedding(EmbedError),
    #[error("vector store failed: {0}")]
    VectorStore(VectorStoreError),
    #[error("mirror store failed: {0}")]
    Mirror(#[from] MirrorError),
    #[error("{function} returned invalid arguments twice: {}", .errors.join("; "))]
    Validation { function: String, errors: Vec<String> },
    #[error("completion failed: {0}")]
    Completion(LlmError),
    #[error("no operations matched the objective")]
    NoOperations,
    #[error("run cancelled")]
    Cancelled,
    #[error("could not encode run output: {0}")]
    Output(String),
}

impl From<EmbedError> for RunError {
    fn from(e: EmbedError) -> Self {
        match e {
            EmbedError::Upstream(u) => Self::Upstream(u),
            other => Self::Embedding(other),
        }
    }
}

impl From<VectorStoreError> for RunError {
    fn from(e: VectorStoreError) -> Self {
        match e {
            VectorStoreError::Upstream(u) => Self::Upstream(u),
            VectorStoreError::Mirror(m) => Self::Mirror(m),
            other => Self::VectorStore(other),
        }
    }
}

impl From<LlmError> for RunError {
    fn from(e: LlmError) -> Self {
        match e {
            LlmError::Upstream(u) => Self::Upstream(u),
            LlmError::Validation { function, errors } => Self::Validation { function, errors },
            other => Self::Completion(other),
        }
    }
}

/// What a run works on, resolved from configuration up front.
#[derive(Clone, Debug)]
pub struct RunInput {
    pub objective: String,
    /// Name to JSON schema of values the caller can supply at runtime.
    pub context: Map<String, Value>,
    /// Parsed OpenAPI documents to onboard before searching.
    pub documents: Vec<Value>,
}

impl RunInput {
    /// Validate `config` and load everything the run reads from disk. No
    /// network call is made.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            objective: config.objective.trim().to_string(),
            context: config.context_schemas()?,
            documents: openapi::load_documents(&config.openapis)?,
        })
    }
}

/// A candidate operation as reported in the run output.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct Candidate {
    pub id: String,
    pub distance: f32,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct RunOutput {
    pub call: ApiCall,
    pub candidates: Vec<Candidate>,
}

/// The handles one run uses. Built once per run and never shared.
pub struct RunContext<E, V, M> {
    pub embedder: E,
    pub vector_store: V,
    pub llm: StructuredCompletionClient<M>,
    pub logger: RunLogger,
    pub search_limit: usize,
    pub where_filter: Option<Value>,
}

/// The production handle set.
pub type LiveRunContext = RunContext<OpenAiEmbedder, AnyVectorStore, OpenAiChatModel>;

impl LiveRunContext {
    /// Build the configured handles. Opens the mirror database but makes no
    /// network call.
    pub fn from_config(config: &Config, logger: RunLogger) -> Result<Self, RunError> {
        let openai_key = config.openai.resolve_api_key().map_err(ConfigError::Invalid)?;
        let mirror = Arc::new(MirrorStore::open(&config.storage.mirror)?);

        Ok(Self {
            embedder: OpenAiEmbedder::new(
                &openai_key,
                &config.openai.embedding_model,
                &config.openai.endpoint,
            ),
            vector_store: AnyVectorStore::from_config(&config.vector_store, mirror)?,
            llm: StructuredCompletionClient::new(
                OpenAiChatModel::new(&openai_key, &config.openai.endpoint),
                config.llm.clone(),
                logger.clone(),
            ),
            logger,
            search_limit: config.vector_store.search_limit,
            where_filter: config.vector_store.where_filter.clone(),
        })
    }
}

impl<E: Embedder, V: VectorStore, M: ChatModel> RunContext<E, V, M> {
    /// Embed and upsert every operation of every document.
    pub async fn onboard(&self, documents: &[Value]) -> Result<usize, RunError> {
        let operations: Vec<_> = documents.iter().flat_map(openapi::extract_operations).collect();
        if operations.is_empty() {
            self.logger.warn("no operations found in the configured OpenAPI documents");
            return Ok(0);
        }
        self.logger.log(format!(
            "onboarding {} operations from {} documents with {}",
            operations.len(),
            documents.len(),
            self.embedder.model_name()
        ));

        let mut onboarded = 0;
        let mut operations = operations.into_iter().peekable();
        while operations.peek().is_some() {
            let chunk: Vec<_> = operations.by_ref().take(EMBED_BATCH_SIZE).collect();
            let texts: Vec<String> = chunk.iter().map(|op| op.text.clone()).collect();
            let vectors = self.embedder.embed(&texts).await?;

            let items: Vec<_> = chunk
                .into_iter()
                .zip(vectors)
                .map(|(op, (_, vector))| op.into_item(vector))
                .collect();
            self.vector_store.upsert_items(&items).await?;
            onboarded += items.len();
        }

        self.logger.info(format!(
            "stored {onboarded} operations in the {} vector store",
            self.vector_store.backend()
        ));
        Ok(onboarded)
    }

    /// Nearest operations to `objective`, as full mirror documents.
    pub async fn find_operations(
        &self,
        objective: &str,
    ) -> Result<(Vec<Candidate>, Vec<MirrorDocument>), RunError> {
        let embedded = self.embedder.embed(&[objective.to_string()]).await?;
        let Some((_, query_vector)) = embedded.into_iter().next() else {
            return Err(EmbedError::MissingIndex(0).into());
        };

        self.logger.log("searching for matching operations");
        let hits = self
            .vector_store
            .search_items(objective, &query_vector, self.search_limit, self.where_filter.as_ref())
            .await?;
        if hits.is_empty() {
            return Err(RunError::NoOperations);
        }

        let candidates: Vec<Candidate> = hits
            .iter()
            .map(|h| Candidate {
                id: h.id.clone(),
                distance: h.distance,
            })
            .collect();
        self.logger.info_with(
            format!("found {} candidate operations", candidates.len()),
            serde_json::to_value(&candidates).unwrap_or(Value::Null),
        );

        let ids: Vec<String> = hits.into_iter().map(|h| h.id).collect();
        let documents = self.vector_store.retrieve_items(&ids).await?;
        Ok((candidates, documents))
    }

    /// The full sequence: onboard, embed the objective, search, retrieve and
    /// generate the structured call.
    pub async fn execute(&self, input: &RunInput) -> Result<RunOutput, RunError> {
        self.onboard(&input.documents).await?;
        let (candidates, documents) = self.find_operations(&input.objective).await?;

        self.logger.log("generating the API call");
        let request = StructuredGenerationRequest::for_output::<ApiCall>(
            build_prompt(&input.objective, &input.context, &documents),
            API_CALL_FUNCTION,
            API_CALL_DESCRIPTION,
        )?;
        let call: ApiCall = self.llm.generate_structured(&request, None).await?;
        self.logger.info_with(
            "generated API call",
            serde_json::to_value(&call).unwrap_or(Value::Null),
        );

        Ok(RunOutput { call, candidates })
    }
}

/// Messages for the final structured call.
pub fn build_prompt(
    objective: &str,
    context: &Map<String, Value>,
    documents: &[MirrorDocument],
) -> Vec<ChatMessage> {
    let mut user = format!("Objective: {objective}\n");

    if !context.is_empty() {
        let schemas = serde_json::to_string_pretty(context).unwrap_or_default();
        user.push_str(&format!(
            "\nContext values available at runtime (JSON schemas by name):\n{schemas}\n"
        ));
    }

    user.push_str("\nCandidate operations:\n");
    for doc in documents {
        let metadata = serde_json::to_string(&doc.metadata).unwrap_or_default();
        user.push_str(&format!("- id: {}\n  details: {metadata}\n", doc.id));
    }

    vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(user)]
}

/// Run once with `config`, optionally replacing its objective. Configuration
/// problems are reported before any handle is built.
pub async fn run_once(
    config: &Config,
    objective_override: Option<&str>,
    logger: RunLogger,
) -> Result<Value, RunError> {
    let mut config = config.clone();
    if let Some(objective) = objective_override {
        config.objective = objective.to_string();
    }

    let input = RunInput::from_config(&config)?;
    logger.info(format!(
        "run {} started with the {} vector store",
        logger.run_id(),
        config.vector_store.backend
    ));

    let context = LiveRunContext::from_config(&config, logger)?;
    let output = context.execute(&input).await?;
    serde_json::to_value(&output).map_err(|e| RunError::Output(e.to_string()))
}

/// [`run_once`], then report the outcome as the terminal event.
pub async fn run_and_finish(config: Config, objective_override: Option<String>, logger: RunLogger) {
    let result = run_once(&config, objective_override.as_deref(), logger.clone()).await;
    if let Err(e) = &result {
        logger.error(e.to_string());
    }
    logger.finish(result.map_err(|e| e.to_string()));
}
