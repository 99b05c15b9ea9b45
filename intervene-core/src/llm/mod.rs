pub mod openai;

use std::future::Future;

use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::config::LlmConfig;
use crate::events::RunLogger;
use crate::types::{ChatMessage, ModelTier, Usage};
use crate::upstream::UpstreamError;

/// Extra instruction appended to every structured request.
pub const CALL_FUNCTION_INSTRUCTION: &str = "always call one of the provided functions";

/// Errors that can occur when generating a completion.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    /// The model's arguments were still invalid after the corrective retry.
    #[error("model output for '{function}' failed validation: {}", .errors.join("; "))]
    Validation { function: String, errors: Vec<String> },
    #[error("could not build output schema: {0}")]
    Schema(String),
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FunctionCall {
    pub name: String,
    /// Raw JSON text as produced by the model. Not guaranteed to parse.
    pub arguments: String,
}

/// One entry of the conversation sent to the model.
#[derive(Clone, Debug, PartialEq)]
pub enum Turn {
    Message(ChatMessage),
    /// An earlier function call made by the assistant.
    FunctionCall(FunctionCall),
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FunctionSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// A single chat-completion call. When `function` is set the model is forced
/// to call it.
#[derive(Clone, Debug, PartialEq)]
pub struct CompletionRequest {
    pub model: String,
    pub turns: Vec<Turn>,
    pub function: Option<FunctionSpec>,
    /// Provider arguments merged over the defaults (e.g. `temperature`).
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Completion {
    pub content: Option<String>,
    pub function_call: Option<FunctionCall>,
    pub usage: Option<Usage>,
}

/// Trait abstracting a chat-completion provider.
pub trait ChatModel: Send + Sync {
    fn complete(
        &self,
        request: &CompletionRequest,
    ) -> impl Future<Output = Result<Completion, LlmError>> + Send;
}

/// A type the model can be asked to produce through a function call.
///
/// Deserialization catches shape errors; `validate` adds the semantic checks
/// a schema cannot express. An empty list means valid.
pub trait StructuredOutput: DeserializeOwned + JsonSchema {
    fn validate(&self) -> Vec<String> {
        Vec::new()
    }
}

/// A forced function call whose arguments must deserialize into an output type.
///
/// Only [`for_output`](Self::for_output) builds one, so the schema sent to the
/// model always comes from a `StructuredOutput` type. Pass the same type to
/// `generate_structured`.
#[derive(Clone, Debug, PartialEq)]
pub struct StructuredGenerationRequest {
    pub messages: Vec<ChatMessage>,
    pub function_name: String,
    pub function_description: String,
    output_schema: Value,
    /// Overrides the client's default tier for this call.
    pub tier: Option<ModelTier>,
}

impl StructuredGenerationRequest {
    /// A request whose output schema is derived from `T`.
    pub fn for_output<T: StructuredOutput>(
        messages: Vec<ChatMessage>,
        function_name: &str,
        function_description: &str,
    ) -> Result<Self, LlmError> {
        let mut output_schema = serde_json::to_value(schemars::schema_for!(T))
            .map_err(|e| LlmError::Schema(e.to_string()))?;
        if let Some(schema) = output_schema.as_object_mut() {
            schema.remove("$schema");
        }
        Ok(Self {
            messages,
            function_name: function_name.to_string(),
            function_description: function_description.to_string(),
            output_schema,
            tier: None,
        })
    }

    pub fn with_tier(mut self, tier: ModelTier) -> Self {
        self.tier = Some(tier);
        self
    }

    pub fn output_schema(&self) -> &Value {
        &self.output_schema
    }
}

/// Plain completion result.
#[derive(Clone, Debug, PartialEq)]
pub struct Generated {
    pub content: String,
    pub usage: Option<Usage>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Attempt {
    First,
    Second,
}

/// Parse and validate the arguments of a function call.
pub fn parse_arguments<T: StructuredOutput>(call: Option<&FunctionCall>) -> Result<T, Vec<String>> {
    let Some(call) = call else {
        return Err(vec!["no function was called".to_string()]);
    };
    let raw = if call.arguments.trim().is_empty() {
        "{}"
    } else {
        call.arguments.as_str()
    };
    let value: T = serde_json::from_str(raw).map_err(|e| vec![e.to_string()])?;
    let errors = value.validate();
    if errors.is_empty() {
        Ok(value)
    } else {
        Err(errors)
    }
}

fn correction_message(errors: &[String]) -> String {
    let rendered = serde_json::to_string(errors).unwrap_or_default();
    format!(
        "You have not supplied correct parameters to the function. Try again. The error was: \n ```{rendered}```"
    )
}

/// Chat completions with a validate-then-retry-once protocol for
/// structured output.
pub struct StructuredCompletionClient<M> {
    model: M,
    config: LlmConfig,
    default_tier: ModelTier,
    logger: RunLogger,
}

impl<M: ChatModel> StructuredCompletionClient<M> {
    pub fn new(model: M, config: LlmConfig, logger: RunLogger) -> Self {
        let default_tier = config.default_tier;
        Self {
            model,
            config,
            default_tier,
            logger,
        }
    }

    pub fn with_default_tier(mut self, tier: ModelTier) -> Self {
        self.default_tier = tier;
        self
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    fn model_name(&self, tier: Option<ModelTier>) -> String {
        self.config
            .model_for(tier.unwrap_or(self.default_tier))
            .to_string()
    }

    /// Plain completion. Failures are returned as-is, without retry.
    pub async fn generate(
        &self,
        messages: &[ChatMessage],
        tier: Option<ModelTier>,
        extra: Option<&Map<String, Value>>,
    ) -> Result<Generated, LlmError> {
        let request = CompletionRequest {
            model: self.model_name(tier),
            turns: messages.iter().cloned().map(Turn::Message).collect(),
            function: None,
            extra: extra.cloned().unwrap_or_default(),
        };
        let completion = self.model.complete(&request).await?;
        let content = completion.content.ok_or_else(|| {
            UpstreamError::MalformedResponse("completion has no message content".into())
        })?;
        Ok(Generated {
            content,
            usage: completion.usage,
        })
    }

    /// Force a call to `request.function_name` and parse its arguments as `T`.
    ///
    /// Invalid output gets one corrective retry that shows the model its
    /// previous call and the validation errors. A second failure is logged
    /// with the original prompt and returned as `LlmError::Validation`.
    pub async fn generate_structured<T: StructuredOutput>(
        &self,
        request: &StructuredGenerationRequest,
        extra: Option<&Map<String, Value>>,
    ) -> Result<T, LlmError> {
        let mut turns: Vec<Turn> = request.messages.iter().cloned().map(Turn::Message).collect();
        turns.push(Turn::Message(ChatMessage::user(CALL_FUNCTION_INSTRUCTION)));

        let function = FunctionSpec {
            name: request.function_name.clone(),
            description: request.function_description.clone(),
            parameters: request.output_schema.clone(),
        };
        let model = self.model_name(request.tier);
        let extra = extra.cloned().unwrap_or_default();

        let mut attempt = Attempt::First;
        loop {
            let completion = self
                .model
                .complete(&CompletionRequest {
                    model: model.clone(),
                    turns: turns.clone(),
                    function: Some(function.clone()),
                    extra: extra.clone(),
                })
                .await?;

            let errors = match parse_arguments::<T>(completion.function_call.as_ref()) {
                Ok(value) => return Ok(value),
                Err(errors) => errors,
            };

            match attempt {
                Attempt::First => {
                    self.logger.warn(format!(
                        "{} returned invalid arguments, retrying once",
                        request.function_name
                    ));
                    turns.push(match completion.function_call {
                        Some(call) => Turn::FunctionCall(call),
                        None => Turn::Message(ChatMessage::assistant(
                            completion.content.unwrap_or_default(),
                        )),
                    });
                    turns.push(Turn::Message(ChatMessage::user(correction_message(&errors))));
                    attempt = Attempt::Second;
                }
                Attempt::Second => {
                    let prompt = request
                        .messages
                        .iter()
                        .map(|m| m.content.as_str())
                        .collect::<Vec<_>>()
                        .join("\n");
                    self.logger.error(format!(
                        "model could not call {} even after retrying: {}\n\nHere is the prompt: \n{prompt}",
                        request.function_name,
                        serde_json::to_string(&errors).unwrap_or_default()
                    ));
                    return Err(LlmError::Validation {
                        function: request.function_name.clone(),
                        errors,
                    });
                }
            }
        }
    }
}
