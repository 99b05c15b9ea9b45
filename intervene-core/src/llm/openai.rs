use reqwest::Client;
use serde::Deserialize;

use super::{ChatModel, Completion, CompletionRequest, FunctionCall, LlmError, Turn};
use crate::types::{Role, Usage};
use crate::upstream::{UpstreamError, send_json};

/// OpenAI-compatible chat completions client (non-streaming, with the
/// `functions`/`function_call` protocol for structured output).
pub struct OpenAiChatModel {
    client: Client,
    api_key: String,
    endpoint: String,
}

impl OpenAiChatModel {
    pub fn new(api_key: &str, endpoint: &str) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.to_string(),
            endpoint: endpoint.to_string(),
        }
    }
}

// --- Request body construction ---

/// Convert the conversation into the OpenAI messages JSON format.
///
/// Earlier function calls become assistant messages with `content: null`.
fn to_chat_messages(turns: &[Turn]) -> Vec<serde_json::Value> {
    turns
        .iter()
        .map(|turn| match turn {
            Turn::Message(msg) => {
                let role = match msg.role {
                    Role::User => "user",
                    Role::Assistant => "assistant",
                    Role::System => "system",
                };
                serde_json::json!({
                    "role": role,
                    "content": msg.content,
                })
            }
            Turn::FunctionCall(call) => serde_json::json!({
                "role": "assistant",
                "content": null,
                "function_call": {
                    "name": call.name,
                    "arguments": call.arguments,
                }
            }),
        })
        .collect()
}

/// Build the full request body for the chat completions endpoint.
///
/// `extra` is applied over the defaults; `stream` is always false.
fn build_request_body(request: &CompletionRequest) -> serde_json::Value {
    let mut body = serde_json::json!({
        "model": request.model,
        "messages": to_chat_messages(&request.turns),
        "temperature": 0,
    });

    if let Some(function) = &request.function {
        body["functions"] = serde_json::json!([function]);
        body["function_call"] = serde_json::json!({ "name": function.name });
    }

    for (key, value) in &request.extra {
        body[key.as_str()] = value.clone();
    }
    body["stream"] = serde_json::Value::Bool(false);

    body
}

// --- Response types ---

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    function_call: Option<FunctionCall>,
}

fn into_completion(response: ChatResponse) -> Result<Completion, UpstreamError> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| UpstreamError::MalformedResponse("response has no choices".into()))?;
    Ok(Completion {
        content: choice.message.content,
        function_call: choice.message.function_call,
        usage: response.usage,
    })
}

impl ChatModel for OpenAiChatModel {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmError> {
        let url = format!("{}/chat/completions", self.endpoint.trim_end_matches('/'));
        let body = build_request_body(request);

        let response: ChatResponse = send_json(
            self.client
                .post(&url)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(&body),
        )
        .await?;

        let completion = into_completion(response)?;
        if let Some(usage) = &completion.usage {
            log::debug!(
                "{}: {} prompt + {} completion tokens",
                request.model,
                usage.prompt_tokens,
                usage.completion_tokens
            );
        }
        Ok(completion)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::Json;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use serde_json::{Map, Value, json};

    use super::*;
    use crate::fake_http;
    use crate::llm::FunctionSpec;
    use crate::types::ChatMessage;

    fn make_request(function: Option<FunctionSpec>) -> CompletionRequest {
        CompletionRequest {
            model: "gpt-4-0613".into(),
            turns: vec![
                Turn::Message(ChatMessage::system("You are helpful.")),
                Turn::Message(ChatMessage::user("Hi")),
            ],
            function,
            extra: Map::new(),
        }
    }

    fn spec() -> FunctionSpec {
        FunctionSpec {
            name: "api_call".into(),
            description: "Describe the call".into(),
            parameters: json!({"type": "object"}),
        }
    }

    #[test]
    fn request_body_matches_openai_format() {
        let body = build_request_body(&make_request(None));

        assert_eq!(body["model"], "gpt-4-0613");
        assert_eq!(body["stream"], false);
        assert_eq!(body["temperature"], 0);

        let msgs = body["messages"].as_array().unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0]["role"], "system");
        assert_eq!(msgs[0]["content"], "You are helpful.");
        assert_eq!(msgs[1]["role"], "user");
        assert!(body.get("functions").is_none());
        assert!(body.get("function_call").is_none());
    }

    #[test]
    fn request_body_forces_function_call() {
        let body = build_request_body(&make_request(Some(spec())));
        assert_eq!(body["functions"][0]["name"], "api_call");
        assert_eq!(body["functions"][0]["parameters"]["type"], "object");
        assert_eq!(body["function_call"], json!({"name": "api_call"}));
    }

    #[test]
    fn extra_overrides_defaults_but_not_stream() {
        let mut request = make_request(None);
        request.extra.insert("temperature".into(), json!(0.5));
        request.extra.insert("stream".into(), json!(true));
        request.extra.insert("max_tokens".into(), json!(64));

        let body = build_request_body(&request);
        assert_eq!(body["temperature"], 0.5);
        assert_eq!(body["max_tokens"], 64);
        assert_eq!(body["stream"], false);
    }

    #[test]
    fn earlier_function_calls_are_assistant_messages() {
        let turns = vec![
            Turn::Message(ChatMessage::user("Go")),
            Turn::FunctionCall(FunctionCall {
                name: "api_call".into(),
                arguments: r#"{"method":"GET"}"#.into(),
            }),
        ];
        let msgs = to_chat_messages(&turns);
        assert_eq!(msgs[1]["role"], "assistant");
        assert!(msgs[1]["content"].is_null());
        assert_eq!(msgs[1]["function_call"]["name"], "api_call");
        assert_eq!(msgs[1]["function_call"]["arguments"], r#"{"method":"GET"}"#);
    }

    #[test]
    fn empty_choices_is_malformed() {
        let response: ChatResponse = serde_json::from_value(json!({"choices": []})).unwrap();
        assert!(matches!(
            into_completion(response),
            Err(UpstreamError::MalformedResponse(_))
        ));
    }

    #[tokio::test]
    async fn completes_against_fake_endpoint() {
        let seen: Arc<Mutex<Vec<Value>>> = Arc::default();

        async fn handler(
            State(seen): State<Arc<Mutex<Vec<Value>>>>,
            headers: HeaderMap,
            Json(body): Json<Value>,
        ) -> Json<Value> {
            assert_eq!(headers.get("authorization").unwrap(), "Bearer sk-test");
            seen.lock().unwrap().push(body);
            Json(json!({
                "id": "chatcmpl-1",
                "choices": [{
                    "index": 0,
                    "message": {
                        "role": "assistant",
                        "content": null,
                        "function_call": {"name": "api_call", "arguments": "{\"method\":\"GET\"}"}
                    },
                    "finish_reason": "stop"
                }],
                "usage": {"prompt_tokens": 12, "completion_tokens": 5, "total_tokens": 17}
            }))
        }

        let router = axum::Router::new()
            .route("/chat/completions", post(handler))
            .with_state(seen.clone());
        let base = fake_http::spawn(router).await;

        let model = OpenAiChatModel::new("sk-test", &base);
        let completion = model.complete(&make_request(Some(spec()))).await.unwrap();

        assert!(completion.content.is_none());
        assert_eq!(completion.function_call.unwrap().arguments, r#"{"method":"GET"}"#);
        assert_eq!(completion.usage.unwrap().total_tokens, 17);
        assert_eq!(seen.lock().unwrap()[0]["function_call"]["name"], "api_call");
    }

    #[tokio::test]
    async fn rate_limit_maps_to_upstream_error() {
        let router = axum::Router::new().route(
            "/chat/completions",
            post(|| async {
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    r#"{"error":{"message":"Rate limit reached"}}"#,
                )
            }),
        );
        let base = fake_http::spawn(router).await;

        let model = OpenAiChatModel::new("sk-test", &base);
        let err = model.complete(&make_request(None)).await.unwrap_err();
        assert!(matches!(
            err,
            LlmError::Upstream(UpstreamError::RateLimit(ref m)) if m == "Rate limit reached"
        ));
    }
}
