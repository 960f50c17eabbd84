//! The model-output iterator contract (Design Notes: "async generator
//! producing model output" reframed as "a lazy finite sequence of tagged
//! chunks, forward-only, cancellable by dropping the iterator"). `ModelChunk`
//! is the tagged variant the [`Publisher`](crate::publisher::Publisher)
//! consumes; [`ModelClient`] is the trait boundary to the provider SDK,
//! which spec.md §1 puts out of scope — only the chunk/error contract is
//! specified here, not any particular provider's request shape.

use std::pin::Pin;
use std::sync::Arc;

use futures_core::Stream;
use serde_json::Value;

use crate::tools::ToolExecutor;

/// One chunk of a model turn, as consumed by the publisher's `execute`
/// loop (spec.md §4.6 "Protocol with the model client").
#[derive(Debug, Clone)]
pub enum ModelChunk {
  TextDelta { text: String },
  ToolCall { id: String, name: String, args: Value },
  ToolResult { id: String, name: String, result: Value },
}

/// Transport-level failure from the provider, still carrying enough
/// information (an HTTP status when there is one) for the publisher
/// boundary to apply the translation table in spec.md §4.6.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ModelError {
  #[error("http {status}: {message}")]
  Http { status: u16, message: String },
  #[error("model stream error: {0}")]
  Stream(String),
}

/// Maps a [`ModelError`] to the user-facing message spec.md §4.6
/// prescribes. This translation happens at exactly one place, the
/// publisher boundary, per Design Notes' "Exception-based control flow"
/// redesign item.
pub fn translate_error(err: &ModelError) -> String {
  match err {
    ModelError::Http { status: 401, .. } => "Invalid or expired API key".to_string(),
    ModelError::Http { status: 429, .. } => "Rate limit exceeded".to_string(),
    ModelError::Http { status: 500, .. } => "Provider server error".to_string(),
    ModelError::Http { status, .. } => format!("API error ({status})"),
    ModelError::Stream(message) => message.clone(),
  }
}

pub type ModelStream =
  Pin<Box<dyn Stream<Item = Result<ModelChunk, ModelError>> + Send>>;

/// A single turn handed to the model: the running conversation plus the
/// newest task/chat message, and the tool runtime the client's own stream
/// dispatches calls through. Tool execution happens inside the client
/// implementation (spec.md §4.6's chunk list already includes
/// `tool-result`, meaning the client yields it - the publisher only
/// reacts), so a real client is handed the executor directly rather than
/// a bare list of names.
#[derive(Clone)]
pub struct ModelRequest {
  pub model: String,
  pub api_key: String,
  pub messages: Vec<ModelMessage>,
  pub tools: Option<Arc<ToolExecutor>>,
}

#[derive(Debug, Clone)]
pub struct ModelMessage {
  pub role: ModelRole,
  pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelRole {
  User,
  Assistant,
}

/// The provider SDK boundary (spec.md §1, explicitly out of scope beyond
/// this contract). One implementation is provided below
/// ([`OpenAiCompatibleClient`]), speaking OpenRouter's OpenAI-compatible
/// chat-completions wire format via `async-openai` pointed at a custom
/// base URL; tests exercise the publisher against a stub implementation
/// instead of a live provider.
pub trait ModelClient: Send + Sync {
  fn stream(&self, request: ModelRequest) -> ModelStream;
}

pub struct OpenAiCompatibleClient {
  client: async_openai::Client<async_openai::config::OpenAIConfig>,
}

impl OpenAiCompatibleClient {
  /// `base_url` lets this point at OpenRouter (or any other
  /// OpenAI-compatible endpoint) instead of api.openai.com; the per-request
  /// `api_key` in [`ModelRequest`] overrides whatever static key the
  /// config carries, since each agent run supplies its own.
  pub fn new(base_url: &str) -> Self {
    let config = async_openai::config::OpenAIConfig::new().with_api_base(base_url);
    OpenAiCompatibleClient { client: async_openai::Client::with_config(config) }
  }
}

impl ModelClient for OpenAiCompatibleClient {
  fn stream(&self, request: ModelRequest) -> ModelStream {
    use async_openai::types::{
      ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestUserMessageArgs,
      ChatCompletionToolArgs, ChatCompletionToolType, CreateChatCompletionRequestArgs,
      FunctionObjectArgs,
    };
    use futures_util::StreamExt;

    let client =
      self.client.with_config(async_openai::config::OpenAIConfig::new().with_api_key(&request.api_key));

    let mut messages = Vec::new();
    for m in &request.messages {
      match m.role {
        ModelRole::User => {
          if let Ok(msg) =
            ChatCompletionRequestUserMessageArgs::default().content(m.content.clone()).build()
          {
            messages.push(msg.into());
          }
        }
        ModelRole::Assistant => {
          if let Ok(msg) = ChatCompletionRequestAssistantMessageArgs::default()
            .content(m.content.clone())
            .build()
          {
            messages.push(msg.into());
          }
        }
      }
    }

    let tools = request.tools.clone();
    let tool_schema: Vec<_> = crate::tools::KNOWN_TOOL_NAMES
      .iter()
      .filter_map(|name| {
        let function = FunctionObjectArgs::default()
          .name(*name)
          .parameters(serde_json::json!({ "type": "object" }))
          .build()
          .ok()?;
        ChatCompletionToolArgs::default().r#type(ChatCompletionToolType::Function).function(function).build().ok()
      })
      .collect();

    let mut builder = CreateChatCompletionRequestArgs::default();
    builder.model(request.model.clone()).messages(messages).stream(true);
    if tools.is_some() && !tool_schema.is_empty() {
      builder.tools(tool_schema);
    }
    let built = builder.build();

    Box::pin(async_stream::stream! {
      let built = match built {
        Ok(b) => b,
        Err(e) => {
          yield Err(ModelError::Stream(e.to_string()));
          return;
        }
      };
      let mut upstream = match client.chat().create_stream(built).await {
        Ok(s) => s,
        Err(e) => {
          yield Err(classify_openai_error(&e));
          return;
        }
      };
      // Streamed tool calls arrive as fragments keyed by index: the id and
      // function name usually land in the first fragment, `arguments`
      // trickles in across many; only the finished accumulation parses as
      // JSON, so fragments are buffered per index until the provider signals
      // the call is complete.
      let mut anon_call_count: u64 = 0;
      let mut pending: std::collections::BTreeMap<u32, PendingToolCall> = std::collections::BTreeMap::new();

      while let Some(next) = upstream.next().await {
        match next {
          Ok(response) => {
            for choice in response.choices {
              if let Some(text) = choice.delta.content {
                if !text.is_empty() {
                  yield Ok(ModelChunk::TextDelta { text });
                }
              }
              if let Some(tool_calls) = choice.delta.tool_calls {
                for call in tool_calls {
                  let entry = pending.entry(call.index).or_insert_with(PendingToolCall::default);
                  if let Some(id) = call.id.filter(|id| !id.is_empty()) {
                    entry.id = Some(id);
                  }
                  if let Some(function) = call.function {
                    if let Some(name) = function.name {
                      entry.name.push_str(&name);
                    }
                    if let Some(fragment) = function.arguments {
                      entry.args_buffer.push_str(&fragment);
                    }
                  }
                }
              }
              if choice.finish_reason.is_some() {
                for (_, call) in std::mem::take(&mut pending) {
                  let id = call.id.unwrap_or_else(|| {
                    anon_call_count += 1;
                    format!("call-{anon_call_count}")
                  });
                  let args = serde_json::from_str::<Value>(&call.args_buffer).unwrap_or(Value::Null);
                  yield Ok(ModelChunk::ToolCall { id: id.clone(), name: call.name.clone(), args: args.clone() });

                  // The client executes the call itself and yields the
                  // result as its own chunk (spec.md §4.6: the model
                  // client's chunk set already includes `tool-result`).
                  if let Some(tools) = &tools {
                    let result = match tools.execute(&call.name, args).await {
                      Ok(value) => value,
                      Err(e) => serde_json::json!({ "error": e.to_string() }),
                    };
                    yield Ok(ModelChunk::ToolResult { id, name: call.name, result });
                  }
                }
              }
            }
          }
          Err(e) => {
            yield Err(classify_openai_error(&e));
            return;
          }
        }
      }
    })
  }
}

#[derive(Default)]
struct PendingToolCall {
  id: Option<String>,
  name: String,
  args_buffer: String,
}

fn classify_openai_error(err: &async_openai::error::OpenAIError) -> ModelError {
  use async_openai::error::OpenAIError;
  match err {
    OpenAIError::ApiError(api_err) => {
      let status = api_err
        .code
        .as_deref()
        .and_then(|c| c.parse::<u16>().ok())
        .unwrap_or(0);
      ModelError::Http { status, message: api_err.message.clone() }
    }
    OpenAIError::Reqwest(e) => {
      let status = e.status().map(|s| s.as_u16()).unwrap_or(0);
      ModelError::Http { status, message: e.to_string() }
    }
    other => ModelError::Stream(other.to_string()),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn translates_known_status_codes() {
    assert_eq!(
      translate_error(&ModelError::Http { status: 401, message: "x".into() }),
      "Invalid or expired API key"
    );
    assert_eq!(
      translate_error(&ModelError::Http { status: 429, message: "x".into() }),
      "Rate limit exceeded"
    );
    assert_eq!(
      translate_error(&ModelError::Http { status: 500, message: "x".into() }),
      "Provider server error"
    );
    assert_eq!(
      translate_error(&ModelError::Http { status: 503, message: "x".into() }),
      "API error (503)"
    );
  }

  #[test]
  fn translates_non_http_errors_generically() {
    assert_eq!(translate_error(&ModelError::Stream("boom".into())), "boom");
  }
}
