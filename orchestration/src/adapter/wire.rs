//! Request/response shapes for each provider protocol.
//!
//! Everything here is pure: build the outbound body for a
//! [`BackendRequest`], decode a reply body into a [`BackendReply`].

use serde::{Deserialize, Serialize};

use super::{BackendReply, BackendRequest, TokenUsage};
use crate::errors::BackendError;
use crate::registry::ProviderKind;

/// Header value required by the Anthropic Messages API.
pub const ANTHROPIC_VERSION: &str = "2023-06-01";
/// Anthropic requires `max_tokens`; used when the provider sets none.
const ANTHROPIC_DEFAULT_MAX_TOKENS: u32 = 1024;

/// Full URL of the completion endpoint for `kind`.
pub fn endpoint(kind: ProviderKind, base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    match kind {
        ProviderKind::OpenAiCompatible => format!("{base}/chat/completions"),
        ProviderKind::Anthropic => format!("{base}/v1/messages"),
        ProviderKind::Ollama => format!("{base}/api/chat"),
    }
}

#[derive(Debug, Serialize)]
pub struct ChatMessage<'a> {
    pub role: &'a str,
    pub content: &'a str,
}

#[derive(Debug, Serialize)]
pub struct OpenAiRequest<'a> {
    pub model: &'a str,
    pub messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct AnthropicRequest<'a> {
    pub model: &'a str,
    pub system: &'a str,
    pub messages: Vec<ChatMessage<'a>>,
    pub max_tokens: u32,
}

#[derive(Debug, Serialize)]
pub struct OllamaOptions {
    pub num_predict: u32,
}

#[derive(Debug, Serialize)]
pub struct OllamaRequest<'a> {
    pub model: &'a str,
    pub messages: Vec<ChatMessage<'a>>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<OllamaOptions>,
}

/// Outbound body for any provider kind.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum WireRequest<'a> {
    OpenAi(OpenAiRequest<'a>),
    Anthropic(AnthropicRequest<'a>),
    Ollama(OllamaRequest<'a>),
}

/// User/assistant turns in chronological order, ending with the new message.
fn conversation(request: &BackendRequest) -> Vec<ChatMessage<'_>> {
    let mut messages = Vec::with_capacity(request.history.len() * 2 + 1);
    for turn in &request.history {
        messages.push(ChatMessage {
            role: "user",
            content: &turn.user,
        });
        messages.push(ChatMessage {
            role: "assistant",
            content: &turn.assistant,
        });
    }
    messages.push(ChatMessage {
        role: "user",
        content: &request.message,
    });
    messages
}

pub fn encode_request<'a>(
    kind: ProviderKind,
    model: &'a str,
    max_tokens: Option<u32>,
    request: &'a BackendRequest,
) -> WireRequest<'a> {
    match kind {
        ProviderKind::OpenAiCompatible => {
            let mut messages = vec![ChatMessage {
                role: "system",
                content: &request.system_prompt,
            }];
            messages.extend(conversation(request));
            WireRequest::OpenAi(OpenAiRequest {
                model,
                messages,
                max_tokens,
            })
        }
        ProviderKind::Anthropic => WireRequest::Anthropic(AnthropicRequest {
            model,
            system: &request.system_prompt,
            messages: conversation(request),
            max_tokens: max_tokens.unwrap_or(ANTHROPIC_DEFAULT_MAX_TOKENS),
        }),
        ProviderKind::Ollama => {
            let mut messages = vec![ChatMessage {
                role: "system",
                content: &request.system_prompt,
            }];
            messages.extend(conversation(request));
            WireRequest::Ollama(OllamaRequest {
                model,
                messages,
                stream: false,
                options: max_tokens.map(|num_predict| OllamaOptions { num_predict }),
            })
        }
    }
}

#[derive(Debug, Deserialize)]
struct OpenAiReply {
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
    #[serde(default)]
    confidence: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: ReplyMessage,
}

#[derive(Debug, Deserialize)]
struct ReplyMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct AnthropicReply {
    content: Vec<AnthropicBlock>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
    #[serde(default)]
    confidence: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct AnthropicBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct OllamaReply {
    message: ReplyMessage,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
    #[serde(default)]
    confidence: Option<f64>,
}

/// Decode a successful reply body.
pub fn decode_reply(kind: ProviderKind, body: &[u8]) -> Result<BackendReply, BackendError> {
    let decode_err = |e: serde_json::Error| BackendError::Decode(e.to_string());

    let (text, usage, confidence) = match kind {
        ProviderKind::OpenAiCompatible => {
            let reply: OpenAiReply = serde_json::from_slice(body).map_err(decode_err)?;
            let text = reply
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.message.content)
                .unwrap_or_default();
            let usage = reply.usage.map(|u| TokenUsage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
            });
            (text, usage, reply.confidence)
        }
        ProviderKind::Anthropic => {
            let reply: AnthropicReply = serde_json::from_slice(body).map_err(decode_err)?;
            let text = reply
                .content
                .into_iter()
                .filter(|b| b.kind == "text")
                .filter_map(|b| b.text)
                .collect::<Vec<_>>()
                .join("");
            let usage = reply.usage.map(|u| TokenUsage {
                input_tokens: u.input_tokens,
                output_tokens: u.output_tokens,
            });
            (text, usage, reply.confidence)
        }
        ProviderKind::Ollama => {
            let reply: OllamaReply = serde_json::from_slice(body).map_err(decode_err)?;
            let usage = match (reply.prompt_eval_count, reply.eval_count) {
                (None, None) => None,
                (input, output) => Some(TokenUsage {
                    input_tokens: input.unwrap_or(0),
                    output_tokens: output.unwrap_or(0),
                }),
            };
            (reply.message.content.unwrap_or_default(), usage, reply.confidence)
        }
    };

    if text.trim().is_empty() {
        return Err(BackendError::Decode("empty completion".to_string()));
    }

    Ok(BackendReply {
        text,
        confidence: confidence.filter(|c| c.is_finite()).map(|c| c.clamp(0.0, 1.0)),
        usage,
    })
}
