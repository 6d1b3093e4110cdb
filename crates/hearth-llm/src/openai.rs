//! OpenAI-compatible chat-completions backend.
//!
//! Works against OpenAI itself and against gateway-style proxies that speak
//! the same wire format; proxies usually need extra headers, which the config
//! carries. Streaming tool-call deltas are translated into
//! [`ToolCallFragment`]s keyed by the call id the provider announces on the
//! first delta of each tool index.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::{Client, Response, header};
use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::time::Duration;

use crate::backend::{LlmBackend, ResponseStream, StreamEvent, ToolCallFragment};
use crate::error::{LlmError, Result};
use crate::types::{CompletionRequest, CompletionResponse, ContentBlock, Role, StopReason, Usage};

/// Default OpenAI API base URL.
pub const DEFAULT_OPENAI_BASE: &str = "https://api.openai.com/v1";

/// Default timeout for requests.
const DEFAULT_TIMEOUT_SECS: u64 = 120;

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Configuration for the OpenAI-compatible backend.
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    /// Provider id. Circuit breakers and usage records are keyed by it.
    pub name: String,

    /// Base URL for the API (without `/chat/completions`).
    pub base_url: String,

    /// Bearer token. Optional for proxies that authenticate by header.
    pub api_key: Option<String>,

    /// Model to pin this backend to.
    pub model: Option<String>,

    /// Request timeout.
    pub timeout: Duration,

    /// Extra headers sent with every request.
    pub headers: Vec<(String, String)>,
}

impl OpenAiConfig {
    /// Config for api.openai.com.
    pub fn openai(api_key: impl Into<String>) -> Self {
        Self {
            name: "openai".to_string(),
            base_url: DEFAULT_OPENAI_BASE.to_string(),
            api_key: Some(api_key.into()),
            model: None,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            headers: Vec::new(),
        }
    }

    /// Config for any OpenAI-compatible endpoint.
    pub fn compatible(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            api_key: None,
            model: None,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            headers: Vec::new(),
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Add a header sent with every request.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// OpenAI Backend
// ─────────────────────────────────────────────────────────────────────────────

/// OpenAI-compatible API backend.
pub struct OpenAiBackend {
    client: Client,
    config: OpenAiConfig,
}

impl OpenAiBackend {
    /// Create a backend. Fails on headers that are not valid HTTP.
    pub fn new(config: OpenAiConfig) -> Result<Self> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        if let Some(ref key) = config.api_key {
            let value = header::HeaderValue::from_str(&format!("Bearer {}", key))
                .map_err(|e| LlmError::Config(format!("Invalid API key: {}", e)))?;
            headers.insert(header::AUTHORIZATION, value);
        }
        for (name, value) in &config.headers {
            let name = header::HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| LlmError::Config(format!("Invalid header name '{}': {}", name, e)))?;
            let value = header::HeaderValue::from_str(value)
                .map_err(|e| LlmError::Config(format!("Invalid header value for '{}': {}", name, e)))?;
            headers.insert(name, value);
        }

        let client = Client::builder()
            .timeout(config.timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| LlmError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }

    /// Convert our CompletionRequest to the chat-completions wire format.
    fn to_openai_request(&self, request: &CompletionRequest) -> OpenAiChatRequest {
        let mut messages: Vec<OpenAiMessage> = Vec::new();

        if let Some(ref system) = request.system {
            messages.push(OpenAiMessage::text("system", system.clone()));
        }

        for m in &request.messages {
            let blocks = m.content.blocks();
            let mut text = String::new();
            let mut tool_calls = Vec::new();
            let mut tool_results = Vec::new();

            for block in blocks {
                match block {
                    ContentBlock::Text { text: t } => text.push_str(&t),
                    ContentBlock::ToolUse { id, name, input } => tool_calls.push(OpenAiToolCall {
                        id,
                        call_type: "function".to_string(),
                        function: OpenAiFunctionCall {
                            name,
                            arguments: input.to_string(),
                        },
                    }),
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        ..
                    } => tool_results.push((tool_use_id, content)),
                }
            }

            if !tool_results.is_empty() {
                for (tool_call_id, content) in tool_results {
                    messages.push(OpenAiMessage {
                        role: "tool".to_string(),
                        content: Some(content),
                        tool_calls: None,
                        tool_call_id: Some(tool_call_id),
                    });
                }
            } else if !tool_calls.is_empty() {
                messages.push(OpenAiMessage {
                    role: "assistant".to_string(),
                    content: (!text.is_empty()).then_some(text),
                    tool_calls: Some(tool_calls),
                    tool_call_id: None,
                });
            } else {
                let role = match m.role {
                    Role::User => "user",
                    Role::Assistant => "assistant",
                };
                messages.push(OpenAiMessage::text(role, text));
            }
        }

        let tools = (!request.tools.is_empty()).then(|| {
            request
                .tools
                .iter()
                .map(|t| OpenAiTool {
                    tool_type: "function".to_string(),
                    function: OpenAiFunction {
                        name: t.name.clone(),
                        description: Some(t.description.clone()),
                        parameters: t.input_schema.clone(),
                    },
                })
                .collect()
        });

        let model = self
            .config
            .model
            .clone()
            .unwrap_or_else(|| request.model.clone());

        OpenAiChatRequest {
            model,
            messages,
            max_tokens: Some(request.max_tokens),
            temperature: request.temperature,
            stream: request.stream.then_some(true),
            stream_options: request
                .stream
                .then_some(OpenAiStreamOptions { include_usage: true }),
            tools,
        }
    }

    async fn send(&self, body: &OpenAiChatRequest) -> Result<Response> {
        tracing::debug!(
            backend = %self.config.name,
            model = %body.model,
            messages = body.messages.len(),
            tools = body.tools.as_ref().map(|t| t.len()).unwrap_or(0),
            stream = body.stream.unwrap_or(false),
            "Sending chat completion request"
        );

        let response = self
            .client
            .post(self.completions_url())
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        Ok(response)
    }
}

/// Map an unsuccessful HTTP response to an error.
async fn error_from_response(response: Response) -> LlmError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<OpenAiErrorResponse>(&body)
        .map(|e| e.error.message)
        .unwrap_or_else(|_| body.clone());
    error_for_status(status, message)
}

fn error_for_status(status: u16, message: String) -> LlmError {
    match status {
        401 | 403 => LlmError::Auth(format!("HTTP {}: {}", status, message)),
        429 => LlmError::RateLimit(message),
        400 | 404 | 422 => LlmError::InvalidRequest(format!("HTTP {}: {}", status, message)),
        _ => LlmError::Backend(format!("HTTP {}: {}", status, message)),
    }
}

#[async_trait]
impl LlmBackend for OpenAiBackend {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let mut request = request;
        request.stream = false;

        let response = self.send(&self.to_openai_request(&request)).await?;
        let body = response.text().await?;
        let parsed: OpenAiChatResponse = serde_json::from_str(&body)?;
        Ok(parsed.into())
    }

    async fn complete_stream(&self, request: CompletionRequest) -> Result<ResponseStream> {
        let mut request = request;
        request.stream = true;

        let response = self.send(&self.to_openai_request(&request)).await?;
        Ok(parse_sse_stream(response.bytes_stream()))
    }

    fn name(&self) -> &str {
        &self.config.name
    }

    fn model(&self) -> Option<&str> {
        self.config.model.as_deref()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Wire Types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, serde::Serialize)]
struct OpenAiChatRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<OpenAiStreamOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<OpenAiTool>>,
}

#[derive(Debug, serde::Serialize)]
struct OpenAiStreamOptions {
    include_usage: bool,
}

#[derive(Debug, serde::Serialize)]
struct OpenAiMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OpenAiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl OpenAiMessage {
    fn text(role: &str, content: String) -> Self {
        Self {
            role: role.to_string(),
            content: Some(content),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

#[derive(Debug, serde::Serialize)]
struct OpenAiTool {
    #[serde(rename = "type")]
    tool_type: String,
    function: OpenAiFunction,
}

#[derive(Debug, serde::Serialize)]
struct OpenAiFunction {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    parameters: serde_json::Value,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct OpenAiToolCall {
    id: String,
    #[serde(rename = "type", default = "function_type")]
    call_type: String,
    function: OpenAiFunctionCall,
}

fn function_type() -> String {
    "function".to_string()
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct OpenAiFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, serde::Deserialize)]
struct OpenAiChatResponse {
    id: String,
    choices: Vec<OpenAiChoice>,
    model: String,
    usage: Option<OpenAiUsage>,
}

impl From<OpenAiChatResponse> for CompletionResponse {
    fn from(resp: OpenAiChatResponse) -> Self {
        let mut content = Vec::new();
        let mut stop_reason = StopReason::EndTurn;

        if let Some(choice) = resp.choices.into_iter().next() {
            if let Some(text) = choice.message.content.filter(|t| !t.is_empty()) {
                content.push(ContentBlock::text(text));
            }
            for tc in choice.message.tool_calls.unwrap_or_default() {
                // Unparsable arguments are kept as a raw string so the caller
                // can decide what to do with them.
                let input = serde_json::from_str(&tc.function.arguments)
                    .unwrap_or(serde_json::Value::String(tc.function.arguments));
                content.push(ContentBlock::tool_use(tc.id, tc.function.name, input));
            }
            stop_reason = stop_reason_from(choice.finish_reason.as_deref());
        }

        let usage = resp.usage.map(Usage::from).unwrap_or_default();
        CompletionResponse::new(resp.id, resp.model, content, stop_reason, usage)
    }
}

fn stop_reason_from(reason: Option<&str>) -> StopReason {
    match reason {
        Some("tool_calls") | Some("function_call") => StopReason::ToolUse,
        Some("length") => StopReason::MaxTokens,
        _ => StopReason::EndTurn,
    }
}

#[derive(Debug, serde::Deserialize)]
struct OpenAiChoice {
    message: OpenAiResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct OpenAiResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<OpenAiToolCall>>,
}

#[derive(Debug, Clone, Copy, serde::Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

impl From<OpenAiUsage> for Usage {
    fn from(u: OpenAiUsage) -> Self {
        Usage::new(u.prompt_tokens, u.completion_tokens)
    }
}

#[derive(Debug, serde::Deserialize)]
struct OpenAiErrorResponse {
    error: OpenAiError,
}

#[derive(Debug, serde::Deserialize)]
struct OpenAiError {
    message: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// SSE Streaming
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, serde::Deserialize)]
struct OpenAiStreamChunk {
    #[serde(default)]
    id: String,
    #[serde(default)]
    model: String,
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
    usage: Option<OpenAiUsage>,
    error: Option<OpenAiError>,
}

#[derive(Debug, serde::Deserialize)]
struct OpenAiStreamChoice {
    delta: Option<OpenAiStreamDelta>,
    finish_reason: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct OpenAiStreamDelta {
    content: Option<String>,
    tool_calls: Option<Vec<OpenAiStreamToolCall>>,
}

#[derive(Debug, serde::Deserialize)]
struct OpenAiStreamToolCall {
    #[serde(default)]
    index: usize,
    id: Option<String>,
    function: Option<OpenAiStreamFunction>,
}

#[derive(Debug, serde::Deserialize)]
struct OpenAiStreamFunction {
    name: Option<String>,
    arguments: Option<String>,
}

/// A tool index's call id and the next fragment sequence number.
#[derive(Debug)]
struct CallSlot {
    id: String,
    next_sequence: usize,
}

/// Turns SSE `data:` lines into stream events.
#[derive(Debug, Default)]
struct ChunkDecoder {
    started: bool,
    calls: HashMap<usize, CallSlot>,
    stop_reason: Option<StopReason>,
    usage: Usage,
    done: bool,
}

impl ChunkDecoder {
    /// Decode one line. Lines that are not `data:` frames are ignored.
    fn decode_line(&mut self, line: &str, out: &mut VecDeque<Result<StreamEvent>>) {
        let Some(data) = line.strip_prefix("data:").map(str::trim) else {
            return;
        };

        if data == "[DONE]" {
            self.finish(out);
            return;
        }

        let chunk: OpenAiStreamChunk = match serde_json::from_str(data) {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::debug!(error = %e, "Skipping unparsable stream chunk");
                return;
            }
        };

        if let Some(error) = chunk.error {
            out.push_back(Ok(StreamEvent::Error {
                message: error.message,
            }));
            self.done = true;
            return;
        }

        if !self.started {
            self.started = true;
            out.push_back(Ok(StreamEvent::MessageStart {
                id: chunk.id,
                model: chunk.model,
            }));
        }

        if let Some(usage) = chunk.usage {
            self.usage = usage.into();
        }

        for choice in chunk.choices {
            if let Some(delta) = choice.delta {
                if let Some(text) = delta.content.filter(|t| !t.is_empty()) {
                    out.push_back(Ok(StreamEvent::TextDelta(text)));
                }
                for tc in delta.tool_calls.unwrap_or_default() {
                    out.push_back(Ok(StreamEvent::ToolCallDelta(self.fragment(tc))));
                }
            }
            if let Some(reason) = choice.finish_reason {
                self.stop_reason = Some(stop_reason_from(Some(&reason)));
            }
        }
    }

    /// Map a tool-call delta to a fragment of the call at its index.
    fn fragment(&mut self, tc: OpenAiStreamToolCall) -> ToolCallFragment {
        let slot = self.calls.entry(tc.index).or_insert_with(|| CallSlot {
            id: tc
                .id
                .clone()
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| format!("call_{}", tc.index)),
            next_sequence: 0,
        });
        let sequence_index = slot.next_sequence;
        slot.next_sequence += 1;

        let (name_part, args_part) = tc
            .function
            .map(|f| (f.name.unwrap_or_default(), f.arguments.unwrap_or_default()))
            .unwrap_or_default();

        ToolCallFragment {
            call_id: slot.id.clone(),
            name_part,
            args_part,
            sequence_index,
        }
    }

    fn finish(&mut self, out: &mut VecDeque<Result<StreamEvent>>) {
        if self.done {
            return;
        }
        self.done = true;
        out.push_back(Ok(StreamEvent::MessageDelta {
            stop_reason: self.stop_reason.unwrap_or(StopReason::EndTurn),
            usage: self.usage,
        }));
        out.push_back(Ok(StreamEvent::MessageStop));
    }
}

struct SseState {
    byte_stream: Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>,
    buffer: Vec<u8>,
    decoder: ChunkDecoder,
    pending: VecDeque<Result<StreamEvent>>,
}

/// Decode one raw line. Lines are only decoded once complete, so multi-byte
/// characters split across network chunks survive.
fn decode_raw_line(
    decoder: &mut ChunkDecoder,
    line: &[u8],
    out: &mut VecDeque<Result<StreamEvent>>,
) {
    match std::str::from_utf8(line) {
        Ok(line) => decoder.decode_line(line.trim(), out),
        Err(e) => {
            decoder.done = true;
            out.push_back(Err(LlmError::Serialization(format!(
                "Invalid UTF-8 in event stream: {}",
                e
            ))));
        }
    }
}

fn parse_sse_stream(
    byte_stream: impl Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
) -> ResponseStream {
    Box::pin(futures::stream::unfold(
        SseState {
            byte_stream: Box::pin(byte_stream),
            buffer: Vec::new(),
            decoder: ChunkDecoder::default(),
            pending: VecDeque::new(),
        },
        |mut state| async move {
            loop {
                if let Some(item) = state.pending.pop_front() {
                    return Some((item, state));
                }
                if state.decoder.done {
                    return None;
                }

                while !state.decoder.done
                    && let Some(line_end) = state.buffer.iter().position(|&b| b == b'\n')
                {
                    let line: Vec<u8> = state.buffer.drain(..=line_end).collect();
                    decode_raw_line(&mut state.decoder, &line, &mut state.pending);
                }
                if !state.pending.is_empty() {
                    continue;
                }

                match state.byte_stream.next().await {
                    Some(Ok(bytes)) => state.buffer.extend_from_slice(&bytes),
                    Some(Err(e)) => {
                        state.decoder.done = true;
                        return Some((Err(LlmError::from(e)), state));
                    }
                    None => {
                        let rest = std::mem::take(&mut state.buffer);
                        decode_raw_line(&mut state.decoder, &rest, &mut state.pending);
                        if state.decoder.done {
                            continue;
                        }
                        if state.decoder.stop_reason.is_some() {
                            state.decoder.finish(&mut state.pending);
                        } else if !state.decoder.done {
                            state.decoder.done = true;
                            state.pending.push_back(Err(LlmError::Network(
                                "Stream ended before completion".to_string(),
                            )));
                        }
                    }
                }
            }
        },
    ))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
