//! OpenAI Chat Completions reasoning model.
//!
//! The run's tools are offered as function tools. Each scratch-pad entry is
//! replayed as an assistant tool call followed by its tool result, so the
//! model sees the whole history on every step.

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::config::{TetherConfig, DEFAULT_OPENAI_BASE_URL};
use crate::error::{Result, TetherError};

use super::{ModelAction, PlanOutcome, PlanningRequest, ReasoningModel, ToolDecision, Usage};

const MAX_FUNCTION_NAME_LEN: usize = 64;

pub struct OpenAiChatModel {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    temperature: Option<f64>,
    max_tokens: Option<u32>,
}

impl OpenAiChatModel {
    pub fn new(model: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: DEFAULT_OPENAI_BASE_URL.to_string(),
            model: model.into(),
            temperature: None,
            max_tokens: None,
        }
    }

    /// Build from `TetherConfig`; fails when no API key is configured.
    pub fn from_config(config: &TetherConfig) -> Result<Self> {
        let api_key = config.openai_api_key().ok_or_else(|| {
            TetherError::Configuration("OPENAI_API_KEY is not set".to_string())
        })?;
        Ok(Self::new(config.model.clone(), api_key).with_base_url(config.openai_base_url.clone()))
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    fn build_request_body(&self, request: &PlanningRequest, names: &FunctionNames) -> Value {
        let mut messages = Vec::with_capacity(2 + request.scratchpad.len() * 2);
        if let Some(system) = &request.system_prompt {
            messages.push(json!({ "role": "system", "content": system }));
        }
        messages.push(json!({ "role": "user", "content": request.goal }));

        for entry in &request.scratchpad {
            let call_id = format!("call_{}", entry.step);
            messages.push(json!({
                "role": "assistant",
                "content": entry.decision.reasoning,
                "tool_calls": [{
                    "id": call_id,
                    "type": "function",
                    "function": {
                        "name": names.to_wire(&entry.decision.name),
                        "arguments": entry.decision.arguments.to_string(),
                    }
                }],
            }));
            messages.push(json!({
                "role": "tool",
                "tool_call_id": call_id,
                "content": entry.observation.to_model_text(),
            }));
        }

        let mut body = json!({
            "model": self.model,
            "messages": messages,
        });
        let Some(obj) = body.as_object_mut() else {
            return body;
        };
        if let Some(temperature) = self.temperature {
            obj.insert("temperature".into(), temperature.into());
        }
        if let Some(max) = self.max_tokens {
            obj.insert("max_tokens".into(), max.into());
        }
        if !request.tools.is_empty() {
            let tool_defs: Vec<Value> = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": names.to_wire(&t.name),
                            "description": t.description.clone().unwrap_or_default(),
                            "parameters": t.input_schema,
                        }
                    })
                })
                .collect();
            obj.insert("tools".into(), tool_defs.into());
        }
        body
    }
}

#[async_trait]
impl ReasoningModel for OpenAiChatModel {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn plan(&self, request: &PlanningRequest) -> Result<PlanOutcome> {
        let names = FunctionNames::new(request.tools.iter().map(|t| t.name.as_str()));
        let body = self.build_request_body(request, &names);
        let url = format!("{}/chat/completions", self.base_url);

        debug!(model = %self.model, step = request.step, tools = request.tools.len(), "OpenAI plan");

        let resp = self
            .client
            .post(&url)
            .headers(bearer_headers(&self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| TetherError::ModelCapability(format!("request failed: {e}")))?;

        let status = resp.status().as_u16();
        if status != 200 {
            let body_text = resp.text().await.unwrap_or_default();
            return Err(TetherError::ModelCapability(format!(
                "HTTP {status}: {body_text}"
            )));
        }

        let data: OpenAiChatResponse = resp
            .json()
            .await
            .map_err(|e| TetherError::ModelCapability(format!("malformed response: {e}")))?;
        let usage = data.usage.map(OpenAiUsage::into_usage).unwrap_or_default();
        debug!(
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            "OpenAI usage"
        );
        let choice = data.choices.into_iter().next().ok_or_else(|| {
            TetherError::ModelCapability("no choices in OpenAI response".to_string())
        })?;

        let content = choice.message.content.filter(|c| !c.trim().is_empty());
        if let Some(call) = choice.message.tool_calls.unwrap_or_default().into_iter().next() {
            let arguments = if call.function.arguments.trim().is_empty() {
                json!({})
            } else {
                serde_json::from_str(&call.function.arguments)
                    .unwrap_or(Value::String(call.function.arguments))
            };
            let action = ModelAction::CallTool(ToolDecision {
                name: names.from_wire(&call.function.name),
                arguments,
                reasoning: content,
            });
            return Ok(PlanOutcome::new(action).with_usage(usage));
        }

        match content {
            Some(text) => Ok(PlanOutcome::new(ModelAction::Final { text }).with_usage(usage)),
            None => Err(TetherError::ModelCapability(
                "response had neither content nor tool calls".to_string(),
            )),
        }
    }
}

fn bearer_headers(api_key: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if let Ok(val) = HeaderValue::from_str(&format!("Bearer {api_key}")) {
        headers.insert(AUTHORIZATION, val);
    }
    headers
}

/// Function names must match `^[a-zA-Z0-9_-]{1,64}$`; tool names such as
/// `fs.read` are rewritten and mapped back on the way out.
struct FunctionNames {
    to_wire: HashMap<String, String>,
    from_wire: HashMap<String, String>,
}

impl FunctionNames {
    fn new<'a>(names: impl Iterator<Item = &'a str>) -> Self {
        let mut to_wire = HashMap::new();
        let mut from_wire = HashMap::new();
        for name in names {
            let base = sanitize_function_name(name);
            let mut wire = base.clone();
            let mut suffix = 2;
            while from_wire.contains_key(&wire) {
                let tag = format!("_{suffix}");
                let keep = base.len().min(MAX_FUNCTION_NAME_LEN - tag.len());
                wire = format!("{}{tag}", &base[..keep]);
                suffix += 1;
            }
            from_wire.insert(wire.clone(), name.to_string());
            to_wire.insert(name.to_string(), wire);
        }
        Self { to_wire, from_wire }
    }

    fn to_wire(&self, name: &str) -> String {
        self.to_wire
            .get(name)
            .cloned()
            .unwrap_or_else(|| sanitize_function_name(name))
    }

    fn from_wire(&self, wire: &str) -> String {
        self.from_wire
            .get(wire)
            .cloned()
            .unwrap_or_else(|| wire.to_string())
    }
}

fn sanitize_function_name(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .take(MAX_FUNCTION_NAME_LEN)
        .collect();
    if out.is_empty() {
        out.push('_');
    }
    out
}

// OpenAI API response types (internal)

#[derive(Deserialize)]
struct OpenAiChatResponse {
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: Option<u64>,
}

impl OpenAiUsage {
    fn into_usage(self) -> Usage {
        let mut usage = Usage::new(self.prompt_tokens, self.completion_tokens);
        if let Some(total) = self.total_tokens {
            usage.total_tokens = total;
        }
        usage
    }
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Deserialize)]
struct OpenAiMessage {
    content: Option<String>,
    tool_calls: Option<Vec<OpenAiToolCall>>,
}

#[derive(Deserialize)]
struct OpenAiToolCall {
    function: OpenAiFunction,
}

#[derive(Deserialize)]
struct OpenAiFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_loop::{Observation, ScratchpadEntry};
    use crate::tools::ToolSchema;

    fn request_with_history() -> PlanningRequest {
        PlanningRequest {
            goal: "compute 5+7".into(),
            system_prompt: Some("be brief".into()),
            tools: vec![ToolSchema::new("math.sum", json!({"type": "object"}))
                .with_description("adds")],
            scratchpad: vec![ScratchpadEntry {
                step: 1,
                decision: ToolDecision::new("math.sum", json!({"a": 5, "b": 7})),
                observation: Observation::success(json!("12")),
                recorded_at: chrono::Utc::now(),
            }],
            step: 1,
            max_steps: 5,
        }
    }

    #[test]
    fn body_replays_scratchpad_as_tool_call_pairs() {
        let model = OpenAiChatModel::new("gpt-4o", "sk-test").with_temperature(0.0);
        let request = request_with_history();
        let names = FunctionNames::new(request.tools.iter().map(|t| t.name.as_str()));
        let body = model.build_request_body(&request, &names);

        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[1]["content"], "compute 5+7");
        assert_eq!(messages[2]["tool_calls"][0]["id"], "call_1");
        assert_eq!(messages[2]["tool_calls"][0]["function"]["name"], "math_sum");
        assert_eq!(messages[3]["role"], "tool");
        assert_eq!(messages[3]["tool_call_id"], "call_1");
        assert_eq!(messages[3]["content"], "12");
        assert_eq!(body["tools"][0]["function"]["name"], "math_sum");
        assert_eq!(body["temperature"], 0.0);
    }

    #[test]
    fn function_names_round_trip_and_disambiguate() {
        let names = FunctionNames::new(["a.b", "a_b", "ok-name"].into_iter());
        assert_eq!(names.to_wire("a.b"), "a_b");
        assert_eq!(names.to_wire("a_b"), "a_b_2");
        assert_eq!(names.from_wire("a_b_2"), "a_b");
        assert_eq!(names.from_wire("ok-name"), "ok-name");
        assert_eq!(names.from_wire("unknown"), "unknown");
    }

    #[test]
    fn long_names_are_truncated() {
        let long = "x".repeat(80);
        assert_eq!(sanitize_function_name(&long).len(), MAX_FUNCTION_NAME_LEN);
        assert_eq!(sanitize_function_name(""), "_");
    }
}
