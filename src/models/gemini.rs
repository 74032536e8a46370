//! Google Gemini `generateContent` provider.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use super::{Candidate, ModelProvider, ModelResponse, ResponsePart};
use crate::capabilities::FunctionDeclaration;
use crate::session::{FunctionCall, FunctionResponse, Part, Turn};

/// Default Gemini API base URL.
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

// -- wire types --------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    contents: Vec<WireContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<WireContent>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireTool<'a> {
    function_declarations: &'a [FunctionDeclaration],
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig<'a> {
    response_mime_type: &'static str,
    response_schema: &'a Value,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct WireContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<WirePart>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_call: Option<WireFunctionCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_response: Option<FunctionResponse>,
    /// Part kinds this client does not understand.
    #[serde(flatten)]
    other: Map<String, Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFunctionCall {
    name: String,
    #[serde(default)]
    args: Option<Map<String, Value>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<WireCandidate>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireCandidate {
    #[serde(default)]
    content: Option<WireContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

fn text_content(text: &str) -> WireContent {
    WireContent {
        role: None,
        parts: vec![WirePart {
            text: Some(text.to_string()),
            ..Default::default()
        }],
    }
}

fn to_wire(turn: &Turn) -> WireContent {
    let parts = turn
        .parts()
        .iter()
        .map(|p| match p {
            Part::Text(t) => WirePart {
                text: Some(t.clone()),
                ..Default::default()
            },
            Part::FunctionCall(fc) => WirePart {
                function_call: Some(WireFunctionCall {
                    name: fc.name.clone(),
                    args: Some(fc.args.clone()),
                }),
                ..Default::default()
            },
            Part::FunctionResponse(fr) => WirePart {
                function_response: Some(fr.clone()),
                ..Default::default()
            },
        })
        .collect();
    WireContent {
        role: Some(turn.role().as_str().to_string()),
        parts,
    }
}

fn from_wire_part(part: WirePart) -> ResponsePart {
    if let Some(fc) = part.function_call {
        return ResponsePart::FunctionCall(FunctionCall {
            name: fc.name,
            args: fc.args.unwrap_or_default(),
        });
    }
    if let Some(text) = part.text {
        return ResponsePart::Text(text);
    }
    let kind = if part.function_response.is_some() {
        "functionResponse".to_string()
    } else {
        let keys: Vec<&str> = part.other.keys().map(String::as_str).collect();
        if keys.is_empty() {
            "empty part".to_string()
        } else {
            keys.join(",")
        }
    };
    ResponsePart::Unexpected(kind)
}

// -- provider ----------------------------------------------------------------

/// Provider that talks to the Gemini REST API.
pub struct GeminiProvider {
    api_key: String,
    base_url: String,
    model: String,
    client: Client,
}

impl GeminiProvider {
    pub fn new(
        api_key: &str,
        model: &str,
        base_url: &str,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build HTTP client: {e}"))?;
        Ok(Self {
            api_key: api_key.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            client,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn endpoint(&self) -> String {
        format!("{}/v1beta/models/{}:generateContent", self.base_url, self.model)
    }

    async fn post(&self, request: &GenerateRequest<'_>) -> anyhow::Result<GenerateResponse> {
        let resp = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", &self.api_key)
            .json(request)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!(
                "Gemini API returned {status}: {}",
                crate::utils::truncate_str(text.trim(), 300)
            );
        }

        let parsed: GenerateResponse = resp
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("invalid Gemini response: {e}"))?;

        if parsed.candidates.is_empty() {
            if let Some(reason) = parsed
                .prompt_feedback
                .as_ref()
                .and_then(|f| f.block_reason.as_deref())
            {
                anyhow::bail!("prompt blocked by Gemini: {reason}");
            }
        }
        Ok(parsed)
    }
}

#[async_trait]
impl ModelProvider for GeminiProvider {
    async fn generate(
        &self,
        history: &[Turn],
        system_instruction: &str,
        functions: &[FunctionDeclaration],
    ) -> anyhow::Result<ModelResponse> {
        let request = GenerateRequest {
            contents: history.iter().map(to_wire).collect(),
            system_instruction: (!system_instruction.is_empty())
                .then(|| text_content(system_instruction)),
            tools: if functions.is_empty() {
                Vec::new()
            } else {
                vec![WireTool {
                    function_declarations: functions,
                }]
            },
            generation_config: None,
        };
        debug!(
            model = %self.model,
            turns = history.len(),
            functions = functions.len(),
            "sending Gemini request"
        );

        let parsed = self.post(&request).await?;
        let candidates = parsed
            .candidates
            .into_iter()
            .map(|c| {
                if let Some(reason) = c.finish_reason.as_deref() {
                    debug!(finish_reason = reason, "candidate finished");
                }
                Candidate {
                    parts: c
                        .content
                        .map(|content| content.parts.into_iter().map(from_wire_part).collect())
                        .unwrap_or_default(),
                }
            })
            .collect();
        Ok(ModelResponse { candidates })
    }

    async fn generate_json(
        &self,
        history: &[Turn],
        system_instruction: &str,
        schema: &Value,
    ) -> anyhow::Result<String> {
        let request = GenerateRequest {
            contents: history.iter().map(to_wire).collect(),
            system_instruction: (!system_instruction.is_empty())
                .then(|| text_content(system_instruction)),
            tools: Vec::new(),
            generation_config: Some(GenerationConfig {
                response_mime_type: "application/json",
                response_schema: schema,
            }),
        };
        let parsed = self.post(&request).await?;
        let text: String = parsed
            .candidates
            .into_iter()
            .filter_map(|c| c.content)
            .flat_map(|c| c.parts)
            .filter_map(|p| p.text)
            .collect();
        if text.is_empty() {
            anyhow::bail!("Gemini returned no JSON content");
        }
        Ok(text)
    }
}
