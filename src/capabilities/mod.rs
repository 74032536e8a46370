//! Capability registry.
//!
//! A capability is a named, schema-described lookup the model may ask the
//! bot to perform (e.g. `get_my_ip`).  Capabilities are registered once at
//! startup into a [`CapabilityRegistry`]; the agent reads their
//! declarations into every model request and invokes them by name when the
//! model asks for one.
//!
//! Invocation never fails past the registry boundary: bad arguments,
//! unknown names, and upstream failures all come back as a
//! [`CapabilityResult`] carrying a single `error` key.

pub mod dota;
pub mod my_ip;
pub mod time;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::config::CapabilitiesConfig;
use crate::session::ChatId;

// ── CapabilityResult ────────────────────────────────────────

/// Untyped key/value result handed back to the model.
///
/// Either a success payload or exactly one `error` key.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(transparent)]
pub struct CapabilityResult(Map<String, Value>);

impl CapabilityResult {
    pub fn ok(payload: Map<String, Value>) -> Self {
        Self(payload)
    }

    /// A result containing only `{ "error": message }`.
    pub fn error(message: impl fmt::Display) -> Self {
        let mut map = Map::new();
        map.insert("error".into(), Value::String(message.to_string()));
        Self(map)
    }

    /// Wrap an arbitrary JSON value: objects are used as-is, anything else
    /// is nested under `key`.
    pub fn from_value(key: &str, value: Value) -> Self {
        match value {
            Value::Object(map) => Self(map),
            other => {
                let mut map = Map::new();
                map.insert(key.to_string(), other);
                Self(map)
            }
        }
    }

    pub fn is_error(&self) -> bool {
        self.0.contains_key("error")
    }

    pub fn error_message(&self) -> Option<&str> {
        self.0.get("error").and_then(Value::as_str)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }
}

impl From<Map<String, Value>> for CapabilityResult {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

// ── Descriptors ─────────────────────────────────────────────

/// Primitive type of a capability parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    String,
    Integer,
    Number,
    Boolean,
}

impl ParamKind {
    /// Schema type name as understood by the Gemini API.
    pub fn schema_type(&self) -> &'static str {
        match self {
            ParamKind::String => "STRING",
            ParamKind::Integer => "INTEGER",
            ParamKind::Number => "NUMBER",
            ParamKind::Boolean => "BOOLEAN",
        }
    }
}

/// One named parameter in a capability's input schema.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
    pub description: String,
    pub required: bool,
}

impl ParamSpec {
    pub fn required(name: &str, kind: ParamKind, description: &str) -> Self {
        Self {
            name: name.into(),
            kind,
            description: description.into(),
            required: true,
        }
    }

    pub fn optional(name: &str, kind: ParamKind, description: &str) -> Self {
        Self {
            required: false,
            ..Self::required(name, kind, description)
        }
    }
}

/// Function declaration sent to the model alongside each request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Per-invocation context: who asked, and where.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CallContext {
    pub chat_id: ChatId,
    pub sender_id: Option<i64>,
}

/// Coerced arguments passed to a handler.  Every declared required
/// parameter is present with the declared type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args(Map<String, Value>);

impl Args {
    pub fn str(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(Value::as_str)
    }

    pub fn i64(&self, name: &str) -> Option<i64> {
        self.0.get(name).and_then(Value::as_i64)
    }

    pub fn f64(&self, name: &str) -> Option<f64> {
        self.0.get(name).and_then(Value::as_f64)
    }

    pub fn bool(&self, name: &str) -> Option<bool> {
        self.0.get(name).and_then(Value::as_bool)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }
}

/// Async handler a capability is bound to.
pub type CapabilityHandler = Arc<
    dyn Fn(Args, CallContext) -> Pin<Box<dyn Future<Output = CapabilityResult> + Send>>
        + Send
        + Sync,
>;

/// A registered capability: descriptor plus bound handler.
#[derive(Clone)]
pub struct Capability {
    pub name: String,
    pub description: String,
    pub params: Vec<ParamSpec>,
    handler: CapabilityHandler,
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capability")
            .field("name", &self.name)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

impl Capability {
    pub fn new(
        name: &str,
        description: &str,
        params: Vec<ParamSpec>,
        handler: CapabilityHandler,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            params,
            handler,
        }
    }

    /// The declaration advertised to the model.
    pub fn declaration(&self) -> FunctionDeclaration {
        let mut properties = Map::new();
        for p in &self.params {
            let mut schema = json!({ "type": p.kind.schema_type() });
            if !p.description.is_empty() {
                schema["description"] = json!(p.description);
            }
            properties.insert(p.name.clone(), schema);
        }
        let required: Vec<&str> = self
            .params
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name.as_str())
            .collect();

        let mut parameters = json!({
            "type": "OBJECT",
            "properties": properties,
        });
        if !required.is_empty() {
            parameters["required"] = json!(required);
        }

        FunctionDeclaration {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters,
        }
    }

    /// Validate and coerce raw model-supplied arguments against the schema.
    ///
    /// Integers may arrive as whole floats (`3.0`) or numeric strings;
    /// strings may arrive as numbers.  Undeclared arguments are dropped.
    pub fn coerce_args(&self, raw: &Map<String, Value>) -> Result<Args, String> {
        let mut out = Map::new();
        for p in &self.params {
            let value = match raw.get(&p.name) {
                None | Some(Value::Null) => {
                    if p.required {
                        return Err(format!("missing required argument `{}`", p.name));
                    }
                    continue;
                }
                Some(v) => v,
            };
            let coerced = coerce_value(p.kind, value).ok_or_else(|| {
                format!(
                    "argument `{}` must be {}, got {}",
                    p.name,
                    kind_label(p.kind),
                    value
                )
            })?;
            out.insert(p.name.clone(), coerced);
        }
        for key in raw.keys() {
            if !self.params.iter().any(|p| &p.name == key) {
                debug!(capability = %self.name, argument = %key, "dropping undeclared argument");
            }
        }
        Ok(Args(out))
    }
}

fn kind_label(kind: ParamKind) -> &'static str {
    match kind {
        ParamKind::String => "a string",
        ParamKind::Integer => "an integer",
        ParamKind::Number => "a number",
        ParamKind::Boolean => "a boolean",
    }
}

fn coerce_value(kind: ParamKind, value: &Value) -> Option<Value> {
    match kind {
        ParamKind::String => match value {
            Value::String(s) => Some(Value::String(s.clone())),
            Value::Number(n) => Some(Value::String(match n.as_i64() {
                Some(i) => i.to_string(),
                None => match n.as_f64() {
                    Some(f) if f.fract() == 0.0 && f.abs() < 9.0e15 => (f as i64).to_string(),
                    _ => n.to_string(),
                },
            })),
            _ => None,
        },
        ParamKind::Integer => match value {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| {
                    n.as_f64()
                        .filter(|f| f.fract() == 0.0 && f.abs() < 9.0e15)
                        .map(|f| f as i64)
                })
                .map(Value::from),
            Value::String(s) => s.trim().parse::<i64>().ok().map(Value::from),
            _ => None,
        },
        ParamKind::Number => match value {
            Value::Number(n) => n.as_f64().map(Value::from),
            Value::String(s) => s.trim().parse::<f64>().ok().map(Value::from),
            _ => None,
        },
        ParamKind::Boolean => match value {
            Value::Bool(b) => Some(Value::Bool(*b)),
            Value::String(s) => match s.trim() {
                "true" => Some(Value::Bool(true)),
                "false" => Some(Value::Bool(false)),
                _ => None,
            },
            _ => None,
        },
    }
}

// ── CapabilityRegistry ──────────────────────────────────────

/// Static mapping of capability name → descriptor + handler.
///
/// Built at startup and shared read-only (`Arc<CapabilityRegistry>`)
/// afterwards.
#[derive(Debug, Default)]
pub struct CapabilityRegistry {
    entries: Vec<Capability>,
    index: HashMap<String, usize>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a capability.  Duplicate names are a configuration error.
    pub fn register(&mut self, capability: Capability) -> anyhow::Result<()> {
        if self.index.contains_key(&capability.name) {
            anyhow::bail!("duplicate capability name: {}", capability.name);
        }
        self.index
            .insert(capability.name.clone(), self.entries.len());
        self.entries.push(capability);
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<&Capability> {
        self.index.get(name).map(|&i| &self.entries[i])
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registered names in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|c| c.name.as_str()).collect()
    }

    /// Declarations for every registered capability, in registration order.
    pub fn declarations(&self) -> Vec<FunctionDeclaration> {
        self.entries.iter().map(Capability::declaration).collect()
    }

    /// Invoke `name` with raw model-supplied arguments.
    pub async fn invoke(
        &self,
        name: &str,
        raw_args: &Map<String, Value>,
        ctx: CallContext,
    ) -> CapabilityResult {
        let Some(capability) = self.lookup(name) else {
            warn!(capability = %name, "model requested unknown capability");
            return CapabilityResult::error(format!("unknown capability: {name}"));
        };

        let args = match capability.coerce_args(raw_args) {
            Ok(a) => a,
            Err(e) => {
                warn!(capability = %name, error = %e, "rejected capability arguments");
                return CapabilityResult::error(e);
            }
        };

        debug!(capability = %name, args = ?args.as_map(), "invoking capability");
        let result = (capability.handler)(args, ctx).await;
        if let Some(e) = result.error_message() {
            warn!(capability = %name, error = %e, "capability returned an error");
        }
        result
    }
}

// ── HTTP helper shared by the builtin lookups ───────────────

/// Build the HTTP client the builtin capabilities share.
pub fn http_client(timeout: Duration) -> anyhow::Result<Client> {
    Client::builder()
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(10))
        .user_agent(concat!("benebot/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| anyhow::anyhow!("failed to build HTTP client: {e}"))
}

/// GET `url` and decode the body as JSON.
///
/// Network failures, non-2xx statuses, and undecodable bodies are all
/// reported as a plain error string.
pub async fn fetch_json(client: &Client, url: &str) -> Result<Value, String> {
    let resp = client
        .get(url)
        .send()
        .await
        .map_err(|e| format!("request failed: {e}"))?;

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(format!(
            "upstream returned {status}: {}",
            crate::utils::truncate_str(body.trim(), 200)
        ));
    }

    resp.json::<Value>()
        .await
        .map_err(|e| format!("invalid JSON response: {e}"))
}

/// Build a registry holding all builtin capabilities.
pub fn builtin_registry(cfg: &CapabilitiesConfig, timeout: Duration) -> anyhow::Result<CapabilityRegistry> {
    let client = http_client(timeout)?;
    let mut registry = CapabilityRegistry::new();
    my_ip::register(&mut registry, client.clone(), &cfg.ipify_url)?;
    dota::register(&mut registry, client, &cfg.opendota_url)?;
    time::register(&mut registry)?;
    debug!(capabilities = ?registry.names(), "capability registry built");
    Ok(registry)
}
