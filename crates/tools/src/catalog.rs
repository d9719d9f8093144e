//! Flat tool catalog across providers, plus the single normalization pass.
//!
//! Three name forms show up in planned calls: the provider's `raw_name`
//! (`read_file`), the qualified `provider__raw` form the LLM is told to emit,
//! and a legacy `provider_raw` prefix. Normalization happens once, here, at
//! the dispatcher boundary; everything downstream sees canonical calls only.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::debug;

use maestro_core::{Error, ErrorKind, Result};

use crate::similarity::best_match;
use crate::{ProviderPort, ToolCall};

/// Parameter keys subject to the `/tmp` rewrite.
const PATH_PARAMETER_KEYS: &[&str] = &[
    "path",
    "file_path",
    "directory",
    "target",
    "targetPath",
    "sourcePath",
    "destinationPath",
];

// ── Descriptors ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub provider: String,
    pub raw_name: String,
    pub qualified_name: String,
    pub description: String,
    pub input_schema: Value,
}

impl ToolDescriptor {
    pub fn qualified(provider: &str, raw_name: &str) -> String {
        format!("{provider}__{raw_name}")
    }

    fn properties(&self) -> Option<&Map<String, Value>> {
        self.input_schema.get("properties").and_then(Value::as_object)
    }

    pub fn required_parameters(&self) -> Vec<String> {
        self.input_schema
            .get("required")
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn parameter_names(&self) -> Vec<String> {
        self.properties()
            .map(|properties| properties.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn parameter_schema(&self, name: &str) -> Option<&Value> {
        self.properties().and_then(|properties| properties.get(name))
    }

    /// Example argument object generated from the schema: first enum value,
    /// then schema default, then a placeholder derived from type and
    /// description.
    pub fn example_arguments(&self) -> Value {
        let mut example = Map::new();
        if let Some(properties) = self.properties() {
            for (name, schema) in properties {
                let value = schema
                    .get("enum")
                    .and_then(Value::as_array)
                    .and_then(|options| options.first())
                    .cloned()
                    .or_else(|| schema.get("default").cloned())
                    .unwrap_or_else(|| placeholder_for(schema, name));
                example.insert(name.clone(), value);
            }
        }
        Value::Object(example)
    }
}

fn placeholder_for(schema: &Value, name: &str) -> Value {
    match schema.get("type").and_then(Value::as_str) {
        Some("number") => Value::from(0),
        Some("integer") => Value::from(0),
        Some("boolean") => Value::from(false),
        Some("array") => Value::Array(vec![]),
        Some("object") => Value::Object(Map::new()),
        _ => {
            let description = schema
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or(name);
            Value::from(format!("<{description}>"))
        }
    }
}

// ── Canonical call ───────────────────────────────────────────────────────────

/// A call after normalization: the provider resolves to a ready provider and
/// `qualified_name` matches a descriptor. The wire name sent to the provider
/// is `raw_name`; `qualified_name` is what history and logs carry.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedCall {
    pub provider: String,
    pub raw_name: String,
    pub qualified_name: String,
    pub parameters: Map<String, Value>,
    pub origin: crate::CallOrigin,
}

// ── Snapshot ─────────────────────────────────────────────────────────────────

/// Point-in-time flat view over every ready provider's tools.
#[derive(Debug, Clone, Default)]
pub struct CatalogSnapshot {
    descriptors: Vec<ToolDescriptor>,
    by_qualified: HashMap<String, usize>,
    ready_providers: Vec<String>,
}

impl CatalogSnapshot {
    pub fn descriptors(&self) -> &[ToolDescriptor] {
        &self.descriptors
    }

    pub fn ready_providers(&self) -> &[String] {
        &self.ready_providers
    }

    pub fn get_qualified(&self, qualified: &str) -> Option<&ToolDescriptor> {
        self.by_qualified
            .get(qualified)
            .map(|&index| &self.descriptors[index])
    }

    pub fn get(&self, provider: &str, raw_name: &str) -> Option<&ToolDescriptor> {
        self.get_qualified(&ToolDescriptor::qualified(provider, raw_name))
    }

    pub fn provider_tools(&self, provider: &str) -> Vec<&ToolDescriptor> {
        self.descriptors
            .iter()
            .filter(|descriptor| descriptor.provider == provider)
            .collect()
    }

    pub fn qualified_names(&self) -> impl Iterator<Item = &str> {
        self.descriptors
            .iter()
            .map(|descriptor| descriptor.qualified_name.as_str())
    }

    /// Resolve the (provider, tool) pair of a planned call to a descriptor,
    /// accepting the qualified, legacy-prefixed, and raw tool forms. An empty
    /// provider is derived from a qualified tool name.
    pub fn resolve(&self, provider: &str, tool: &str) -> Option<&ToolDescriptor> {
        let (provider, tool) = if provider.is_empty() {
            let (derived, raw) = tool.split_once("__")?;
            (derived, raw)
        } else {
            (provider, tool)
        };

        let qualified_prefix = format!("{provider}__");
        let legacy_prefix = format!("{provider}_");
        if let Some(stripped) = tool.strip_prefix(&qualified_prefix) {
            if let Some(descriptor) = self.get(provider, stripped) {
                return Some(descriptor);
            }
        }
        if let Some(stripped) = tool.strip_prefix(&legacy_prefix) {
            if let Some(descriptor) = self.get(provider, stripped) {
                return Some(descriptor);
            }
        }
        self.get(provider, tool)
    }
}

// ── Catalog ──────────────────────────────────────────────────────────────────

pub struct ToolCatalog {
    port: Arc<dyn ProviderPort>,
    /// Providers with the `/tmp` → `/private/tmp` rewrite enabled.
    tmp_rewrite_providers: HashSet<String>,
}

impl ToolCatalog {
    pub fn new(port: Arc<dyn ProviderPort>, tmp_rewrite_providers: HashSet<String>) -> Self {
        Self {
            port,
            tmp_rewrite_providers,
        }
    }

    /// Build a fresh snapshot from the supervisor's published tool lists.
    pub fn snapshot(&self) -> CatalogSnapshot {
        let mut descriptors = Vec::new();
        let mut by_qualified = HashMap::new();
        let ready_providers = self.port.ready_providers();

        for (provider, tools) in self.port.tools_snapshot() {
            for tool in tools.iter() {
                let qualified = ToolDescriptor::qualified(&provider, &tool.name);
                let descriptor = ToolDescriptor {
                    provider: provider.clone(),
                    raw_name: tool.name.clone(),
                    qualified_name: qualified.clone(),
                    description: tool.description.clone().unwrap_or_default(),
                    input_schema: tool.input_schema.clone(),
                };
                by_qualified.insert(qualified, descriptors.len());
                descriptors.push(descriptor);
            }
        }

        CatalogSnapshot {
            descriptors,
            by_qualified,
            ready_providers,
        }
    }

    /// Normalize one planned call against a snapshot. Unknown tools come back
    /// as a soft `ToolNotFound` carrying the nearest-match suggestion.
    pub fn normalize(&self, call: &ToolCall, snapshot: &CatalogSnapshot) -> Result<NormalizedCall> {
        let Some(descriptor) = snapshot.resolve(&call.provider, &call.tool) else {
            let mut error = Error::new(
                ErrorKind::ToolNotFound,
                format!(
                    "no tool {:?} on provider {:?}",
                    call.tool,
                    if call.provider.is_empty() { "<derived>" } else { &call.provider }
                ),
            );
            let suggestion = nearest_qualified(&call.tool, snapshot);
            if !suggestion.is_empty() {
                error = error.with_suggestion(suggestion);
            }
            return Err(error);
        };

        let mut parameters = call.parameters.clone();
        self.apply_tmp_rewrite(&descriptor.provider, &mut parameters);
        Ok(NormalizedCall {
            provider: descriptor.provider.clone(),
            raw_name: descriptor.raw_name.clone(),
            qualified_name: descriptor.qualified_name.clone(),
            parameters,
            origin: call.origin,
        })
    }

    /// Platform compatibility rewrite: `/tmp`-rooted path parameters become
    /// `/private/tmp` for providers that opted in.
    fn apply_tmp_rewrite(&self, provider: &str, parameters: &mut Map<String, Value>) {
        if !self.tmp_rewrite_providers.contains(provider) {
            return;
        }
        for key in PATH_PARAMETER_KEYS {
            if let Some(value) = parameters.get_mut(*key) {
                if let Some(text) = value.as_str() {
                    if text == "/tmp" {
                        *value = Value::from("/private/tmp");
                    } else if let Some(rest) = text.strip_prefix("/tmp/") {
                        debug!(key, "rewriting /tmp path for {provider}");
                        *value = Value::from(format!("/private/tmp/{rest}"));
                    }
                }
            }
        }
    }

    // ── Listings ────────────────────────────────────────────────────────────

    pub fn list_all_tools(&self) -> Vec<ToolDescriptor> {
        self.snapshot().descriptors().to_vec()
    }

    pub fn list_from(&self, providers: &[String]) -> Vec<ToolDescriptor> {
        self.snapshot()
            .descriptors()
            .iter()
            .filter(|descriptor| providers.contains(&descriptor.provider))
            .cloned()
            .collect()
    }

    /// Compact human-readable description, one line per tool.
    pub fn summary(&self, providers: Option<&[String]>) -> String {
        let snapshot = self.snapshot();
        let mut lines = Vec::new();
        for descriptor in snapshot.descriptors() {
            if let Some(filter) = providers {
                if !filter.contains(&descriptor.provider) {
                    continue;
                }
            }
            lines.push(format!(
                "{}: {}",
                descriptor.qualified_name,
                summarize(&descriptor.description)
            ));
        }
        lines.join("\n")
    }

    /// Full schemas with required/optional split and an example invocation.
    pub fn detailed(&self, providers: &[String]) -> String {
        let mut sections = Vec::new();
        for descriptor in self.list_from(providers) {
            let required = descriptor.required_parameters();
            let optional: Vec<String> = descriptor
                .parameter_names()
                .into_iter()
                .filter(|name| !required.contains(name))
                .collect();
            sections.push(format!(
                "## {}\n{}\nrequired: {}\noptional: {}\nexample: {}",
                descriptor.qualified_name,
                summarize(&descriptor.description),
                if required.is_empty() { "(none)".to_string() } else { required.join(", ") },
                if optional.is_empty() { "(none)".to_string() } else { optional.join(", ") },
                descriptor.example_arguments(),
            ));
        }
        sections.join("\n\n")
    }
}

fn summarize(description: &str) -> &str {
    let trimmed = description.trim();
    if trimmed.is_empty() {
        "(no description)"
    } else {
        trimmed.lines().next().unwrap_or(trimmed)
    }
}

fn nearest_qualified(tool: &str, snapshot: &CatalogSnapshot) -> String {
    best_match(tool, snapshot.qualified_names())
        .map(|(name, _)| name.to_string())
        .unwrap_or_default()
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use async_trait::async_trait;
    use maestro_core::Awaiter;
    use maestro_mcp::ToolInfo;
    use serde_json::json;

    /// In-process provider fake: fixed tool lists, canned call results.
    pub struct FakePort {
        pub providers: Vec<(String, Arc<Vec<ToolInfo>>)>,
    }

    impl FakePort {
        pub fn filesystem() -> Self {
            let tools = vec![
                ToolInfo {
                    name: "read_file".to_string(),
                    description: Some("Read a file from disk".to_string()),
                    input_schema: json!({
                        "type": "object",
                        "properties": { "path": { "type": "string" } },
                        "required": ["path"]
                    }),
                },
                ToolInfo {
                    name: "write_file".to_string(),
                    description: Some("Write content to a file".to_string()),
                    input_schema: json!({
                        "type": "object",
                        "properties": {
                            "path": { "type": "string" },
                            "content": { "type": "string" }
                        },
                        "required": ["path", "content"]
                    }),
                },
            ];
            Self {
                providers: vec![("filesystem".to_string(), Arc::new(tools))],
            }
        }
    }

    #[async_trait]
    impl ProviderPort for FakePort {
        fn ready_providers(&self) -> Vec<String> {
            self.providers.iter().map(|(name, _)| name.clone()).collect()
        }

        fn tools_snapshot(&self) -> Vec<(String, Arc<Vec<ToolInfo>>)> {
            self.providers.clone()
        }

        async fn call(
            &self,
            _provider: &str,
            _raw_tool: &str,
            _arguments: &Value,
        ) -> Result<Awaiter<Value>> {
            unimplemented!("catalog tests never dispatch")
        }
    }

    pub fn filesystem_catalog(rewrite: bool) -> ToolCatalog {
        let mut rewrite_providers = HashSet::new();
        if rewrite {
            rewrite_providers.insert("filesystem".to_string());
        }
        ToolCatalog::new(Arc::new(FakePort::filesystem()), rewrite_providers)
    }
}
