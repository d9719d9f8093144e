//! Multi-stage validation pipeline: format → history → schema → MCP sync.
//!
//! Each validator sees the current (possibly corrected) call list. The first
//! hard failure rejects the batch; corrections made by earlier validators are
//! visible to later ones. The pipeline is deterministic for a fixed input and
//! history window.

use serde_json::Value;
use tracing::debug;

use maestro_config::InspectionConfig;
use maestro_core::{Error, ErrorKind};

use crate::catalog::{CatalogSnapshot, ToolDescriptor};
use crate::history::CallHistory;
use crate::similarity::{best_match, synonym_equivalent, SUGGESTION_THRESHOLD};
use crate::ToolCall;

// ── Outcome types ────────────────────────────────────────────────────────────

/// One per-call rejection reason.
#[derive(Debug, Clone)]
pub struct CallDiagnostic {
    pub index: usize,
    pub error: Error,
}

#[derive(Debug, Clone, Default)]
pub struct ValidationOutcome {
    pub valid: bool,
    pub errors: Vec<CallDiagnostic>,
    pub warnings: Vec<String>,
    /// Present when a validator rewrote the list (renames, substitutions).
    pub corrected_calls: Option<Vec<ToolCall>>,
}

impl ValidationOutcome {
    fn pass() -> Self {
        Self { valid: true, ..Default::default() }
    }

    fn pass_with(corrected: Vec<ToolCall>, warnings: Vec<String>) -> Self {
        Self {
            valid: true,
            warnings,
            corrected_calls: Some(corrected),
            ..Default::default()
        }
    }

    fn fail(errors: Vec<CallDiagnostic>, warnings: Vec<String>) -> Self {
        Self {
            valid: false,
            errors,
            warnings,
            corrected_calls: None,
        }
    }
}

pub struct ValidationContext<'a> {
    pub snapshot: &'a CatalogSnapshot,
    pub history: &'a CallHistory,
    pub config: &'a InspectionConfig,
    pub autocorrect: bool,
}

pub trait CallValidator: Send + Sync {
    fn name(&self) -> &'static str;
    fn validate(&self, calls: &[ToolCall], ctx: &ValidationContext<'_>) -> ValidationOutcome;
}

// ── Pipeline ─────────────────────────────────────────────────────────────────

pub struct ValidationPipeline {
    validators: Vec<Box<dyn CallValidator>>,
}

impl ValidationPipeline {
    /// The standard chain in spec order.
    pub fn standard() -> Self {
        Self {
            validators: vec![
                Box::new(FormatValidator),
                Box::new(HistoryValidator),
                Box::new(SchemaValidator),
                Box::new(McpSyncValidator),
            ],
        }
    }

    pub fn with_validators(validators: Vec<Box<dyn CallValidator>>) -> Self {
        Self { validators }
    }

    /// Run the chain. On success the outcome carries the final (corrected)
    /// call list; on the first hard failure the remaining validators are
    /// skipped.
    pub fn run(&self, calls: Vec<ToolCall>, ctx: &ValidationContext<'_>) -> ValidationOutcome {
        let mut current = calls;
        let mut warnings = Vec::new();

        for validator in &self.validators {
            let outcome = validator.validate(&current, ctx);
            warnings.extend(outcome.warnings);
            if !outcome.valid {
                debug!(validator = validator.name(), errors = outcome.errors.len(), "batch rejected");
                return ValidationOutcome::fail(outcome.errors, warnings);
            }
            if let Some(corrected) = outcome.corrected_calls {
                current = corrected;
            }
        }

        ValidationOutcome::pass_with(current, warnings)
    }
}

// ── 1. Format ────────────────────────────────────────────────────────────────

/// The list is non-empty and every entry names a tool resolvable to a
/// provider (directly or through its qualified form). Unknown top-level
/// fields were already stripped at parse time.
pub struct FormatValidator;

impl CallValidator for FormatValidator {
    fn name(&self) -> &'static str {
        "format"
    }

    fn validate(&self, calls: &[ToolCall], _ctx: &ValidationContext<'_>) -> ValidationOutcome {
        if calls.is_empty() {
            return ValidationOutcome::fail(
                vec![CallDiagnostic {
                    index: 0,
                    error: Error::new(ErrorKind::ValidationFailed, "empty tool-call list"),
                }],
                vec![],
            );
        }

        let mut errors = Vec::new();
        for (index, call) in calls.iter().enumerate() {
            if call.tool.trim().is_empty() {
                errors.push(CallDiagnostic {
                    index,
                    error: Error::new(ErrorKind::ValidationFailed, "call has no tool name"),
                });
            } else if call.provider.is_empty() && !call.tool.contains("__") {
                errors.push(CallDiagnostic {
                    index,
                    error: Error::new(
                        ErrorKind::ValidationFailed,
                        format!("call to {:?} names no provider", call.tool),
                    ),
                });
            }
        }

        if errors.is_empty() {
            ValidationOutcome::pass()
        } else {
            ValidationOutcome::fail(errors, vec![])
        }
    }
}

// ── 2. History ───────────────────────────────────────────────────────────────

/// Rejects exact repetitions of recently completed calls above the configured
/// threshold, and any call to a (provider, tool) pair that has already failed
/// too many times this session.
pub struct HistoryValidator;

impl CallValidator for HistoryValidator {
    fn name(&self) -> &'static str {
        "history"
    }

    fn validate(&self, calls: &[ToolCall], ctx: &ValidationContext<'_>) -> ValidationOutcome {
        let mut errors = Vec::new();
        for (index, call) in calls.iter().enumerate() {
            let Some(descriptor) = ctx.snapshot.resolve(&call.provider, &call.tool) else {
                continue; // schema stage owns unknown tools
            };

            let repeats = ctx.history.count_exact(
                &descriptor.qualified_name,
                &call.parameters,
                ctx.config.history_window,
            );
            if repeats >= ctx.config.max_repetitions {
                errors.push(CallDiagnostic {
                    index,
                    error: Error::new(
                        ErrorKind::ValidationFailed,
                        format!(
                            "{} repeated {repeats} times with identical parameters",
                            descriptor.qualified_name
                        ),
                    ),
                });
                continue;
            }

            let failures = ctx
                .history
                .failure_count(&descriptor.provider, &descriptor.raw_name);
            if failures >= ctx.config.max_repetitions {
                errors.push(CallDiagnostic {
                    index,
                    error: Error::new(
                        ErrorKind::ValidationFailed,
                        format!(
                            "{} has already failed {failures} times this session",
                            descriptor.qualified_name
                        ),
                    ),
                });
            }
        }

        if errors.is_empty() {
            ValidationOutcome::pass()
        } else {
            ValidationOutcome::fail(errors, vec![])
        }
    }
}

// ── 3. Schema ────────────────────────────────────────────────────────────────

/// Looks up each descriptor, autocorrects renamable parameters, and enforces
/// declared types and enums.
pub struct SchemaValidator;

impl SchemaValidator {
    /// Pick a provided key that can stand in for `required`: synonym table
    /// first, similarity score second.
    fn rename_candidate<'a>(
        required: &str,
        provided: impl Iterator<Item = &'a String>,
    ) -> Option<String> {
        let provided: Vec<&String> = provided.collect();
        if let Some(found) = provided
            .iter()
            .find(|key| synonym_equivalent(required, key))
        {
            return Some((*found).clone());
        }
        best_match(required, provided.iter().map(|key| key.as_str()))
            .map(|(key, _)| key.to_string())
    }

    fn check_type(declared: &str, value: &Value) -> bool {
        match declared {
            "string" => value.is_string(),
            "number" => value.is_number(),
            "integer" => value.is_i64() || value.is_u64(),
            "boolean" => value.is_boolean(),
            "array" => value.is_array(),
            "object" => value.is_object(),
            _ => true,
        }
    }

    fn validate_call(
        call: &ToolCall,
        descriptor: &ToolDescriptor,
        ctx: &ValidationContext<'_>,
        index: usize,
        errors: &mut Vec<CallDiagnostic>,
        warnings: &mut Vec<String>,
    ) -> ToolCall {
        let mut corrected = call.clone();

        // Missing required parameters: rename-autocorrect from provided keys.
        for required in descriptor.required_parameters() {
            if corrected.parameters.contains_key(&required) {
                continue;
            }
            let candidate = Self::rename_candidate(
                &required,
                corrected
                    .parameters
                    .keys()
                    .filter(|key| descriptor.parameter_schema(key).is_none()),
            );
            match candidate {
                Some(provided) if ctx.autocorrect => {
                    debug!(tool = %descriptor.qualified_name, from = %provided, to = %required, "renamed parameter");
                    if let Some(value) = corrected.parameters.remove(&provided) {
                        corrected.parameters.insert(required.clone(), value);
                    }
                }
                Some(provided) => {
                    errors.push(CallDiagnostic {
                        index,
                        error: Error::new(
                            ErrorKind::ToolSchemaViolation,
                            format!(
                                "{} is missing required parameter {required:?}",
                                descriptor.qualified_name
                            ),
                        )
                        .with_suggestion(format!("{required} ← {provided}")),
                    });
                }
                None => {
                    errors.push(CallDiagnostic {
                        index,
                        error: Error::new(
                            ErrorKind::ToolSchemaViolation,
                            format!(
                                "{} is missing required parameter {required:?}",
                                descriptor.qualified_name
                            ),
                        ),
                    });
                }
            }
        }

        // Known keys: enforce declared type and enum membership.
        for (key, value) in corrected.parameters.clone() {
            let Some(schema) = descriptor.parameter_schema(&key) else {
                // Unknown parameter: rename toward the schema when something
                // fits, otherwise keep it and warn.
                let known = descriptor.parameter_names();
                let target = known
                    .iter()
                    .find(|name| {
                        !corrected.parameters.contains_key(*name) && synonym_equivalent(name, &key)
                    })
                    .cloned()
                    .or_else(|| {
                        best_match(&key, known.iter().map(String::as_str))
                            .filter(|(name, score)| {
                                *score > SUGGESTION_THRESHOLD
                                    && !corrected.parameters.contains_key(*name)
                            })
                            .map(|(name, _)| name.to_string())
                    });
                match target {
                    Some(target) if ctx.autocorrect => {
                        if let Some(value) = corrected.parameters.remove(&key) {
                            corrected.parameters.insert(target, value);
                        }
                    }
                    _ => warnings.push(format!(
                        "{}: unknown parameter {key:?} kept as-is",
                        descriptor.qualified_name
                    )),
                }
                continue;
            };

            if let Some(declared) = schema.get("type").and_then(Value::as_str) {
                if !Self::check_type(declared, &value) {
                    errors.push(CallDiagnostic {
                        index,
                        error: Error::new(
                            ErrorKind::ToolSchemaViolation,
                            format!(
                                "{}: parameter {key:?} must be of type {declared}",
                                descriptor.qualified_name
                            ),
                        ),
                    });
                }
            }
            if let Some(options) = schema.get("enum").and_then(Value::as_array) {
                if !options.contains(&value) {
                    errors.push(CallDiagnostic {
                        index,
                        error: Error::new(
                            ErrorKind::ToolSchemaViolation,
                            format!(
                                "{}: parameter {key:?} must be one of {options:?}",
                                descriptor.qualified_name
                            ),
                        ),
                    });
                }
            }
        }

        corrected
    }
}

impl CallValidator for SchemaValidator {
    fn name(&self) -> &'static str {
        "schema"
    }

    fn validate(&self, calls: &[ToolCall], ctx: &ValidationContext<'_>) -> ValidationOutcome {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        let mut corrected = Vec::with_capacity(calls.len());

        for (index, call) in calls.iter().enumerate() {
            let mut call = call.clone();
            let mut descriptor = ctx.snapshot.resolve(&call.provider, &call.tool);

            // Unknown tool: substitute the nearest qualified name when
            // autocorrecting, otherwise reject with it as a suggestion.
            if descriptor.is_none() {
                let nearest = best_match(&call.tool, ctx.snapshot.qualified_names())
                    .map(|(name, _)| name.to_string());
                match nearest {
                    Some(nearest) if ctx.autocorrect => {
                        debug!(from = %call.tool, to = %nearest, "substituted unknown tool name");
                        descriptor = ctx.snapshot.get_qualified(&nearest);
                        if let Some(found) = descriptor {
                            call.provider = found.provider.clone();
                            call.tool = found.raw_name.clone();
                        }
                    }
                    nearest => {
                        let mut error = Error::new(
                            ErrorKind::ToolNotFound,
                            format!("unknown tool {:?} (provider {:?})", call.tool, call.provider),
                        );
                        if let Some(nearest) = nearest {
                            error = error.with_suggestion(nearest);
                        }
                        errors.push(CallDiagnostic { index, error });
                        corrected.push(call);
                        continue;
                    }
                }
            }

            let Some(descriptor) = descriptor else {
                errors.push(CallDiagnostic {
                    index,
                    error: Error::new(
                        ErrorKind::ToolNotFound,
                        format!("unknown tool {:?} (provider {:?})", call.tool, call.provider),
                    ),
                });
                corrected.push(call);
                continue;
            };

            corrected.push(Self::validate_call(
                &call,
                descriptor,
                ctx,
                index,
                &mut errors,
                &mut warnings,
            ));
        }

        if errors.is_empty() {
            ValidationOutcome::pass_with(corrected, warnings)
        } else {
            ValidationOutcome::fail(errors, warnings)
        }
    }
}

// ── 4. MCP sync ──────────────────────────────────────────────────────────────

/// Confirms the provider is currently ready and the tool is present in its
/// latest `tools/list`; with autocorrect on, a near-miss name on the same
/// provider is substituted.
pub struct McpSyncValidator;

impl CallValidator for McpSyncValidator {
    fn name(&self) -> &'static str {
        "mcp_sync"
    }

    fn validate(&self, calls: &[ToolCall], ctx: &ValidationContext<'_>) -> ValidationOutcome {
        let mut errors = Vec::new();
        let mut corrected = Vec::with_capacity(calls.len());
        let mut changed = false;

        for (index, call) in calls.iter().enumerate() {
            let resolved = ctx.snapshot.resolve(&call.provider, &call.tool);
            let provider = resolved
                .map(|descriptor| descriptor.provider.clone())
                .unwrap_or_else(|| {
                    if call.provider.is_empty() {
                        call.tool
                            .split_once("__")
                            .map(|(provider, _)| provider.to_string())
                            .unwrap_or_default()
                    } else {
                        call.provider.clone()
                    }
                });

            if !ctx.snapshot.ready_providers().contains(&provider) {
                errors.push(CallDiagnostic {
                    index,
                    error: Error::new(
                        ErrorKind::ProviderNotReady,
                        format!("provider {provider:?} is not ready"),
                    ),
                });
                corrected.push(call.clone());
                continue;
            }

            match resolved {
                Some(_) => corrected.push(call.clone()),
                None if ctx.autocorrect => {
                    let provider_raw_names: Vec<&str> = ctx
                        .snapshot
                        .provider_tools(&provider)
                        .iter()
                        .map(|descriptor| descriptor.raw_name.as_str())
                        .collect();
                    let bare = call
                        .tool
                        .split_once("__")
                        .map(|(_, raw)| raw)
                        .unwrap_or(&call.tool);
                    if let Some((substitute, score)) =
                        best_match(bare, provider_raw_names.into_iter())
                    {
                        debug!(from = %call.tool, to = %substitute, score, "substituted near-miss tool name");
                        let mut fixed = call.clone();
                        fixed.provider = provider.clone();
                        fixed.tool = substitute.to_string();
                        corrected.push(fixed);
                        changed = true;
                    } else {
                        errors.push(CallDiagnostic {
                            index,
                            error: Error::new(
                                ErrorKind::ToolNotFound,
                                format!("tool {:?} not advertised by {provider:?}", call.tool),
                            ),
                        });
                        corrected.push(call.clone());
                    }
                }
                None => {
                    errors.push(CallDiagnostic {
                        index,
                        error: Error::new(
                            ErrorKind::ToolNotFound,
                            format!("tool {:?} not advertised by {provider:?}", call.tool),
                        ),
                    });
                    corrected.push(call.clone());
                }
            }
        }

        if !errors.is_empty() {
            ValidationOutcome::fail(errors, vec![])
        } else if changed {
            ValidationOutcome::pass_with(corrected, vec![])
        } else {
            ValidationOutcome::pass()
        }
    }
}
