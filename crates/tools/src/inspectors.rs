//! Policy inspection, distinct from schema validation: each inspector
//! categorizes calls as approved, requiring approval, or denied. Denials win
//! over approval requirements, which win over approvals.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::RegexSet;
use serde_json::Value;
use tracing::{debug, warn};

use crate::catalog::NormalizedCall;
use crate::history::CallHistory;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum InspectionVerdict {
    Approved,
    RequiresApproval,
    Denied,
}

#[derive(Debug, Clone)]
pub struct Finding {
    pub inspector: &'static str,
    pub verdict: InspectionVerdict,
    pub reason: String,
}

/// Merged verdict for one call plus every finding that contributed.
#[derive(Debug, Clone)]
pub struct CallAssessment {
    pub verdict: InspectionVerdict,
    pub findings: Vec<Finding>,
}

impl CallAssessment {
    pub fn deny_reason(&self) -> Option<&str> {
        self.findings
            .iter()
            .filter(|finding| finding.verdict == self.verdict)
            .map(|finding| finding.reason.as_str())
            .next()
    }
}

/// One finding attributed to a call index within the inspected batch.
#[derive(Debug, Clone)]
pub struct IndexedFinding {
    pub index: usize,
    pub finding: Finding,
}

pub struct InspectionContext<'a> {
    /// `chat`, `task`, or `auto`.
    pub mode: &'a str,
    pub readonly: bool,
    pub strict_repetition: bool,
    pub history: &'a CallHistory,
    pub window: usize,
    pub max_consecutive: usize,
    /// Declared user intent, passed to the LLM validator when attached.
    pub intent: &'a str,
}

#[async_trait]
pub trait CallInspector: Send + Sync {
    fn name(&self) -> &'static str;
    async fn inspect(
        &self,
        calls: &[NormalizedCall],
        ctx: &InspectionContext<'_>,
    ) -> Vec<IndexedFinding>;
}

// ── Chain ────────────────────────────────────────────────────────────────────

pub struct InspectorChain {
    inspectors: Vec<Box<dyn CallInspector>>,
}

impl InspectorChain {
    /// Security, mode, and repetition inspection in that order.
    pub fn standard() -> Self {
        Self {
            inspectors: vec![
                Box::new(SecurityInspector),
                Box::new(ModeInspector),
                Box::new(RepetitionInspector),
            ],
        }
    }

    pub fn with_llm_validator(mut self, assessor: Arc<dyn RiskAssessor>, fallback_allow: bool) -> Self {
        self.inspectors.push(Box::new(LlmValidatorInspector {
            assessor,
            fallback_allow,
        }));
        self
    }

    pub async fn inspect(
        &self,
        calls: &[NormalizedCall],
        ctx: &InspectionContext<'_>,
    ) -> Vec<CallAssessment> {
        let mut assessments: Vec<CallAssessment> = calls
            .iter()
            .map(|_| CallAssessment {
                verdict: InspectionVerdict::Approved,
                findings: vec![],
            })
            .collect();

        for inspector in &self.inspectors {
            for indexed in inspector.inspect(calls, ctx).await {
                let Some(assessment) = assessments.get_mut(indexed.index) else {
                    continue;
                };
                assessment.verdict = assessment.verdict.max(indexed.finding.verdict);
                assessment.findings.push(indexed.finding);
            }
        }

        assessments
    }
}

// ── Security ─────────────────────────────────────────────────────────────────

/// Critical patterns: denied outright.
static CRITICAL_PATTERNS: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        r"(?i)rm\s+-rf\s+/(\s|$|')",
        r"(?i)drop\s+database",
        r"(?i)delete\s+from\s+\w+\s+where\s+1\s*=\s*1",
        r"(?i)mkfs\.",
    ])
    .expect("security patterns compile")
});

/// Suspicious patterns: require approval.
static SUSPICIOUS_PATTERNS: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        r"(?i)rm\s+-rf",
        r"(?i)\bformat\b",
        r"(?i)delete\s+.*\bwhere\b",
        r"eval\s*\(",
        r"exec\s*\(",
    ])
    .expect("security patterns compile")
});

const SENSITIVE_PATH_PREFIXES: &[&str] = &[
    "/etc/",
    "/boot/",
    "/usr/bin/",
    "/System/",
    "/private/etc/",
    "/root/.ssh",
    "~/.ssh",
];

const PATH_LIKE_KEYS: &[&str] = &["path", "file_path", "directory", "target", "destination"];

pub struct SecurityInspector;

#[async_trait]
impl CallInspector for SecurityInspector {
    fn name(&self) -> &'static str {
        "security"
    }

    async fn inspect(
        &self,
        calls: &[NormalizedCall],
        _ctx: &InspectionContext<'_>,
    ) -> Vec<IndexedFinding> {
        let mut findings = Vec::new();
        for (index, call) in calls.iter().enumerate() {
            let payload = Value::Object(call.parameters.clone()).to_string();

            if CRITICAL_PATTERNS.is_match(&payload) {
                findings.push(IndexedFinding {
                    index,
                    finding: Finding {
                        inspector: self.name(),
                        verdict: InspectionVerdict::Denied,
                        reason: "parameters match a destructive command pattern".to_string(),
                    },
                });
                continue;
            }

            if SUSPICIOUS_PATTERNS.is_match(&payload) {
                findings.push(IndexedFinding {
                    index,
                    finding: Finding {
                        inspector: self.name(),
                        verdict: InspectionVerdict::RequiresApproval,
                        reason: "parameters match a suspicious command pattern".to_string(),
                    },
                });
                continue;
            }

            for key in PATH_LIKE_KEYS {
                let Some(path) = call.parameters.get(*key).and_then(Value::as_str) else {
                    continue;
                };
                if SENSITIVE_PATH_PREFIXES
                    .iter()
                    .any(|prefix| path.starts_with(prefix))
                {
                    findings.push(IndexedFinding {
                        index,
                        finding: Finding {
                            inspector: self.name(),
                            verdict: InspectionVerdict::RequiresApproval,
                            reason: format!("touches sensitive path {path:?}"),
                        },
                    });
                    break;
                }
            }
        }
        findings
    }
}

// ── Mode / permission ────────────────────────────────────────────────────────

/// Tools considered read-only in chat mode.
const READONLY_TOOLS: &[&str] = &[
    "read_file",
    "read_multiple_files",
    "list_directory",
    "directory_tree",
    "get_file_info",
    "search_files",
    "list_allowed_directories",
    "web_search",
    "fetch",
    "screenshot",
];

/// Markers of tools that mutate state or run code.
const WRITE_MARKERS: &[&str] = &[
    "write", "delete", "remove", "create", "move", "rename", "execute", "run", "kill", "update",
    "set_", "install",
];

fn is_readonly(raw_name: &str) -> bool {
    READONLY_TOOLS.contains(&raw_name)
        || raw_name.starts_with("read_")
        || raw_name.starts_with("list_")
        || raw_name.starts_with("get_")
        || raw_name.starts_with("search_")
        || raw_name.starts_with("query_")
}

fn is_write(raw_name: &str) -> bool {
    WRITE_MARKERS.iter().any(|marker| raw_name.contains(marker))
}

pub struct ModeInspector;

#[async_trait]
impl CallInspector for ModeInspector {
    fn name(&self) -> &'static str {
        "mode"
    }

    async fn inspect(
        &self,
        calls: &[NormalizedCall],
        ctx: &InspectionContext<'_>,
    ) -> Vec<IndexedFinding> {
        let mut findings = Vec::new();
        for (index, call) in calls.iter().enumerate() {
            if ctx.readonly && is_write(&call.raw_name) {
                findings.push(IndexedFinding {
                    index,
                    finding: Finding {
                        inspector: self.name(),
                        verdict: InspectionVerdict::Denied,
                        reason: format!("{} writes while session is read-only", call.qualified_name),
                    },
                });
                continue;
            }
            if ctx.mode == "chat" && !is_readonly(&call.raw_name) {
                findings.push(IndexedFinding {
                    index,
                    finding: Finding {
                        inspector: self.name(),
                        verdict: InspectionVerdict::Denied,
                        reason: format!("{} is not allowed in chat mode", call.qualified_name),
                    },
                });
            }
        }
        findings
    }
}

// ── Repetition ───────────────────────────────────────────────────────────────

pub struct RepetitionInspector;

#[async_trait]
impl CallInspector for RepetitionInspector {
    fn name(&self) -> &'static str {
        "repetition"
    }

    async fn inspect(
        &self,
        calls: &[NormalizedCall],
        ctx: &InspectionContext<'_>,
    ) -> Vec<IndexedFinding> {
        let escalated = if ctx.strict_repetition {
            InspectionVerdict::Denied
        } else {
            InspectionVerdict::RequiresApproval
        };

        let mut findings = Vec::new();
        for (index, call) in calls.iter().enumerate() {
            let exact = ctx
                .history
                .count_exact(&call.qualified_name, &call.parameters, ctx.window);
            if exact > 0 {
                findings.push(IndexedFinding {
                    index,
                    finding: Finding {
                        inspector: self.name(),
                        verdict: escalated,
                        reason: "exact repetition within window".to_string(),
                    },
                });
                continue;
            }

            let tail = ctx.history.consecutive_tail(&call.qualified_name, ctx.window);
            if tail >= ctx.max_consecutive {
                findings.push(IndexedFinding {
                    index,
                    finding: Finding {
                        inspector: self.name(),
                        verdict: escalated,
                        reason: format!(
                            "{} called {tail} times consecutively",
                            call.qualified_name
                        ),
                    },
                });
            }
        }
        findings
    }
}

// ── LLM validator (optional) ─────────────────────────────────────────────────

/// Seam to whatever produces the risk assessment text; the runtime wires this
/// to the optimizer.
#[async_trait]
pub trait RiskAssessor: Send + Sync {
    async fn assess(
        &self,
        calls: &[NormalizedCall],
        intent: &str,
    ) -> maestro_core::Result<String>;
}

#[derive(Debug, Clone)]
struct RiskEntry {
    valid: bool,
    risk: String,
    reasoning: String,
}

/// Parse the validator reply, tolerating `{"validations": [...]}` and a bare
/// array, with or without a code fence.
fn parse_risk_entries(content: &str) -> Option<Vec<RiskEntry>> {
    let stripped = strip_fences(content);
    let value: Value = serde_json::from_str(stripped).ok()?;
    let entries = value
        .get("validations")
        .and_then(Value::as_array)
        .or_else(|| value.as_array())?;
    Some(
        entries
            .iter()
            .map(|entry| RiskEntry {
                valid: entry.get("valid").and_then(Value::as_bool).unwrap_or(true),
                risk: entry
                    .get("risk")
                    .and_then(Value::as_str)
                    .unwrap_or("none")
                    .to_lowercase(),
                reasoning: entry
                    .get("reasoning")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            })
            .collect(),
    )
}

fn strip_fences(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => rest,
    };
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

pub struct LlmValidatorInspector {
    assessor: Arc<dyn RiskAssessor>,
    /// On validator failure: pass everything with a warning (`true`) or deny
    /// the batch (`false`).
    fallback_allow: bool,
}

#[async_trait]
impl CallInspector for LlmValidatorInspector {
    fn name(&self) -> &'static str {
        "llm_validator"
    }

    async fn inspect(
        &self,
        calls: &[NormalizedCall],
        ctx: &InspectionContext<'_>,
    ) -> Vec<IndexedFinding> {
        let fallback_verdict = if self.fallback_allow {
            InspectionVerdict::Approved
        } else {
            InspectionVerdict::Denied
        };

        let entries = match self.assessor.assess(calls, ctx.intent).await {
            Ok(content) => parse_risk_entries(&content),
            Err(err) => {
                warn!(%err, "llm validator unavailable");
                None
            }
        };

        let Some(entries) = entries else {
            return calls
                .iter()
                .enumerate()
                .map(|(index, _)| IndexedFinding {
                    index,
                    finding: Finding {
                        inspector: self.name(),
                        verdict: fallback_verdict,
                        reason: "validator unavailable, risk unknown".to_string(),
                    },
                })
                .collect();
        };

        let mut findings = Vec::new();
        for (index, entry) in entries.iter().enumerate().take(calls.len()) {
            let verdict = match entry.risk.as_str() {
                "critical" | "high" => InspectionVerdict::Denied,
                _ if !entry.valid => InspectionVerdict::RequiresApproval,
                "medium" => InspectionVerdict::Approved, // surfaced as a warning finding
                _ => continue,
            };
            debug!(index, risk = %entry.risk, "llm validator finding");
            findings.push(IndexedFinding {
                index,
                finding: Finding {
                    inspector: self.name(),
                    verdict,
                    reason: if entry.reasoning.is_empty() {
                        format!("risk assessed as {}", entry.risk)
                    } else {
                        entry.reasoning.clone()
                    },
                },
            });
        }
        findings
    }
}
