//! Policy Linter - Organizational Rules
//!
//! Rules produce findings from a validated channel and the organization's
//! policy. The linter maps findings to violations, applies severity
//! overrides and acknowledgments, and decides whether the build may proceed.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

use crate::channel::{Channel, RuntimeTarget, SecurityFlags};

pub const DEFAULT_POLICY_ID: &str = "default";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PolicyMode {
    Deny,
    #[default]
    Warn,
    Allow,
}

impl PolicyMode {
    pub fn severity(self) -> Option<Severity> {
        match self {
            PolicyMode::Deny => Some(Severity::Error),
            PolicyMode::Warn => Some(Severity::Warning),
            PolicyMode::Allow => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PolicyCategory {
    Security,
    Nexon,
    Runtime,
    Limits,
    Documentation,
    Compliance,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InternetEgressPolicy {
    #[serde(default = "mode_warn")]
    pub http: PolicyMode,
    #[serde(default = "mode_deny")]
    pub tcp: PolicyMode,
    #[serde(default = "mode_deny")]
    pub udp: PolicyMode,
}

impl Default for InternetEgressPolicy {
    fn default() -> Self {
        Self {
            http: PolicyMode::Warn,
            tcp: PolicyMode::Deny,
            udp: PolicyMode::Deny,
        }
    }
}

fn mode_warn() -> PolicyMode {
    PolicyMode::Warn
}

fn mode_deny() -> PolicyMode {
    PolicyMode::Deny
}

fn default_org() -> String {
    DEFAULT_POLICY_ID.to_string()
}

fn default_targets() -> Vec<RuntimeTarget> {
    vec![RuntimeTarget::Onprem, RuntimeTarget::Cloud]
}

fn default_max_stages() -> usize {
    100
}

fn default_warn_threshold() -> usize {
    50
}

fn default_doc_length() -> usize {
    20
}

/// Per-organization policy document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OrgPolicy {
    #[serde(default = "default_org")]
    pub org_id: String,
    #[serde(default)]
    pub internet_egress: InternetEgressPolicy,
    #[serde(default = "mode_deny")]
    pub public_http_inbound: PolicyMode,
    #[serde(default)]
    pub blocked_nexons: Vec<String>,
    /// When present, only these nexons may be used without a violation.
    #[serde(default)]
    pub allowed_nexons: Option<Vec<String>>,
    #[serde(default = "mode_deny")]
    pub unlisted_nexons: PolicyMode,
    #[serde(default = "default_targets")]
    pub allowed_targets: Vec<RuntimeTarget>,
    #[serde(default = "default_max_stages")]
    pub max_stages: usize,
    #[serde(default = "default_warn_threshold")]
    pub stage_warn_threshold: usize,
    #[serde(default = "mode_warn")]
    pub require_documentation: PolicyMode,
    #[serde(default = "default_doc_length")]
    pub min_documentation_length: usize,
    #[serde(default)]
    pub sensitive_data_nexons: Vec<String>,
    #[serde(default = "mode_warn")]
    pub sensitive_data: PolicyMode,
    #[serde(default)]
    pub severity_overrides: BTreeMap<String, Severity>,
}

impl Default for OrgPolicy {
    fn default() -> Self {
        Self {
            org_id: default_org(),
            internet_egress: InternetEgressPolicy::default(),
            public_http_inbound: PolicyMode::Deny,
            blocked_nexons: vec![],
            allowed_nexons: None,
            unlisted_nexons: PolicyMode::Deny,
            allowed_targets: default_targets(),
            max_stages: default_max_stages(),
            stage_warn_threshold: default_warn_threshold(),
            require_documentation: PolicyMode::Warn,
            min_documentation_length: default_doc_length(),
            sensitive_data_nexons: vec![],
            sensitive_data: PolicyMode::Warn,
            severity_overrides: BTreeMap::new(),
        }
    }
}

/// `pattern` is an exact nexon id or a prefix ending in `*`.
pub fn nexon_matches(pattern: &str, nexon_id: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => nexon_id.starts_with(prefix),
        None => pattern == nexon_id,
    }
}

fn listed(list: &[String], nexon_id: &str) -> bool {
    list.iter().any(|p| nexon_matches(p, nexon_id))
}

/// Policies by organization id, with a fallback for unknown organizations.
pub struct PolicyRegistry {
    policies: HashMap<String, OrgPolicy>,
    fallback: OrgPolicy,
}

impl PolicyRegistry {
    pub fn new() -> Self {
        Self {
            policies: HashMap::new(),
            fallback: OrgPolicy::default(),
        }
    }

    /// Load every `*.json` policy in `dir`. A policy whose `orgId` is
    /// `default` replaces the built-in fallback.
    pub fn load_from_dir(dir: &Path) -> Result<Self, std::io::Error> {
        let mut registry = Self::new();
        if dir.exists() {
            for entry in fs::read_dir(dir)? {
                let path = entry?.path();
                if path.extension().map_or(false, |e| e == "json") {
                    let content = fs::read_to_string(&path)?;
                    match serde_json::from_str::<OrgPolicy>(&content) {
                        Ok(policy) => registry.register(policy),
                        Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable policy"),
                    }
                }
            }
        }
        Ok(registry)
    }

    pub fn register(&mut self, policy: OrgPolicy) {
        if policy.org_id == DEFAULT_POLICY_ID {
            self.fallback = policy;
        } else {
            self.policies.insert(policy.org_id.clone(), policy);
        }
    }

    pub fn get(&self, org_id: &str) -> &OrgPolicy {
        self.policies.get(org_id).unwrap_or(&self.fallback)
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// What a rule found, before overrides and acknowledgments.
#[derive(Debug, Clone)]
pub struct Finding {
    pub severity: Severity,
    pub message: String,
    pub stage_id: Option<String>,
    pub suggestion: Option<String>,
}

impl Finding {
    fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            stage_id: None,
            suggestion: None,
        }
    }

    fn stage(mut self, id: &str) -> Self {
        self.stage_id = Some(id.to_string());
        self
    }

    fn suggest(mut self, s: impl Into<String>) -> Self {
        self.suggestion = Some(s.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PolicyViolation {
    pub id: String,
    pub rule_id: String,
    pub severity: Severity,
    pub category: PolicyCategory,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    pub acknowledged: bool,
}

impl PolicyViolation {
    pub fn blocks(&self) -> bool {
        self.severity == Severity::Error && !self.acknowledged
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LintSummary {
    pub errors: usize,
    pub warnings: usize,
    pub info: usize,
    pub acknowledged: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyLintResult {
    pub passed: bool,
    pub violations: Vec<PolicyViolation>,
    pub summary: LintSummary,
}

/// Policy rule trait - produces findings
pub trait PolicyRule: Send + Sync {
    fn id(&self) -> &'static str;
    fn category(&self) -> PolicyCategory;
    fn evaluate(&self, channel: &Channel, policy: &OrgPolicy) -> Vec<Finding>;
}

// --- Concrete Rules ---

/// One internet-egress protocol flag against its policy mode.
pub struct EgressRule {
    id: &'static str,
    protocol: &'static str,
    flag: fn(&SecurityFlags) -> bool,
    mode: fn(&InternetEgressPolicy) -> PolicyMode,
}

impl EgressRule {
    pub fn http() -> Self {
        Self {
            id: "security.internet-http-out",
            protocol: "HTTP",
            flag: |s| s.allow_internet_http_out,
            mode: |p| p.http,
        }
    }

    pub fn tcp() -> Self {
        Self {
            id: "security.internet-tcp-out",
            protocol: "TCP",
            flag: |s| s.allow_internet_tcp_out,
            mode: |p| p.tcp,
        }
    }

    pub fn udp() -> Self {
        Self {
            id: "security.internet-udp-out",
            protocol: "UDP",
            flag: |s| s.allow_internet_udp_out,
            mode: |p| p.udp,
        }
    }
}

impl PolicyRule for EgressRule {
    fn id(&self) -> &'static str {
        self.id
    }

    fn category(&self) -> PolicyCategory {
        PolicyCategory::Security
    }

    fn evaluate(&self, channel: &Channel, policy: &OrgPolicy) -> Vec<Finding> {
        if !(self.flag)(&channel.security) {
            return vec![];
        }
        let Some(severity) = (self.mode)(&policy.internet_egress).severity() else {
            return vec![];
        };
        vec![Finding::new(
            severity,
            format!("Channel requests outbound {} access to the internet", self.protocol),
        )
        .suggest("Route traffic through an approved gateway or request a policy exception")]
    }
}

pub struct PublicInboundRule;

impl PolicyRule for PublicInboundRule {
    fn id(&self) -> &'static str {
        "security.public-http-in"
    }

    fn category(&self) -> PolicyCategory {
        PolicyCategory::Security
    }

    fn evaluate(&self, channel: &Channel, policy: &OrgPolicy) -> Vec<Finding> {
        if !channel.security.allow_http_in_from_internet {
            return vec![];
        }
        policy
            .public_http_inbound
            .severity()
            .map(|sev| {
                Finding::new(sev, "Channel accepts inbound HTTP from the internet")
                    .suggest("Expose the endpoint through the organization's ingress instead")
            })
            .into_iter()
            .collect()
    }
}

pub struct BlockedNexonRule;

impl PolicyRule for BlockedNexonRule {
    fn id(&self) -> &'static str {
        "nexon.blocked"
    }

    fn category(&self) -> PolicyCategory {
        PolicyCategory::Nexon
    }

    fn evaluate(&self, channel: &Channel, policy: &OrgPolicy) -> Vec<Finding> {
        channel
            .stages
            .iter()
            .filter(|s| listed(&policy.blocked_nexons, &s.nexon_id))
            .map(|s| {
                Finding::new(
                    Severity::Error,
                    format!("Stage '{}' uses blocked nexon '{}'", s.display_name(), s.nexon_id),
                )
                .stage(&s.id)
            })
            .collect()
    }
}

pub struct AllowListRule;

impl PolicyRule for AllowListRule {
    fn id(&self) -> &'static str {
        "nexon.not-allowed"
    }

    fn category(&self) -> PolicyCategory {
        PolicyCategory::Nexon
    }

    fn evaluate(&self, channel: &Channel, policy: &OrgPolicy) -> Vec<Finding> {
        let Some(allowed) = &policy.allowed_nexons else {
            return vec![];
        };
        let Some(severity) = policy.unlisted_nexons.severity() else {
            return vec![];
        };
        channel
            .stages
            .iter()
            .filter(|s| !listed(allowed, &s.nexon_id))
            .map(|s| {
                Finding::new(
                    severity,
                    format!("Nexon '{}' is not on the organization's allow list", s.nexon_id),
                )
                .stage(&s.id)
                .suggest("Use an approved nexon or ask an administrator to allow this one")
            })
            .collect()
    }
}

pub struct UnpinnedVersionRule;

impl PolicyRule for UnpinnedVersionRule {
    fn id(&self) -> &'static str {
        "nexon.unpinned-version"
    }

    fn category(&self) -> PolicyCategory {
        PolicyCategory::Nexon
    }

    fn evaluate(&self, channel: &Channel, _policy: &OrgPolicy) -> Vec<Finding> {
        channel
            .stages
            .iter()
            .filter(|s| s.nexon_version.is_none())
            .map(|s| {
                Finding::new(
                    Severity::Info,
                    format!("Stage '{}' does not pin a nexon version", s.display_name()),
                )
                .stage(&s.id)
                .suggest("Set nexonVersion for reproducible builds")
            })
            .collect()
    }
}

pub struct RuntimeTargetRule;

impl PolicyRule for RuntimeTargetRule {
    fn id(&self) -> &'static str {
        "runtime.target-not-allowed"
    }

    fn category(&self) -> PolicyCategory {
        PolicyCategory::Runtime
    }

    fn evaluate(&self, channel: &Channel, policy: &OrgPolicy) -> Vec<Finding> {
        let target = channel.runtime.target;
        if policy.allowed_targets.contains(&target) {
            return vec![];
        }
        vec![Finding::new(
            Severity::Error,
            format!("Runtime target '{}' is not allowed for this organization", target),
        )]
    }
}

pub struct StageLimitRule;

impl PolicyRule for StageLimitRule {
    fn id(&self) -> &'static str {
        "limits.max-stages"
    }

    fn category(&self) -> PolicyCategory {
        PolicyCategory::Limits
    }

    fn evaluate(&self, channel: &Channel, policy: &OrgPolicy) -> Vec<Finding> {
        let count = channel.stages.len();
        if count <= policy.max_stages {
            return vec![];
        }
        vec![Finding::new(
            Severity::Error,
            format!("Channel has {} stages, limit is {}", count, policy.max_stages),
        )
        .suggest("Split the channel into smaller channels")]
    }
}

/// Fires only below the hard limit so one channel never gets both.
pub struct StageCountWarningRule;

impl PolicyRule for StageCountWarningRule {
    fn id(&self) -> &'static str {
        "limits.stage-count-warning"
    }

    fn category(&self) -> PolicyCategory {
        PolicyCategory::Limits
    }

    fn evaluate(&self, channel: &Channel, policy: &OrgPolicy) -> Vec<Finding> {
        let count = channel.stages.len();
        if count <= policy.stage_warn_threshold || count > policy.max_stages {
            return vec![];
        }
        vec![Finding::new(
            Severity::Warning,
            format!(
                "Channel has {} stages, above the recommended {}",
                count, policy.stage_warn_threshold
            ),
        )]
    }
}

pub struct DocumentationRule;

impl PolicyRule for DocumentationRule {
    fn id(&self) -> &'static str {
        "docs.missing"
    }

    fn category(&self) -> PolicyCategory {
        PolicyCategory::Documentation
    }

    fn evaluate(&self, channel: &Channel, policy: &OrgPolicy) -> Vec<Finding> {
        let Some(severity) = policy.require_documentation.severity() else {
            return vec![];
        };
        let len = channel.documentation.as_ref().map_or(0, |d| d.text_len());
        if len >= policy.min_documentation_length {
            return vec![];
        }
        let message = if channel.documentation.is_none() {
            "Channel has no documentation".to_string()
        } else {
            format!(
                "Channel documentation is shorter than {} characters",
                policy.min_documentation_length
            )
        };
        vec![Finding::new(severity, message).suggest("Describe what the channel does and who owns it")]
    }
}

pub struct SensitiveDataRule;

impl PolicyRule for SensitiveDataRule {
    fn id(&self) -> &'static str {
        "compliance.sensitive-data"
    }

    fn category(&self) -> PolicyCategory {
        PolicyCategory::Compliance
    }

    fn evaluate(&self, channel: &Channel, policy: &OrgPolicy) -> Vec<Finding> {
        let exposed = channel.security.any_egress() || channel.runtime.target == RuntimeTarget::Cloud;
        if !exposed {
            return vec![];
        }
        let Some(severity) = policy.sensitive_data.severity() else {
            return vec![];
        };
        channel
            .stages
            .iter()
            .filter(|s| listed(&policy.sensitive_data_nexons, &s.nexon_id))
            .map(|s| {
                Finding::new(
                    severity,
                    format!(
                        "Stage '{}' handles sensitive data on a channel with internet or cloud exposure",
                        s.display_name()
                    ),
                )
                .stage(&s.id)
                .suggest("Keep sensitive-data stages on-premises without internet egress")
            })
            .collect()
    }
}

/// Linter orchestrates rules and applies overrides and acknowledgments.
pub struct PolicyLinter {
    registry: PolicyRegistry,
    rules: Vec<Box<dyn PolicyRule>>,
}

impl PolicyLinter {
    pub fn new(registry: PolicyRegistry) -> Self {
        Self {
            registry,
            rules: vec![
                Box::new(EgressRule::http()),
                Box::new(EgressRule::tcp()),
                Box::new(EgressRule::udp()),
                Box::new(PublicInboundRule),
                Box::new(BlockedNexonRule),
                Box::new(AllowListRule),
                Box::new(UnpinnedVersionRule),
                Box::new(RuntimeTargetRule),
                Box::new(StageLimitRule),
                Box::new(StageCountWarningRule),
                Box::new(DocumentationRule),
                Box::new(SensitiveDataRule),
            ],
        }
    }

    pub fn registry(&self) -> &PolicyRegistry {
        &self.registry
    }

    pub fn lint(&self, channel: &Channel, org_id: &str, acknowledged: &[String]) -> PolicyLintResult {
        self.lint_with_policy(channel, self.registry.get(org_id), acknowledged)
    }

    pub fn lint_with_policy(
        &self,
        channel: &Channel,
        policy: &OrgPolicy,
        acknowledged: &[String],
    ) -> PolicyLintResult {
        let acked: HashSet<&str> = acknowledged.iter().map(|s| s.trim()).collect();
        let mut violations = vec![];

        for rule in &self.rules {
            for finding in rule.evaluate(channel, policy) {
                let rule_id = rule.id();
                let id = match &finding.stage_id {
                    Some(stage) => format!("{}:{}", rule_id, stage),
                    None => rule_id.to_string(),
                };
                let severity = policy
                    .severity_overrides
                    .get(rule_id)
                    .copied()
                    .unwrap_or(finding.severity);
                let is_acked = acked.contains(id.as_str()) || acked.contains(rule_id);
                violations.push(PolicyViolation {
                    id,
                    rule_id: rule_id.to_string(),
                    severity,
                    category: rule.category(),
                    message: finding.message,
                    stage_id: finding.stage_id,
                    suggestion: finding.suggestion,
                    acknowledged: is_acked,
                });
            }
        }

        let mut summary = LintSummary::default();
        for v in &violations {
            match v.severity {
                Severity::Error => summary.errors += 1,
                Severity::Warning => summary.warnings += 1,
                Severity::Info => summary.info += 1,
            }
            if v.acknowledged {
                summary.acknowledged += 1;
            }
        }

        PolicyLintResult {
            passed: !violations.iter().any(PolicyViolation::blocks),
            violations,
            summary,
        }
    }
}

impl Default for PolicyLinter {
    fn default() -> Self {
        Self::new(PolicyRegistry::default())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcknowledgeRequest {
    pub channel_id: String,
    pub user_id: String,
    pub violation_ids: Vec<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AcknowledgeResponse {
    pub success: bool,
    pub acknowledged_violations: Vec<String>,
    pub message: String,
}

impl AcknowledgeResponse {
    fn rejected(message: &str) -> Self {
        Self {
            success: false,
            acknowledged_violations: vec![],
            message: message.to_string(),
        }
    }
}

/// Record a user's acknowledgment of policy violations.
///
/// Ids are trimmed and deduplicated in first-seen order. The accepted ids
/// are what callers pass back as `acknowledgedViolations` on the next
/// compile.
pub fn acknowledge(request: &AcknowledgeRequest) -> AcknowledgeResponse {
    if request.reason.trim().is_empty() {
        return AcknowledgeResponse::rejected("A reason is required to acknowledge violations");
    }
    if request.channel_id.trim().is_empty() || request.user_id.trim().is_empty() {
        return AcknowledgeResponse::rejected("channelId and userId are required");
    }

    let mut seen = HashSet::new();
    let ids: Vec<String> = request
        .violation_ids
        .iter()
        .map(|id| id.trim())
        .filter(|id| !id.is_empty() && seen.insert(*id))
        .map(str::to_string)
        .collect();

    if ids.is_empty() {
        return AcknowledgeResponse::rejected("No violation ids to acknowledge");
    }

    info!(
        channel_id = %request.channel_id,
        user_id = %request.user_id,
        count = ids.len(),
        reason = %request.reason.trim(),
        "policy violations acknowledged"
    );

    AcknowledgeResponse {
        success: true,
        message: format!("Acknowledged {} violation(s)", ids.len()),
        acknowledged_violations: ids,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn channel(v: serde_json::Value) -> Channel {
        serde_json::from_value(v).unwrap()
    }

    fn documented() -> serde_json::Value {
        json!({"summary": "Moves orders from the shop into the ERP nightly", "owner": "ops"})
    }

    fn linter() -> PolicyLinter {
        PolicyLinter::default()
    }

    fn rule_ids(r: &PolicyLintResult) -> Vec<&str> {
        r.violations.iter().map(|v| v.rule_id.as_str()).collect()
    }

    #[test]
    fn test_clean_channel_passes() {
        let c = channel(json!({
            "channelId": "c",
            "documentation": documented(),
            "stages": [{"id": "a", "nexonId": "function", "nexonVersion": "1.0.0"}]
        }));
        let r = linter().lint(&c, "acme", &[]);
        assert!(r.passed);
        assert!(r.violations.is_empty(), "{:?}", r.violations);
    }

    #[test]
    fn test_warn_mode_does_not_block() {
        let c = channel(json!({
            "channelId": "c",
            "documentation": documented(),
            "security": {"allowInternetHttpOut": true},
            "stages": [{"id": "a", "nexonId": "http-request", "nexonVersion": "1.0.0"}]
        }));
        let r = linter().lint(&c, "acme", &[]);
        assert!(r.passed);
        assert_eq!(r.summary.warnings, 1);
        assert_eq!(rule_ids(&r), vec!["security.internet-http-out"]);
    }

    #[test]
    fn test_deny_blocks_until_acknowledged() {
        let c = channel(json!({
            "channelId": "c",
            "documentation": documented(),
            "security": {"allowInternetTcpOut": true},
            "stages": [{"id": "a", "nexonId": "tcp-out", "nexonVersion": "1.0.0"}]
        }));
        let r = linter().lint(&c, "acme", &[]);
        assert!(!r.passed);
        assert_eq!(r.summary.errors, 1);

        let r = linter().lint(&c, "acme", &["security.internet-tcp-out".to_string()]);
        assert!(r.passed);
        assert!(r.violations[0].acknowledged);
        assert_eq!(r.summary.acknowledged, 1);
    }

    #[test]
    fn test_stage_scoped_ack() {
        let mut policy = OrgPolicy::default();
        policy.blocked_nexons = vec!["legacy-*".to_string()];
        let c = channel(json!({
            "channelId": "c",
            "documentation": documented(),
            "stages": [
                {"id": "a", "nexonId": "legacy-ftp", "nexonVersion": "1.0.0"},
                {"id": "b", "nexonId": "legacy-smb", "nexonVersion": "1.0.0"}
            ]
        }));
        let l = linter();
        let r = l.lint_with_policy(&c, &policy, &["nexon.blocked:a".to_string()]);
        assert!(!r.passed);
        let ids: Vec<(&str, bool)> = r.violations.iter().map(|v| (v.id.as_str(), v.acknowledged)).collect();
        assert_eq!(ids, vec![("nexon.blocked:a", true), ("nexon.blocked:b", false)]);

        let r = l.lint_with_policy(&c, &policy, &["nexon.blocked".to_string()]);
        assert!(r.passed);
    }

    #[test]
    fn test_allow_list_and_unpinned() {
        let mut policy = OrgPolicy::default();
        policy.allowed_nexons = Some(vec!["function".to_string()]);
        policy.unlisted_nexons = PolicyMode::Warn;
        let c = channel(json!({
            "channelId": "c",
            "documentation": documented(),
            "stages": [
                {"id": "a", "nexonId": "function"},
                {"id": "b", "nexonId": "mqtt-in", "nexonVersion": "2.0.0"}
            ]
        }));
        let r = linter().lint_with_policy(&c, &policy, &[]);
        assert!(r.passed);
        assert_eq!(rule_ids(&r), vec!["nexon.not-allowed", "nexon.unpinned-version"]);
        assert_eq!(r.violations[1].severity, Severity::Info);
        assert_eq!(r.violations[0].stage_id.as_deref(), Some("b"));
    }

    #[test]
    fn test_limits_and_target() {
        let mut policy = OrgPolicy::default();
        policy.max_stages = 3;
        policy.stage_warn_threshold = 1;
        policy.allowed_targets = vec![RuntimeTarget::Onprem];
        let stages: Vec<_> = (0..2)
            .map(|i| json!({"id": format!("s{}", i), "nexonId": "function", "nexonVersion": "1.0.0"}))
            .collect();
        let c = channel(json!({
            "channelId": "c",
            "documentation": documented(),
            "runtime": {"target": "cloud"},
            "stages": stages
        }));
        let r = linter().lint_with_policy(&c, &policy, &[]);
        assert_eq!(rule_ids(&r), vec!["runtime.target-not-allowed", "limits.stage-count-warning"]);

        policy.max_stages = 1;
        let r = linter().lint_with_policy(&c, &policy, &[]);
        assert!(rule_ids(&r).contains(&"limits.max-stages"));
        assert!(!rule_ids(&r).contains(&"limits.stage-count-warning"));
    }

    #[test]
    fn test_documentation_and_sensitive_data() {
        let mut policy = OrgPolicy::default();
        policy.require_documentation = PolicyMode::Deny;
        policy.sensitive_data_nexons = vec!["postgres".to_string()];
        policy.sensitive_data = PolicyMode::Deny;
        let c = channel(json!({
            "channelId": "c",
            "runtime": {"target": "cloud"},
            "documentation": {"summary": "short"},
            "stages": [{"id": "db", "nexonId": "postgres", "nexonVersion": "1.0.0"}]
        }));
        let r = linter().lint_with_policy(&c, &policy, &[]);
        assert!(!r.passed);
        assert_eq!(rule_ids(&r), vec!["docs.missing", "compliance.sensitive-data"]);
        assert!(r.violations[0].message.contains("shorter than 20"));
    }

    #[test]
    fn test_severity_override() {
        let mut policy = OrgPolicy::default();
        policy
            .severity_overrides
            .insert("security.internet-tcp-out".to_string(), Severity::Warning);
        let c = channel(json!({
            "channelId": "c",
            "documentation": documented(),
            "security": {"allowInternetTcpOut": true},
            "stages": [{"id": "a", "nexonId": "x", "nexonVersion": "1.0.0"}]
        }));
        let r = linter().lint_with_policy(&c, &policy, &[]);
        assert!(r.passed);
        assert_eq!(r.violations[0].severity, Severity::Warning);
    }

    #[test]
    fn test_registry_load_from_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("acme.json"),
            r#"{"orgId": "acme", "internetEgress": {"http": "deny"}}"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("default.json"),
            r#"{"orgId": "default", "requireDocumentation": "allow"}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("broken.json"), "{not json").unwrap();

        let registry = PolicyRegistry::load_from_dir(dir.path()).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("acme").internet_egress.http, PolicyMode::Deny);
        assert_eq!(registry.get("acme").internet_egress.tcp, PolicyMode::Deny);
        assert_eq!(registry.get("other").require_documentation, PolicyMode::Allow);
    }

    #[test]
    fn test_acknowledge_contract() {
        let req = AcknowledgeRequest {
            channel_id: "c".into(),
            user_id: "u".into(),
            violation_ids: vec![" a ".into(), "b".into(), "a".into(), "".into()],
            reason: "approved by security review".into(),
        };
        let resp = acknowledge(&req);
        assert!(resp.success);
        assert_eq!(resp.acknowledged_violations, vec!["a", "b"]);

        let resp = acknowledge(&AcknowledgeRequest { reason: "  ".into(), ..req.clone() });
        assert!(!resp.success);

        let resp = acknowledge(&AcknowledgeRequest { violation_ids: vec![" ".into()], ..req });
        assert!(!resp.success);
    }
}
