//! Compilation Pipeline - Single Entry Point
//!
//! Validate → Lint → Generate → Bundle. `compile` always validates; there is
//! no path from a raw document to a bundle that skips it. Every domain
//! failure lands in the returned [`CompileResult`].

use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

use crate::bundle::{bundle, Bundle, BundleHashes, BundleMetadata, BundleOptions, BundlingError};
use crate::channel::Channel;
use crate::config::CompilerConfig;
use crate::generator::{ArtifactGenerator, GenerateOptions, GeneratedArtifacts, GeneratorError, IssueLevel};
use crate::policy::{PolicyLintResult, PolicyLinter, PolicyRegistry, Severity};
use crate::templates::{FetchOptions, TemplateCache, TemplateResolver};
use crate::validation::{ChannelValidation, ChannelValidator, ValidationIssue};

#[cfg(feature = "test-hooks")]
use std::sync::atomic::{AtomicU32, Ordering};

#[cfg(feature = "test-hooks")]
static VALIDATION_CALL_COUNT: AtomicU32 = AtomicU32::new(0);

#[cfg(feature = "test-hooks")]
pub fn get_validation_call_count() -> u32 {
    VALIDATION_CALL_COUNT.load(Ordering::SeqCst)
}

#[cfg(feature = "test-hooks")]
pub fn reset_validation_call_count() {
    VALIDATION_CALL_COUNT.store(0, Ordering::SeqCst);
}

/// Faults that are not a property of the submitted channel.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Generation failed: {0}")]
    Generation(#[from] GeneratorError),

    #[error("Bundling task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Policy directory could not be loaded: {0}")]
    Policy(#[source] std::io::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompileRequest {
    pub channel: Value,
    pub org_id: String,
    pub user_id: String,
    #[serde(default)]
    pub acknowledged_violations: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CompileStage {
    Validate,
    Lint,
    Generate,
    Bundle,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CompileIssue {
    pub stage: CompileStage,
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_id: Option<String>,
}

impl CompileIssue {
    fn new(stage: CompileStage, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            stage,
            code: code.into(),
            message: message.into(),
            stage_id: None,
        }
    }

    fn from_validation(issue: &ValidationIssue) -> Self {
        Self {
            stage_id: issue.stage_ids.first().cloned(),
            ..Self::new(CompileStage::Validate, issue.code.clone(), issue.message.clone())
        }
    }
}

fn as_base64<S: Serializer>(bytes: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
    match bytes {
        Some(b) => s.serialize_str(&base64::Engine::encode(
            &base64::engine::general_purpose::STANDARD,
            b,
        )),
        None => s.serialize_none(),
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompileResult {
    pub success: bool,
    pub build_id: String,
    pub validation: ChannelValidation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_lint: Option<PolicyLintResult>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<CompileIssue>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<CompileIssue>,
    #[serde(serialize_with = "as_base64", skip_serializing_if = "Option::is_none")]
    pub bundle: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hashes: Option<BundleHashes>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BundleMetadata>,
    /// Generated artifacts, for callers that deploy without unpacking.
    #[serde(skip)]
    pub artifacts: Option<GeneratedArtifacts>,
}

impl CompileResult {
    fn started(build_id: String) -> Self {
        Self {
            success: false,
            build_id,
            validation: ChannelValidation {
                valid: false,
                channel: None,
                errors: vec![],
                warnings: vec![],
            },
            policy_lint: None,
            errors: vec![],
            warnings: vec![],
            bundle: None,
            hashes: None,
            metadata: None,
            artifacts: None,
        }
    }
}

/// The compilation pipeline - single entry point for channel builds
pub struct Compiler {
    validator: ChannelValidator,
    linter: Arc<PolicyLinter>,
    generator: ArtifactGenerator,
    resolver: Arc<TemplateResolver>,
    config: CompilerConfig,
}

impl Compiler {
    pub fn new(config: CompilerConfig, resolver: Arc<TemplateResolver>, linter: Arc<PolicyLinter>) -> Self {
        Self {
            validator: ChannelValidator::new(),
            generator: ArtifactGenerator::new(resolver.clone()),
            linter,
            resolver,
            config,
        }
    }

    /// Wire sources, cache and policies from configuration.
    pub fn from_config(config: CompilerConfig) -> Result<Self, PipelineError> {
        let cache = Arc::new(TemplateCache::new(config.template_ttl));
        let resolver = Arc::new(TemplateResolver::from_config(&config, cache));
        let registry = match &config.policy_dir {
            Some(dir) => PolicyRegistry::load_from_dir(dir).map_err(PipelineError::Policy)?,
            None => PolicyRegistry::new(),
        };
        Ok(Self::new(config, resolver, Arc::new(PolicyLinter::new(registry))))
    }

    pub fn resolver(&self) -> &Arc<TemplateResolver> {
        &self.resolver
    }

    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }

    /// Validate a raw channel document.
    ///
    /// This is the ONLY validation entry point.
    pub fn validate(&self, raw: &Value) -> ChannelValidation {
        #[cfg(feature = "test-hooks")]
        VALIDATION_CALL_COUNT.fetch_add(1, Ordering::SeqCst);

        self.validator.validate(raw)
    }

    pub fn lint(&self, channel: &Channel, org_id: &str, acknowledged: &[String]) -> PolicyLintResult {
        self.linter.lint(channel, org_id, acknowledged)
    }

    /// Compile a channel. Never fails: faults become `internal` errors.
    pub async fn compile(&self, request: CompileRequest) -> CompileResult {
        let build_id = Uuid::new_v4().to_string();
        let span = info_span!(
            "compile",
            build_id = %build_id,
            org_id = %request.org_id,
            channel_id = tracing::field::Empty,
        );

        async move {
            info!(user_id = %request.user_id, "compile started");
            let mut result = CompileResult::started(build_id.clone());
            if let Err(e) = self.run(&request, &mut result).await {
                error!(build_id = %build_id, error = %e, "compile aborted by internal fault");
                result.success = false;
                result
                    .errors
                    .push(CompileIssue::new(CompileStage::Internal, "internal", e.to_string()));
            }
            info!(
                success = result.success,
                errors = result.errors.len(),
                warnings = result.warnings.len(),
                "compile finished"
            );
            result
        }
        .instrument(span)
        .await
    }

    async fn run(&self, request: &CompileRequest, result: &mut CompileResult) -> Result<(), PipelineError> {
        // MANDATORY: validation runs on every compile.
        let validation = self.validate(&request.channel);
        result
            .warnings
            .extend(validation.warnings.iter().map(CompileIssue::from_validation));
        if !validation.valid {
            result
                .errors
                .extend(validation.errors.iter().map(CompileIssue::from_validation));
            result.validation = validation;
            return Ok(());
        }
        let Some(channel) = validation.channel.clone() else {
            result.validation = validation;
            return Ok(());
        };
        result.validation = validation;
        Span::current().record("channel_id", channel.channel_id.as_str());

        let lint = self.lint(&channel, &request.org_id, &request.acknowledged_violations);
        for v in &lint.violations {
            let issue = CompileIssue {
                stage_id: v.stage_id.clone(),
                ..CompileIssue::new(CompileStage::Lint, v.id.clone(), v.message.clone())
            };
            match v.severity {
                Severity::Error if v.blocks() => result.errors.push(issue),
                Severity::Error | Severity::Warning => result.warnings.push(issue),
                Severity::Info => {}
            }
        }
        let passed = lint.passed;
        result.policy_lint = Some(lint);
        if !passed {
            warn!("policy lint blocked the build");
            return Ok(());
        }

        let options = GenerateOptions {
            build_id: result.build_id.clone(),
            mode: self.config.build_mode,
            target: None,
            fetch: FetchOptions::default(),
        };
        let generated = self.generator.generate(&channel, &options).await?;
        for issue in &generated.issues {
            if issue.level == IssueLevel::Warning {
                result.warnings.push(CompileIssue {
                    stage_id: issue.stage_id.clone(),
                    ..CompileIssue::new(CompileStage::Generate, issue.code.clone(), issue.message.clone())
                });
            }
        }

        let bundle_options = BundleOptions {
            build_id: result.build_id.clone(),
            created_at: chrono::Utc::now(),
            compression: self.config.compression,
            include_metadata: self.config.include_metadata,
        };
        let artifacts = Arc::new(generated.artifacts);
        let task = {
            let artifacts = artifacts.clone();
            tokio::task::spawn_blocking(move || bundle(&artifacts, &bundle_options))
        };

        let bundled: Result<Bundle, BundlingError> =
            match tokio::time::timeout(self.config.bundle_timeout, task).await {
                Err(_) => Err(BundlingError::Timeout(self.config.bundle_timeout)),
                Ok(joined) => joined?,
            };

        match bundled {
            Ok(b) => {
                info!(
                    merkle_root = %b.hashes.merkle_root,
                    bundle_hash = %b.hashes.bundle_hash,
                    size = b.bytes.len(),
                    "bundle created"
                );
                result.success = true;
                result.bundle = Some(b.bytes);
                result.hashes = Some(b.hashes);
                result.metadata = Some(b.metadata);
                result.artifacts = Some(Arc::unwrap_or_clone(artifacts));
            }
            Err(e) => {
                warn!(error = %e, "bundling failed");
                let code = match e {
                    BundlingError::Timeout(_) => "bundle.timeout",
                    _ => "bundle.failed",
                };
                result
                    .errors
                    .push(CompileIssue::new(CompileStage::Bundle, code, e.to_string()));
            }
        }
        Ok(())
    }
}
