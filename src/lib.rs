//! Channel Compiler - Visual Channel to Runtime Bundle
//!
//! # Guarantees
//! 1. Every compile validates before anything else runs
//! 2. Policy violations gate the build unless acknowledged
//! 3. Secrets never appear in generated artifacts, only env placeholders
//! 4. Identical channels produce identical artifact hashes and Merkle roots
//! 5. One stage failing yields a placeholder node, never a failed build

pub mod bundle;
pub mod channel;
pub mod config;
pub mod credentials;
pub mod expression;
pub mod generator;
pub mod hashing;
pub mod merkle;
pub mod pipeline;
pub mod policy;
pub mod settings;
pub mod sources;
pub mod substitution;
pub mod templates;
pub mod validation;

pub use bundle::{bundle, verify_bundle, Bundle, BundleHashes, BundleOptions, Compression, DeployHandoff};
pub use channel::{BuildMode, Channel, RuntimeTarget};
pub use config::CompilerConfig;
pub use credentials::CredentialsMap;
pub use generator::{ArtifactGenerator, GeneratedArtifacts};
pub use hashing::{canonical_json, sha256_hex};
pub use pipeline::{CompileRequest, CompileResult, Compiler, PipelineError};
pub use policy::{PolicyLintResult, PolicyLinter, PolicyRegistry};
pub use substitution::SubstitutionEngine;
pub use templates::{TemplateCache, TemplateResolver};
pub use validation::{ChannelValidation, ChannelValidator};

pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
