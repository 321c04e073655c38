//! Channel Compiler CLI
//!
//! Commands: compile, validate, lint, nexon, verify
//! Outputs JSON to stdout, logs to stderr
//! Returns 2 on compile/validation failure, 1 on usage or I/O failure

use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use channel_compiler::{
    bundle::{verify_bundle_with_limit, DeployHandoff},
    templates::{validate_template, FetchOptions},
    CompileRequest, Compiler, CompilerConfig,
};

#[derive(Parser)]
#[command(name = "channel-compiler-cli")]
#[command(about = "Channel Compiler - visual channel to runtime bundle")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a channel into a deployable bundle
    Compile {
        /// Channel document (JSON)
        #[arg(short, long)]
        channel: PathBuf,

        /// Organization whose policy applies
        #[arg(short, long)]
        org: String,

        #[arg(short, long, default_value = "cli")]
        user: String,

        /// Acknowledged violation id or rule id (repeatable)
        #[arg(long = "ack")]
        acks: Vec<String>,

        /// Write the bundle here instead of inlining it as base64
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Validate a channel document
    Validate {
        #[arg(short, long)]
        channel: PathBuf,
    },

    /// Lint a channel against an organization's policy
    Lint {
        #[arg(short, long)]
        channel: PathBuf,

        #[arg(short, long)]
        org: String,

        #[arg(long = "ack")]
        acks: Vec<String>,
    },

    /// Resolve and check a nexon template
    Nexon {
        #[arg(long)]
        id: String,

        #[arg(long)]
        version: Option<String>,
    },

    /// Recompute hashes and Merkle root of a bundle
    Verify {
        #[arg(short, long)]
        bundle: PathBuf,
    },
}

fn emit<T: Serialize>(value: &T) -> bool {
    match serde_json::to_string_pretty(value) {
        Ok(s) => {
            println!("{}", s);
            true
        }
        Err(e) => {
            println!("{}", json!({"error": format!("Failed to serialize output: {}", e)}));
            false
        }
    }
}

fn fail(message: String) -> ExitCode {
    println!("{}", json!({"error": message}));
    ExitCode::FAILURE
}

fn read_channel(path: &Path) -> Result<Value, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
    serde_json::from_str(&content).map_err(|e| format!("Invalid channel JSON: {}", e))
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match CompilerConfig::from_env() {
        Ok(c) => c,
        Err(e) => return fail(format!("Invalid configuration: {}", e)),
    };
    let compiler = match Compiler::from_config(config) {
        Ok(c) => c,
        Err(e) => return fail(e.to_string()),
    };

    match cli.command {
        Commands::Compile { channel, org, user, acks, out } => {
            let channel = match read_channel(&channel) {
                Ok(v) => v,
                Err(e) => return fail(e),
            };
            let mut result = compiler
                .compile(CompileRequest {
                    channel,
                    org_id: org,
                    user_id: user,
                    acknowledged_violations: acks,
                })
                .await;

            let mut handoff = None;
            if let (Some(out), Some(bytes)) = (&out, result.bundle.take()) {
                if let Err(e) = std::fs::write(out, &bytes) {
                    return fail(format!("Failed to write {}: {}", out.display(), e));
                }
                let root = out.parent().unwrap_or(Path::new("."));
                handoff = result.artifacts.as_ref().map(|a| {
                    DeployHandoff::for_bundle(root, a, &result.build_id, compiler.config().build_mode)
                });
            }

            let printed = match handoff {
                Some(h) => emit(&json!({"result": &result, "handoff": h})),
                None => emit(&result),
            };
            if !printed {
                ExitCode::FAILURE
            } else if result.success {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(2)
            }
        }

        Commands::Validate { channel } => {
            let channel = match read_channel(&channel) {
                Ok(v) => v,
                Err(e) => return fail(e),
            };
            let result = compiler.validate(&channel);
            if !emit(&result) {
                return ExitCode::FAILURE;
            }
            if result.valid {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(2)
            }
        }

        Commands::Lint { channel, org, acks } => {
            let raw = match read_channel(&channel) {
                Ok(v) => v,
                Err(e) => return fail(e),
            };
            let validation = compiler.validate(&raw);
            let Some(channel) = validation.channel.as_ref() else {
                emit(&validation);
                return ExitCode::from(2);
            };
            let result = compiler.lint(channel, &org, &acks);
            if !emit(&result) {
                return ExitCode::FAILURE;
            }
            if result.passed {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(2)
            }
        }

        Commands::Nexon { id, version } => {
            let resolved = compiler
                .resolver()
                .resolve(&id, version.as_deref(), &FetchOptions::default())
                .await;
            match resolved {
                Ok(t) => {
                    let check = validate_template(&t.manifest, &t.template);
                    let valid = check.valid;
                    let printed = emit(&json!({
                        "key": t.key(),
                        "manifest": &t.manifest,
                        "source": &t.source,
                        "validation": check,
                    }));
                    if !printed {
                        ExitCode::FAILURE
                    } else if valid {
                        ExitCode::SUCCESS
                    } else {
                        ExitCode::from(2)
                    }
                }
                Err(e) => {
                    println!("{}", json!({"error": e.to_string()}));
                    ExitCode::from(2)
                }
            }
        }

        Commands::Verify { bundle } => {
            let bytes = match std::fs::read(&bundle) {
                Ok(b) => b,
                Err(e) => return fail(format!("Failed to read {}: {}", bundle.display(), e)),
            };
            match verify_bundle_with_limit(&bytes, None, compiler.config().max_bundle_bytes) {
                Ok(report) => {
                    if !emit(&report) {
                        return ExitCode::FAILURE;
                    }
                    if report.valid {
                        ExitCode::SUCCESS
                    } else {
                        ExitCode::from(2)
                    }
                }
                Err(e) => {
                    println!("{}", json!({"valid": false, "error": e.to_string()}));
                    ExitCode::from(2)
                }
            }
        }
    }
}
