//! FleetForge CLI - Bridge interface for CI
//!
//! Commands: variants, resolve, build
//! Outputs JSON to stdout, stage logs to stderr
//! Returns non-zero on build failure

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use fleetforge_core::{
    assembler::TrustMaterial,
    compiler::{CommandToolchain, CompilerStage, TargetPlatform},
    manifest::{Lock, Manifest},
    pipeline::{BuildContext, BuildPipeline, BuildRequest},
    resolver::{DependencyCache, DependencyResolver, DirSource},
    variants::{BasePolicy, VariantRegistry},
};

#[derive(Parser)]
#[command(name = "fleetforge-cli")]
#[command(about = "FleetForge CLI - Fleet Production Builder")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to variant descriptors directory
    #[arg(short, long, default_value = "variants")]
    variants_dir: PathBuf,

    /// Source tree root (entry points and overlays resolve against it)
    #[arg(short, long, default_value = ".")]
    source_root: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// List known variants
    Variants,

    /// Resolve and verify the dependency set without building
    Resolve {
        #[command(flatten)]
        deps: DepArgs,
    },

    /// Build one variant's image
    Build {
        /// Variant identifier (required; no default variant exists)
        #[arg(long)]
        variant: String,

        #[command(flatten)]
        deps: DepArgs,

        /// Base policy override: minimal-os or zero-os
        #[arg(long)]
        base: Option<String>,

        /// Toolchain command invoked for compilation
        #[arg(long, default_value = "fleetforge-toolchain")]
        toolchain: String,

        /// Extra toolchain arguments (repeatable)
        #[arg(long = "toolchain-arg")]
        toolchain_args: Vec<String>,

        /// Compile deadline in seconds
        #[arg(long, default_value_t = 300)]
        compile_timeout: u64,

        /// Builder trust directory (ca-certificates.crt + zoneinfo/)
        #[arg(long, default_value = "builder/trust")]
        trust_dir: PathBuf,

        /// Shared configuration base directory
        #[arg(long)]
        shared_config: Option<PathBuf>,

        /// Materialize the assembled rootfs here
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(clap::Args)]
struct DepArgs {
    /// Dependency manifest
    #[arg(long, default_value = "manifest.json")]
    manifest: PathBuf,

    /// Lock record
    #[arg(long, default_value = "manifest.lock.json")]
    lock: PathBuf,

    /// Local dependency artifact directory
    #[arg(long, default_value = "deps")]
    artifacts: PathBuf,

    /// Dependency cache directory (shared across builds)
    #[arg(long, default_value = ".fleetforge/cache")]
    cache: PathBuf,

    /// Resolve deadline in seconds
    #[arg(long, default_value_t = 120)]
    resolve_timeout: u64,
}

fn parse_base(raw: &str) -> Option<BasePolicy> {
    match raw {
        "minimal-os" => Some(BasePolicy::MinimalOs),
        "zero-os" => Some(BasePolicy::ZeroOs),
        _ => None,
    }
}

fn resolver(deps: &DepArgs) -> DependencyResolver<DirSource> {
    DependencyResolver::new(
        DirSource::new(&deps.artifacts),
        Arc::new(DependencyCache::new(&deps.cache)),
        Duration::from_secs(deps.resolve_timeout),
    )
}

fn load_inputs(deps: &DepArgs) -> Result<(Manifest, Lock), String> {
    let manifest = Manifest::load(&deps.manifest).map_err(|e| e.to_string())?;
    let lock = Lock::load(&deps.lock).map_err(|e| e.to_string())?;
    Ok((manifest, lock))
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Load variant descriptors
    let registry = match VariantRegistry::load_from_dir(&cli.variants_dir) {
        Ok(r) => r,
        Err(e) => {
            eprintln!(r#"{{"error": "Failed to load variants: {}"}}"#, e);
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Commands::Variants => {
            let variants: Vec<_> = registry
                .list()
                .iter()
                .map(|v| {
                    serde_json::json!({
                        "id": v.id,
                        "name": v.name,
                        "kind": v.kind,
                        "base": v.base,
                        "port": v.port,
                        "deprecated": v.deprecated,
                    })
                })
                .collect();

            println!("{}", serde_json::to_string_pretty(&variants).unwrap());
            ExitCode::SUCCESS
        }

        Commands::Resolve { deps } => {
            let (manifest, lock) = match load_inputs(&deps) {
                Ok(pair) => pair,
                Err(e) => {
                    println!(r#"{{"resolved": false, "error": "{}"}}"#, e);
                    return ExitCode::FAILURE;
                }
            };

            match resolver(&deps).resolve(&manifest, &lock) {
                Ok(set) => {
                    let fingerprint = set.fingerprint();
                    let output = serde_json::json!({
                        "resolved": true,
                        "lockDigest": set.lock_digest,
                        "fingerprint": fingerprint,
                        "dependencies": set.dependencies,
                    });
                    println!("{}", serde_json::to_string_pretty(&output).unwrap());
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    println!(
                        r#"{{"resolved": false, "error": "{}"}}"#,
                        e.to_string().replace('"', "'")
                    );
                    ExitCode::from(2)
                }
            }
        }

        Commands::Build {
            variant,
            deps,
            base,
            toolchain,
            toolchain_args,
            compile_timeout,
            trust_dir,
            shared_config,
            output,
        } => {
            let base_override = match base.as_deref() {
                None => None,
                Some(raw) => match parse_base(raw) {
                    Some(policy) => Some(policy),
                    None => {
                        eprintln!(r#"{{"error": "Unknown base policy: {}"}}"#, raw);
                        return ExitCode::FAILURE;
                    }
                },
            };

            let (manifest, lock) = match load_inputs(&deps) {
                Ok(pair) => pair,
                Err(e) => {
                    println!(r#"{{"success": false, "error": "{}"}}"#, e);
                    return ExitCode::FAILURE;
                }
            };

            let trust = match TrustMaterial::load(&trust_dir) {
                Ok(t) => t,
                Err(e) => {
                    println!(
                        r#"{{"success": false, "error": "{}"}}"#,
                        e.to_string().replace('"', "'")
                    );
                    return ExitCode::FAILURE;
                }
            };

            let compiler = CompilerStage::new(
                CommandToolchain::new(
                    toolchain,
                    toolchain_args,
                    Duration::from_secs(compile_timeout),
                ),
                TargetPlatform::default(),
            );
            let context = BuildContext {
                source_root: cli.source_root.clone(),
                shared_config,
                trust,
            };
            let pipeline = BuildPipeline::new(registry, resolver(&deps), compiler, context);

            let request = BuildRequest {
                variant_id: variant,
                base_override,
            };

            match pipeline.build_image(&manifest, &lock, &request) {
                Ok(built) => {
                    if let Some(dir) = output {
                        if let Err(e) = built.image.materialize(&dir) {
                            println!(
                                r#"{{"success": false, "error": "{}"}}"#,
                                e.to_string().replace('"', "'")
                            );
                            return ExitCode::from(2);
                        }
                    }
                    let output = serde_json::json!({
                        "success": true,
                        "image": built.manifest,
                    });
                    println!("{}", serde_json::to_string_pretty(&output).unwrap());
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    let output = serde_json::json!({
                        "success": false,
                        "retryable": e.is_retryable(),
                        "error": e.to_string(),
                    });
                    println!("{}", serde_json::to_string(&output).unwrap());
                    ExitCode::from(2)
                }
            }
        }
    }
}
