//! FleetForge Core - Fleet Production Builder
//!
//! # The Build Laws (Non-Negotiable)
//! 1. The Lock File Is Truth
//! 2. Variants Are Contracts
//! 3. Verification Is Protective
//! 4. Deterministic Images
//! 5. Manifests Enable Reproduction
//! 6. The Runtime Never Runs As Root

pub mod assembler;
pub mod compiler;
pub mod contract;
pub mod hashing;
pub mod manifest;
pub mod pipeline;
pub mod resolver;
pub mod variants;

pub use assembler::{ExecutionIdentity, ImageAssembler, RuntimeImage};
pub use compiler::{CompiledArtifact, CompilerStage, TargetPlatform, Toolchain};
pub use contract::{HealthProbe, ProbeVerdict, RuntimeContract};
pub use hashing::{canonical_json, compute_build_hash, compute_image_digest};
pub use manifest::{Lock, Manifest};
pub use pipeline::{BuildPipeline, BuildRequest, BuiltImage, PipelineError};
pub use resolver::{DependencyResolver, DependencySource, ResolvedSet};
pub use variants::{BasePolicy, VariantDescriptor, VariantId, VariantRegistry};

pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const MIN_DESCRIPTOR_VERSION: &str = "1.0.0";
