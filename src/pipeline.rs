//! Build Pipeline - Single Entry Point
//!
//! CRITICAL: build_image resolves and verifies dependencies BEFORE any
//! compilation, and compiles before any assembly. No bypass, no partial
//! promotion: a failed stage ends that variant's build immediately.

use std::path::PathBuf;

use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::assembler::{
    AssemblyError, AssemblyInput, ExecutionIdentity, ImageAssembler, RuntimeImage, TrustMaterial,
};
use crate::compiler::{CompileError, CompilerStage, TargetPlatform, Toolchain};
use crate::contract::{ContractError, RuntimeContract};
use crate::hashing::{compute_build_hash, compute_image_digest, sha256_hex};
use crate::manifest::{Lock, Manifest, ManifestError};
use crate::resolver::{DependencyResolver, DependencySource, ResolverError};
use crate::variants::{BasePolicy, VariantDescriptor, VariantKind, VariantRegistry};
use crate::ENGINE_VERSION;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Unknown variant: {0}")]
    UnknownVariant(String),

    #[error("Integrity mismatch for {dependency}: lock pins {expected}, fetched {actual}")]
    IntegrityMismatch {
        dependency: String,
        expected: String,
        actual: String,
    },

    #[error("Dependency {0} is not pinned in the lock record")]
    UnpinnedDependency(String),

    #[error("Dependency resolution failed: {0}")]
    Resolve(String),

    #[error("Compilation error: {0}")]
    CompileError(String),

    #[error("{stage} stage exceeded {limit_secs}s (retry the whole build)")]
    Timeout {
        stage: &'static str,
        limit_secs: u64,
    },

    #[error("Descriptor {0} requires engine >= {1}, current is {2}")]
    EngineVersionMismatch(String, String, String),

    #[error(transparent)]
    Assembly(#[from] AssemblyError),

    #[error(transparent)]
    Contract(#[from] ContractError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl PipelineError {
    /// Retryable errors are retried at whole-pipeline granularity; there is
    /// no partial resume inside one build.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::Timeout { .. })
    }
}

impl From<ResolverError> for PipelineError {
    fn from(err: ResolverError) -> Self {
        match err {
            ResolverError::IntegrityMismatch {
                dependency,
                expected,
                actual,
            } => PipelineError::IntegrityMismatch {
                dependency,
                expected,
                actual,
            },
            ResolverError::NotPinned(dep) => PipelineError::UnpinnedDependency(dep),
            ResolverError::Timeout { limit_secs } => PipelineError::Timeout {
                stage: "resolve",
                limit_secs,
            },
            ResolverError::Manifest(e) => PipelineError::Manifest(e),
            other => PipelineError::Resolve(other.to_string()),
        }
    }
}

impl From<CompileError> for PipelineError {
    fn from(err: CompileError) -> Self {
        match err {
            CompileError::Timeout { limit_secs } => PipelineError::Timeout {
                stage: "compile",
                limit_secs,
            },
            other => PipelineError::CompileError(other.to_string()),
        }
    }
}

/// Build-time parameters for one pipeline run. The variant identifier is
/// required; its absence is a build-configuration error at the CLI boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildRequest {
    pub variant_id: String,
    /// Deployment-profile override for the descriptor's base policy.
    #[serde(default)]
    pub base_override: Option<BasePolicy>,
}

/// Builder-stage inputs shared by every variant build.
pub struct BuildContext {
    /// Source tree root; descriptor entry points and overlays are relative
    /// to it.
    pub source_root: PathBuf,
    /// Shared configuration base copied into every image.
    pub shared_config: Option<PathBuf>,
    /// CA roots and tzdata from the builder stage.
    pub trust: TrustMaterial,
}

/// One file of the final layer, as recorded in the build manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub path: String,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

/// The promoted artifact, as recorded in the build manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactRecord {
    pub size: usize,
    pub sha256: String,
    pub target: TargetPlatform,
    pub data_base64: String,
}

/// Reproducible record of one produced image.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    pub id: String,
    pub variant_id: String,
    pub kind: VariantKind,
    pub base: BasePolicy,
    pub engine_version: String,
    pub created_at: DateTime<Utc>,
    pub lock_digest: String,
    /// Identical inputs always yield an identical build hash.
    pub build_hash: String,
    /// Digest over this manifest; computed last.
    pub image_digest: String,
    pub artifact: ArtifactRecord,
    pub contract: RuntimeContract,
    pub execution_identity: ExecutionIdentity,
    pub files: Vec<FileRecord>,
}

/// A finished build: the manifest the orchestrator consumes plus the
/// assembled layer itself.
#[derive(Debug)]
pub struct BuiltImage {
    pub manifest: ImageManifest,
    pub image: RuntimeImage,
}

/// The build pipeline - single entry point for producing images.
pub struct BuildPipeline<S: DependencySource, T: Toolchain> {
    registry: VariantRegistry,
    resolver: DependencyResolver<S>,
    compiler: CompilerStage<T>,
    context: BuildContext,
}

impl<S: DependencySource, T: Toolchain> BuildPipeline<S, T> {
    pub fn new(
        registry: VariantRegistry,
        resolver: DependencyResolver<S>,
        compiler: CompilerStage<T>,
        context: BuildContext,
    ) -> Self {
        Self {
            registry,
            resolver,
            compiler,
            context,
        }
    }

    /// List all known variants
    pub fn list_variants(&self) -> Vec<&VariantDescriptor> {
        self.registry.list()
    }

    /// Get a specific variant descriptor
    pub fn get_variant(&self, id: &str) -> Option<&VariantDescriptor> {
        self.registry.get(id)
    }

    /// Build one variant's image: select, resolve, compile, assemble.
    ///
    /// Stages run strictly in sequence; no stage starts before its
    /// predecessor succeeds, and no partial image is ever published.
    pub fn build_image(
        &self,
        manifest: &Manifest,
        lock: &Lock,
        request: &BuildRequest,
    ) -> Result<BuiltImage, PipelineError> {
        let descriptor = self
            .registry
            .get(&request.variant_id)
            .ok_or_else(|| PipelineError::UnknownVariant(request.variant_id.clone()))?;
        self.check_engine_version(descriptor)?;
        let base = request.base_override.unwrap_or(descriptor.base);
        let (entry_point, overlay) = descriptor.resolve();

        info!(variant = %descriptor.id, ?base, "build started");

        let resolved = self.resolver.resolve(manifest, lock)?;

        let entry_abs = self.context.source_root.join(entry_point);
        let artifact = self.compiler.compile(&entry_abs, &resolved)?;

        let contract = RuntimeContract::for_variant(
            &descriptor.id,
            descriptor.port,
            base,
            descriptor.probe.clone(),
        );
        contract.validate(base)?;

        let identity = ExecutionIdentity::for_kind(descriptor.kind);
        let assembler = ImageAssembler::new(identity)?;
        let overlay_abs = overlay.map(|p| self.context.source_root.join(p));
        let image = assembler.assemble(AssemblyInput {
            artifact: &artifact,
            trust: &self.context.trust,
            shared_config: self.context.shared_config.as_deref(),
            overlay_config: overlay_abs.as_deref(),
            contract: &contract,
            base,
        })?;

        let build_hash = compute_build_hash(
            &descriptor.id,
            &resolved.lock_digest,
            self.compiler.target(),
            ENGINE_VERSION,
        )?;

        let files = image
            .entries()
            .map(|(path, file)| FileRecord {
                path: path.display().to_string(),
                mode: file.mode,
                uid: file.owner.uid,
                gid: file.owner.gid,
            })
            .collect();

        let mut built = ImageManifest {
            id: Uuid::new_v4().to_string(),
            variant_id: descriptor.id.clone(),
            kind: descriptor.kind,
            base,
            engine_version: ENGINE_VERSION.to_string(),
            created_at: Utc::now(),
            lock_digest: resolved.lock_digest.clone(),
            build_hash,
            image_digest: String::new(), // Computed after
            artifact: ArtifactRecord {
                size: artifact.data.len(),
                sha256: sha256_hex(&artifact.data),
                target: artifact.target.clone(),
                data_base64: base64::engine::general_purpose::STANDARD.encode(&artifact.data),
            },
            contract,
            execution_identity: assembler.identity().clone(),
            files,
        };
        built.image_digest = compute_image_digest(&built)?;

        info!(variant = %built.variant_id, digest = %built.image_digest, "build finished");
        Ok(BuiltImage {
            manifest: built,
            image,
        })
    }

    fn check_engine_version(&self, descriptor: &VariantDescriptor) -> Result<(), PipelineError> {
        let engine_ver = semver::Version::parse(ENGINE_VERSION)
            .map_err(|_| PipelineError::CompileError("Invalid engine version".into()))?;
        let min_ver = semver::Version::parse(&descriptor.engine_min_version)
            .map_err(|_| PipelineError::CompileError("Invalid descriptor min version".into()))?;

        if engine_ver < min_ver {
            return Err(PipelineError::EngineVersionMismatch(
                descriptor.descriptor_version.clone(),
                descriptor.engine_min_version.clone(),
                ENGINE_VERSION.to_string(),
            ));
        }

        Ok(())
    }
}
