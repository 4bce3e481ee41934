//! Image Assembler - Exactly {Binary, Trust Material, Config}
//!
//! Builds the runtime layer in a fixed, testable copy order: trust material,
//! then the compiled binary, then the shared config base, then the variant
//! overlay. Overlay entries win on path collision, and that correctness
//! depends on the ordering, so the order is an explicit invariant here.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::compiler::CompiledArtifact;
use crate::contract::{ContractError, ProbePlacement, RuntimeContract};
use crate::variants::{BasePolicy, VariantKind};

/// Fixed path of the service binary inside the image.
pub const BINARY_PATH: &str = "/bin/app";
/// Fixed root of the composed configuration tree.
pub const CONFIG_ROOT: &str = "/app/config";
/// CA root bundle, copied verbatim from the builder stage.
pub const CA_BUNDLE_PATH: &str = "/etc/ssl/certs/ca-certificates.crt";
/// Timezone database root, copied verbatim from the builder stage.
pub const ZONEINFO_ROOT: &str = "/usr/share/zoneinfo";

/// Shell, package manager and probe client provided by the minimal-OS base.
/// A zero-OS image must contain none of these.
pub const MINIMAL_OS_TOOLS: [&str; 3] = ["/bin/sh", "/sbin/apk", "/usr/bin/curl"];

#[derive(Debug, Error)]
pub enum AssemblyError {
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Execution identity {user} resolves to uid 0; the runtime never runs as root")]
    RootIdentity { user: String },

    #[error("Materialize target already exists: {path:?}")]
    OutputExists { path: PathBuf },

    #[error(transparent)]
    Contract(#[from] ContractError),
}

/// Non-root user/group the running service is bound to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionIdentity {
    pub user: String,
    pub uid: u32,
    pub group: String,
    pub gid: u32,
}

impl ExecutionIdentity {
    pub fn for_kind(kind: VariantKind) -> Self {
        let name = match kind {
            VariantKind::Service => "app",
            VariantKind::Agent => "agent",
        };
        Self {
            user: name.to_string(),
            uid: 1000,
            group: name.to_string(),
            gid: 1000,
        }
    }

    fn owner(&self) -> FileOwner {
        FileOwner {
            uid: self.uid,
            gid: self.gid,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileOwner {
    pub uid: u32,
    pub gid: u32,
}

impl FileOwner {
    pub const ROOT: FileOwner = FileOwner { uid: 0, gid: 0 };
}

/// One file in the assembled layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageFile {
    #[serde(skip)]
    pub data: Vec<u8>,
    pub mode: u32,
    pub owner: FileOwner,
}

/// The four copy steps, in the only order they may run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum CopyStep {
    TrustMaterial,
    Binary,
    SharedConfig,
    OverlayConfig,
}

/// The canonical copy order. Overlay precedence holds only because overlay
/// entries land last.
pub const COPY_ORDER: [CopyStep; 4] = [
    CopyStep::TrustMaterial,
    CopyStep::Binary,
    CopyStep::SharedConfig,
    CopyStep::OverlayConfig,
];

/// CA roots and timezone data taken from the builder stage. Never
/// regenerated at runtime.
#[derive(Debug, Clone)]
pub struct TrustMaterial {
    pub ca_bundle: Vec<u8>,
    /// Relative zoneinfo paths and their payloads.
    pub zoneinfo: Vec<(String, Vec<u8>)>,
}

impl TrustMaterial {
    /// Load `ca-certificates.crt` and the `zoneinfo/` tree from a builder
    /// output directory.
    pub fn load(builder_root: &Path) -> Result<Self, AssemblyError> {
        let ca_path = builder_root.join("ca-certificates.crt");
        let ca_bundle = fs::read(&ca_path).map_err(|e| AssemblyError::Io {
            path: ca_path,
            source: e,
        })?;
        let mut zoneinfo = Vec::new();
        let zoneinfo_root = builder_root.join("zoneinfo");
        if zoneinfo_root.exists() {
            for (rel, data) in walk_sorted(&zoneinfo_root)? {
                zoneinfo.push((rel, data));
            }
        }
        Ok(Self {
            ca_bundle,
            zoneinfo,
        })
    }
}

/// The final filesystem layer set plus the metadata the orchestrator reads.
#[derive(Debug, Clone)]
pub struct RuntimeImage {
    files: BTreeMap<PathBuf, ImageFile>,
    copy_log: Vec<CopyStep>,
    pub base: BasePolicy,
    pub entrypoint: Vec<String>,
    pub exposed_port: u16,
    pub env: BTreeMap<String, String>,
    /// The identity the process runs as. Never root.
    pub user: ExecutionIdentity,
    /// In-container check command; `None` for zero-OS images.
    pub healthcheck: Option<String>,
}

impl RuntimeImage {
    pub fn file(&self, path: impl AsRef<Path>) -> Option<&ImageFile> {
        self.files.get(path.as_ref())
    }

    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.files.keys().map(PathBuf::as_path)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&Path, &ImageFile)> {
        self.files.iter().map(|(path, file)| (path.as_path(), file))
    }

    /// The copy steps that produced this image, in execution order.
    pub fn copy_log(&self) -> &[CopyStep] {
        &self.copy_log
    }

    fn insert(&mut self, path: impl Into<PathBuf>, data: Vec<u8>, mode: u32, owner: FileOwner) {
        let path = path.into();
        self.files.insert(path, ImageFile { data, mode, owner });
    }

    /// Write the layer to `dir`. Staging plus rename keeps publication
    /// atomic: the directory either exists complete or not at all. The
    /// target must not exist yet; an image is published once, never over
    /// a previous one.
    pub fn materialize(&self, dir: &Path) -> Result<(), AssemblyError> {
        if dir.exists() {
            return Err(AssemblyError::OutputExists {
                path: dir.to_path_buf(),
            });
        }
        let staging = dir.with_extension(format!("partial-{}", Uuid::new_v4()));
        if let Err(e) = self.write_layer(&staging) {
            let _ = fs::remove_dir_all(&staging);
            return Err(e);
        }
        fs::rename(&staging, dir).map_err(|e| {
            let _ = fs::remove_dir_all(&staging);
            AssemblyError::Io {
                path: dir.to_path_buf(),
                source: e,
            }
        })
    }

    fn write_layer(&self, staging: &Path) -> Result<(), AssemblyError> {
        for (path, file) in &self.files {
            let rel = path.strip_prefix("/").unwrap_or(path);
            let dest = staging.join(rel);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).map_err(|e| AssemblyError::Io {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
            }
            fs::write(&dest, &file.data).map_err(|e| AssemblyError::Io {
                path: dest.clone(),
                source: e,
            })?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(&dest, fs::Permissions::from_mode(file.mode)).map_err(
                    |e| AssemblyError::Io {
                        path: dest.clone(),
                        source: e,
                    },
                )?;
            }
        }
        Ok(())
    }
}

/// Inputs for one assembly, all produced by earlier stages.
pub struct AssemblyInput<'a> {
    pub artifact: &'a CompiledArtifact,
    pub trust: &'a TrustMaterial,
    pub shared_config: Option<&'a Path>,
    pub overlay_config: Option<&'a Path>,
    pub contract: &'a RuntimeContract,
    pub base: BasePolicy,
}

/// Assembles runtime images under one of the two base policies.
pub struct ImageAssembler {
    identity: ExecutionIdentity,
}

impl ImageAssembler {
    pub fn new(identity: ExecutionIdentity) -> Result<Self, AssemblyError> {
        if identity.uid == 0 {
            return Err(AssemblyError::RootIdentity {
                user: identity.user,
            });
        }
        Ok(Self { identity })
    }

    pub fn identity(&self) -> &ExecutionIdentity {
        &self.identity
    }

    /// Construct the runtime layer.
    ///
    /// Both policies share every step; they differ only in base provisioning
    /// and in where the liveness check is placed.
    pub fn assemble(&self, input: AssemblyInput<'_>) -> Result<RuntimeImage, AssemblyError> {
        input.contract.validate(input.base)?;

        let mut image = RuntimeImage {
            files: BTreeMap::new(),
            copy_log: Vec::new(),
            base: input.base,
            entrypoint: vec![BINARY_PATH.to_string()],
            exposed_port: input.contract.port,
            env: input.contract.env.clone(),
            user: self.identity.clone(),
            healthcheck: None,
        };

        if input.base == BasePolicy::MinimalOs {
            for tool in MINIMAL_OS_TOOLS {
                image.insert(tool, Vec::new(), 0o755, FileOwner::ROOT);
            }
        }

        // (1) Trust material: root-owned, read-only, never chowned.
        image.insert(
            CA_BUNDLE_PATH,
            input.trust.ca_bundle.clone(),
            0o444,
            FileOwner::ROOT,
        );
        for (rel, data) in &input.trust.zoneinfo {
            image.insert(
                Path::new(ZONEINFO_ROOT).join(rel),
                data.clone(),
                0o444,
                FileOwner::ROOT,
            );
        }
        image.copy_log.push(CopyStep::TrustMaterial);

        // (2) The compiled artifact.
        image.insert(
            BINARY_PATH,
            input.artifact.data.clone(),
            0o755,
            FileOwner::ROOT,
        );
        image.copy_log.push(CopyStep::Binary);

        // (3) Shared configuration base, chowned to the execution identity.
        if let Some(shared) = input.shared_config {
            self.copy_config_tree(&mut image, shared)?;
        }
        image.copy_log.push(CopyStep::SharedConfig);

        // (4) Variant overlay last, so it wins on collision.
        if let Some(overlay) = input.overlay_config {
            self.copy_config_tree(&mut image, overlay)?;
        }
        image.copy_log.push(CopyStep::OverlayConfig);

        if let ProbePlacement::InContainer { probe } = &input.contract.probe {
            image.healthcheck = Some(probe.check_command(input.contract.port));
        }

        info!(
            files = image.files.len(),
            base = ?input.base,
            user = %self.identity.user,
            "image assembled"
        );
        Ok(image)
    }

    fn copy_config_tree(
        &self,
        image: &mut RuntimeImage,
        root: &Path,
    ) -> Result<(), AssemblyError> {
        for (rel, data) in walk_sorted(root)? {
            debug!(path = %rel, "copying config entry");
            image.insert(
                Path::new(CONFIG_ROOT).join(&rel),
                data,
                0o644,
                self.identity.owner(),
            );
        }
        Ok(())
    }
}

/// Collect every file under `root` as (relative path, bytes), sorted so the
/// traversal order never depends on directory enumeration order.
fn walk_sorted(root: &Path) -> Result<Vec<(String, Vec<u8>)>, AssemblyError> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = fs::read_dir(&dir).map_err(|e| AssemblyError::Io {
            path: dir.clone(),
            source: e,
        })?;
        for entry in entries {
            let entry = entry.map_err(|e| AssemblyError::Io {
                path: dir.clone(),
                source: e,
            })?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                let data = fs::read(&path).map_err(|e| AssemblyError::Io {
                    path: path.clone(),
                    source: e,
                })?;
                let rel = path
                    .strip_prefix(root)
                    .unwrap_or(&path)
                    .to_string_lossy()
                    .into_owned();
                out.push((rel, data));
            }
        }
    }
    out.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(out)
}
