//! Compiler Stage - One Entry Point, One Static Binary
//!
//! Compiles exactly the entry point the variant selector resolved, pinned to
//! a fixed OS/architecture pair, statically linked and stripped. A partial
//! artifact is never promoted: any toolchain failure is fatal to the build.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::resolver::ResolvedSet;

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("Compilation failed for {entry_point}: {reason}")]
    Failed { entry_point: String, reason: String },

    #[error("Entry point does not exist: {0}")]
    MissingEntryPoint(String),

    #[error("Compilation exceeded {limit_secs}s")]
    Timeout { limit_secs: u64 },

    #[error("Artifact resolves dynamic libraries at load time: {0}")]
    DynamicLibraries(String),

    #[error("Artifact still carries debug symbols or build-host paths")]
    NotStripped,
}

/// The fixed platform every artifact is pinned to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TargetPlatform {
    pub os: String,
    pub arch: String,
}

impl Default for TargetPlatform {
    fn default() -> Self {
        Self {
            os: "linux".to_string(),
            arch: "amd64".to_string(),
        }
    }
}

/// Everything a toolchain needs for one compilation.
pub struct CompileUnit<'a> {
    pub entry_point: &'a Path,
    pub target: &'a TargetPlatform,
    pub static_link: bool,
    pub strip: bool,
    pub dependencies: &'a ResolvedSet,
}

/// A single standalone executable, platform- and architecture-pinned.
#[derive(Debug, Clone)]
pub struct CompiledArtifact {
    pub data: Vec<u8>,
    pub target: TargetPlatform,
    /// Debug symbols and build-host paths removed.
    pub stripped: bool,
    /// Dynamic libraries the artifact would resolve at load time.
    /// Must be empty for a promotable artifact.
    pub dynamic_libraries: Vec<String>,
}

/// The language toolchain seam. The stage drives it; concrete toolchains
/// only know how to turn one entry point into bytes.
pub trait Toolchain {
    fn compile(&self, unit: &CompileUnit<'_>) -> Result<CompiledArtifact, CompileError>;
}

/// Runs an external compiler command, bounded by a wall deadline.
///
/// The command receives the entry point as its final argument and the
/// `OUTPUT`, `TARGET_OS`, `TARGET_ARCH`, `STATIC_LINK`, `STRIP` environment
/// keys; it must write the executable to `OUTPUT`.
pub struct CommandToolchain {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandToolchain {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }
}

impl Toolchain for CommandToolchain {
    fn compile(&self, unit: &CompileUnit<'_>) -> Result<CompiledArtifact, CompileError> {
        let entry = unit.entry_point.display().to_string();
        let output: PathBuf = std::env::temp_dir().join(format!(
            "fleetforge-artifact-{}",
            uuid::Uuid::new_v4()
        ));

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(unit.entry_point)
            .env("OUTPUT", &output)
            .env("TARGET_OS", &unit.target.os)
            .env("TARGET_ARCH", &unit.target.arch)
            .env("STATIC_LINK", if unit.static_link { "1" } else { "0" })
            .env("STRIP", if unit.strip { "1" } else { "0" })
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| CompileError::Failed {
                entry_point: entry.clone(),
                reason: format!("failed to start {}: {}", self.program, e),
            })?;

        let started = Instant::now();
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if started.elapsed() >= self.timeout {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(CompileError::Timeout {
                            limit_secs: self.timeout.as_secs(),
                        });
                    }
                    std::thread::sleep(Duration::from_millis(25));
                }
                Err(e) => {
                    return Err(CompileError::Failed {
                        entry_point: entry,
                        reason: format!("wait failed: {}", e),
                    })
                }
            }
        };

        if !status.success() {
            let _ = std::fs::remove_file(&output);
            return Err(CompileError::Failed {
                entry_point: entry,
                reason: format!("toolchain exited with {}", status),
            });
        }

        let data = std::fs::read(&output).map_err(|e| CompileError::Failed {
            entry_point: entry,
            reason: format!("toolchain produced no artifact: {}", e),
        })?;
        let _ = std::fs::remove_file(&output);

        Ok(CompiledArtifact {
            data,
            target: unit.target.clone(),
            stripped: unit.strip,
            dynamic_libraries: vec![],
        })
    }
}

/// Drives a toolchain with the pipeline's pinned target and verifies the
/// artifact before it may be promoted to the image assembler.
pub struct CompilerStage<T: Toolchain> {
    toolchain: T,
    target: TargetPlatform,
}

impl<T: Toolchain> CompilerStage<T> {
    pub fn new(toolchain: T, target: TargetPlatform) -> Self {
        Self { toolchain, target }
    }

    pub fn target(&self) -> &TargetPlatform {
        &self.target
    }

    /// Compile one entry point into one promotable artifact.
    ///
    /// Static linking and stripping are always enforced; an artifact that
    /// reports dynamic libraries or retained symbols is rejected here, not
    /// downstream.
    pub fn compile(
        &self,
        entry_point: &Path,
        dependencies: &ResolvedSet,
    ) -> Result<CompiledArtifact, CompileError> {
        if !entry_point.exists() {
            return Err(CompileError::MissingEntryPoint(
                entry_point.display().to_string(),
            ));
        }

        info!(entry_point = %entry_point.display(), os = %self.target.os, arch = %self.target.arch, "compiling");
        let unit = CompileUnit {
            entry_point,
            target: &self.target,
            static_link: true,
            strip: true,
            dependencies,
        };
        let artifact = self.toolchain.compile(&unit)?;

        if !artifact.dynamic_libraries.is_empty() {
            return Err(CompileError::DynamicLibraries(
                artifact.dynamic_libraries.join(", "),
            ));
        }
        if !artifact.stripped {
            return Err(CompileError::NotStripped);
        }

        Ok(artifact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn empty_set() -> ResolvedSet {
        ResolvedSet {
            lock_digest: "0".repeat(64),
            dependencies: vec![],
        }
    }

    struct FixedToolchain {
        stripped: bool,
        dynamic_libraries: Vec<String>,
    }

    impl Toolchain for FixedToolchain {
        fn compile(&self, unit: &CompileUnit<'_>) -> Result<CompiledArtifact, CompileError> {
            Ok(CompiledArtifact {
                data: b"\x7fELF-stub".to_vec(),
                target: unit.target.clone(),
                stripped: self.stripped,
                dynamic_libraries: self.dynamic_libraries.clone(),
            })
        }
    }

    fn entry_point(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("main");
        std::fs::write(&path, "package main").unwrap();
        path
    }

    #[test]
    fn missing_entry_point_is_rejected() {
        let stage = CompilerStage::new(
            FixedToolchain {
                stripped: true,
                dynamic_libraries: vec![],
            },
            TargetPlatform::default(),
        );
        let err = stage
            .compile(Path::new("/nonexistent/entry"), &empty_set())
            .unwrap_err();
        assert!(matches!(err, CompileError::MissingEntryPoint(_)));
    }

    #[test]
    fn dynamic_libraries_are_rejected() {
        let dir = TempDir::new().unwrap();
        let stage = CompilerStage::new(
            FixedToolchain {
                stripped: true,
                dynamic_libraries: vec!["libc.so.6".to_string()],
            },
            TargetPlatform::default(),
        );
        let err = stage.compile(&entry_point(&dir), &empty_set()).unwrap_err();
        assert!(matches!(err, CompileError::DynamicLibraries(_)));
    }

    #[test]
    fn unstripped_artifact_is_rejected() {
        let dir = TempDir::new().unwrap();
        let stage = CompilerStage::new(
            FixedToolchain {
                stripped: false,
                dynamic_libraries: vec![],
            },
            TargetPlatform::default(),
        );
        let err = stage.compile(&entry_point(&dir), &empty_set()).unwrap_err();
        assert!(matches!(err, CompileError::NotStripped));
    }

    #[test]
    fn command_toolchain_reads_output_file() {
        let dir = TempDir::new().unwrap();
        let toolchain = CommandToolchain::new(
            "sh",
            vec![
                "-c".to_string(),
                r#"printf 'static-binary' > "$OUTPUT""#.to_string(),
            ],
            Duration::from_secs(10),
        );
        let stage = CompilerStage::new(toolchain, TargetPlatform::default());
        let artifact = stage.compile(&entry_point(&dir), &empty_set()).unwrap();
        assert_eq!(artifact.data, b"static-binary");
        assert!(artifact.stripped);
        assert!(artifact.dynamic_libraries.is_empty());
    }

    #[test]
    fn command_toolchain_failure_is_compile_error() {
        let dir = TempDir::new().unwrap();
        let toolchain = CommandToolchain::new(
            "sh",
            vec!["-c".to_string(), "exit 2".to_string()],
            Duration::from_secs(10),
        );
        let stage = CompilerStage::new(toolchain, TargetPlatform::default());
        let err = stage.compile(&entry_point(&dir), &empty_set()).unwrap_err();
        assert!(matches!(err, CompileError::Failed { .. }));
    }

    #[test]
    fn command_toolchain_enforces_deadline() {
        let dir = TempDir::new().unwrap();
        let toolchain = CommandToolchain::new(
            "sh",
            vec!["-c".to_string(), "sleep 30".to_string()],
            Duration::from_millis(100),
        );
        let stage = CompilerStage::new(toolchain, TargetPlatform::default());
        let err = stage.compile(&entry_point(&dir), &empty_set()).unwrap_err();
        assert!(matches!(err, CompileError::Timeout { .. }));
    }
}
