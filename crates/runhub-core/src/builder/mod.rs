//! Build pipeline for uploaded programs.
//!
//! Interpreted programs get their dependency manifest resolved and are linted inside
//! a throwaway container of the matching image. Compiled programs are built on the
//! host with the Go toolchain, stripped of symbols.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tokio::process::Command;
use uuid::Uuid;

use crate::config::{BuildConfig, RuntimeConfig};
use crate::errors::BuildError;
use crate::registry::Language;
use crate::runtime::{archive, ContainerRuntime, ContainerSpec};

pub mod manifest;

pub const COMPILED_BINARY: &str = "main";

#[async_trait]
pub trait Builder: Send + Sync {
    /// Builds or lints the program in `dir`. The caller removes `dir` on failure.
    async fn build(&self, dir: &Path, language: Language) -> Result<(), BuildError>;
}

pub struct ToolchainBuilder {
    runtime: Arc<dyn ContainerRuntime>,
    runtime_config: RuntimeConfig,
    config: BuildConfig,
}

impl ToolchainBuilder {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        runtime_config: RuntimeConfig,
        config: BuildConfig,
    ) -> Self {
        Self {
            runtime,
            runtime_config,
            config,
        }
    }

    fn lint_command(language: Language) -> Option<String> {
        let pip = match language {
            Language::Python2 => "pip2",
            Language::Python3 => "pip3",
            Language::Go => return None,
        };
        Some(format!(
            "{} install -r {} && pylint --output-format=json --errors-only {}",
            pip,
            manifest::MANIFEST_FILE,
            language.entry_file()
        ))
    }

    async fn build_interpreted(&self, dir: &Path, language: Language) -> Result<(), BuildError> {
        let entry = language.entry_file();
        if !dir.join(entry).is_file() {
            return Err(BuildError::MissingEntry(entry.to_string()));
        }
        let requirements = manifest::write_manifest(dir, entry).await?;
        log::debug!(
            "Resolved {} requirement(s) for {}",
            requirements.len(),
            dir.display()
        );
        if !self.config.lint {
            return Ok(());
        }
        let Some(command) = Self::lint_command(language) else {
            return Ok(());
        };

        let spec = ContainerSpec {
            name: format!("runhub-lint-{}", Uuid::new_v4()),
            image: self
                .runtime_config
                .images
                .for_language(language)
                .to_string(),
            cmd: vec!["sh".to_string(), "-c".to_string(), command],
            working_dir: self.runtime_config.workdir.clone(),
            env: Vec::new(),
        };
        let id = self.runtime.create(&spec).await?;
        let outcome = match self.run_lint(&id, dir).await {
            Ok(0) => Ok(()),
            Ok(code) => Err(BuildError::ToolFailed {
                command: "container lint".to_string(),
                code,
                output: self.runtime.logs(&id).await.unwrap_or_default(),
            }),
            Err(e) => Err(e),
        };
        if let Err(e) = self.runtime.remove(&id).await {
            log::warn!("Failed to remove lint container {}: {}", id, e);
        }
        outcome
    }

    async fn run_lint(&self, id: &str, dir: &Path) -> Result<i64, BuildError> {
        let archive = archive::pack_dir_async(dir.to_path_buf()).await?;
        self.runtime
            .upload(id, &self.runtime_config.workdir, archive)
            .await?;
        self.runtime.start(id).await?;
        Ok(self.runtime.wait(id).await?)
    }

    async fn build_compiled(&self, dir: &Path) -> Result<(), BuildError> {
        let entry = Language::Go.entry_file();
        if !dir.join(entry).is_file() {
            return Err(BuildError::MissingEntry(entry.to_string()));
        }
        if !dir.join("go.mod").exists() {
            run_tool(&self.config.go_binary, &["mod", "init", "main"], dir).await?;
        }
        run_tool(
            &self.config.go_binary,
            &["build", "-ldflags", "-s -w", "-o", COMPILED_BINARY],
            dir,
        )
        .await
    }
}

#[async_trait]
impl Builder for ToolchainBuilder {
    async fn build(&self, dir: &Path, language: Language) -> Result<(), BuildError> {
        log::info!("Building {} program in {}", language.name(), dir.display());
        if language.is_interpreted() {
            self.build_interpreted(dir, language).await
        } else {
            self.build_compiled(dir).await
        }
    }
}

/// Runs an external tool in `dir`; a non-zero exit becomes a diagnostic carrying the
/// combined output.
pub async fn run_tool(program: &str, args: &[&str], dir: &Path) -> Result<(), BuildError> {
    let output = Command::new(program)
        .args(args)
        .current_dir(dir)
        .output()
        .await?;
    if output.status.success() {
        return Ok(());
    }
    let mut text = String::from_utf8_lossy(&output.stdout).to_string();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    Err(BuildError::ToolFailed {
        command: format!("{} {}", program, args.first().copied().unwrap_or_default()),
        code: output.status.code().map(i64::from).unwrap_or(-1),
        output: text,
    })
}
