use super::{Build, Generate, ServicePackage, Test};
use crate::error::CollaboratorFailure;
use ota_registry::ServiceDescriptor;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;

/// Toolchain that accepts everything without doing any work
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughToolchain;

#[async_trait::async_trait]
impl Generate for PassthroughToolchain {
    async fn generate(&self, _: &ServiceDescriptor, _: &ServicePackage) -> Result<(), CollaboratorFailure> {
        Ok(())
    }
}

#[async_trait::async_trait]
impl Build for PassthroughToolchain {
    async fn build(&self, _: &ServiceDescriptor, _: &ServicePackage) -> Result<(), CollaboratorFailure> {
        Ok(())
    }
}

#[async_trait::async_trait]
impl Test for PassthroughToolchain {
    async fn test(&self, _: &ServiceDescriptor, _: &ServicePackage) -> Result<(), CollaboratorFailure> {
        Ok(())
    }
}

/// One external command, as an argv vector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageCommand(pub Vec<String>);

impl StageCommand {
    /// Command from program and arguments
    #[must_use]
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(argv.into_iter().map(Into::into).collect())
    }

    async fn run(
        &self,
        stage: &str,
        descriptor: &ServiceDescriptor,
        package: &ServicePackage,
        workdir: Option<&PathBuf>,
    ) -> Result<(), CollaboratorFailure> {
        let Some((program, args)) = self.0.split_first() else {
            return Ok(());
        };

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .env("OTA_SERVICE", descriptor.name())
            .env("OTA_VERSION", descriptor.version().to_string())
            .env("OTA_LANGUAGE", descriptor.language().as_str())
            .env(
                "OTA_PACKAGE",
                package.location.as_ref().map(|p| p.display().to_string()).unwrap_or_default(),
            )
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = workdir {
            cmd.current_dir(dir);
        }

        tracing::debug!(stage, service = descriptor.name(), program = %program, "running toolchain command");
        let output = cmd
            .output()
            .await
            .map_err(|e| CollaboratorFailure::new(format!("{stage}: cannot run {program}: {e}")))?;

        if output.status.success() {
            return Ok(());
        }

        let mut diagnostic = String::from_utf8_lossy(&output.stderr).into_owned();
        diagnostic.push_str(&String::from_utf8_lossy(&output.stdout));
        if diagnostic.trim().is_empty() {
            diagnostic = format!("{program} exited with {}", output.status);
        }
        Err(CollaboratorFailure::new(diagnostic))
    }
}

/// Toolchain driven by external commands
///
/// Each command runs with `OTA_SERVICE`, `OTA_VERSION`, `OTA_LANGUAGE`
/// and `OTA_PACKAGE` set. A stage without a command is skipped. On a
/// non-zero exit, stderr followed by stdout becomes the diagnostic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandToolchain {
    #[serde(default)]
    pub generate: Option<StageCommand>,
    #[serde(default)]
    pub build: Option<StageCommand>,
    #[serde(default)]
    pub test: Option<StageCommand>,
    /// Working directory for every command
    #[serde(default)]
    pub workdir: Option<PathBuf>,
}

impl CommandToolchain {
    async fn run_stage(
        &self,
        stage: &str,
        command: Option<&StageCommand>,
        descriptor: &ServiceDescriptor,
        package: &ServicePackage,
    ) -> Result<(), CollaboratorFailure> {
        match command {
            Some(cmd) => cmd.run(stage, descriptor, package, self.workdir.as_ref()).await,
            None => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl Generate for CommandToolchain {
    async fn generate(&self, descriptor: &ServiceDescriptor, package: &ServicePackage) -> Result<(), CollaboratorFailure> {
        self.run_stage("generate", self.generate.as_ref(), descriptor, package).await
    }
}

#[async_trait::async_trait]
impl Build for CommandToolchain {
    async fn build(&self, descriptor: &ServiceDescriptor, package: &ServicePackage) -> Result<(), CollaboratorFailure> {
        self.run_stage("build", self.build.as_ref(), descriptor, package).await
    }
}

#[async_trait::async_trait]
impl Test for CommandToolchain {
    async fn test(&self, descriptor: &ServiceDescriptor, package: &ServicePackage) -> Result<(), CollaboratorFailure> {
        self.run_stage("test", self.test.as_ref(), descriptor, package).await
    }
}
