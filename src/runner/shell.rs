//! Shell runner - runs each script line through `sh -c`

use crate::runner::{JobInvocation, JobOutput, JobRunner, RunnerError, ShellRunnerConfig};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, warn};

/// Runs job bodies as local shell commands
///
/// Each attempt gets a fresh working directory
/// `<workspace_root>/<run_id>/<job>`, seeded with the files of the job's
/// input artifacts. Declared artifact paths are read back after the last
/// line succeeds.
#[derive(Debug, Clone, Default)]
pub struct ShellRunner {
    config: ShellRunnerConfig,
}

impl ShellRunner {
    pub fn new(config: ShellRunnerConfig) -> Self {
        Self { config }
    }

    /// Working directory for a job in a run
    pub fn job_dir(&self, invocation: &JobInvocation) -> PathBuf {
        self.config
            .workspace_root
            .join(invocation.run_id.to_string())
            .join(&invocation.job)
    }

    async fn prepare(&self, dir: &Path, invocation: &JobInvocation) -> Result<(), RunnerError> {
        if tokio::fs::try_exists(dir).await? {
            tokio::fs::remove_dir_all(dir).await?;
        }
        tokio::fs::create_dir_all(dir).await?;

        for (producer, artifact) in &invocation.inputs {
            for (path, contents) in &artifact.files {
                let relative = relative_path(path).ok_or_else(|| {
                    RunnerError::Internal(format!(
                        "artifact of '{}' contains unsafe path '{}'",
                        producer, path
                    ))
                })?;
                let target = dir.join(relative);
                if let Some(parent) = target.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&target, contents).await?;
            }
        }

        Ok(())
    }

    async fn collect(
        &self,
        dir: &Path,
        paths: &[String],
    ) -> Result<BTreeMap<String, Vec<u8>>, RunnerError> {
        let mut files = BTreeMap::new();

        for declared in paths {
            let Some(relative) = relative_path(declared) else {
                warn!("Ignoring artifact path outside the job directory: {}", declared);
                continue;
            };
            let root = dir.join(relative);
            if !tokio::fs::try_exists(&root).await? {
                warn!("Artifact path {} not found", declared);
                continue;
            }

            let mut pending = vec![root];
            while let Some(path) = pending.pop() {
                let metadata = tokio::fs::symlink_metadata(&path).await?;
                if metadata.file_type().is_symlink() {
                    warn!("Not following symlink in artifact path: {}", path.display());
                    continue;
                }
                if metadata.is_dir() {
                    let mut entries = tokio::fs::read_dir(&path).await?;
                    while let Some(entry) = entries.next_entry().await? {
                        pending.push(entry.path());
                    }
                } else {
                    let key = path
                        .strip_prefix(dir)
                        .map_err(|e| RunnerError::Internal(e.to_string()))?
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy().into_owned())
                        .collect::<Vec<_>>()
                        .join("/");
                    files.insert(key, tokio::fs::read(&path).await?);
                }
            }
        }

        Ok(files)
    }
}

/// Accept only plain relative paths that stay inside the job directory
fn relative_path(raw: &str) -> Option<PathBuf> {
    let path = Path::new(raw);
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if clean.as_os_str().is_empty() {
        None
    } else {
        Some(clean)
    }
}

#[async_trait]
impl JobRunner for ShellRunner {
    async fn run(&self, invocation: &JobInvocation) -> Result<JobOutput, RunnerError> {
        let dir = self.job_dir(invocation);
        self.prepare(&dir, invocation).await?;

        let mut log = String::new();
        for line in &invocation.script {
            debug!("[{}] $ {}", invocation.job, line);
            log.push_str(&format!("$ {}\n", line));

            let output = Command::new(&self.config.shell)
                .arg("-c")
                .arg(line)
                .current_dir(&dir)
                .envs(&invocation.variables)
                .kill_on_drop(true)
                .output()
                .await
                .map_err(|e| {
                    RunnerError::Spawn(format!("{} -c {:?}: {}", self.config.shell, line, e))
                })?;

            log.push_str(&String::from_utf8_lossy(&output.stdout));
            log.push_str(&String::from_utf8_lossy(&output.stderr));

            if !output.status.success() {
                let exit_code = output.status.code().unwrap_or(-1);
                debug!("[{}] exited with code {}", invocation.job, exit_code);
                return Ok(JobOutput::failure(exit_code, log));
            }
        }

        let files = self.collect(&dir, &invocation.artifact_paths).await?;
        Ok(JobOutput {
            exit_code: 0,
            log,
            files,
        })
    }
}
