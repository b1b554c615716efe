//! Docker-backed environment using the bollard crate.
//!
//! The workspace is bind-mounted at [`CONTAINER_WORKDIR`] and commands run
//! through the exec API. Each workspace root gets its own container, so one
//! [`ContainerEnvironment`] can serve several workspaces at once.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, RemoveContainerOptions, StartContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    git, shell_quote, Environment, ExecOptions, ExecOutput, DEFAULT_COMMAND_TIMEOUT,
    TIMEOUT_EXIT_CODE,
};
use crate::error::EnvironmentError;

/// Mount point of the workspace inside the container.
pub const CONTAINER_WORKDIR: &str = "/workspace";

/// Extra time given to the exec stream after the in-container timeout fires.
const EXEC_GRACE: Duration = Duration::from_secs(10);

/// Exit code of `timeout -s KILL` when it had to kill the command.
const KILLED_EXIT_CODE: i32 = 137;

/// Timeout for `docker build`.
const BUILD_TIMEOUT: Duration = Duration::from_secs(1800);

fn default_image() -> String {
    "ubuntu:22.04".to_string()
}

fn default_true() -> bool {
    true
}

/// Container environment settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Image to run. Ignored when `dockerfile` is set.
    #[serde(default = "default_image")]
    pub image: String,
    /// Dockerfile to build; the result is tagged `judge-forge-<uuid>`.
    #[serde(default)]
    pub dockerfile: Option<PathBuf>,
    /// Build context, defaults to the Dockerfile's directory.
    #[serde(default)]
    pub build_context: Option<PathBuf>,
    /// Extra `KEY=VALUE` variables for every command.
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub network_mode: Option<String>,
    /// Reset the checkout to the last commit after the container starts.
    #[serde(default = "default_true")]
    pub reset_on_setup: bool,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            dockerfile: None,
            build_context: None,
            env: Vec::new(),
            network_mode: None,
            reset_on_setup: true,
        }
    }
}

impl ContainerConfig {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    pub fn with_dockerfile(mut self, dockerfile: impl Into<PathBuf>) -> Self {
        self.dockerfile = Some(dockerfile.into());
        self
    }

    pub fn with_env(mut self, env: Vec<String>) -> Self {
        self.env = env;
        self
    }
}

#[derive(Debug, Clone)]
struct RunningContainer {
    id: String,
}

/// Environment that runs every command inside a per-workspace container.
pub struct ContainerEnvironment {
    docker: Docker,
    config: ContainerConfig,
    /// Tag of the image built from `config.dockerfile`, once built.
    built_image: Mutex<Option<String>>,
    containers: Mutex<HashMap<PathBuf, RunningContainer>>,
}

impl ContainerEnvironment {
    /// Creates the environment. No daemon round-trip happens until setup.
    pub fn new(config: ContainerConfig) -> Result<Self, EnvironmentError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| EnvironmentError::Docker(format!("Failed to connect: {e}")))?;
        Ok(Self::from_docker(docker, config))
    }

    pub fn from_docker(docker: Docker, config: ContainerConfig) -> Self {
        Self {
            docker,
            config,
            built_image: Mutex::new(None),
            containers: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ContainerConfig {
        &self.config
    }

    async fn resolve_image(&self) -> Result<String, EnvironmentError> {
        let Some(dockerfile) = &self.config.dockerfile else {
            self.ensure_image(&self.config.image).await?;
            return Ok(self.config.image.clone());
        };

        let mut built = self.built_image.lock().await;
        if let Some(tag) = built.as_ref() {
            return Ok(tag.clone());
        }

        let tag = image_tag();
        let context = self
            .config
            .build_context
            .clone()
            .or_else(|| dockerfile.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("."));
        build_image(dockerfile, &context, &tag).await?;
        *built = Some(tag.clone());
        Ok(tag)
    }

    async fn ensure_image(&self, image: &str) -> Result<(), EnvironmentError> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        info!(image = image, "Pulling image");
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            result.map_err(|e| EnvironmentError::Docker(format!("Failed to pull {image}: {e}")))?;
        }
        Ok(())
    }

    async fn start_container(&self, root: &Path, image: &str) -> Result<String, EnvironmentError> {
        let host_root = root.canonicalize()?;
        let host_config = HostConfig {
            binds: Some(vec![format!(
                "{}:{}",
                host_root.display(),
                CONTAINER_WORKDIR
            )]),
            network_mode: self.config.network_mode.clone(),
            ..Default::default()
        };

        let container_config = Config {
            image: Some(image.to_string()),
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            env: if self.config.env.is_empty() {
                None
            } else {
                Some(self.config.env.clone())
            },
            working_dir: Some(CONTAINER_WORKDIR.to_string()),
            host_config: Some(host_config),
            tty: Some(false),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: format!("judge-forge-{}", Uuid::new_v4().simple()),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), container_config)
            .await
            .map_err(|e| EnvironmentError::Docker(format!("Failed to create container: {e}")))?;

        if let Err(e) = self
            .docker
            .start_container(&response.id, None::<StartContainerOptions<String>>)
            .await
        {
            self.remove_container(&response.id).await.ok();
            return Err(EnvironmentError::Docker(format!(
                "Failed to start container: {e}"
            )));
        }

        Ok(response.id)
    }

    async fn remove_container(&self, id: &str) -> Result<(), EnvironmentError> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(container = id, "Container already gone");
                Ok(())
            }
            Err(e) => Err(EnvironmentError::Teardown(format!(
                "Failed to remove container {id}: {e}"
            ))),
        }
    }

    /// Finds the container whose workspace contains `cwd` and the matching
    /// in-container directory.
    async fn locate(&self, cwd: &Path) -> Option<(String, String)> {
        let containers = self.containers.lock().await;
        containers
            .iter()
            .filter_map(|(root, container)| {
                cwd.strip_prefix(root)
                    .ok()
                    .map(|rel| (root.components().count(), container, rel))
            })
            .max_by_key(|(depth, _, _)| *depth)
            .map(|(_, container, rel)| (container.id.clone(), container_path(rel)))
    }

    async fn exec(
        &self,
        id: &str,
        command: &str,
        workdir: &str,
        options: &ExecOptions,
        timeout: Duration,
    ) -> Result<(String, String, i32), BollardError> {
        let wrapped = format!(
            "timeout -s KILL {} sh -c {}",
            timeout.as_secs().max(1),
            shell_quote(command)
        );
        let env: Vec<String> = options
            .env
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        let exec = self
            .docker
            .create_exec(
                id,
                CreateExecOptions {
                    cmd: Some(vec!["sh".to_string(), "-c".to_string(), wrapped]),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    attach_stdin: Some(options.stdin.is_some()),
                    tty: Some(false),
                    working_dir: Some(workdir.to_string()),
                    env: if env.is_empty() { None } else { Some(env) },
                    ..Default::default()
                },
            )
            .await?;

        let mut stdout = String::new();
        let mut stderr = String::new();

        if let StartExecResults::Attached { mut output, mut input } =
            self.docker.start_exec(&exec.id, None).await?
        {
            if let Some(data) = &options.stdin {
                if let Err(e) = input.write_all(data.as_bytes()).await {
                    debug!(error = %e, "Failed to write exec stdin");
                }
                input.shutdown().await.ok();
            }

            while let Some(chunk) = output.next().await {
                match chunk? {
                    LogOutput::StdOut { message } => {
                        stdout.push_str(&String::from_utf8_lossy(&message));
                    }
                    LogOutput::StdErr { message } => {
                        stderr.push_str(&String::from_utf8_lossy(&message));
                    }
                    _ => {}
                }
            }
        }

        let info = self.docker.inspect_exec(&exec.id).await?;
        let exit_code = info.exit_code.unwrap_or(-1) as i32;
        Ok((stdout, stderr, exit_code))
    }
}

fn image_tag() -> String {
    format!("judge-forge-{}", Uuid::new_v4().simple())
}

fn container_path(rel: &Path) -> String {
    if rel.as_os_str().is_empty() {
        CONTAINER_WORKDIR.to_string()
    } else {
        format!("{}/{}", CONTAINER_WORKDIR, rel.to_string_lossy())
    }
}

async fn build_image(dockerfile: &Path, context: &Path, tag: &str) -> Result<(), EnvironmentError> {
    info!(dockerfile = %dockerfile.display(), tag = tag, "Building image");
    let build = Command::new("docker")
        .arg("build")
        .arg("-t")
        .arg(tag)
        .arg("-f")
        .arg(dockerfile)
        .arg(context)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    let output = tokio::time::timeout(BUILD_TIMEOUT, build)
        .await
        .map_err(|_| EnvironmentError::Docker(format!("docker build timed out for {tag}")))??;

    if !output.status.success() {
        return Err(EnvironmentError::Docker(format!(
            "docker build failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

#[async_trait]
impl Environment for ContainerEnvironment {
    fn name(&self) -> &str {
        "container"
    }

    async fn setup(&self, root: &Path) -> Result<(), EnvironmentError> {
        if self.containers.lock().await.contains_key(root) {
            return Ok(());
        }

        let image = self.resolve_image().await?;
        let id = self.start_container(root, &image).await?;
        info!(container = %id, root = %root.display(), image = %image, "Container started");
        self.containers
            .lock()
            .await
            .insert(root.to_path_buf(), RunningContainer { id: id.clone() });

        // The bind mount is owned by the host user; let git trust it.
        let trust = self
            .execute(
                "git config --global --add safe.directory '*'",
                root,
                ExecOptions::with_timeout(git::GIT_TIMEOUT),
            )
            .await;
        if !trust.is_success() {
            debug!(stderr = %trust.stderr.trim(), "Could not mark workspace as safe for git");
        }

        let prepared = async {
            git::ensure_repository(self, root).await?;
            if self.config.reset_on_setup {
                git::reset_and_clean(self, root).await?;
            }
            Ok::<(), EnvironmentError>(())
        }
        .await;

        if let Err(e) = prepared {
            self.teardown(root).await.ok();
            return Err(e);
        }
        Ok(())
    }

    async fn execute(&self, command: &str, cwd: &Path, options: ExecOptions) -> ExecOutput {
        let start = Instant::now();
        let Some((id, workdir)) = self.locate(cwd).await else {
            return ExecOutput::failure(
                format!(
                    "No container is running for {}; setup() must be called before execute()",
                    cwd.display()
                ),
                start.elapsed(),
            );
        };

        let timeout = options.timeout.unwrap_or(DEFAULT_COMMAND_TIMEOUT);
        let exec = self.exec(&id, command, &workdir, &options, timeout);

        match tokio::time::timeout(timeout + EXEC_GRACE, exec).await {
            Ok(Ok((stdout, stderr, exit_code))) => {
                let elapsed = start.elapsed();
                if (exit_code == TIMEOUT_EXIT_CODE || exit_code == KILLED_EXIT_CODE)
                    && elapsed >= timeout
                {
                    warn!(command = command, container = %id, "Command timed out");
                    let mut out = ExecOutput::timed_out(timeout, elapsed);
                    out.stdout = stdout;
                    return out;
                }
                ExecOutput {
                    stdout,
                    stderr,
                    exit_code,
                    duration_ms: elapsed.as_millis() as u64,
                    timed_out: false,
                }
            }
            Ok(Err(e)) => ExecOutput::failure(format!("Docker exec failed: {e}"), start.elapsed()),
            Err(_) => {
                warn!(command = command, container = %id, "Exec stream did not finish after timeout");
                ExecOutput::timed_out(timeout, start.elapsed())
            }
        }
    }

    async fn diff(&self, root: &Path) -> Result<String, EnvironmentError> {
        git::collect_diff(self, root).await
    }

    async fn teardown(&self, root: &Path) -> Result<(), EnvironmentError> {
        let removed = self.containers.lock().await.remove(root);
        if let Some(container) = removed {
            self.remove_container(&container.id).await?;
            debug!(container = %container.id, root = %root.display(), "Container removed");
        }
        Ok(())
    }
}
