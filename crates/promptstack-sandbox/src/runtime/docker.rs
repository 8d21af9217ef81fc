//! Docker-backed [`ResourceProvider`].
//!
//! Each sandbox is a container named after its handle id, labelled
//! `promptstack=true`, with the project volume bind-mounted at the spec's
//! mount path. Volumes are plain named Docker volumes; when no sandbox is
//! running they are read and written through a short-lived helper container.

use crate::{
    config::DockerConfig,
    error::{SandboxError, SandboxResult},
    shell_escape, ResourceProvider, SandboxHandle, SandboxOutput, SandboxSpec, VolumeRef,
};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bollard::{
    container::{
        Config, CreateContainerOptions, InspectContainerOptions, LogOutput, LogsOptions,
        RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
        WaitContainerOptions,
    },
    errors::Error as DockerError,
    exec::{CreateExecOptions, StartExecOptions, StartExecResults},
    image::CreateImageOptions,
    models::{HostConfig, PortBinding, PortMap},
    volume::{CreateVolumeOptions, RemoveVolumeOptions},
    Docker,
};
use futures::StreamExt;
use promptstack_util::Identifier;
use std::{
    collections::{BTreeMap, HashMap},
    time::Duration,
};
use tracing::{debug, info, warn};

const MANAGED_LABEL: &str = "promptstack";
const HELPER_MOUNT: &str = "/vol";
/// Exit code the helper uses for "file does not exist".
const MISSING_FILE_EXIT: i64 = 44;

pub struct DockerProvider {
    docker: Docker,
    config: DockerConfig,
}

impl DockerProvider {
    /// Connect to the local daemon and verify it answers.
    pub async fn connect(config: DockerConfig) -> SandboxResult<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::unavailable(e.to_string()))?;
        docker
            .ping()
            .await
            .map_err(|e| SandboxError::unavailable(format!("Docker ping failed: {}", e)))?;
        info!("Docker provider connected");
        Ok(Self { docker, config })
    }

    async fn ensure_image(&self, image: &str) -> SandboxResult<()> {
        if !self.config.pull_images {
            return Ok(());
        }
        if self.docker.inspect_image(image).await.is_ok() {
            debug!(image = %image, "Image already exists locally");
            return Ok(());
        }

        info!(image = %image, "Pulling image");
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            match progress {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!(image = %image, status = %status, "Image pull progress");
                    }
                }
                Err(e) => return Err(SandboxError::image_pull_failed(image, e.to_string())),
            }
        }
        info!(image = %image, "Image pulled");
        Ok(())
    }

    async fn remove_container(&self, id: &str) {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        if let Err(e) = self.docker.remove_container(id, Some(options)).await {
            if !is_status(&e, 404) {
                warn!(container = %id, error = %e, "Error removing container");
            }
        }
    }

    /// Run `script` in a throwaway container with `volume` mounted at `/vol`.
    async fn run_helper(&self, volume: &VolumeRef, script: &str) -> SandboxResult<SandboxOutput> {
        self.ensure_image(&self.config.helper_image).await?;

        let name = format!("{}-helper", Identifier::sandbox());
        let config = Config {
            image: Some(self.config.helper_image.clone()),
            cmd: Some(vec!["sh".to_string(), "-c".to_string(), script.to_string()]),
            host_config: Some(HostConfig {
                binds: Some(vec![format!("{}:{}", volume.name, HELPER_MOUNT)]),
                ..Default::default()
            }),
            labels: Some(HashMap::from([(
                MANAGED_LABEL.to_string(),
                "helper".to_string(),
            )])),
            ..Default::default()
        };
        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.as_str(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| SandboxError::Volume(e.to_string()))?;

        let result = self.collect_helper(&name).await;
        self.remove_container(&name).await;
        result
    }

    async fn collect_helper(&self, name: &str) -> SandboxResult<SandboxOutput> {
        self.docker
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| SandboxError::Volume(e.to_string()))?;

        let mut waits = self.docker.wait_container(
            name,
            Some(WaitContainerOptions {
                condition: "not-running",
            }),
        );
        let exit_code = match waits.next().await {
            Some(Ok(resp)) => resp.status_code,
            Some(Err(DockerError::DockerContainerWaitError { code, .. })) => code,
            Some(Err(e)) => return Err(SandboxError::Volume(e.to_string())),
            None => -1,
        };

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut logs = self.docker.logs(
            name,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                ..Default::default()
            }),
        );
        while let Some(chunk) = logs.next().await {
            match chunk {
                Ok(LogOutput::StdOut { message }) => stdout.extend_from_slice(&message),
                Ok(LogOutput::StdErr { message }) => stderr.extend_from_slice(&message),
                Ok(_) => {}
                Err(e) => warn!(container = %name, error = %e, "Error reading helper logs"),
            }
        }

        Ok(SandboxOutput {
            stdout: String::from_utf8_lossy(&stdout).to_string(),
            stderr: String::from_utf8_lossy(&stderr).to_string(),
            exit_code,
        })
    }
}

fn is_status(e: &DockerError, code: u16) -> bool {
    matches!(e, DockerError::DockerResponseServerError { status_code, .. } if *status_code == code)
}

fn exec_error(handle: &SandboxHandle, e: DockerError) -> SandboxError {
    if is_status(&e, 404) {
        SandboxError::NotFound(handle.id.clone())
    } else if is_status(&e, 409) {
        SandboxError::NotRunning
    } else {
        SandboxError::ExecFailed(e.to_string())
    }
}

/// Container definition for a sandbox named `name`.
fn container_config(spec: &SandboxSpec, name: &str, config: &DockerConfig) -> Config<String> {
    let port_key = spec.exposed_port.map(|p| format!("{p}/tcp"));

    let port_bindings: Option<PortMap> = port_key.as_ref().map(|key| {
        HashMap::from([(
            key.clone(),
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                // Empty host port lets the daemon pick a free one.
                host_port: Some(String::new()),
            }]),
        )])
    });

    let host_config = HostConfig {
        binds: Some(vec![format!("{}:{}", spec.volume.name, spec.mount_path)]),
        port_bindings,
        memory: config.resources.memory_bytes().map(|m| m as i64),
        nano_cpus: Some(config.resources.cpu_nano()),
        network_mode: config.network.clone(),
        auto_remove: Some(false),
        ..Default::default()
    };

    let mut labels: HashMap<String, String> = spec
        .labels
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
    labels.insert(format!("{MANAGED_LABEL}.sandbox"), name.to_string());
    labels.insert(format!("{MANAGED_LABEL}.volume"), spec.volume.name.clone());

    Config {
        image: Some(spec.image.clone()),
        cmd: Some(vec![
            "timeout".to_string(),
            spec.timeout.as_secs().max(1).to_string(),
            "sh".to_string(),
            "-c".to_string(),
            spec.command.clone(),
        ]),
        working_dir: Some(spec.mount_path.clone()),
        exposed_ports: port_key.map(|key| HashMap::from([(key, HashMap::new())])),
        host_config: Some(host_config),
        env: Some(vec![
            "TERM=dumb".to_string(),
            "NO_COLOR=1".to_string(),
            "GIT_TERMINAL_PROMPT=0".to_string(),
            "DEBIAN_FRONTEND=noninteractive".to_string(),
        ]),
        tty: Some(false),
        labels: Some(labels),
        ..Default::default()
    }
}

/// Published ports to `http://host:port`, keyed by container port.
fn tunnels_from_ports(ports: &PortMap, host: &str) -> BTreeMap<u16, String> {
    let mut tunnels = BTreeMap::new();
    for (key, bindings) in ports {
        let Some(container_port) = key.split('/').next().and_then(|p| p.parse::<u16>().ok())
        else {
            continue;
        };
        let host_port = bindings
            .iter()
            .flatten()
            .find_map(|b| b.host_port.as_deref().filter(|p| !p.is_empty()));
        if let Some(host_port) = host_port {
            tunnels.insert(container_port, format!("http://{host}:{host_port}"));
        }
    }
    tunnels
}

/// Path inside the helper mount for a volume-relative path.
fn helper_path(path: &str) -> SandboxResult<String> {
    let trimmed = path.trim_start_matches('/');
    if trimmed.is_empty() || trimmed.split('/').any(|seg| seg == "..") {
        return Err(SandboxError::read_failed(path, "invalid volume path"));
    }
    Ok(format!("{HELPER_MOUNT}/{trimmed}"))
}

#[async_trait]
impl ResourceProvider for DockerProvider {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn create(&self, spec: &SandboxSpec) -> SandboxResult<SandboxHandle> {
        self.ensure_image(&spec.image).await?;

        let name = Identifier::sandbox();
        let config = container_config(spec, &name, &self.config);
        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.as_str(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| SandboxError::CreateFailed(e.to_string()))?;

        if let Err(e) = self
            .docker
            .start_container(&name, None::<StartContainerOptions<String>>)
            .await
        {
            self.remove_container(&name).await;
            return Err(SandboxError::StartFailed(e.to_string()));
        }

        info!(sandbox = %name, image = %spec.image, volume = %spec.volume.name, "Sandbox container started");
        Ok(SandboxHandle::new(name))
    }

    async fn from_handle(&self, id: &str) -> SandboxResult<SandboxHandle> {
        match self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
        {
            Ok(_) => Ok(SandboxHandle::new(id)),
            Err(e) if is_status(&e, 404) => Err(SandboxError::NotFound(id.to_string())),
            Err(e) => Err(SandboxError::unavailable(e.to_string())),
        }
    }

    async fn terminate(&self, handle: &SandboxHandle) -> SandboxResult<()> {
        let options = StopContainerOptions { t: 2 };
        if let Err(e) = self.docker.stop_container(&handle.id, Some(options)).await {
            if !is_status(&e, 404) && !is_status(&e, 304) {
                warn!(sandbox = %handle.id, error = %e, "Error stopping container");
            }
        }
        self.remove_container(&handle.id).await;
        info!(sandbox = %handle.id, "Sandbox terminated");
        Ok(())
    }

    async fn execute(
        &self,
        handle: &SandboxHandle,
        command: &str,
        workdir: Option<&str>,
        timeout: Duration,
    ) -> SandboxResult<SandboxOutput> {
        debug!(sandbox = %handle.id, command = %command, "Executing command");
        let exec_config = CreateExecOptions::<String> {
            cmd: Some(vec!["sh".to_string(), "-c".to_string(), command.to_string()]),
            working_dir: workdir.map(str::to_string),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            ..Default::default()
        };
        let exec = self
            .docker
            .create_exec(&handle.id, exec_config)
            .await
            .map_err(|e| exec_error(handle, e))?;

        let run = async {
            let started = self
                .docker
                .start_exec(&exec.id, Some(StartExecOptions::default()))
                .await
                .map_err(|e| exec_error(handle, e))?;

            let StartExecResults::Attached { mut output, .. } = started else {
                return Err(SandboxError::ExecFailed("unexpected detached exec".to_string()));
            };

            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            while let Some(chunk) = output.next().await {
                match chunk {
                    Ok(LogOutput::StdOut { message }) => stdout.extend_from_slice(&message),
                    Ok(LogOutput::StdErr { message }) => stderr.extend_from_slice(&message),
                    Ok(_) => {}
                    Err(e) => warn!(sandbox = %handle.id, error = %e, "Error reading exec output"),
                }
            }

            let inspect = self
                .docker
                .inspect_exec(&exec.id)
                .await
                .map_err(|e| exec_error(handle, e))?;

            Ok(SandboxOutput {
                stdout: String::from_utf8_lossy(&stdout).to_string(),
                stderr: String::from_utf8_lossy(&stderr).to_string(),
                exit_code: inspect.exit_code.unwrap_or(-1),
            })
        };

        tokio::time::timeout(timeout, run)
            .await
            .map_err(|_| SandboxError::Timeout(timeout))?
    }

    async fn list_tunnels(&self, handle: &SandboxHandle) -> SandboxResult<BTreeMap<u16, String>> {
        let info = self
            .docker
            .inspect_container(&handle.id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| exec_error(handle, e))?;
        let ports = info
            .network_settings
            .and_then(|n| n.ports)
            .unwrap_or_default();
        Ok(tunnels_from_ports(&ports, &self.config.tunnel_host))
    }

    async fn poll_liveness(&self, handle: &SandboxHandle) -> SandboxResult<bool> {
        match self
            .docker
            .inspect_container(&handle.id, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => Ok(info.state.and_then(|s| s.running).unwrap_or(false)),
            Err(e) if is_status(&e, 404) => Ok(false),
            Err(e) => Err(SandboxError::unavailable(e.to_string())),
        }
    }

    async fn create_volume(&self, label: &str) -> SandboxResult<VolumeRef> {
        let name = Identifier::volume();
        let options = CreateVolumeOptions {
            name: name.clone(),
            driver: "local".to_string(),
            driver_opts: HashMap::new(),
            labels: HashMap::from([
                (MANAGED_LABEL.to_string(), "true".to_string()),
                (format!("{MANAGED_LABEL}.label"), label.to_string()),
            ]),
        };
        self.docker
            .create_volume(options)
            .await
            .map_err(|e| SandboxError::Volume(e.to_string()))?;
        debug!(volume = %name, label = %label, "Volume created");
        Ok(VolumeRef::new(name))
    }

    async fn delete_volume(&self, volume: &VolumeRef) -> SandboxResult<()> {
        match self
            .docker
            .remove_volume(&volume.name, Some(RemoveVolumeOptions { force: true }))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_status(&e, 404) => Ok(()),
            Err(e) => Err(SandboxError::Volume(e.to_string())),
        }
    }

    async fn read_volume_file(&self, volume: &VolumeRef, path: &str) -> SandboxResult<Vec<u8>> {
        let target = shell_escape(&helper_path(path)?);
        let script = format!("test -f {target} || exit {MISSING_FILE_EXIT}; base64 {target}");
        let output = self.run_helper(volume, &script).await?;
        match output.exit_code {
            0 => {
                let encoded: String = output.stdout.split_whitespace().collect();
                BASE64
                    .decode(encoded)
                    .map_err(|e| SandboxError::read_failed(path, e.to_string()))
            }
            MISSING_FILE_EXIT => Err(SandboxError::FileNotFound(path.to_string())),
            _ => Err(SandboxError::read_failed(path, output.combined())),
        }
    }

    async fn write_volume_file(
        &self,
        volume: &VolumeRef,
        path: &str,
        content: &[u8],
    ) -> SandboxResult<()> {
        let target = helper_path(path).map_err(|_| SandboxError::write_failed(path, "invalid volume path"))?;
        let script = format!(
            "mkdir -p \"$(dirname {target})\" && echo '{content}' | base64 -d > {target}",
            target = shell_escape(&target),
            content = BASE64.encode(content),
        );
        let output = self.run_helper(volume, &script).await?;
        if output.is_success() {
            Ok(())
        } else {
            Err(SandboxError::write_failed(path, output.combined()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> SandboxSpec {
        SandboxSpec {
            image: "node:20".into(),
            command: "cd /app/frontend && npm run dev".into(),
            volume: VolumeRef::new("vol_abc"),
            mount_path: "/app".into(),
            exposed_port: Some(3000),
            timeout: Duration::from_secs(3600),
            labels: BTreeMap::from([("promptstack.project".to_string(), "prj_1".to_string())]),
        }
    }

    #[test]
    fn test_container_config_mounts_and_ports() {
        let config = container_config(&spec(), "sbx_1", &DockerConfig::default());
        let host = config.host_config.unwrap();
        assert_eq!(host.binds.unwrap(), vec!["vol_abc:/app".to_string()]);
        assert!(host.port_bindings.unwrap().contains_key("3000/tcp"));
        assert!(config.exposed_ports.unwrap().contains_key("3000/tcp"));

        let cmd = config.cmd.unwrap();
        assert_eq!(cmd[0], "timeout");
        assert_eq!(cmd[1], "3600");
        assert_eq!(cmd.last().unwrap(), "cd /app/frontend && npm run dev");

        let labels = config.labels.unwrap();
        assert_eq!(labels.get("promptstack").map(String::as_str), Some("true"));
        assert_eq!(labels.get("promptstack.project").map(String::as_str), Some("prj_1"));
        assert_eq!(labels.get("promptstack.sandbox").map(String::as_str), Some("sbx_1"));
    }

    #[test]
    fn test_container_config_without_port() {
        let mut s = spec();
        s.exposed_port = None;
        let config = container_config(&s, "sbx_1", &DockerConfig::default());
        assert!(config.exposed_ports.is_none());
        assert!(config.host_config.unwrap().port_bindings.is_none());
    }

    #[test]
    fn test_tunnels_from_ports() {
        let ports: PortMap = HashMap::from([
            (
                "3000/tcp".to_string(),
                Some(vec![PortBinding {
                    host_ip: Some("0.0.0.0".into()),
                    host_port: Some("49153".into()),
                }]),
            ),
            ("9229/tcp".to_string(), None),
            ("garbage".to_string(), None),
        ]);
        let tunnels = tunnels_from_ports(&ports, "localhost");
        assert_eq!(tunnels.len(), 1);
        assert_eq!(tunnels[&3000], "http://localhost:49153");
    }

    #[test]
    fn test_helper_path() {
        assert_eq!(helper_path("frontend/a.js").unwrap(), "/vol/frontend/a.js");
        assert_eq!(helper_path("/frontend/a.js").unwrap(), "/vol/frontend/a.js");
        assert!(helper_path("../etc/passwd").is_err());
        assert!(helper_path("").is_err());
    }
}
