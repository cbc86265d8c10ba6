//! Docker implementation of [`ContainerEngine`] using bollard.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::{BuildImageOptions, CreateImageOptions};
use bollard::models::{BuildInfo, CreateImageInfo, HostConfig, PortBinding};
use bollard::network::{CreateNetworkOptions, ListNetworksOptions};
use bytes::Bytes;
use futures::StreamExt;

use crate::engine::{
    BUILD_FILE_NAME, ContainerEngine, ContainerSummary, CreateContainerRequest, EngineError,
    LogChunk, LogChunkStream, LogStream, NetworkSummary, PUBLISH_HOST_IP, ProgressStream, Result,
};

/// Connect to the local Docker daemon and verify it answers a ping.
///
/// Honors `DOCKER_HOST`; otherwise uses the platform default socket or pipe.
pub async fn connect_docker() -> Result<Docker> {
    let docker =
        Docker::connect_with_local_defaults().map_err(|e| EngineError::Unavailable {
            reason: e.to_string(),
        })?;

    docker
        .ping()
        .await
        .map_err(|e| EngineError::Unavailable {
            reason: e.to_string(),
        })?;

    Ok(docker)
}

/// Container engine backed by a Docker daemon.
#[derive(Clone)]
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Wrap an existing bollard client.
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    /// Connect to the local daemon.
    pub async fn connect() -> Result<Self> {
        Ok(Self::new(connect_docker().await?))
    }

    async fn find_network(&self, name: &str) -> Result<Option<NetworkSummary>> {
        Ok(self
            .list_networks()
            .await?
            .into_iter()
            .find(|n| n.name == name))
    }
}

/// Translate a bollard error, recognising missing and conflicting resources.
fn map_docker_error(
    operation: &'static str,
    kind: &'static str,
    name: &str,
    err: DockerError,
) -> EngineError {
    match err {
        DockerError::DockerResponseServerError {
            status_code: 404, ..
        } => EngineError::NotFound {
            kind,
            name: name.to_string(),
        },
        DockerError::DockerResponseServerError {
            status_code: 409, ..
        } => EngineError::Conflict {
            kind,
            name: name.to_string(),
        },
        other => EngineError::request(operation, other),
    }
}

/// Split an image reference into the `fromImage`/`tag` pair the pull API wants.
///
/// A reference without a tag pulls `latest` rather than every tag.
fn split_reference(reference: &str) -> (&str, &str) {
    if reference.contains('@') {
        return (reference, "");
    }
    match reference.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => (repo, tag),
        _ => (reference, "latest"),
    }
}

fn pull_progress_line(info: CreateImageInfo) -> Result<Option<String>> {
    if let Some(error) = info.error {
        return Err(EngineError::Stream {
            operation: "pull image",
            reason: error,
        });
    }

    let Some(status) = info.status else {
        return Ok(None);
    };

    let mut line = match info.id {
        Some(id) => format!("{}: {}", id, status),
        None => status,
    };
    if let Some(progress) = info.progress {
        line.push(' ');
        line.push_str(&progress);
    }
    Ok(Some(line))
}

fn build_progress_line(info: BuildInfo) -> Result<Option<String>> {
    if let Some(error) = info.error {
        return Err(EngineError::Stream {
            operation: "build image",
            reason: error,
        });
    }

    let line = info.stream.or(info.status).unwrap_or_default();
    let line = line.trim_end();
    if line.is_empty() {
        Ok(None)
    } else {
        Ok(Some(line.to_string()))
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn list_networks(&self) -> Result<Vec<NetworkSummary>> {
        let networks = self
            .docker
            .list_networks(None::<ListNetworksOptions<String>>)
            .await
            .map_err(|e| EngineError::request("list networks", e))?;

        Ok(networks
            .into_iter()
            .filter_map(|n| {
                Some(NetworkSummary {
                    id: n.id?,
                    name: n.name?,
                })
            })
            .collect())
    }

    async fn create_network(&self, name: &str) -> Result<NetworkSummary> {
        let options = CreateNetworkOptions {
            name: name.to_string(),
            driver: "bridge".to_string(),
            check_duplicate: true,
            attachable: true,
            ..Default::default()
        };

        self.docker
            .create_network(options)
            .await
            .map_err(|e| map_docker_error("create network", "network", name, e))?;

        // Resolve the identity by name; the create response shape varies across API versions.
        self.find_network(name)
            .await?
            .ok_or_else(|| EngineError::NotFound {
                kind: "network",
                name: name.to_string(),
            })
    }

    async fn list_containers(&self) -> Result<Vec<ContainerSummary>> {
        let options = ListContainersOptions::<String> {
            all: true,
            ..Default::default()
        };

        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| EngineError::request("list containers", e))?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                Some(ContainerSummary {
                    id: c.id?,
                    names: c.names.unwrap_or_default(),
                })
            })
            .collect())
    }

    async fn create_container(&self, request: &CreateContainerRequest) -> Result<String> {
        let port_key = request.port_key();

        let mut port_bindings = HashMap::new();
        port_bindings.insert(
            port_key.clone(),
            Some(vec![PortBinding {
                host_ip: Some(PUBLISH_HOST_IP.to_string()),
                host_port: Some(request.port.to_string()),
            }]),
        );

        let exposed_ports: HashMap<String, HashMap<(), ()>> =
            HashMap::from([(port_key, HashMap::new())]);

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            network_mode: Some(request.network_id.clone()),
            ..Default::default()
        };

        let config = Config {
            image: Some(request.image.clone()),
            hostname: Some(request.hostname.clone()),
            env: Some(request.env_entries()),
            exposed_ports: Some(exposed_ports),
            tty: Some(false),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: request.name.clone(),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| map_docker_error("create container", "container", &request.name, e))?;

        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| map_docker_error("start container", "container", id, e))
    }

    async fn stop_container(&self, id: &str) -> Result<()> {
        match self.docker.stop_container(id, None).await {
            Ok(()) => Ok(()),
            // 304: already stopped
            Err(DockerError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(map_docker_error("stop container", "container", id, e)),
        }
    }

    async fn wait_not_running(&self, id: &str) -> Result<()> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = self.docker.wait_container(id, Some(options));

        match stream.next().await {
            Some(Ok(_)) | None => Ok(()),
            Some(Err(e)) => Err(EngineError::Stream {
                operation: "wait container",
                reason: e.to_string(),
            }),
        }
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        self.docker
            .remove_container(id, None::<RemoveContainerOptions>)
            .await
            .map_err(|e| map_docker_error("remove container", "container", id, e))
    }

    fn container_logs<'a>(&'a self, id: &'a str) -> LogChunkStream<'a> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            ..Default::default()
        };

        self.docker
            .logs(id, Some(options))
            .filter_map(|item| async move {
                match item {
                    Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                        Some(Ok(LogChunk {
                            stream: LogStream::Stdout,
                            bytes: message,
                        }))
                    }
                    Ok(LogOutput::StdErr { message }) => Some(Ok(LogChunk {
                        stream: LogStream::Stderr,
                        bytes: message,
                    })),
                    Ok(LogOutput::StdIn { .. }) => None,
                    Err(e) => Some(Err(EngineError::Stream {
                        operation: "fetch logs",
                        reason: e.to_string(),
                    })),
                }
            })
            .boxed()
    }

    fn pull_image<'a>(&'a self, reference: &'a str) -> ProgressStream<'a> {
        let (from_image, tag) = split_reference(reference);
        let options = CreateImageOptions {
            from_image: from_image.to_string(),
            tag: tag.to_string(),
            ..Default::default()
        };

        self.docker
            .create_image(Some(options), None, None)
            .filter_map(move |item| async move {
                match item {
                    Ok(info) => pull_progress_line(info).transpose(),
                    Err(e) => Some(Err(map_docker_error("pull image", "image", reference, e))),
                }
            })
            .boxed()
    }

    fn build_image<'a>(&'a self, context: Bytes, tag: &'a str) -> ProgressStream<'a> {
        let options = BuildImageOptions {
            dockerfile: BUILD_FILE_NAME.to_string(),
            t: tag.to_string(),
            rm: true,
            ..Default::default()
        };

        self.docker
            .build_image(options, None, Some(context))
            .filter_map(|item| async move {
                match item {
                    Ok(info) => build_progress_line(info).transpose(),
                    Err(e) => Some(Err(EngineError::request("build image", e))),
                }
            })
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_reference_defaults_to_latest() {
        assert_eq!(
            split_reference("mcr.microsoft.com/azure-sql-edge"),
            ("mcr.microsoft.com/azure-sql-edge", "latest")
        );
        assert_eq!(split_reference("postgres:16"), ("postgres", "16"));
    }

    #[test]
    fn test_split_reference_registry_port() {
        assert_eq!(
            split_reference("localhost:5000/app"),
            ("localhost:5000/app", "latest")
        );
        assert_eq!(
            split_reference("localhost:5000/app:v2"),
            ("localhost:5000/app", "v2")
        );
    }

    #[test]
    fn test_split_reference_digest() {
        let reference = "postgres@sha256:abcd";
        assert_eq!(split_reference(reference), (reference, ""));
    }

    #[tokio::test]
    async fn test_pull_stream_reports_unreachable_daemon() {
        let docker =
            Docker::connect_with_http("http://127.0.0.1:1", 2, bollard::API_DEFAULT_VERSION)
                .unwrap();
        let engine = DockerEngine::new(docker);

        let reference = String::from("postgres:16");
        let mut stream = engine.pull_image(&reference);
        let first = stream.next().await.unwrap();

        assert!(first.is_err());
    }

    #[test]
    fn test_pull_progress_line_formats_layer_status() {
        let info = CreateImageInfo {
            id: Some("3f4ca61aafcd".to_string()),
            status: Some("Downloading".to_string()),
            progress: Some("[=>   ]".to_string()),
            ..Default::default()
        };
        assert_eq!(
            pull_progress_line(info).unwrap(),
            Some("3f4ca61aafcd: Downloading [=>   ]".to_string())
        );
    }

    #[test]
    fn test_build_progress_line_surfaces_errors() {
        let info = BuildInfo {
            error: Some("COPY failed".to_string()),
            ..Default::default()
        };
        assert!(build_progress_line(info).is_err());

        let info = BuildInfo {
            stream: Some("Step 1/4 : FROM golang\n".to_string()),
            ..Default::default()
        };
        assert_eq!(
            build_progress_line(info).unwrap(),
            Some("Step 1/4 : FROM golang".to_string())
        );
    }
}
