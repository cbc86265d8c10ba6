//! In-memory doubles for exercising environments without a daemon.
//!
//! Provides:
//! - [`FakeEngine`]: A [`ContainerEngine`] that keeps networks, images and
//!   containers in memory, records every call, and fails on demand
//! - [`RecordingSink`]: An [`OutputSink`] that keeps everything it receives
//! - [`ScriptedProbe`]: A readiness probe that succeeds after a fixed number
//!   of failures
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use testbed::environment::NetworkManager;
//! use testbed::testing::{EngineCall, FakeEngine};
//!
//! # async fn demo() {
//! let engine = Arc::new(FakeEngine::new());
//! NetworkManager::new(engine.clone()).create("env").await.unwrap();
//! assert_eq!(engine.count_calls(|c| matches!(c, EngineCall::CreateNetwork(_))), 1);
//! # }
//! ```

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::time::Instant;

use crate::engine::{
    ContainerEngine, ContainerSummary, CreateContainerRequest, EngineError, LogChunk,
    LogChunkStream, LogStream, NetworkSummary, ProgressStream, Result,
};
use crate::environment::error::ProbeError;
use crate::environment::readiness::ReadinessProbe;
use crate::environment::sink::OutputSink;

/// Engine operations that can be made to fail with [`FakeEngine::fail_on`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    ListNetworks,
    CreateNetwork,
    ListContainers,
    CreateContainer,
    StartContainer,
    StopContainer,
    WaitNotRunning,
    RemoveContainer,
    FetchLogs,
    PullImage,
    BuildImage,
}

impl Operation {
    fn as_str(&self) -> &'static str {
        match self {
            Self::ListNetworks => "list networks",
            Self::CreateNetwork => "create network",
            Self::ListContainers => "list containers",
            Self::CreateContainer => "create container",
            Self::StartContainer => "start container",
            Self::StopContainer => "stop container",
            Self::WaitNotRunning => "wait container",
            Self::RemoveContainer => "remove container",
            Self::FetchLogs => "container logs",
            Self::PullImage => "pull image",
            Self::BuildImage => "build image",
        }
    }
}

/// A call observed by [`FakeEngine`], with its main argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    ListNetworks,
    CreateNetwork(String),
    ListContainers,
    /// Container name.
    CreateContainer(String),
    StartContainer(String),
    StopContainer(String),
    /// Recorded when a wait for not-running resolves successfully.
    WaitCompleted(String),
    RemoveContainer(String),
    FetchLogs(String),
    /// Image reference.
    PullImage(String),
    /// Image tag.
    BuildImage(String),
}

/// A container held by [`FakeEngine`].
#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub id: String,
    pub name: String,
    pub request: CreateContainerRequest,
    pub running: bool,
    pub logs: Vec<LogChunk>,
}

#[derive(Default)]
struct State {
    next_id: u64,
    networks: Vec<NetworkSummary>,
    images: BTreeSet<String>,
    containers: Vec<FakeContainer>,
    build_contexts: HashMap<String, Vec<String>>,
    calls: Vec<(EngineCall, Instant)>,
    failing: HashSet<Operation>,
    wait_delay: Duration,
    hang_wait: bool,
}

impl State {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{:04}", prefix, self.next_id)
    }

    fn record(&mut self, call: EngineCall) {
        self.calls.push((call, Instant::now()));
    }

    fn check(&self, operation: Operation) -> Result<()> {
        if self.failing.contains(&operation) {
            return Err(EngineError::request(operation.as_str(), "injected failure"));
        }
        Ok(())
    }

    fn container_mut(&mut self, id: &str) -> Result<&mut FakeContainer> {
        self.containers
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| EngineError::NotFound {
                kind: "container",
                name: id.to_string(),
            })
    }
}

/// In-memory container engine.
///
/// Containers behave like the real thing where the environment relies on it:
/// names are unique, creating from an unknown image fails, running
/// containers cannot be removed, and stopping an already stopped container
/// succeeds.
#[derive(Default)]
pub struct FakeEngine {
    state: Mutex<State>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make every later call of `operation` fail.
    pub fn fail_on(&self, operation: Operation) {
        self.state().failing.insert(operation);
    }

    /// Let calls of `operation` succeed again.
    pub fn recover(&self, operation: Operation) {
        self.state().failing.remove(&operation);
    }

    /// Delay before a wait for not-running resolves.
    pub fn set_wait_delay(&self, delay: Duration) {
        self.state().wait_delay = delay;
    }

    /// Make waits for not-running never resolve.
    pub fn hang_wait(&self) {
        self.state().hang_wait = true;
    }

    pub fn add_network(&self, name: &str) -> NetworkSummary {
        let mut state = self.state();
        let network = NetworkSummary {
            id: state.next_id("net"),
            name: name.to_string(),
        };
        state.networks.push(network.clone());
        network
    }

    pub fn networks(&self) -> Vec<NetworkSummary> {
        self.state().networks.clone()
    }

    pub fn add_image(&self, reference: &str) {
        self.state().images.insert(reference.to_string());
    }

    pub fn has_image(&self, reference: &str) -> bool {
        self.state().images.contains(reference)
    }

    /// Insert a container directly, bypassing call recording.
    pub fn add_container(&self, name: &str, image: &str, running: bool) -> String {
        let mut state = self.state();
        let id = state.next_id("ctr");
        state.containers.push(FakeContainer {
            id: id.clone(),
            name: name.to_string(),
            request: CreateContainerRequest {
                name: name.to_string(),
                image: image.to_string(),
                hostname: name.to_string(),
                port: 0,
                env: Default::default(),
                network_id: String::new(),
            },
            running,
            logs: Vec::new(),
        });
        id
    }

    /// Append output to a container's log. Unknown ids are ignored.
    pub fn add_log(&self, id: &str, stream: LogStream, bytes: &[u8]) {
        let mut state = self.state();
        if let Ok(container) = state.container_mut(id) {
            container.logs.push(LogChunk {
                stream,
                bytes: Bytes::copy_from_slice(bytes),
            });
        }
    }

    pub fn containers(&self) -> Vec<FakeContainer> {
        self.state().containers.clone()
    }

    pub fn container(&self, id: &str) -> Option<FakeContainer> {
        self.state().containers.iter().find(|c| c.id == id).cloned()
    }

    pub fn container_named(&self, name: &str) -> Option<FakeContainer> {
        self.state()
            .containers
            .iter()
            .find(|c| c.name == name)
            .cloned()
    }

    /// Entry paths of the last build context submitted for `tag`.
    pub fn build_context(&self, tag: &str) -> Option<Vec<String>> {
        self.state().build_contexts.get(tag).cloned()
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.state().calls.iter().map(|(c, _)| c.clone()).collect()
    }

    pub fn count_calls(&self, pred: impl Fn(&EngineCall) -> bool) -> usize {
        self.state().calls.iter().filter(|(c, _)| pred(c)).count()
    }

    /// When the first call matching `pred` was recorded.
    pub fn call_time(&self, pred: impl Fn(&EngineCall) -> bool) -> Option<Instant> {
        self.state()
            .calls
            .iter()
            .find(|(c, _)| pred(c))
            .map(|(_, at)| *at)
    }
}

fn archive_paths(context: &[u8]) -> std::io::Result<Vec<String>> {
    let mut archive = tar::Archive::new(context);
    let mut paths = Vec::new();
    for entry in archive.entries()? {
        let entry = entry?;
        paths.push(entry.path()?.to_string_lossy().into_owned());
    }
    Ok(paths)
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn list_networks(&self) -> Result<Vec<NetworkSummary>> {
        let mut state = self.state();
        state.record(EngineCall::ListNetworks);
        state.check(Operation::ListNetworks)?;
        Ok(state.networks.clone())
    }

    async fn create_network(&self, name: &str) -> Result<NetworkSummary> {
        let mut state = self.state();
        state.record(EngineCall::CreateNetwork(name.to_string()));
        state.check(Operation::CreateNetwork)?;

        if state.networks.iter().any(|n| n.name == name) {
            return Err(EngineError::Conflict {
                kind: "network",
                name: name.to_string(),
            });
        }

        let network = NetworkSummary {
            id: state.next_id("net"),
            name: name.to_string(),
        };
        state.networks.push(network.clone());
        Ok(network)
    }

    async fn list_containers(&self) -> Result<Vec<ContainerSummary>> {
        let mut state = self.state();
        state.record(EngineCall::ListContainers);
        state.check(Operation::ListContainers)?;
        Ok(state
            .containers
            .iter()
            .map(|c| ContainerSummary {
                id: c.id.clone(),
                names: vec![format!("/{}", c.name)],
            })
            .collect())
    }

    async fn create_container(&self, request: &CreateContainerRequest) -> Result<String> {
        let mut state = self.state();
        state.record(EngineCall::CreateContainer(request.name.clone()));
        state.check(Operation::CreateContainer)?;

        if !state.images.contains(&request.image) {
            return Err(EngineError::NotFound {
                kind: "image",
                name: request.image.clone(),
            });
        }
        if state.containers.iter().any(|c| c.name == request.name) {
            return Err(EngineError::Conflict {
                kind: "container",
                name: request.name.clone(),
            });
        }

        let id = state.next_id("ctr");
        state.containers.push(FakeContainer {
            id: id.clone(),
            name: request.name.clone(),
            request: request.clone(),
            running: false,
            logs: Vec::new(),
        });
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        let mut state = self.state();
        state.record(EngineCall::StartContainer(id.to_string()));
        state.check(Operation::StartContainer)?;

        let container = state.container_mut(id)?;
        container.running = true;
        let line = format!("container {} started\n", container.name);
        container.logs.push(LogChunk {
            stream: LogStream::Stdout,
            bytes: Bytes::from(line),
        });
        Ok(())
    }

    async fn stop_container(&self, id: &str) -> Result<()> {
        let mut state = self.state();
        state.record(EngineCall::StopContainer(id.to_string()));
        state.check(Operation::StopContainer)?;

        state.container_mut(id)?.running = false;
        Ok(())
    }

    async fn wait_not_running(&self, id: &str) -> Result<()> {
        let (delay, hang) = {
            let state = self.state();
            (state.wait_delay, state.hang_wait)
        };

        if hang {
            std::future::pending::<()>().await;
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        state.check(Operation::WaitNotRunning)?;
        state.record(EngineCall::WaitCompleted(id.to_string()));
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let mut state = self.state();
        state.record(EngineCall::RemoveContainer(id.to_string()));
        state.check(Operation::RemoveContainer)?;

        if state.container_mut(id)?.running {
            return Err(EngineError::request(
                "remove container",
                format!("container {} is running", id),
            ));
        }
        state.containers.retain(|c| c.id != id);
        Ok(())
    }

    fn container_logs<'a>(&'a self, id: &'a str) -> LogChunkStream<'a> {
        let mut state = self.state();
        state.record(EngineCall::FetchLogs(id.to_string()));

        let items: Vec<Result<LogChunk>> = match state.check(Operation::FetchLogs) {
            Err(e) => vec![Err(e)],
            Ok(()) => match state.container_mut(id) {
                Ok(container) => container.logs.iter().cloned().map(Ok).collect(),
                Err(e) => vec![Err(e)],
            },
        };
        futures::stream::iter(items).boxed()
    }

    fn pull_image<'a>(&'a self, reference: &'a str) -> ProgressStream<'a> {
        let mut state = self.state();
        state.record(EngineCall::PullImage(reference.to_string()));

        let items: Vec<Result<String>> = match state.check(Operation::PullImage) {
            Err(_) => vec![
                Ok(format!("Pulling from {}", reference)),
                Err(EngineError::Stream {
                    operation: "pull image",
                    reason: "manifest unknown".to_string(),
                }),
            ],
            Ok(()) => {
                state.images.insert(reference.to_string());
                vec![
                    Ok(format!("Pulling from {}", reference)),
                    Ok("Pull complete".to_string()),
                    Ok(format!("Status: Downloaded newer image for {}", reference)),
                ]
            }
        };
        futures::stream::iter(items).boxed()
    }

    fn build_image<'a>(&'a self, context: Bytes, tag: &'a str) -> ProgressStream<'a> {
        let mut state = self.state();
        state.record(EngineCall::BuildImage(tag.to_string()));

        let items: Vec<Result<String>> = match state.check(Operation::BuildImage) {
            Err(e) => vec![Err(e)],
            Ok(()) => match archive_paths(&context) {
                Err(e) => vec![Err(EngineError::request("build image", e))],
                Ok(paths) => {
                    let count = paths.len();
                    state.build_contexts.insert(tag.to_string(), paths);
                    state.images.insert(tag.to_string());
                    vec![
                        Ok(format!("Sending build context ({} files)", count)),
                        Ok(format!("Successfully tagged {}", tag)),
                    ]
                }
            },
        };
        futures::stream::iter(items).boxed()
    }
}

/// Output sink that keeps everything it receives.
#[derive(Default)]
pub struct RecordingSink {
    progress: Mutex<Vec<(String, String)>>,
    logs: Mutex<Vec<(String, LogStream, Vec<u8>)>>,
}

impl RecordingSink {
    /// Progress lines reported for `resource`, in order.
    pub fn progress_for(&self, resource: &str) -> Vec<String> {
        self.progress
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(r, _)| r == resource)
            .map(|(_, line)| line.clone())
            .collect()
    }

    /// Log output drained from `container`, both streams, lossily decoded.
    pub fn logs_for(&self, container: &str) -> String {
        let logs = self.logs.lock().unwrap_or_else(|e| e.into_inner());
        let bytes: Vec<u8> = logs
            .iter()
            .filter(|(c, _, _)| c == container)
            .flat_map(|(_, _, b)| b.iter().copied())
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

impl OutputSink for RecordingSink {
    fn progress(&self, resource: &str, line: &str) {
        self.progress
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((resource.to_string(), line.to_string()));
    }

    fn log(&self, container: &str, stream: LogStream, bytes: &[u8]) {
        self.logs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((container.to_string(), stream, bytes.to_vec()));
    }
}

/// Readiness probe that fails a fixed number of times, then succeeds.
pub struct ScriptedProbe {
    failures: Option<u32>,
    call_count: AtomicU32,
}

impl ScriptedProbe {
    /// Fail `failures` times, then succeed on every later call.
    pub fn succeed_after(failures: u32) -> Self {
        Self {
            failures: Some(failures),
            call_count: AtomicU32::new(0),
        }
    }

    /// Never succeed.
    pub fn always_failing() -> Self {
        Self {
            failures: None,
            call_count: AtomicU32::new(0),
        }
    }

    /// Number of checks made so far.
    pub fn calls(&self) -> u32 {
        self.call_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReadinessProbe for ScriptedProbe {
    fn target(&self) -> String {
        "scripted".to_string()
    }

    async fn check(&self) -> std::result::Result<(), ProbeError> {
        let attempt = self.call_count.fetch_add(1, Ordering::SeqCst) + 1;
        match self.failures {
            Some(failures) if attempt > failures => Ok(()),
            _ => Err(ProbeError::Connect {
                target: self.target(),
                reason: format!("refused on attempt {}", attempt),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fake_engine_rejects_unknown_image() {
        let engine = FakeEngine::new();
        let request = CreateContainerRequest {
            name: "db".to_string(),
            image: "missing".to_string(),
            hostname: "db".to_string(),
            port: 1,
            env: Default::default(),
            network_id: String::new(),
        };

        let err = engine.create_container(&request).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_fake_engine_refuses_to_remove_running_container() {
        let engine = FakeEngine::new();
        let id = engine.add_container("db", "postgres:16", true);

        assert!(engine.remove_container(&id).await.is_err());
        engine.stop_container(&id).await.unwrap();
        engine.remove_container(&id).await.unwrap();
        assert!(engine.containers().is_empty());
    }

    #[tokio::test]
    async fn test_scripted_probe() {
        let probe = ScriptedProbe::succeed_after(1);
        assert!(probe.check().await.is_err());
        assert!(probe.check().await.is_ok());
        assert_eq!(probe.calls(), 2);
    }
}
