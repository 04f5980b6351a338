//! In-process container runtime.
//!
//! Containers never run anything: they exit when [`MemoryRuntime::exit`] is called
//! (or immediately on start when an automatic exit code is configured). Used by the
//! test suites to drive the orchestrator without a Docker daemon.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;

use super::{ContainerRuntime, ContainerSpec};
use crate::errors::RuntimeError;

/// Operation that the next call should fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    Create,
    Upload,
    Start,
}

struct MemoryContainer {
    spec: ContainerSpec,
    uploaded: Vec<(String, usize)>,
    started: bool,
    exit: watch::Sender<Option<i64>>,
    logs: String,
}

#[derive(Default)]
struct State {
    containers: HashMap<String, MemoryContainer>,
    created: Vec<ContainerSpec>,
    removed: Vec<String>,
    fail_next: Option<FailPoint>,
    auto_exit: Option<i64>,
    logs: String,
    upload_delay: Option<Duration>,
    remove_delay: Option<Duration>,
}

#[derive(Default)]
pub struct MemoryRuntime {
    state: Mutex<State>,
    next_id: AtomicU64,
}

impl MemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every started container exits right away with `code` and `logs` as its output.
    pub fn with_auto_exit(code: i64, logs: &str) -> Self {
        let runtime = Self::default();
        {
            let mut state = runtime.lock();
            state.auto_exit = Some(code);
            state.logs = logs.to_string();
        }
        runtime
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn take_failure(&self, point: FailPoint) -> Result<(), RuntimeError> {
        let mut state = self.lock();
        if state.fail_next == Some(point) {
            state.fail_next = None;
            return Err(RuntimeError::Other(format!("injected {:?} failure", point)));
        }
        Ok(())
    }

    pub fn fail_next(&self, point: FailPoint) {
        self.lock().fail_next = Some(point);
    }

    /// Every later upload takes `delay` before it lands.
    pub fn delay_uploads(&self, delay: Duration) {
        self.lock().upload_delay = Some(delay);
    }

    /// Every later removal takes `delay`, like a forced remove of a busy container.
    pub fn delay_removals(&self, delay: Duration) {
        self.lock().remove_delay = Some(delay);
    }

    /// Makes a started container exit. Returns false if it is unknown or not started.
    pub fn exit(&self, id: &str, code: i64) -> bool {
        match self.lock().containers.get(id) {
            Some(container) if container.started => {
                container.exit.send_replace(Some(code));
                true
            }
            _ => false,
        }
    }

    pub fn spec(&self, id: &str) -> Option<ContainerSpec> {
        self.lock().containers.get(id).map(|c| c.spec.clone())
    }

    pub fn uploads(&self, id: &str) -> Vec<(String, usize)> {
        self.lock()
            .containers
            .get(id)
            .map(|c| c.uploaded.clone())
            .unwrap_or_default()
    }

    /// Identifiers of containers that exist and have not been removed.
    pub fn live(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.lock().containers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Spec of every container ever created, in creation order.
    pub fn created(&self) -> Vec<ContainerSpec> {
        self.lock().created.clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.lock().removed.clone()
    }
}

#[async_trait]
impl ContainerRuntime for MemoryRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        self.take_failure(FailPoint::Create)?;
        let id = format!("mem{:04}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let (exit, _) = watch::channel(None);
        let mut state = self.lock();
        state.created.push(spec.clone());
        state.containers.insert(
            id.clone(),
            MemoryContainer {
                spec: spec.clone(),
                uploaded: Vec::new(),
                started: false,
                exit,
                logs: String::new(),
            },
        );
        Ok(id)
    }

    async fn upload(&self, id: &str, path: &str, archive: Vec<u8>) -> Result<(), RuntimeError> {
        self.take_failure(FailPoint::Upload)?;
        let delay = self.lock().upload_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.lock();
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::Other(format!("no such container: {}", id)))?;
        container.uploaded.push((path.to_string(), archive.len()));
        Ok(())
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        self.take_failure(FailPoint::Start)?;
        let mut state = self.lock();
        let auto_exit = state.auto_exit;
        let logs = state.logs.clone();
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::Other(format!("no such container: {}", id)))?;
        container.started = true;
        if let Some(code) = auto_exit {
            container.logs = logs;
            container.exit.send_replace(Some(code));
        }
        Ok(())
    }

    async fn wait(&self, id: &str) -> Result<i64, RuntimeError> {
        let mut receiver = self
            .lock()
            .containers
            .get(id)
            .map(|c| c.exit.subscribe())
            .ok_or_else(|| RuntimeError::Other(format!("no such container: {}", id)))?;
        let code = receiver
            .wait_for(|code| code.is_some())
            .await
            .map_err(|_| RuntimeError::WaitEnded(id.to_string()))?;
        Ok(code.unwrap_or(-1))
    }

    async fn logs(&self, id: &str) -> Result<String, RuntimeError> {
        self.lock()
            .containers
            .get(id)
            .map(|c| c.logs.clone())
            .ok_or_else(|| RuntimeError::Other(format!("no such container: {}", id)))
    }

    async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        let delay = self.lock().remove_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.lock();
        match state.containers.remove(id) {
            Some(_) => {
                state.removed.push(id.to_string());
                Ok(())
            }
            None => Err(RuntimeError::Other(format!("no such container: {}", id))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ContainerSpec {
        ContainerSpec {
            name: "t".to_string(),
            image: "img".to_string(),
            cmd: vec!["true".to_string()],
            working_dir: "/app".to_string(),
            env: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_exit_releases_waiter() {
        let runtime = MemoryRuntime::new();
        let id = runtime.create(&spec()).await.unwrap();
        assert!(!runtime.exit(&id, 0));
        runtime.start(&id).await.unwrap();
        assert!(runtime.exit(&id, 7));
        assert_eq!(runtime.wait(&id).await.unwrap(), 7);
        runtime.remove(&id).await.unwrap();
        assert!(runtime.remove(&id).await.is_err());
        assert_eq!(runtime.removed(), vec![id]);
    }

    #[tokio::test]
    async fn test_injected_failure_fires_once() {
        let runtime = MemoryRuntime::new();
        runtime.fail_next(FailPoint::Create);
        assert!(runtime.create(&spec()).await.is_err());
        assert!(runtime.create(&spec()).await.is_ok());
    }
}
