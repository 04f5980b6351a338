//! Container lifecycle orchestration
//!
//! `launch` walks a container through create, populate and start, undoing every step
//! already taken if a later one fails. Each started container gets exactly one
//! teardown task which waits for exit or cancellation, reports the outcome on the
//! delivery queue and then releases the container, its buffers, its bindings and
//! finally its record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::binding::SessionBindings;
use crate::cancel::Scope;
use crate::config::RuntimeConfig;
use crate::errors::{HubError, HubResult, RuntimeError};
use crate::queue::DeliveryQueue;
use crate::registry::{Language, ProgramDescriptor};
use crate::runtime::{archive, ContainerRuntime, ContainerSpec};
use crate::wire;

/// Exit code reported for executions ended by `stop` or shutdown.
pub const CANCELLED_EXIT_CODE: i64 = -1;

pub const ADDR_ENV: &str = "RUNHUB_ADDR";
pub const TOKEN_ENV: &str = "RUNHUB_TOKEN";

/// Credentials and address of a data store handed to a running program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InjectedConnection {
    #[serde(rename = "Type")]
    pub kind: String,
    #[serde(rename = "Addr")]
    pub addr: String,
    #[serde(rename = "Database")]
    pub database: String,
    #[serde(rename = "UserName")]
    pub user_name: String,
    #[serde(rename = "Password")]
    pub password: String,
}

impl InjectedConnection {
    /// Parses `type;addr;database;user;password`.
    pub fn parse(record: &str) -> HubResult<Self> {
        let fields: Vec<&str> = record.split(';').collect();
        let [kind, addr, database, user_name, password] = fields.as_slice() else {
            return Err(HubError::malformed(format!(
                "connection record has {} field(s), expected 5",
                fields.len()
            )));
        };
        Ok(Self {
            kind: kind.to_string(),
            addr: addr.to_string(),
            database: database.to_string(),
            user_name: user_name.to_string(),
            password: password.to_string(),
        })
    }
}

#[derive(Debug)]
pub struct ExecutionRecord {
    pub id: String,
    pub program: String,
    pub scope: Scope,
    pub immediate: bool,
    pub connections: Vec<InjectedConnection>,
    pub started_at: DateTime<Utc>,
    /// Cleared by teardown before the `stopped` frame is queued.
    output_open: Mutex<bool>,
}

impl ExecutionRecord {
    fn output_gate(&self) -> MutexGuard<'_, bool> {
        self.output_open.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Point-in-time view of one live execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionSummary {
    pub id: String,
    pub program: String,
    pub immediate: bool,
    pub started_at: DateTime<Utc>,
}

#[derive(Default)]
struct ExecutionTable {
    records: Mutex<HashMap<String, Arc<ExecutionRecord>>>,
    launching: AtomicUsize,
    drained: Notify,
}

impl ExecutionTable {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<ExecutionRecord>>> {
        self.records.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn insert(&self, record: Arc<ExecutionRecord>) {
        self.lock().insert(record.id.clone(), record);
    }

    fn get(&self, id: &str) -> Option<Arc<ExecutionRecord>> {
        self.lock().get(id).cloned()
    }

    fn remove(&self, id: &str) -> Option<Arc<ExecutionRecord>> {
        let mut records = self.lock();
        let removed = records.remove(id);
        if records.is_empty() {
            self.drained.notify_waiters();
        }
        removed
    }

    fn len(&self) -> usize {
        self.lock().len()
    }

    fn begin_launch(&self) {
        self.launching.fetch_add(1, Ordering::SeqCst);
    }

    fn end_launch(&self) {
        if self.launching.fetch_sub(1, Ordering::SeqCst) == 1 && self.len() == 0 {
            self.drained.notify_waiters();
        }
    }

    /// Waits until no record is live and no launch is in flight.
    async fn wait_empty(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.len() == 0 && self.launching.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Output held back from non-immediate executions until they finish.
#[derive(Default)]
struct PendingBuffers {
    buffers: Mutex<HashMap<String, Vec<u8>>>,
}

impl PendingBuffers {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.buffers.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn allocate(&self, id: &str) {
        self.lock().insert(id.to_string(), Vec::new());
    }

    /// Fails once the buffer has been taken.
    fn append(&self, id: &str, chunk: &[u8]) -> bool {
        match self.lock().get_mut(id) {
            Some(buffer) => {
                buffer.extend_from_slice(chunk);
                true
            }
            None => false,
        }
    }

    fn take(&self, id: &str) -> Option<Vec<u8>> {
        self.lock().remove(id)
    }
}

/// Marks one launch as in flight until dropped.
struct LaunchSlot(Arc<Orchestrator>);

impl LaunchSlot {
    fn new(orchestrator: Arc<Orchestrator>) -> Self {
        orchestrator.executions.begin_launch();
        Self(orchestrator)
    }
}

impl Drop for LaunchSlot {
    fn drop(&mut self) {
        self.0.executions.end_launch();
    }
}

pub struct Orchestrator {
    runtime: Arc<dyn ContainerRuntime>,
    queue: Arc<DeliveryQueue>,
    bindings: Arc<SessionBindings>,
    config: RuntimeConfig,
    advertise_addr: String,
    executions: ExecutionTable,
    pending: PendingBuffers,
}

impl Orchestrator {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        queue: Arc<DeliveryQueue>,
        bindings: Arc<SessionBindings>,
        config: RuntimeConfig,
        advertise_addr: String,
    ) -> Self {
        Self {
            runtime,
            queue,
            bindings,
            config,
            advertise_addr,
            executions: ExecutionTable::default(),
            pending: PendingBuffers::default(),
        }
    }

    /// Shell command that bootstraps dependencies (interpreted) and runs the program
    /// with the session token as its first argument.
    pub fn entry_command(language: Language, token: &str, argv: &str) -> Vec<String> {
        let mut line = match language {
            Language::Python2 => format!(
                "pip2 install -r requirements.txt && python2 main.py {}",
                token
            ),
            Language::Python3 => format!(
                "pip3 install -r requirements.txt && python3 main.py {}",
                token
            ),
            Language::Go => format!("./main {}", token),
        };
        let argv = argv.trim();
        if !argv.is_empty() {
            line.push(' ');
            line.push_str(argv);
        }
        vec!["sh".to_string(), "-c".to_string(), line]
    }

    /// Starts one execution of `program` and returns its identifier. On error nothing
    /// of the attempt is left behind.
    ///
    /// The steps run on their own task, so dropping the returned future does not
    /// interrupt them; [`Orchestrator::wait_idle`] covers launches still in flight.
    pub async fn launch(
        self: &Arc<Self>,
        program: &ProgramDescriptor,
        argv: &str,
        connections: Vec<InjectedConnection>,
    ) -> HubResult<String> {
        let slot = LaunchSlot::new(Arc::clone(self));
        let program = program.clone();
        let argv = argv.to_string();
        let task = tokio::spawn(async move {
            let result = slot.0.launch_steps(&program, &argv, connections).await;
            drop(slot);
            result
        });
        task.await.map_err(|e| {
            HubError::Runtime(RuntimeError::Other(format!("launch task failed: {}", e)))
        })?
    }

    async fn launch_steps(
        self: &Arc<Self>,
        program: &ProgramDescriptor,
        argv: &str,
        connections: Vec<InjectedConnection>,
    ) -> HubResult<String> {
        let scope = program.scope.child();
        if scope.is_cancelled() {
            scope.release();
            return Err(HubError::not_found(program.id.clone()));
        }
        let token = self.bindings.issue_token();
        let spec = ContainerSpec {
            name: format!("runhub-{}-{}", program.id, &Uuid::new_v4().simple().to_string()[..8]),
            image: self.config.images.for_language(program.language).to_string(),
            cmd: Self::entry_command(program.language, &token, argv),
            working_dir: self.config.workdir.clone(),
            env: vec![
                format!("{}={}", ADDR_ENV, self.advertise_addr),
                format!("{}={}", TOKEN_ENV, token),
            ],
        };

        let id = match self.runtime.create(&spec).await {
            Ok(id) => id,
            Err(e) => {
                self.bindings.revoke_token(&token);
                scope.release();
                return Err(e.into());
            }
        };
        log::debug!("Created container {} for program {}", id, program.id);

        let populated = match self.populate(&id, program).await {
            // Stopped or shut down while the archive was uploading.
            Ok(()) if scope.is_cancelled() => Err(HubError::not_found(program.id.clone())),
            other => other,
        };
        if let Err(e) = populated {
            self.discard_container(&id).await;
            self.bindings.revoke_token(&token);
            scope.release();
            return Err(e);
        }

        let record = Arc::new(ExecutionRecord {
            id: id.clone(),
            program: program.id.clone(),
            scope,
            immediate: program.immediate,
            connections,
            started_at: Utc::now(),
            output_open: Mutex::new(true),
        });
        self.bindings.bind_token(&token, &id);
        self.executions.insert(Arc::clone(&record));
        // Registered before start so output from a fast program is never lost.
        if !record.immediate {
            self.pending.allocate(&id);
        }

        if let Err(e) = self.runtime.start(&id).await {
            self.discard_container(&id).await;
            self.pending.take(&id);
            self.bindings.detach_execution(&id);
            record.scope.release();
            self.executions.remove(&id);
            return Err(e.into());
        }

        log::info!(
            "Execution {} of program {} started ({} connection(s), immediate: {})",
            id,
            program.id,
            record.connections.len(),
            record.immediate
        );
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move { orchestrator.await_exit(record).await });
        Ok(id)
    }

    async fn populate(&self, id: &str, program: &ProgramDescriptor) -> HubResult<()> {
        let archive = archive::pack_dir_async(program.dir.clone()).await?;
        self.runtime.upload(id, &self.config.workdir, archive).await?;
        Ok(())
    }

    async fn discard_container(&self, id: &str) {
        if let Err(e) = self.runtime.remove(id).await {
            log::warn!("Failed to remove container {}: {}", id, e);
        }
    }

    /// Teardown of one execution. Runs once per started container.
    async fn await_exit(self: Arc<Self>, record: Arc<ExecutionRecord>) {
        let code = tokio::select! {
            _ = record.scope.cancelled() => {
                log::info!("Execution {} cancelled", record.id);
                CANCELLED_EXIT_CODE
            }
            result = self.runtime.wait(&record.id) => match result {
                Ok(code) => {
                    log::info!("Execution {} exited with {}", record.id, code);
                    code
                }
                Err(e) => {
                    log::warn!("Waiting on execution {} failed: {}", record.id, e);
                    CANCELLED_EXIT_CODE
                }
            },
        };

        {
            let mut open = record.output_gate();
            *open = false;
            let mut frames = vec![wire::stopped_frame(&record.id, code)];
            if let Some(output) = self.pending.take(&record.id) {
                if !output.is_empty() {
                    frames.push(wire::data_frame(&record.id, &output));
                }
            }
            self.queue.enqueue_all(frames);
        }

        self.discard_container(&record.id).await;
        self.bindings.detach_execution(&record.id);
        record.scope.release();
        self.executions.remove(&record.id);
    }

    /// Cancels a live execution. Teardown completes asynchronously.
    pub fn stop(&self, id: &str) -> HubResult<()> {
        let record = self
            .executions
            .get(id)
            .ok_or_else(|| HubError::not_found(id))?;
        log::info!("Stopping execution {}", id);
        record.scope.cancel();
        Ok(())
    }

    /// Relays or buffers output written by an execution. Refused once teardown has
    /// queued the `stopped` frame, even while the container is still being removed.
    pub fn push_output(&self, id: &str, chunk: &[u8]) -> HubResult<()> {
        let record = self
            .executions
            .get(id)
            .ok_or_else(|| HubError::not_found(id))?;
        let open = record.output_gate();
        if !*open {
            return Err(HubError::not_found(id));
        }
        if record.immediate {
            self.queue.enqueue(wire::data_frame(id, chunk));
            return Ok(());
        }
        if self.pending.append(id, chunk) {
            Ok(())
        } else {
            Err(HubError::not_found(id))
        }
    }

    pub fn connections(&self, id: &str) -> Option<Vec<InjectedConnection>> {
        self.executions
            .get(id)
            .map(|record| record.connections.clone())
    }

    pub fn len(&self) -> usize {
        self.executions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<ExecutionSummary> {
        let mut executions: Vec<_> = self
            .executions
            .lock()
            .values()
            .map(|record| ExecutionSummary {
                id: record.id.clone(),
                program: record.program.clone(),
                immediate: record.immediate,
                started_at: record.started_at,
            })
            .collect();
        executions.sort_by(|a, b| a.id.cmp(&b.id));
        executions
    }

    /// Resolves once no execution is live or tearing down.
    pub async fn wait_idle(&self) {
        self.executions.wait_empty().await;
    }
}
