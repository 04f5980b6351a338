//! Service wiring.
//!
//! [`Hub`] owns every shared table and is the state handed to both command tables.
//! [`Hub::serve`] binds the two listeners and starts the delivery task, all below the
//! process-wide root scope so that cancelling the root winds everything down.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::binding::{binding_table, SessionBindings};
use crate::builder::{Builder, ToolchainBuilder};
use crate::cancel::{Scope, ScopeTree};
use crate::config::{parse_addr, ConfigLoader, HubConfig};
use crate::control::control_table;
use crate::errors::HubResult;
use crate::orchestrator::Orchestrator;
use crate::queue::DeliveryQueue;
use crate::registry::ProgramRegistry;
use crate::runtime::{ContainerRuntime, DockerRuntime};
use crate::transport::{tls, Listener, ListenerHandle, SessionTable};

pub struct Hub {
    config: HubConfig,
    key: String,
    tree: Arc<ScopeTree>,
    root: Scope,
    sessions: Arc<SessionTable>,
    registry: ProgramRegistry,
    builder: Arc<dyn Builder>,
    orchestrator: Arc<Orchestrator>,
    queue: Arc<DeliveryQueue>,
    bindings: Arc<SessionBindings>,
}

impl Hub {
    /// Builds the hub and repopulates the program registry from disk.
    pub async fn new(
        config: HubConfig,
        key: String,
        runtime: Arc<dyn ContainerRuntime>,
        builder: Arc<dyn Builder>,
    ) -> HubResult<Self> {
        config.validate()?;
        let tree = ScopeTree::new();
        let root = tree.root();
        let registry = ProgramRegistry::load(config.storage.program_dir.clone(), root.clone()).await?;
        let queue = Arc::new(DeliveryQueue::new());
        let bindings = Arc::new(SessionBindings::new());
        let orchestrator = Arc::new(Orchestrator::new(
            runtime,
            Arc::clone(&queue),
            Arc::clone(&bindings),
            config.runtime.clone(),
            config.binding.advertise_addr.clone(),
        ));
        Ok(Self {
            config,
            key,
            tree,
            root,
            sessions: Arc::new(SessionTable::new()),
            registry,
            builder,
            orchestrator,
            queue,
            bindings,
        })
    }

    /// Production wiring: key file, local Docker daemon and the toolchain builder.
    pub async fn from_config(config: HubConfig) -> HubResult<Self> {
        let key = ConfigLoader::read_key(&config.control.key_file).await?;
        let docker = DockerRuntime::connect()?;
        if !docker.is_available().await {
            log::warn!("Docker daemon did not answer ping; executions will fail until it does");
        }
        let runtime: Arc<dyn ContainerRuntime> = Arc::new(docker);
        let builder = Arc::new(ToolchainBuilder::new(
            Arc::clone(&runtime),
            config.runtime.clone(),
            config.build.clone(),
        ));
        Self::new(config, key, runtime, builder).await
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn auth_timeout(&self) -> Duration {
        self.config.control.auth_timeout()
    }

    pub fn python_driver(&self) -> Option<&Path> {
        self.config.storage.python_driver.as_deref()
    }

    pub fn program_dir(&self) -> PathBuf {
        self.registry.store().to_path_buf()
    }

    pub fn registry(&self) -> &ProgramRegistry {
        &self.registry
    }

    pub fn builder(&self) -> &dyn Builder {
        self.builder.as_ref()
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn queue(&self) -> &DeliveryQueue {
        &self.queue
    }

    pub fn bindings(&self) -> &SessionBindings {
        &self.bindings
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn root(&self) -> &Scope {
        &self.root
    }

    pub fn live_scopes(&self) -> usize {
        self.tree.live_scopes()
    }

    /// Cancels every listener, connection and execution.
    pub fn shutdown(&self) {
        log::info!("Shutting down");
        self.root.cancel();
    }

    /// Binds both listeners and starts delivering queued frames.
    pub async fn serve(self: Arc<Self>) -> HubResult<HubHandle> {
        let control_addr = parse_addr("control.bind_addr", &self.config.control.bind_addr)?;
        let binding_addr = parse_addr("binding.bind_addr", &self.config.binding.bind_addr)?;

        let mut control = Listener::new("control", control_addr, control_table());
        match &self.config.control.tls {
            Some(tls_config) => {
                control = control.with_tls(tls::load_acceptor(&tls_config.cert, &tls_config.key)?);
            }
            None => log::warn!("control channel runs without TLS"),
        }
        let control = control
            .bind(Arc::clone(&self), Arc::clone(&self.sessions), &self.root)
            .await?;
        let binding = Listener::new("binding", binding_addr, binding_table())
            .bind(Arc::clone(&self), Arc::clone(&self.sessions), &self.root)
            .await?;
        let delivery = self.queue.spawn(self.root.child());

        log::info!(
            "runhub serving {} program(s); control on {}, binding on {}",
            self.registry.len(),
            control.local_addr(),
            binding.local_addr()
        );
        Ok(HubHandle {
            hub: self,
            control,
            binding,
            delivery,
        })
    }
}

/// Running service.
pub struct HubHandle {
    hub: Arc<Hub>,
    control: ListenerHandle,
    binding: ListenerHandle,
    delivery: JoinHandle<()>,
}

impl HubHandle {
    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    pub fn control_addr(&self) -> std::net::SocketAddr {
        self.control.local_addr()
    }

    pub fn binding_addr(&self) -> std::net::SocketAddr {
        self.binding.local_addr()
    }

    /// Resolves once the root scope has been cancelled.
    pub async fn stopped(&self) {
        self.hub.root.cancelled().await;
    }

    /// Cancels the root scope and waits for listeners, teardowns and delivery to end.
    pub async fn shutdown(self) {
        self.hub.shutdown();
        self.control.join().await;
        self.binding.join().await;
        self.hub.orchestrator.wait_idle().await;
        if let Err(e) = self.delivery.await {
            log::error!("Delivery task failed: {}", e);
        }
        log::info!("Shutdown complete");
    }
}
