use crate::bus::WorkBus;
use crate::config::Settings;
use crate::connection::DataConnection;
use crate::manager::{FragmentContext, FragmentManager};
use crate::memory::{Budget, Buffer, BufferAllocator};
use crate::reporter::{spawn_status_reporter, FragmentProgress};
use floe_api::{FragmentHandle, FragmentStatus, NodeEndpoint};
use floe_common::Result;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

/// One worker process: the root memory budget plus the bus every local
/// fragment and inbound connection meets on.
#[derive(Debug)]
pub struct Worker {
    id: Uuid,
    settings: Settings,
    endpoint: NodeEndpoint,
    root: Budget,
    bus: Arc<WorkBus>,
}

impl Worker {
    pub fn new(settings: Settings) -> Self {
        let id = Uuid::new_v4();
        let port = u32::from(settings.worker_port);
        let endpoint = NodeEndpoint::new(settings.worker_host.clone(), port, port);
        let root = Budget::root(format!("worker-{id}"), settings.memory.root_limit_bytes);
        info!(
            worker = %id,
            endpoint = %endpoint,
            root_limit_bytes = settings.memory.root_limit_bytes,
            "worker initialised"
        );
        Self {
            id,
            settings,
            endpoint,
            root,
            bus: Arc::new(WorkBus::new()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn endpoint(&self) -> &NodeEndpoint {
        &self.endpoint
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn root_budget(&self) -> &Budget {
        &self.root
    }

    pub fn bus(&self) -> &Arc<WorkBus> {
        &self.bus
    }

    /// Mints the fragment's budget, builds its manager and registers it.
    /// Connections already parked for `handle` are attached on the way.
    pub fn start_fragment(
        &self,
        handle: FragmentHandle,
    ) -> Result<(Arc<FragmentManager>, mpsc::UnboundedReceiver<Buffer>)> {
        let memory = &self.settings.memory;
        let budget = self.root.child(
            &handle,
            memory.fragment_initial_reservation_bytes,
            memory.fragment_max_reservation_bytes,
        )?;
        let context = FragmentContext::new(handle.clone(), self.endpoint.clone(), budget);
        let (manager, inbound) = FragmentManager::new(context);
        let attached = self.bus.register(Arc::clone(&manager))?;
        info!(handle = %handle, attached, "started fragment");
        Ok((manager, inbound))
    }

    pub fn accept_connection(
        &self,
        remote: NodeEndpoint,
        destination: FragmentHandle,
    ) -> Result<(Arc<DataConnection>, oneshot::Receiver<()>)> {
        self.bus.accept(remote, destination)
    }

    /// Reports `manager`'s progress every `status_interval_ms` until it
    /// reaches a terminal state.
    pub fn spawn_reporter(
        &self,
        manager: Arc<FragmentManager>,
        progress: watch::Receiver<FragmentProgress>,
        sink: mpsc::Sender<FragmentStatus>,
    ) -> JoinHandle<()> {
        spawn_status_reporter(manager, progress, self.settings.status_interval(), sink)
    }

    /// Terminates the fragment and closes its connections.
    pub fn finish_fragment(&self, handle: &FragmentHandle) -> Result<usize> {
        self.bus.retire(handle)
    }
}
