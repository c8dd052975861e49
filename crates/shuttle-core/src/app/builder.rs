//! NodeBuilder - wiring of one coordinating instance.
//!
//! Fail-fast: `build()` validates the configuration and refuses to produce
//! a node with a missing store, so misconfiguration surfaces at startup
//! instead of on the first claim.

use std::sync::Arc;

use tokio::sync::watch;

use crate::app::allocator::WorkspaceAllocator;
use crate::app::lease_manager::LeaseManager;
use crate::app::loops::BackgroundLoops;
use crate::app::presence::PresenceRegistry;
use crate::app::sweeper::StaleSweeper;
use crate::app::worker::Worker;
use crate::config::{ConfigError, CoordinationConfig};
use crate::domain::{InstanceId, OwnerId, StoreError};
use crate::impls::{
    JsonFilePresenceStore, JsonFileSlotStore, JsonFileStateStore, TracingEventSink,
};
use crate::ports::{
    Clock, EventSink, IdGenerator, PresenceStore, SlotStore, StateStore, SystemClock,
    UlidGenerator,
};

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("no {0} configured")]
    MissingStore(&'static str),

    #[error("open {store} store: {source}")]
    Open {
        store: &'static str,
        #[source]
        source: StoreError,
    },
}

/// # Example
/// ```ignore
/// let node = NodeBuilder::new(config)
///     .file_backed()
///     .await?
///     .build()?;
/// let background = node.spawn_background();
/// ```
pub struct NodeBuilder {
    config: CoordinationConfig,
    state_store: Option<Arc<dyn StateStore>>,
    presence_store: Option<Arc<dyn PresenceStore>>,
    slot_store: Option<Arc<dyn SlotStore>>,
    clock: Arc<dyn Clock>,
    ids: Option<Arc<dyn IdGenerator>>,
    events: Arc<dyn EventSink>,
}

impl NodeBuilder {
    pub fn new(config: CoordinationConfig) -> Self {
        Self {
            config,
            state_store: None,
            presence_store: None,
            slot_store: None,
            clock: Arc::new(SystemClock),
            ids: None,
            events: Arc::new(TracingEventSink),
        }
    }

    /// JSON-file stores under `config.data_dir`.
    pub async fn file_backed(self) -> Result<Self, BuildError> {
        let root = self.config.data_dir.clone();
        let open = |store: &'static str| move |source| BuildError::Open { store, source };

        let state = JsonFileStateStore::open(&root).await.map_err(open("lease"))?;
        let presence = JsonFilePresenceStore::open(&root)
            .await
            .map_err(open("presence"))?;
        let slots = JsonFileSlotStore::open(&root).await.map_err(open("slot"))?;

        Ok(self
            .with_state_store(Arc::new(state))
            .with_presence_store(Arc::new(presence))
            .with_slot_store(Arc::new(slots)))
    }

    pub fn with_state_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.state_store = Some(store);
        self
    }

    pub fn with_presence_store(mut self, store: Arc<dyn PresenceStore>) -> Self {
        self.presence_store = Some(store);
        self
    }

    pub fn with_slot_store(mut self, store: Arc<dyn SlotStore>) -> Self {
        self.slot_store = Some(store);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn build(self) -> Result<Node, BuildError> {
        self.config.validate()?;

        let state_store = self.state_store.ok_or(BuildError::MissingStore("lease"))?;
        let presence_store = self
            .presence_store
            .ok_or(BuildError::MissingStore("presence"))?;
        let slot_store = self.slot_store.ok_or(BuildError::MissingStore("slot"))?;
        let ids: Arc<dyn IdGenerator> = match self.ids {
            Some(ids) => ids,
            None => Arc::new(UlidGenerator::new(Arc::clone(&self.clock))),
        };
        let config = self.config;

        let leases = Arc::new(LeaseManager::new(
            state_store,
            Arc::clone(&self.clock),
            Arc::clone(&ids),
            self.events,
            config.lease_settings(),
        ));
        let sweeper = Arc::new(StaleSweeper::new(Arc::clone(&leases), ids));
        let presence = Arc::new(PresenceRegistry::new(
            presence_store,
            Arc::clone(&self.clock),
            config.instance(),
            config.role,
            config.presence_ttl(),
            config.backoff(),
        ));
        let allocator = Arc::new(WorkspaceAllocator::new(
            slot_store,
            self.clock,
            config.pool.size,
            config.slot_lease_ttl(),
        ));

        Ok(Node {
            config,
            leases,
            sweeper,
            presence,
            allocator,
        })
    }
}

/// One wired instance: the components plus the config they were built from.
pub struct Node {
    config: CoordinationConfig,
    leases: Arc<LeaseManager>,
    sweeper: Arc<StaleSweeper>,
    presence: Arc<PresenceRegistry>,
    allocator: Arc<WorkspaceAllocator>,
}

impl Node {
    pub fn config(&self) -> &CoordinationConfig {
        &self.config
    }

    pub fn instance_id(&self) -> &InstanceId {
        self.presence.instance_id()
    }

    pub fn owner(&self, agent: &str) -> OwnerId {
        OwnerId::new(self.instance_id().clone(), agent)
    }

    pub fn leases(&self) -> &Arc<LeaseManager> {
        &self.leases
    }

    pub fn sweeper(&self) -> &Arc<StaleSweeper> {
        &self.sweeper
    }

    pub fn presence(&self) -> &Arc<PresenceRegistry> {
        &self.presence
    }

    pub fn allocator(&self) -> &Arc<WorkspaceAllocator> {
        &self.allocator
    }

    pub fn worker(&self, agent: &str, shutdown: watch::Receiver<bool>) -> Worker {
        Worker::new(
            Arc::clone(&self.leases),
            Arc::clone(&self.allocator),
            self.owner(agent),
            self.config.renew_interval(),
            self.config.poll_interval(),
            shutdown,
        )
    }

    /// Start presence refresh, the coordinator sweep and slot pruning.
    pub fn spawn_background(&self) -> BackgroundLoops {
        let mut loops = BackgroundLoops::new();
        loops.spawn_presence(Arc::clone(&self.presence), self.config.presence_interval());
        loops.spawn_sweeper(
            Arc::clone(&self.presence),
            Arc::clone(&self.sweeper),
            self.config.sweep_interval(),
        );
        loops.spawn_slot_prune(Arc::clone(&self.allocator), self.config.prune_interval());
        loops
    }
}
