//! Engine configuration reachable from every command context.

use std::sync::Arc;

use conveyor_core::{Clock, EngineResult, SystemClock};

use crate::config::JobConfig;
use crate::jobs::handler::JobHandlerRegistry;
use crate::store::BackingStore;

use super::executor::CommandConfig;
use super::session::{EntitySessionFactory, SessionFactory};

/// Decides whether a command may run.
pub trait CommandAuthorizer: Send + Sync {
    fn authorize(&self, command: &str, config: &CommandConfig) -> EngineResult<()>;
}

/// Authorizer that lets every command through.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl CommandAuthorizer for AllowAll {
    fn authorize(&self, _command: &str, _config: &CommandConfig) -> EngineResult<()> {
        Ok(())
    }
}

/// Fixed dependency order of entity tables, parents first.
///
/// Inserts are flushed in this order and deletes in reverse, so that rows are
/// never written before the rows they reference exist (or deleted while still
/// referenced). Tables not listed sort after every listed table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityOrder {
    tables: Vec<String>,
}

impl EntityOrder {
    pub fn new<I, S>(tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tables: tables.into_iter().map(Into::into).collect(),
        }
    }

    pub fn rank(&self, table: &str) -> usize {
        self.tables
            .iter()
            .position(|t| t == table)
            .unwrap_or(self.tables.len())
    }

    pub fn tables(&self) -> &[String] {
        &self.tables
    }
}

/// Everything a command may need to reach: store, clock, sessions, jobs.
pub struct EngineConfiguration {
    store: Arc<dyn BackingStore>,
    clock: Arc<dyn Clock>,
    entity_order: EntityOrder,
    session_factories: Vec<Arc<dyn SessionFactory>>,
    authorizer: Arc<dyn CommandAuthorizer>,
    job_config: JobConfig,
    handlers: Arc<JobHandlerRegistry>,
}

impl std::fmt::Debug for EngineConfiguration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfiguration")
            .field("entity_order", &self.entity_order)
            .field("session_factories", &self.session_factories.len())
            .field("job_config", &self.job_config)
            .field("handlers", &self.handlers.handler_types())
            .finish_non_exhaustive()
    }
}

impl EngineConfiguration {
    pub fn builder(store: Arc<dyn BackingStore>) -> EngineConfigurationBuilder {
        EngineConfigurationBuilder::new(store)
    }

    pub fn store(&self) -> &Arc<dyn BackingStore> {
        &self.store
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn entity_order(&self) -> &EntityOrder {
        &self.entity_order
    }

    pub fn session_factories(&self) -> &[Arc<dyn SessionFactory>] {
        &self.session_factories
    }

    pub fn authorizer(&self) -> &dyn CommandAuthorizer {
        self.authorizer.as_ref()
    }

    pub fn job_config(&self) -> &JobConfig {
        &self.job_config
    }

    pub fn handlers(&self) -> &JobHandlerRegistry {
        &self.handlers
    }
}

/// Builder for [`EngineConfiguration`].
///
/// The entity session factory is always registered first; additional session
/// factories are flushed after it, in registration order.
pub struct EngineConfigurationBuilder {
    store: Arc<dyn BackingStore>,
    clock: Arc<dyn Clock>,
    entity_order: EntityOrder,
    session_factories: Vec<Arc<dyn SessionFactory>>,
    authorizer: Arc<dyn CommandAuthorizer>,
    job_config: JobConfig,
    handlers: JobHandlerRegistry,
}

impl EngineConfigurationBuilder {
    pub fn new(store: Arc<dyn BackingStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            entity_order: crate::jobs::entity_order(),
            session_factories: Vec::new(),
            authorizer: Arc::new(AllowAll),
            job_config: JobConfig::default(),
            handlers: JobHandlerRegistry::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_entity_order(mut self, order: EntityOrder) -> Self {
        self.entity_order = order;
        self
    }

    pub fn with_session_factory(mut self, factory: Arc<dyn SessionFactory>) -> Self {
        self.session_factories.push(factory);
        self
    }

    pub fn with_authorizer(mut self, authorizer: Arc<dyn CommandAuthorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    pub fn with_job_config(mut self, config: JobConfig) -> Self {
        self.job_config = config;
        self
    }

    pub fn with_handlers(mut self, handlers: JobHandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn build(self) -> Arc<EngineConfiguration> {
        let mut session_factories: Vec<Arc<dyn SessionFactory>> =
            vec![Arc::new(EntitySessionFactory)];
        session_factories.extend(self.session_factories);

        Arc::new(EngineConfiguration {
            store: self.store,
            clock: self.clock,
            entity_order: self.entity_order,
            session_factories,
            authorizer: self.authorizer,
            job_config: self.job_config,
            handlers: Arc::new(self.handlers),
        })
    }
}
