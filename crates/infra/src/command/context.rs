//! The unit of work of one command tree.

use std::any::TypeId;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use conveyor_core::{Clock, EngineError, EngineResult};

use crate::store::StoreTransaction;

use super::engine::EngineConfiguration;
use super::executor::{Command, CommandConfig, CommandExecutor};
use super::session::{EntityManager, EntitySession, Session};

/// Observer of a context's close sequence.
///
/// Phases run in order `closing`, (sessions flush), `after_sessions_flushed`,
/// `closed`. If the command body, a flush or an earlier phase fails,
/// `close_failure` runs instead of the remaining phases. Listeners are
/// notified in registration order.
pub trait CloseListener {
    fn closing(&mut self, _ctx: &mut CommandContext) -> EngineResult<()> {
        Ok(())
    }

    fn after_sessions_flushed(&mut self, _ctx: &mut CommandContext) -> EngineResult<()> {
        Ok(())
    }

    fn closed(&mut self, _ctx: &mut CommandContext) {}

    fn close_failure(&mut self, _ctx: &mut CommandContext, _error: &EngineError) {}
}

/// Commits the context's transaction once sessions are flushed, rolls back on failure.
#[derive(Debug, Default)]
pub struct TransactionCloseListener;

impl CloseListener for TransactionCloseListener {
    fn after_sessions_flushed(&mut self, ctx: &mut CommandContext) -> EngineResult<()> {
        ctx.commit_transaction()
    }

    fn close_failure(&mut self, ctx: &mut CommandContext, _error: &EngineError) {
        if let Err(err) = ctx.rollback_transaction() {
            warn!(error = %err, "rollback failed");
        }
    }
}

struct OpenSession {
    type_id: TypeId,
    /// Position of the session's factory; sessions flush in this order.
    rank: usize,
    session: Box<dyn Session>,
}

/// Root unit-of-work object for one (possibly nested) command invocation.
///
/// Owns the store transaction, the open sessions (one per session type) and
/// the close listeners. Nested commands that join this context see the same
/// sessions, so they observe earlier in-memory changes without re-querying.
pub struct CommandContext {
    engine: Arc<EngineConfiguration>,
    executor: CommandExecutor,
    transaction: Option<Box<dyn StoreTransaction>>,
    sessions: Vec<OpenSession>,
    close_listeners: Vec<Box<dyn CloseListener>>,
}

impl CommandContext {
    pub(crate) fn new(
        executor: CommandExecutor,
        transaction: Option<Box<dyn StoreTransaction>>,
        close_listeners: Vec<Box<dyn CloseListener>>,
    ) -> Self {
        Self {
            engine: Arc::clone(executor.engine()),
            executor,
            transaction,
            sessions: Vec::new(),
            close_listeners,
        }
    }

    pub fn engine(&self) -> &Arc<EngineConfiguration> {
        &self.engine
    }

    pub fn clock(&self) -> &dyn Clock {
        self.engine.clock()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.engine.clock().now()
    }

    pub fn executor(&self) -> &CommandExecutor {
        &self.executor
    }

    /// Run a nested command. It joins this context unless `config.requires_new`.
    pub fn execute<C: Command>(
        &mut self,
        config: CommandConfig,
        command: C,
    ) -> EngineResult<C::Output> {
        let executor = self.executor.clone();
        executor.run(Some(self), config, command)
    }

    pub fn add_close_listener(&mut self, listener: Box<dyn CloseListener>) {
        self.close_listeners.push(listener);
    }

    pub fn has_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    /// Direct access to the store transaction, bypassing session caching.
    pub fn transaction(&mut self) -> EngineResult<&mut dyn StoreTransaction> {
        match self.transaction.as_mut() {
            Some(tx) => Ok(tx.as_mut()),
            None => Err(EngineError::illegal_state(
                "command context has no active transaction",
            )),
        }
    }

    pub fn commit_transaction(&mut self) -> EngineResult<()> {
        match self.transaction.take() {
            Some(tx) => tx.commit().map_err(Into::into),
            None => Ok(()),
        }
    }

    pub fn rollback_transaction(&mut self) -> EngineResult<()> {
        match self.transaction.take() {
            Some(tx) => tx.rollback().map_err(Into::into),
            None => Ok(()),
        }
    }

    /// The session of type `S`, opened on first use.
    pub fn session<S: Session>(&mut self) -> EngineResult<&mut S> {
        let idx = self.session_index(TypeId::of::<S>())?;
        self.sessions[idx]
            .session
            .as_any_mut()
            .downcast_mut::<S>()
            .ok_or_else(|| EngineError::illegal_state("session type mismatch"))
    }

    /// Entity operations against this context's entity session and transaction.
    pub fn entities(&mut self) -> EngineResult<EntityManager<'_>> {
        let idx = self.session_index(TypeId::of::<EntitySession>())?;
        let session = self.sessions[idx]
            .session
            .as_any_mut()
            .downcast_mut::<EntitySession>()
            .ok_or_else(|| EngineError::illegal_state("session type mismatch"))?;
        let tx = match self.transaction.as_mut() {
            Some(tx) => tx.as_mut(),
            None => {
                return Err(EngineError::illegal_state(
                    "command context has no active transaction",
                ));
            }
        };
        Ok(EntityManager::new(session, tx))
    }

    fn session_index(&mut self, type_id: TypeId) -> EngineResult<usize> {
        if let Some(idx) = self.sessions.iter().position(|s| s.type_id == type_id) {
            return Ok(idx);
        }
        let (rank, factory) = self
            .engine
            .session_factories()
            .iter()
            .enumerate()
            .find(|(_, f)| f.session_type() == type_id)
            .ok_or_else(|| EngineError::illegal_state("no session factory for requested type"))?;
        let session = factory.open_session();
        self.sessions.push(OpenSession {
            type_id,
            rank,
            session,
        });
        Ok(self.sessions.len() - 1)
    }

    /// Close the context exactly once with the outcome of the command body.
    ///
    /// On success the sessions are flushed and the listeners run through
    /// their commit phases. On any failure `close_failure` runs and the first
    /// error is returned unchanged.
    pub(crate) fn close(mut self, outcome: EngineResult<()>) -> EngineResult<()> {
        let result = outcome.and_then(|()| self.flush_and_commit());
        let result = match result {
            Ok(()) => {
                // closed listeners cannot fail the command any more
                let _ = self.each_listener(|l, ctx| {
                    l.closed(ctx);
                    Ok(())
                });
                Ok(())
            }
            Err(err) => {
                debug!(error = %err, "closing command context after failure");
                let failure = err.clone();
                let _ = self.each_listener(|l, ctx| {
                    l.close_failure(ctx, &failure);
                    Ok(())
                });
                Err(err)
            }
        };
        for open in &mut self.sessions {
            open.session.close();
        }
        // anything still open here was never committed
        if let Some(tx) = self.transaction.take() {
            if let Err(err) = tx.rollback() {
                warn!(error = %err, "rollback of unclosed transaction failed");
            }
        }
        result
    }

    fn flush_and_commit(&mut self) -> EngineResult<()> {
        self.each_listener(|l, ctx| l.closing(ctx))?;
        self.flush_sessions()?;
        self.each_listener(|l, ctx| l.after_sessions_flushed(ctx))
    }

    pub(crate) fn flush_sessions(&mut self) -> EngineResult<()> {
        if self.sessions.is_empty() {
            return Ok(());
        }
        let mut order: Vec<usize> = (0..self.sessions.len()).collect();
        order.sort_by_key(|&i| self.sessions[i].rank);
        for i in order {
            let Some(tx) = self.transaction.as_mut() else {
                return Err(EngineError::illegal_state(
                    "cannot flush sessions without a transaction",
                ));
            };
            self.sessions[i].session.flush(tx.as_mut(), &self.engine)?;
        }
        Ok(())
    }

    fn each_listener(
        &mut self,
        mut f: impl FnMut(&mut dyn CloseListener, &mut CommandContext) -> EngineResult<()>,
    ) -> EngineResult<()> {
        let mut listeners = std::mem::take(&mut self.close_listeners);
        let mut result = Ok(());
        for listener in listeners.iter_mut() {
            if let Err(err) = f(listener.as_mut(), self) {
                result = Err(err);
                break;
            }
        }
        // listeners registered during this phase keep their place after existing ones
        listeners.append(&mut self.close_listeners);
        self.close_listeners = listeners;
        result
    }
}
