//! Cross-cutting concerns wrapped around every command body.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info_span, warn};

use conveyor_core::{EngineError, EngineResult};

use crate::store::StoreTransaction;

use super::context::{CloseListener, CommandContext, TransactionCloseListener};
use super::engine::EngineConfiguration;
use super::executor::{CommandConfig, CommandExecutor};

/// State threaded through the interceptor chain for one invocation.
pub struct CommandInvocation<'a> {
    name: &'a str,
    config: &'a CommandConfig,
    executor: &'a CommandExecutor,
    parent: Option<&'a mut CommandContext>,
    transaction: Option<Box<dyn StoreTransaction>>,
    close_listeners: Vec<Box<dyn CloseListener>>,
    context: Option<CommandContext>,
    body: &'a mut dyn FnMut(&mut CommandContext) -> EngineResult<()>,
}

impl<'a> CommandInvocation<'a> {
    pub(crate) fn new(
        name: &'a str,
        config: &'a CommandConfig,
        executor: &'a CommandExecutor,
        parent: Option<&'a mut CommandContext>,
        body: &'a mut dyn FnMut(&mut CommandContext) -> EngineResult<()>,
    ) -> Self {
        Self {
            name,
            config,
            executor,
            parent,
            transaction: None,
            close_listeners: Vec::new(),
            context: None,
            body,
        }
    }

    pub fn name(&self) -> &str {
        self.name
    }

    pub fn config(&self) -> &CommandConfig {
        self.config
    }

    pub fn engine(&self) -> &Arc<EngineConfiguration> {
        self.executor.engine()
    }

    pub fn is_nested(&self) -> bool {
        self.parent.is_some()
    }

    /// Whether this invocation runs inside its parent's unit of work.
    pub fn joins_parent(&self) -> bool {
        self.parent.is_some() && !self.config.requires_new
    }

    /// Register a listener for the context this invocation is about to create.
    pub fn add_close_listener(&mut self, listener: Box<dyn CloseListener>) {
        self.close_listeners.push(listener);
    }
}

/// One link of the chain. Implementations call `next.run(invocation)` to continue.
pub trait CommandInterceptor: Send + Sync {
    fn name(&self) -> &'static str;

    fn intercept(&self, invocation: &mut CommandInvocation<'_>, next: Next<'_>) -> EngineResult<()>;
}

/// The remainder of the chain.
pub struct Next<'c> {
    rest: &'c [Arc<dyn CommandInterceptor>],
}

impl<'c> Next<'c> {
    pub(crate) fn new(chain: &'c [Arc<dyn CommandInterceptor>]) -> Self {
        Self { rest: chain }
    }

    pub fn run(self, invocation: &mut CommandInvocation<'_>) -> EngineResult<()> {
        match self.rest.split_first() {
            Some((first, rest)) => first.intercept(invocation, Next { rest }),
            None => {
                let ctx = match (invocation.context.as_mut(), invocation.parent.as_deref_mut()) {
                    (Some(ctx), _) => ctx,
                    (None, Some(parent)) => parent,
                    (None, None) => {
                        return Err(EngineError::illegal_state(format!(
                            "command '{}' reached its body without a context",
                            invocation.name
                        )));
                    }
                };
                (invocation.body)(ctx)
            }
        }
    }
}

/// Opens a `command` span and logs the outcome.
#[derive(Debug, Default)]
pub struct LoggingInterceptor;

impl CommandInterceptor for LoggingInterceptor {
    fn name(&self) -> &'static str {
        "logging"
    }

    fn intercept(&self, invocation: &mut CommandInvocation<'_>, next: Next<'_>) -> EngineResult<()> {
        let span = info_span!(
            "command",
            name = %invocation.name,
            nested = invocation.is_nested(),
            requires_new = invocation.config.requires_new,
        );
        let _entered = span.enter();
        let started = Instant::now();

        let result = next.run(invocation);
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(()) => debug!(elapsed_ms, "command completed"),
            Err(err) if err.is_conflict() => debug!(elapsed_ms, error = %err, "command conflicted"),
            Err(err) => warn!(elapsed_ms, error = %err, "command failed"),
        }
        result
    }
}

/// Begins a store transaction for every invocation that does not join its parent.
#[derive(Debug, Default)]
pub struct TransactionInterceptor;

impl CommandInterceptor for TransactionInterceptor {
    fn name(&self) -> &'static str {
        "transaction"
    }

    fn intercept(&self, invocation: &mut CommandInvocation<'_>, next: Next<'_>) -> EngineResult<()> {
        if invocation.joins_parent() {
            return next.run(invocation);
        }
        let tx = invocation.engine().store().begin()?;
        invocation.transaction = Some(tx);
        invocation.add_close_listener(Box::new(TransactionCloseListener));
        next.run(invocation)
    }
}

/// Creates the command context (or reuses the parent's) and closes it exactly once.
#[derive(Debug, Default)]
pub struct ContextInterceptor;

impl CommandInterceptor for ContextInterceptor {
    fn name(&self) -> &'static str {
        "context"
    }

    fn intercept(&self, invocation: &mut CommandInvocation<'_>, next: Next<'_>) -> EngineResult<()> {
        if invocation.joins_parent() {
            return next.run(invocation);
        }

        let transaction = invocation.transaction.take();
        let listeners = std::mem::take(&mut invocation.close_listeners);
        invocation.context = Some(CommandContext::new(
            invocation.executor.clone(),
            transaction,
            listeners,
        ));

        let outcome = next.run(invocation);
        match invocation.context.take() {
            Some(ctx) => ctx.close(outcome),
            None => outcome.and(Err(EngineError::illegal_state(
                "command context disappeared before close",
            ))),
        }
    }
}

/// Rejects commands the configured authorizer does not allow.
#[derive(Debug, Default)]
pub struct AuthorizationInterceptor;

impl CommandInterceptor for AuthorizationInterceptor {
    fn name(&self) -> &'static str {
        "authorization"
    }

    fn intercept(&self, invocation: &mut CommandInvocation<'_>, next: Next<'_>) -> EngineResult<()> {
        invocation
            .engine()
            .authorizer()
            .authorize(invocation.name, invocation.config)?;
        next.run(invocation)
    }
}
