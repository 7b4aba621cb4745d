//! Command executor: runs caller logic through the interceptor chain.
//!
//! ```text
//! execute(config, command)
//!   ↓
//! 1. LoggingInterceptor        span + outcome
//!   ↓
//! 2. TransactionInterceptor    begin store transaction (unless joining)
//!   ↓
//! 3. ContextInterceptor        create/join CommandContext, close it afterwards
//!   ↓
//! 4. AuthorizationInterceptor  ask the configured CommandAuthorizer
//!   ↓
//! 5. command.execute(ctx)
//! ```

use std::sync::Arc;

use conveyor_core::{EngineError, EngineResult};

use super::context::CommandContext;
use super::engine::EngineConfiguration;
use super::interceptor::{
    AuthorizationInterceptor, CommandInterceptor, CommandInvocation, ContextInterceptor,
    LoggingInterceptor, Next, TransactionInterceptor,
};

/// A unit of caller logic run inside a [`CommandContext`].
pub trait Command {
    type Output;

    fn name(&self) -> &str {
        short_type_name(std::any::type_name::<Self>())
    }

    fn execute(self, ctx: &mut CommandContext) -> EngineResult<Self::Output>;
}

/// Command backed by a closure.
pub struct FnCommand<F> {
    name: String,
    f: F,
}

impl<F, T> FnCommand<F>
where
    F: FnOnce(&mut CommandContext) -> EngineResult<T>,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F, T> Command for FnCommand<F>
where
    F: FnOnce(&mut CommandContext) -> EngineResult<T>,
{
    type Output = T;

    fn name(&self) -> &str {
        &self.name
    }

    fn execute(self, ctx: &mut CommandContext) -> EngineResult<T> {
        (self.f)(ctx)
    }
}

/// Per-invocation settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandConfig {
    /// Run in a fresh context with its own transaction even when nested.
    pub requires_new: bool,
    /// Who is executing, for authorization and diagnostics.
    pub actor: Option<String>,
}

impl CommandConfig {
    pub fn requiring_new() -> Self {
        Self {
            requires_new: true,
            actor: None,
        }
    }

    pub fn with_requires_new(mut self, requires_new: bool) -> Self {
        self.requires_new = requires_new;
        self
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }
}

struct ExecutorInner {
    engine: Arc<EngineConfiguration>,
    interceptors: Vec<Arc<dyn CommandInterceptor>>,
}

/// Entry point for running commands. Cheap to clone and shareable across threads.
#[derive(Clone)]
pub struct CommandExecutor {
    inner: Arc<ExecutorInner>,
}

impl std::fmt::Debug for CommandExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<_> = self.inner.interceptors.iter().map(|i| i.name()).collect();
        f.debug_struct("CommandExecutor")
            .field("interceptors", &names)
            .finish_non_exhaustive()
    }
}

impl CommandExecutor {
    /// Executor with the default interceptor chain.
    pub fn new(engine: Arc<EngineConfiguration>) -> Self {
        Self::with_interceptors(engine, Self::default_interceptors())
    }

    /// Executor with a custom chain. The chain should contain a
    /// [`ContextInterceptor`] or commands run without a context.
    pub fn with_interceptors(
        engine: Arc<EngineConfiguration>,
        interceptors: Vec<Arc<dyn CommandInterceptor>>,
    ) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                engine,
                interceptors,
            }),
        }
    }

    pub fn default_interceptors() -> Vec<Arc<dyn CommandInterceptor>> {
        vec![
            Arc::new(LoggingInterceptor),
            Arc::new(TransactionInterceptor),
            Arc::new(ContextInterceptor),
            Arc::new(AuthorizationInterceptor),
        ]
    }

    pub fn engine(&self) -> &Arc<EngineConfiguration> {
        &self.inner.engine
    }

    pub fn execute<C: Command>(&self, config: CommandConfig, command: C) -> EngineResult<C::Output> {
        self.run(None, config, command)
    }

    pub fn execute_fn<T>(
        &self,
        config: CommandConfig,
        name: &str,
        f: impl FnOnce(&mut CommandContext) -> EngineResult<T>,
    ) -> EngineResult<T> {
        self.execute(config, FnCommand::new(name, f))
    }

    pub(crate) fn run<C: Command>(
        &self,
        parent: Option<&mut CommandContext>,
        config: CommandConfig,
        command: C,
    ) -> EngineResult<C::Output> {
        let name = command.name().to_string();
        let mut command = Some(command);
        let mut output = None;
        let mut body = |ctx: &mut CommandContext| -> EngineResult<()> {
            let command = command
                .take()
                .ok_or_else(|| EngineError::illegal_state("command body invoked twice"))?;
            output = Some(command.execute(ctx)?);
            Ok(())
        };

        let mut invocation = CommandInvocation::new(&name, &config, self, parent, &mut body);
        Next::new(&self.inner.interceptors).run(&mut invocation)?;
        drop(invocation);

        output.ok_or_else(|| {
            EngineError::illegal_state(format!("command '{name}' completed without running"))
        })
    }
}

fn short_type_name(full: &str) -> &str {
    let base = full.split('<').next().unwrap_or(full);
    match base.rfind("::") {
        Some(idx) => &full[idx + 2..],
        None => full,
    }
}
