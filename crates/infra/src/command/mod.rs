//! Transactional command execution.
//!
//! Every read and write the engine performs happens inside a command: caller
//! logic that receives a [`CommandContext`] (the unit of work) and runs through
//! an ordered chain of interceptors. Nested commands join the active context
//! unless they ask for a new one.

pub mod context;
pub mod engine;
pub mod executor;
pub mod interceptor;
pub mod session;

pub use context::{CloseListener, CommandContext, TransactionCloseListener};
pub use engine::{
    AllowAll, CommandAuthorizer, EngineConfiguration, EngineConfigurationBuilder, EntityOrder,
};
pub use executor::{Command, CommandConfig, CommandExecutor, FnCommand};
pub use interceptor::{
    AuthorizationInterceptor, CommandInterceptor, CommandInvocation, ContextInterceptor,
    LoggingInterceptor, Next, TransactionInterceptor,
};
pub use session::{
    CachedEntityMatcher, EntityManager, EntitySession, EntitySessionFactory, QueryMatcher,
    Session, SessionFactory, Shared,
};
