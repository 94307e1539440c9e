//! Concurrency-bounded executor for LLM sessions.
//!
//! Each butler owns one [`Spawner`] holding a semaphore of
//! `max_concurrent_sessions` permits. A trigger acquires a permit, writes a
//! session row, invokes the configured [`RuntimeAdapter`], and records the
//! terminal status -- tokens, tool calls, duration, success or error. Drain
//! flips the spawner into a rejecting state, waits for in-flight sessions up
//! to a deadline, then cancels the stragglers cooperatively and marks their
//! sessions `error = "drained"`.
//!
//! Adapters are registered in a name → constructor map
//! ([`create_adapter`]); the Gemini CLI adapter is the production one, the
//! mock adapters exist for tests and development.

mod adapter;
mod error;
mod gemini;
mod mock;
mod session;
mod spawner;

pub use adapter::{
    EnvPolicy, InvocationOutput, InvocationRequest, McpServerConfig, RuntimeAdapter, TokenUsage,
    ToolCall, create_adapter, registered_adapters,
};
pub use error::{RuntimeError, SpawnerError};
pub use gemini::GeminiAdapter;
pub use mock::{FailingAdapter, MockAdapter};
pub use session::{
    MemorySessionStore, NewSession, PostgresSessionStore, SessionCompletion, SessionRow,
    SessionStore,
};
pub use spawner::{DrainOutcome, Spawner, SpawnerConfig, SpawnerResult, TriggerOptions};
