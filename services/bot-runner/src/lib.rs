//! Bot runner
//!
//! Schedules subscription runs, turns market data into signals (LLM first,
//! technical engines as fallback), applies risk limits and places orders
//! through the exchange gateway.

pub mod config;
pub mod credentials;
pub mod indicators;
pub mod intent;
pub mod llm;
pub mod lock;
pub mod notifier;
pub mod reconciler;
pub mod risk;
pub mod scheduler;
pub mod signal;
pub mod store;
pub mod technical;
pub mod testing;
pub mod workflow;

pub use config::{RunnerSettings, SchedulerConfig};
pub use intent::{IntentRegistry, IntentState};
pub use lock::{LockManager, MemoryLockManager, RedisLockManager};
pub use notifier::{Notification, Notifier};
pub use scheduler::{Scheduler, TickReport};
pub use signal::{SignalGenerator, TradeSignal};
pub use store::{MemoryRunStore, PgRunStore, RunStore};
pub use workflow::{ExchangeFactory, LiveExchangeFactory, Workflow, WorkflowReport};
