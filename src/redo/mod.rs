//! Redo pipeline
//!
//! - **LogBuffer**: circular in-memory tail of the log, concurrent reservations
//! - **MiniTransaction**: records plus dirtied pages, committed atomically
//! - **CommitCoordinator**: reserve, copy, close, wait, register, release
//! - **FlushList**: dirty pages in LSN order for the page cleaner and checkpoint
//! - **DurabilityWaiter**: bounded backpressure on the not-yet-durable log
//! - **LogWriter**: background thread grouping closed log into writes and fsyncs
//! - **Checkpointer** / **RedoScanner**: checkpoint markers and startup scan
//! - **RedoManager**: all of the above for one data directory

pub mod checkpoint;
pub mod config;
pub mod coordinator;
pub mod flush_list;
pub mod log_buffer;
pub mod manager;
pub mod mtr;
pub mod page;
pub mod record;
pub mod recovery;
pub mod waiter;
pub mod writer;

pub use checkpoint::{CheckpointInfo, Checkpointer};
pub use config::RedoConfig;
pub use coordinator::{CommitCoordinator, CommitStatsSnapshot};
pub use flush_list::{DirtyPageEntry, FlushList};
pub use log_buffer::{LogBuffer, Reservation};
pub use manager::RedoManager;
pub use mtr::{MiniTransaction, MtrMode, MtrState};
pub use page::{LatchTable, PageLatch, PageLsn, PageLsnTable, PageStore, PageXLatch};
pub use record::{LogRecord, RedoBlock};
pub use recovery::{RecoveredLog, RedoScanner};
pub use waiter::{DurabilityWaiter, DurableState, WaitOutcome};
pub use writer::{LogWriter, RedoFile, RedoSink, WriterMessage};
