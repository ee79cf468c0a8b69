//! redoline - a mini-transaction commit pipeline with grouped redo persistence
//!
//! Application threads change pages inside mini-transactions (MTRs). At
//! commit each MTR gets a disjoint LSN range in a shared log buffer, copies
//! its records there without locking, and registers its dirty pages in a
//! flush list kept in LSN order. A background writer groups everything that
//! is closed into few writes and fsyncs.
//!
//! ```text
//!   app threads          CommitCoordinator                 LogWriter
//!  ┌──────────┐   reserve / copy / close   ┌───────────┐  drain   ┌──────────┐
//!  │   MTR    │ ─────────────────────────▶ │ LogBuffer │ ───────▶ │ redo.log │
//!  └──────────┘                            └───────────┘  fsync   └──────────┘
//!        │        splice in LSN order      ┌───────────┐              │
//!        └───────────────────────────────▶ │ FlushList │   durable LSN│
//!                                          └───────────┘ ◀────────────┘
//! ```

pub mod error;
pub mod redo;
pub mod types;

pub use error::{RedoError, Result, Severity};
pub use redo::{
    CheckpointInfo, CommitCoordinator, FlushList, LogBuffer, LogRecord, MiniTransaction, MtrMode,
    PageStore, RedoConfig, RedoManager,
};
pub use types::{Lsn, LsnRange, PageId};
