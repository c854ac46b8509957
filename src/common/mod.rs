//! Common utilities and types shared across regionmaster

pub mod config;
pub mod error;
pub mod log;
pub mod metrics;
pub mod utils;

pub use config::{
    AssignmentConfig, Config, DispatcherConfig, ExecutorConfig, StoreConfig, WalSyncPolicy,
};
pub use error::{Error, ProcedureError, ProcedureErrorKind, Result};
pub use log::{LogRecord, RecordLog};
pub use metrics::{
    AssignmentMetrics, Counter, DispatchMetrics, Gauge, Histogram, ProcedureMetrics,
};
pub use utils::{crc32, parse_duration, timestamp_now_millis, NodeState};
