pub mod adaptive;
pub mod batch;
pub mod classify;
pub mod metrics;
pub mod retry;
pub mod settings;
pub mod task;

pub use adaptive::{AdaptiveController, AdaptiveParams, Baseline, NetworkSnapshot, NetworkStats, Observation};
pub use batch::{plan, Batch, FileEntry, Unit};
pub use classify::{classify, Category};
pub use metrics::{MetricsStore, TransferMetrics, TransferRecord};
pub use retry::{ErrorClass, RetryDecision, RetryPolicy};
pub use settings::{PathFilter, Settings, SettingsError, SharedSettings};
pub use task::{
	Direction, SubmitError, Subject, TaskId, TaskKind, TaskOutcome, TaskRequest, TaskSnapshot, TaskStatus,
};
