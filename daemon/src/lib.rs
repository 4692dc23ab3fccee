pub mod executor;
pub mod pool;
pub mod probe;
pub mod rsync;
pub mod scanner;

pub use executor::{DryRunExecutor, ExecError, ExecHandle, ExitReport, Invocation, Reporter, TransferExecutor};
pub use pool::{PoolHandle, PoolMetrics, PoolStatus, SyncError, SyncReport};
pub use probe::{probe, ProbeError, ProbeSample, ProbeWatcher};
pub use rsync::RsyncExecutor;
pub use scanner::{scan, ScanError, ScanResult};
