pub mod compression;
pub mod dump;
pub mod executor;
pub mod inspect;
pub mod scheduler;

pub use dump::{DumpCommand, DumpCommandBuilder, VendorDumpCommands};
pub use executor::{BackupExecutor, BackupOutcome, BackupResult, ExecuteAllSummary};
pub use inspect::ConnectionInspector;
pub use scheduler::{InFlightGuard, ScheduledJob, Scheduler, SchedulerStats};
