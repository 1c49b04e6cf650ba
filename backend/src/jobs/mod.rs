// Background Jobs
//
// Scheduled background work for the Laneflow platform. Jobs are scheduled
// with tokio-cron-scheduler and run automatically at configured intervals.

pub mod dwell_checker;
pub mod maintenance;
pub mod scheduler;

pub use dwell_checker::{DwellCheckResult, DwellCheckerJob};
pub use maintenance::MaintenanceJobs;
pub use scheduler::{JobConfig, JobError, JobResult, JobScheduler};
