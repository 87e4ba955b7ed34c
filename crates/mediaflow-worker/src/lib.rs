//! Media job worker.
//!
//! This crate provides:
//! - The staged pipeline executor (download, probe, encode, upload)
//! - A progress monitor sampling live encode progress
//! - Completion notifications
//! - The queue handler and worker configuration

pub mod config;
pub mod error;
pub mod handler;
pub mod logging;
pub mod metrics;
pub mod monitor;
pub mod notify;
pub mod pipeline;
pub mod stage;

pub use config::{WorkLayout, WorkerConfig};
pub use error::{WorkerError, WorkerResult};
pub use handler::{action_for_role, JobHandler};
pub use logging::JobLogger;
pub use monitor::{MonitorTarget, ProgressMonitor};
pub use notify::{encode_success_message, Notifier, SlackNotifier};
pub use pipeline::{PipelineExecutor, LOCAL_DESTINATION};
pub use stage::Stage;
