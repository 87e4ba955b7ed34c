//! Store backend selection.

use std::str::FromStr;
use std::sync::Arc;

use tracing::{info, warn};

use crate::error::{StoreError, StoreResult};
use crate::firestore_store::FirestoreJobStore;
use crate::memory::MemoryJobStore;
use crate::repository::JobStore;

/// Which `JobStore` implementation a process runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreBackend {
    #[default]
    Firestore,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "firestore" => Ok(Self::Firestore),
            "memory" => Ok(Self::Memory),
            other => Err(StoreError::config_error(format!(
                "unknown JOB_STORE '{}', expected firestore or memory",
                other
            ))),
        }
    }
}

impl StoreBackend {
    /// Read `JOB_STORE`; unset means Firestore.
    pub fn from_env() -> StoreResult<Self> {
        match std::env::var("JOB_STORE") {
            Ok(raw) if !raw.trim().is_empty() => raw.parse(),
            _ => Ok(Self::default()),
        }
    }

    pub fn connect(self) -> StoreResult<Arc<dyn JobStore>> {
        match self {
            Self::Firestore => {
                let store = FirestoreJobStore::from_env()?;
                info!("Using Firestore job store");
                Ok(Arc::new(store))
            }
            Self::Memory => {
                warn!("Using in-memory job store; job records do not outlive this process");
                Ok(Arc::new(MemoryJobStore::new()))
            }
        }
    }
}
