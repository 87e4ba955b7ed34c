//! Pipeline stages.

use std::fmt;

use mediaflow_models::JobStatus;

/// One ordered step of a job's pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Download,
    Probe,
    Encode,
    Upload,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Download => "download",
            Stage::Probe => "probe",
            Stage::Encode => "encode",
            Stage::Upload => "upload",
        }
    }

    /// Status the job holds while this stage runs.
    pub fn in_progress_status(&self) -> JobStatus {
        match self {
            Stage::Download => JobStatus::Downloading,
            Stage::Probe => JobStatus::Probing,
            Stage::Encode => JobStatus::Encoding,
            Stage::Upload => JobStatus::Uploading,
        }
    }

    /// Status written once the stage succeeds, if it has its own.
    pub fn done_status(&self) -> Option<JobStatus> {
        match self {
            Stage::Download => Some(JobStatus::Downloaded),
            Stage::Probe | Stage::Encode | Stage::Upload => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statuses_follow_job_order() {
        let order = [Stage::Download, Stage::Probe, Stage::Encode, Stage::Upload];
        let ranks: Vec<u8> = order
            .iter()
            .map(|s| s.in_progress_status().rank().unwrap())
            .collect();
        assert!(ranks.windows(2).all(|w| w[0] < w[1]));

        assert!(JobStatus::Downloading.can_transition_to(Stage::Download.done_status().unwrap()));
        assert!(JobStatus::Downloaded.can_transition_to(Stage::Probe.in_progress_status()));
    }
}
