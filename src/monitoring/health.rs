use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Summary of one relay loop after it stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopStats {
    pub processed: u64,
    pub acked: u64,
    pub requeued: u64,
    pub rejected: u64,
    pub skipped: u64,
}

impl LoopStats {
    pub fn merge(&mut self, other: &LoopStats) {
        self.processed += other.processed;
        self.acked += other.acked;
        self.requeued += other.requeued;
        self.rejected += other.rejected;
        self.skipped += other.skipped;
    }
}

/// Health status for the whole process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineHealth {
    pub healthy: bool,
    pub rabbitmq_healthy: bool,
    pub running: bool,
    pub mode: String,
    pub last_check: DateTime<Utc>,
    pub last_event_time: Option<DateTime<Utc>>,
}
