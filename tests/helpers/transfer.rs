use async_trait::async_trait;
use glance_image_sync::sync::{FileTransfer, TransferOutcome, TransferRequest};
use glance_image_sync::Result;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Transfer double: records requests and replays scripted outcomes.
/// Once the script runs out every transfer succeeds.
#[derive(Clone, Default)]
pub struct RecordingTransfer {
    requests: Arc<Mutex<Vec<TransferRequest>>>,
    outcomes: Arc<Mutex<VecDeque<TransferOutcome>>>,
    write_destination: bool,
}

impl RecordingTransfer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Successful transfers also create the destination file.
    pub fn writing_files() -> Self {
        Self {
            write_destination: true,
            ..Self::default()
        }
    }

    pub fn with_outcomes(outcomes: Vec<TransferOutcome>) -> Self {
        Self {
            outcomes: Arc::new(Mutex::new(outcomes.into())),
            ..Self::default()
        }
    }

    pub fn requests(&self) -> Vec<TransferRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl FileTransfer for RecordingTransfer {
    async fn transfer(&self, request: &TransferRequest) -> Result<TransferOutcome> {
        self.requests.lock().unwrap().push(request.clone());
        let outcome = self
            .outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(TransferOutcome::succeeded);

        if outcome.success && self.write_destination {
            tokio::fs::write(&request.destination, b"image data").await?;
        }
        Ok(outcome)
    }
}
