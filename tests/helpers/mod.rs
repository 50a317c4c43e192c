pub mod broker;
pub mod notifications;
pub mod test_harness;
pub mod transfer;

pub use broker::{AckState, RecordingAcker, RecordingPublisher, ScriptedSource};
pub use notifications::NotificationBuilder;
pub use test_harness::TestHarness;
pub use transfer::RecordingTransfer;
