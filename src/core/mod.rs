pub mod nodes;
pub mod pipeline;
pub mod retry;
pub mod routing;
pub mod types;

pub use nodes::NodeList;
pub use pipeline::ImageSyncPipeline;
pub use retry::RetryPolicy;
pub use types::{EventType, Notification};
