pub mod duplicator;

pub use duplicator::{Duplicator, FanoutReport};
