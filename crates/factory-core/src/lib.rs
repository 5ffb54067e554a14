pub mod artifacts;
pub mod ci;
pub mod config;
pub mod errors;
pub mod events;
pub mod metrics;
pub mod queue;
pub mod resume;
pub mod types;

pub use config::FactoryConfig;
pub use errors::{ErrorCode, FactoryFault};
pub use queue::Queue;
pub use resume::{derive_state, ResumeState, ResumeStatus};
pub use types::*;
