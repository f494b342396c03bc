pub mod config;
pub mod portal;
pub mod sleep;
pub mod status;

pub use config::{AgentConfig, ConfigError, NetworkConfig};
pub use portal::{PortalConfigView, PortalSubmission, PortalUpdate};
pub use sleep::SleepPlan;
pub use status::{Frame, StatusOutcome};
