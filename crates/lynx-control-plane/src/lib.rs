pub mod config;
pub mod dispatcher;
pub mod emergency;
pub mod error;
pub mod executor;
pub mod generator;
pub mod history;
pub mod http;
pub mod queue;
pub mod readiness;
pub mod retry;
pub mod runtime;
pub mod store;
pub mod worker;

pub use config::ControlPlaneConfig;
pub use runtime::ControlPlane;
