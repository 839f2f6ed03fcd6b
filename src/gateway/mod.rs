//! The gateway process: launch environment and lifecycle supervision.

pub mod env;
pub mod supervisor;

pub use env::build_env_vars;
pub use supervisor::{
    DeviceApproval, DeviceFailure, GATEWAY_TAG, GatewayLogs, GatewayStatus, GatewaySupervisor,
    RestartOutcome, StartGuards,
};
