//! UPF N4 control plane
//!
//! PFCP association and session handling for a 5G UPF: TEID allocation,
//! SDF filter parsing, PDR/FAR/QER programming through a forwarding-plane
//! interface, heartbeats and session reports towards the SMF.

pub mod association;
pub mod config;
pub mod connection;
pub mod error;
pub mod forwarding;
pub mod n4_build;
pub mod n4_handler;
pub mod pdr_context;
pub mod pfcp_path;
pub mod report;
pub mod sdf;
pub mod session;
pub mod teid;


pub use config::UpfConfig;
pub use connection::PfcpConnection;
pub use error::{UpfError, UpfResult};
