//! Network layer: TCP full-mesh bring-up, the blocking/turbo socket
//! wrappers, the inter-node sync primitives, and every wire packet the
//! driver exchanges with workers.

pub mod config_wire;
pub mod error;
pub mod packets;
pub mod socket;
pub mod sync;
pub mod weight_wire;

pub use error::{NetError, Result};
pub use packets::{BootstrapPacket, ControlPacket, PerfPacket, CONTROL_PROFILE};
pub use socket::{Network, ROOT_SOCKET_INDEX};
pub use sync::NetworkSynchronizer;
