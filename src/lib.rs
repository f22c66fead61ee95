//! SOE reliable-UDP transport
//!
//! Umbrella crate over the wire protocol (`soe-shared`) and the server
//! (`soe-server`).

pub use soe_server as server;
pub use soe_shared as shared;
