//! SofiaAI Common Types
//!
//! Wire types shared by the gateway and its clients.

pub mod protocol;

pub use protocol::{ClientRequest, DoneStats, ServerFrame};
