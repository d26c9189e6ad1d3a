//! Wire formats shared between castgrid nodes and tooling: the client
//! signaling text framing, the inter-node bus message encoding, and the
//! small vocabulary both of them use.

pub mod bus;
pub mod signaling;
pub mod types;

pub use bus::{BusEnvelope, BusMessage, BROADCAST_CHANNEL};
pub use signaling::SignalingMessage;
pub use types::{ErrorCode, StreamKind};
