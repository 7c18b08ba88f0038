pub mod header;
pub mod layer;

pub use header::{IpHeader, IpPacket};
pub use layer::Layer;
