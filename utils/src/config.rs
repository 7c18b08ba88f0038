//! Compile-time constants shared across the pipeline. There is no runtime
//! configuration surface: these are the only knobs the stack has.

/// Size of every packet buffer, from the tunnel device up through the IP
/// layer. Must be at least large enough to hold the largest datagram the
/// tunnel can deliver in one `read`.
pub const PACKET_SIZE: usize = 2048;

/// Capacity of the tunnel device's ingress and egress queues, and of the IP
/// layer's ingress and egress queues.
pub const TUNNEL_QUEUE_CAPACITY: usize = 10;

/// Capacity of the TCP engine's accept queue (established, data-bearing
/// connections waiting to be handed to the consumer).
pub const ENGINE_QUEUE_CAPACITY: usize = 100;

/// Advertised TCP receive window on every outbound segment. Never honored
/// against real buffer occupancy; there is no flow control beyond the
/// fixed-capacity queues.
pub const TCP_WINDOW: u16 = 65535;

/// TTL stamped on every outbound IPv4 datagram.
pub const TTL: u8 = 64;
