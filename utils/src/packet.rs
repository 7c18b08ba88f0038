use crate::config::PACKET_SIZE;

/// An owned packet buffer: a fixed-capacity allocation plus a valid-prefix
/// length. Ownership transfers stage-to-stage through queues; nothing is
/// shared across stages, so there is no reference counting here: once a
/// `Packet` is enqueued downstream, the producer has relinquished it.
pub struct Packet {
	buf: Box<[u8]>,
	len: usize,
}

impl Packet {
	/// Allocate a fresh, zeroed buffer of [`PACKET_SIZE`] with no valid data.
	pub fn new() -> Self {
		Self { buf: vec![0; PACKET_SIZE].into_boxed_slice(), len: 0 }
	}

	/// The valid prefix of the buffer, i.e. `buf[..len]`.
	pub fn as_slice(&self) -> &[u8] {
		&self.buf[..self.len]
	}

	/// The whole backing allocation, for a worker to fill via a single read.
	pub fn as_mut_buf(&mut self) -> &mut [u8] {
		&mut self.buf
	}

	/// Mark the first `len` bytes of the buffer as valid. Clamped to the
	/// buffer's capacity so a misbehaving reader can't claim more than it
	/// was given room for.
	pub fn set_len(&mut self, len: usize) {
		self.len = len.min(self.buf.len());
	}

	pub fn len(&self) -> usize {
		self.len
	}

	pub fn is_empty(&self) -> bool {
		self.len == 0
	}

	pub fn capacity(&self) -> usize {
		self.buf.len()
	}
}

impl Default for Packet {
	fn default() -> Self {
		Self::new()
	}
}

/// Build a `Packet` from already-serialized bytes, e.g. a freshly marshalled
/// IPv4+TCP segment ready for tunnel egress. Panics if `bytes` would not fit
/// in a single packet buffer. The caller is responsible for staying within
/// [`PACKET_SIZE`].
impl From<Vec<u8>> for Packet {
	fn from(bytes: Vec<u8>) -> Self {
		let mut pkt = Self::new();
		let len = bytes.len();
		assert!(len <= pkt.capacity(), "serialized segment exceeds PACKET_SIZE");
		pkt.buf[..len].copy_from_slice(&bytes);
		pkt.set_len(len);
		pkt
	}
}
