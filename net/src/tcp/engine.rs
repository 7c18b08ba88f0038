//! The TCP engine: the connection table, the receive-driven state machine,
//! and synthesis of response segments. The only component above the IP
//! layer; everything the consumer ever sees comes through [`Engine::accept`].

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use log::trace;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use runtime::channel::{bounded, Receiver, Sender};
use runtime::Cancel;
use utils::config::ENGINE_QUEUE_CAPACITY;
use utils::error::Error;

use crate::ip::{IpHeader, IpPacket, Layer};

use super::header::{TcpFlags, TcpHeader};

/// Server-side states a connection passes through. `Listen` is never
/// actually assigned (connections come into being already in
/// `SynReceived`), but it remains part of the state space described by the
/// data model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
	Listen,
	SynReceived,
	Established,
	CloseWait,
	LastAck,
	Closed,
}

/// A TCP segment paired with its own and its datagram's decoded headers
/// and payload: the slice past `ihl*4 + data_offset*4` the consumer reads
/// through [`Connection::payload`].
#[derive(Clone)]
pub struct TcpPacket {
	pub ip_header: IpHeader,
	pub tcp_header: TcpHeader,
	pub payload: Vec<u8>,
}

/// One entry of the connection table, keyed by `(src_port, dst_port)` from
/// the stack's perspective: `src_port` is the local port, `dst_port` the
/// remote one.
#[derive(Clone)]
pub struct Connection {
	pub src_port: u16,
	pub dst_port: u16,
	pub state: State,
	pub pkt: Option<TcpPacket>,
	pub initial_seq_num: u32,
	pub increment_seq_num: u32,
	pub is_accept: bool,
}

impl Connection {
	fn new_syn_received(src_port: u16, dst_port: u16, isn: u32) -> Self {
		Self { src_port, dst_port, state: State::SynReceived, pkt: None, initial_seq_num: isn, increment_seq_num: 0, is_accept: false }
	}

	/// The payload bytes of the most recently received segment on this
	/// flow, if any. This is what a PSH delivers to the consumer.
	pub fn payload(&self) -> &[u8] {
		self.pkt.as_ref().map_or(&[], |pkt| pkt.payload.as_slice())
	}
}

/// Source of initial sequence numbers, reseeded from a monotonic clock
/// reading at construction.
struct IsnSource {
	rng: Mutex<StdRng>,
}

impl IsnSource {
	fn new() -> Self {
		let mut hasher = DefaultHasher::new();
		Instant::now().hash(&mut hasher);
		Self { rng: Mutex::new(StdRng::seed_from_u64(hasher.finish())) }
	}

	fn next(&self) -> u32 {
		self.rng.lock().expect("ISN rng lock poisoned").gen()
	}
}

/// The connection table. Single mutex; connections are mutated in place
/// under the lock rather than copied out and written back, which removes
/// the lost-update window the source's find/mutate/updateState pattern
/// otherwise relies on the lock to paper over.
struct Table {
	inner: Mutex<HashMap<(u16, u16), Connection>>,
	isn: IsnSource,
}

impl Table {
	fn new() -> Self {
		Self { inner: Mutex::new(HashMap::new()), isn: IsnSource::new() }
	}

	/// Look up `key`, creating a fresh `SynReceived` entry if none exists,
	/// then run `f` against it while still holding the lock. `f` receives
	/// whether this call just created the entry.
	fn dispatch<R>(&self, key: (u16, u16), f: impl FnOnce(&mut Connection, bool) -> R) -> R {
		let mut table = self.inner.lock().expect("connection table lock poisoned");
		let created = !table.contains_key(&key);
		let conn = table.entry(key).or_insert_with(|| Connection::new_syn_received(key.0, key.1, self.isn.next()));

		f(conn, created)
	}

	fn remove(&self, key: (u16, u16)) {
		self.inner.lock().expect("connection table lock poisoned").remove(&key);
	}

	fn len(&self) -> usize {
		self.inner.lock().expect("connection table lock poisoned").len()
	}
}

/// Outbound segments and queue effects produced by one dispatch decision.
#[derive(Default)]
struct Effects {
	outbound: Vec<Vec<u8>>,
	deliver: Option<Connection>,
	remove: bool,
}

/// The TCP engine. Runs one receive-loop worker consuming parsed datagrams
/// from the IP layer and pushing serialized responses back to it.
pub struct Engine {
	table: Table,
	accept_tx: Sender<Connection>,
	accept_rx: Receiver<Connection>,
	cancel: Cancel,
	worker: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
	pub fn new(cancel: Cancel) -> Self {
		let (accept_tx, accept_rx) = bounded(ENGINE_QUEUE_CAPACITY);
		Self { table: Table::new(), accept_tx, accept_rx, cancel, worker: Mutex::new(None) }
	}

	/// Number of live (non-`Closed`) connections. Exposed for tests.
	pub fn table_len(&self) -> usize {
		self.table.len()
	}

	/// Start the receive-loop worker against `ip`. Returns immediately.
	pub fn manage(self: &Arc<Self>, ip: Arc<Layer>) {
		let engine = self.clone();
		let cancel = self.cancel.clone();
		let handle = thread::spawn(move || engine.run_receive(ip, cancel));
		*self.worker.lock().expect("worker lock poisoned") = Some(handle);
	}

	/// Join the receive-loop worker. Best-effort; intended for shutdown
	/// after the shared cancellation token has fired.
	pub fn join(&self) {
		if let Some(handle) = self.worker.lock().expect("worker lock poisoned").take() {
			let _ = handle.join();
		}
	}

	fn run_receive(&self, ip: Arc<Layer>, cancel: Cancel) {
		while let Some(ip_packet) = ip.read(&cancel) {
			if ip_packet.ip_header.protocol != 6 {
				continue;
			}

			self.handle(ip_packet, &ip, &cancel);
		}
	}

	fn handle(&self, ip_packet: IpPacket, ip: &Layer, cancel: &Cancel) {
		let ip_header = ip_packet.ip_header;

		let tcp_header = match TcpHeader::unmarshal(ip_packet.payload()) {
			Ok(h) => h,
			Err(_) => {
				trace!("dropping segment: TCP header too short");
				return;
			}
		};

		let tcp_segment = ip_packet.payload();
		let payload_start = (tcp_header.data_offset as usize * 4).min(tcp_segment.len());
		let tcp_packet = TcpPacket { ip_header, tcp_header, payload: tcp_segment[payload_start..].to_vec() };

		let key = (tcp_header.dst_port, tcp_header.src_port);
		let flags = tcp_header.flags;

		let effects = self.table.dispatch(key, |conn, created| {
			conn.pkt = Some(tcp_packet);

			let mut effects = Effects::default();

			if created && flags.syn {
				conn.state = State::SynReceived;
				effects.outbound.push(Self::synthesize(conn, TcpFlags::syn_ack(), &[]));
				return effects;
			}

			match conn.state {
				State::SynReceived if flags.ack => {
					conn.state = State::Established;
				}
				// A FIN takes priority over a bare PSH on the same segment.
				State::Established if flags.fin => {
					conn.state = State::CloseWait;
					effects.outbound.push(Self::synthesize(conn, TcpFlags::ack(), &[]));
					conn.state = State::LastAck;
					effects.outbound.push(Self::synthesize(conn, TcpFlags::fin_ack(), &[]));
				}
				State::Established if flags.psh => {
					conn.is_accept = true;
					effects.deliver = Some(conn.clone());
				}
				State::LastAck if flags.ack => {
					conn.state = State::Closed;
					effects.remove = true;
				}
				_ => {}
			}

			effects
		});

		for bytes in effects.outbound {
			let _ = ip.write(bytes, cancel);
		}

		if let Some(conn) = effects.deliver {
			let _ = runtime::send(&self.accept_tx, conn, cancel);
		}

		if effects.remove {
			self.table.remove(key);
		}
	}

	/// Build and serialize a reply segment, advancing `conn`'s sequence
	/// accounting to match. Uses `conn.pkt` (the incoming segment that
	/// triggered this dispatch) for both the acknowledgment base and the
	/// (intentionally asymmetric) acknowledgment increment: see the engine's
	/// design notes on the `ack_num` quirk this preserves.
	fn synthesize(conn: &mut Connection, flags: TcpFlags, data: &[u8]) -> Vec<u8> {
		let incoming = conn.pkt.as_ref().expect("synthesize called before an incoming segment was cached");

		let ack_increment: u32 = if incoming.payload.is_empty() { 1 } else { data.len() as u32 };
		let ack_num = incoming.tcp_header.seq_num.wrapping_add(ack_increment);
		let seq_num = conn.initial_seq_num.wrapping_add(conn.increment_seq_num);

		let ip_header = IpHeader::new(incoming.ip_header.dst_ip, incoming.ip_header.src_ip, 20 + data.len());
		let tcp_header =
			TcpHeader::new(incoming.tcp_header.dst_port, incoming.tcp_header.src_port, seq_num, ack_num, flags);

		let tcp_bytes = tcp_header.marshal(&ip_header, data);

		let mut segment = ip_header.marshal().to_vec();
		segment.extend_from_slice(&tcp_bytes);
		segment.extend_from_slice(data);

		conn.increment_seq_num =
			conn.increment_seq_num.wrapping_add(data.len() as u32).wrapping_add(flags.syn as u32).wrapping_add(flags.fin as u32);

		segment
	}

	/// Block for the next established, data-bearing connection. Fails with
	/// [`Error::AcceptClosed`] once the accept queue is closed and drained.
	pub fn accept(&self) -> Result<Connection, Error> {
		runtime::recv(&self.accept_rx, &self.cancel).ok_or(Error::AcceptClosed)
	}
}

#[cfg(test)]
mod tests {
	use std::net::Ipv4Addr;

	use super::*;

	fn syn(src_port: u16, dst_port: u16, seq: u32) -> IpPacket {
		segment(src_port, dst_port, seq, 0, TcpFlags::syn(), &[])
	}

	fn segment(src_port: u16, dst_port: u16, seq: u32, ack: u32, flags: TcpFlags, data: &[u8]) -> IpPacket {
		let peer = Ipv4Addr::new(10, 0, 0, 2);
		let local = Ipv4Addr::new(10, 0, 0, 1);

		let ip_header = IpHeader::new(peer, local, 20 + data.len());
		let tcp_header = TcpHeader::new(src_port, dst_port, seq, ack, flags);
		let tcp_bytes = tcp_header.marshal(&ip_header, data);

		let mut buf = ip_header.marshal().to_vec();
		buf.extend_from_slice(&tcp_bytes);
		buf.extend_from_slice(data);

		let mut packet = utils::packet::Packet::new();
		packet.as_mut_buf()[..buf.len()].copy_from_slice(&buf);
		packet.set_len(buf.len());

		IpPacket { ip_header, packet }
	}

	fn run(engine: &Engine, ip: &Layer, pkt: IpPacket, cancel: &Cancel) {
		engine.handle(pkt, ip, cancel);
	}

	#[test]
	fn full_lifecycle_empties_the_table() {
		let cancel = Cancel::new();
		let engine = Engine::new(cancel.clone());
		let ip = Layer::new();

		// A: SYN
		run(&engine, &ip, syn(40000, 80, 0x1000), &cancel);
		assert_eq!(engine.table_len(), 1);
		let synack = ip.take_egress(&cancel).expect("SYN|ACK reply");
		let synack_tcp = TcpHeader::unmarshal(&synack[20..]).unwrap();
		assert!(synack_tcp.flags.syn && synack_tcp.flags.ack);
		assert_eq!(synack_tcp.ack_num, 0x1001);
		let isn_l = synack_tcp.seq_num;

		// B: ACK completes the handshake.
		run(&engine, &ip, segment(40000, 80, 0x1001, isn_l + 1, TcpFlags::ack(), &[]), &cancel);
		assert_eq!(engine.table_len(), 1);

		// C: PSH delivers the connection, with no reply on the wire.
		run(&engine, &ip, segment(40000, 80, 0x1001, isn_l + 1, TcpFlags::psh_ack(), b"hi"), &cancel);
		let delivered = engine.accept().expect("connection delivered");
		assert!(delivered.is_accept);

		// D: FIN drives ACK then FIN|ACK, both at the same seq/ack.
		run(&engine, &ip, segment(40000, 80, 0x1003, isn_l + 1, TcpFlags::fin_ack(), &[]), &cancel);
		let first = ip.take_egress(&cancel).expect("ACK reply");
		let first_tcp = TcpHeader::unmarshal(&first[20..]).unwrap();
		assert!(first_tcp.flags.ack && !first_tcp.flags.fin);
		assert_eq!(first_tcp.seq_num, isn_l + 1);
		assert_eq!(first_tcp.ack_num, 0x1004);

		let second = ip.take_egress(&cancel).expect("FIN|ACK reply");
		let second_tcp = TcpHeader::unmarshal(&second[20..]).unwrap();
		assert!(second_tcp.flags.fin && second_tcp.flags.ack);
		assert_eq!(second_tcp.seq_num, isn_l + 1);
		assert_eq!(second_tcp.ack_num, 0x1004);

		// E: final ACK removes the connection.
		run(&engine, &ip, segment(40000, 80, 0x1004, isn_l + 2, TcpFlags::ack(), &[]), &cancel);
		assert_eq!(engine.table_len(), 0);
	}

	#[test]
	fn duplicate_syn_does_not_grow_the_table() {
		let cancel = Cancel::new();
		let engine = Engine::new(cancel.clone());
		let ip = Layer::new();

		run(&engine, &ip, syn(40000, 80, 0x1000), &cancel);
		let _ = ip.take_egress(&cancel);
		assert_eq!(engine.table_len(), 1);

		run(&engine, &ip, syn(40000, 80, 0x1000), &cancel);
		assert_eq!(engine.table_len(), 1);
	}

	#[test]
	fn seq_num_advances_by_one_for_control_only_segments_and_by_len_for_data() {
		let cancel = Cancel::new();
		let engine = Engine::new(cancel.clone());
		let ip = Layer::new();

		run(&engine, &ip, syn(40000, 80, 0x1000), &cancel);
		let synack = ip.take_egress(&cancel).expect("SYN|ACK reply");
		let isn_l = TcpHeader::unmarshal(&synack[20..]).unwrap().seq_num;

		run(&engine, &ip, segment(40000, 80, 0x1001, isn_l + 1, TcpFlags::ack(), &[]), &cancel);

		// The SYN|ACK carried a phantom SYN byte, so the next outbound
		// segment's seq_num is exactly isn_l + 1.
		run(&engine, &ip, segment(40000, 80, 0x1003, isn_l + 1, TcpFlags::fin_ack(), &[]), &cancel);
		let first = ip.take_egress(&cancel).expect("ACK reply");
		assert_eq!(TcpHeader::unmarshal(&first[20..]).unwrap().seq_num, isn_l + 1);
	}
}
