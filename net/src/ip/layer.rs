//! The IPv4 codec and queue: sits between the tunnel device and the TCP
//! engine. Owns one worker that parses inbound datagrams off the tunnel and
//! one that hands already-serialized outbound datagrams back to it.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{trace, warn};
use runtime::channel::{bounded, Receiver, Sender};
use runtime::Cancel;
use tunnel::Device;
use utils::config::TUNNEL_QUEUE_CAPACITY;
use utils::error::Error;

use super::header::{IpHeader, IpPacket};

/// IPv4 codec and queue. Everything above this layer only ever sees
/// [`IpPacket`]s on the way in and raw serialized bytes on the way out.
pub struct Layer {
	ingress_tx: Sender<IpPacket>,
	ingress_rx: Receiver<IpPacket>,

	egress_tx: Sender<Vec<u8>>,
	egress_rx: Receiver<Vec<u8>>,

	workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Layer {
	pub fn new() -> Self {
		let (ingress_tx, ingress_rx) = bounded(TUNNEL_QUEUE_CAPACITY);
		let (egress_tx, egress_rx) = bounded(TUNNEL_QUEUE_CAPACITY);

		Self { ingress_tx, ingress_rx, egress_tx, egress_rx, workers: std::sync::Mutex::new(Vec::new()) }
	}

	/// Start the ingress and egress workers against `tunnel`. Returns
	/// immediately; workers run until `tunnel`'s cancellation token fires.
	pub fn manage(&self, tunnel: Arc<Device>) {
		let cancel = tunnel.cancel();

		let ingress = {
			let tunnel = tunnel.clone();
			let tx = self.ingress_tx.clone();
			let cancel = cancel.clone();
			thread::spawn(move || Self::run_ingress(tunnel, tx, cancel))
		};

		let egress = {
			let rx = self.egress_rx.clone();
			thread::spawn(move || Self::run_egress(tunnel, rx, cancel))
		};

		*self.workers.lock().expect("workers lock poisoned") = vec![ingress, egress];
	}

	fn run_ingress(tunnel: Arc<Device>, tx: Sender<IpPacket>, cancel: Cancel) {
		loop {
			let pkt = match tunnel.read_packet() {
				Ok(pkt) => pkt,
				Err(Error::DeviceClosed) => return,
				Err(err) => {
					warn!("tunnel read failed: {err}");
					continue;
				}
			};

			let ip_header = match IpHeader::unmarshal(pkt.as_slice()) {
				Ok(h) => h,
				Err(_) => {
					trace!("dropping datagram: header too short ({} bytes)", pkt.len());
					continue;
				}
			};

			if ip_header.version != 4 {
				trace!("dropping datagram: unsupported IP version {}", ip_header.version);
				continue;
			}

			if !runtime::send(&tx, IpPacket { ip_header, packet: pkt }, &cancel) {
				return;
			}
		}
	}

	fn run_egress(tunnel: Arc<Device>, rx: Receiver<Vec<u8>>, cancel: Cancel) {
		while let Some(bytes) = runtime::recv(&rx, &cancel) {
			if let Err(err) = tunnel.write_packet(bytes.into()) {
				warn!("tunnel write failed: {err}");
			}
		}
	}

	/// Block for the next inbound, already-parsed IPv4 datagram.
	pub fn read(&self, cancel: &Cancel) -> Option<IpPacket> {
		runtime::recv(&self.ingress_rx, cancel)
	}

	/// Enqueue an already-serialized IPv4 datagram for the tunnel to send.
	pub fn write(&self, bytes: Vec<u8>, cancel: &Cancel) -> bool {
		runtime::send(&self.egress_tx, bytes, cancel)
	}

	/// Drain one outbound datagram without a tunnel attached. Lets the TCP
	/// engine's tests observe synthesized segments directly.
	#[cfg(test)]
	pub(crate) fn take_egress(&self, cancel: &Cancel) -> Option<Vec<u8>> {
		runtime::recv(&self.egress_rx, cancel)
	}
}

impl Default for Layer {
	fn default() -> Self {
		Self::new()
	}
}
