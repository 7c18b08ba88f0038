//! The tunnel device: owns the raw byte channel to a kernel layer-3 virtual
//! interface (a TUN device) and presents it as two bounded packet queues.
//!
//! This is the lowest layer of the pipeline. Everything above it (the IPv4
//! codec, the TCP engine) only ever sees [`Packet`]s; the device-control
//! call that actually creates the interface is delegated to the `tun-tap`
//! crate.

use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use log::{trace, warn};
use runtime::channel::{bounded, Receiver, Sender};
use runtime::Cancel;
use tun_tap::{Iface, Mode};
use utils::config::TUNNEL_QUEUE_CAPACITY;
use utils::error::Error;
use utils::packet::Packet;

/// The tunnel device. Configures a TUN interface for layer-3 framing with
/// no per-packet protocol prefix (`tun_tap::without_packet_info`), and runs
/// one ingress and one egress worker once [`Device::bind`] is called.
pub struct Device {
	iface: Arc<Iface>,

	ingress_tx: Sender<Packet>,
	ingress_rx: Receiver<Packet>,

	egress_tx: Sender<Packet>,
	egress_rx: Receiver<Packet>,

	cancel: Cancel,
	workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Device {
	/// Open and configure the tunnel. Fails with [`Error::DeviceOpen`] if
	/// the device node cannot be acquired or configured.
	pub fn open(name: &str) -> Result<Self, Error> {
		let iface = Iface::without_packet_info(name, Mode::Tun).map_err(Error::DeviceOpen)?;

		let (ingress_tx, ingress_rx) = bounded(TUNNEL_QUEUE_CAPACITY);
		let (egress_tx, egress_rx) = bounded(TUNNEL_QUEUE_CAPACITY);

		Ok(Self {
			iface: Arc::new(iface),
			ingress_tx,
			ingress_rx,
			egress_tx,
			egress_rx,
			cancel: Cancel::new(),
			workers: Mutex::new(Vec::new()),
		})
	}

	/// The name the kernel assigned the interface (may differ from the
	/// requested name, e.g. if it ended in `%d`).
	pub fn name(&self) -> &str {
		self.iface.name()
	}

	/// The cancellation token bound to this device's lifetime. Shared with
	/// every layer above so that [`Device::close`] propagates through the
	/// whole pipeline.
	pub fn cancel(&self) -> Cancel {
		self.cancel.clone()
	}

	/// Start the ingress and egress workers. Returns immediately.
	pub fn bind(&self) {
		let ingress = {
			let iface = self.iface.clone();
			let tx = self.ingress_tx.clone();
			let cancel = self.cancel.clone();
			thread::spawn(move || Self::run_ingress(iface, tx, cancel))
		};

		let egress = {
			let iface = self.iface.clone();
			let rx = self.egress_rx.clone();
			let cancel = self.cancel.clone();
			thread::spawn(move || Self::run_egress(iface, rx, cancel))
		};

		*self.workers.lock().expect("workers lock poisoned") = vec![ingress, egress];
	}

	fn run_ingress(iface: Arc<Iface>, tx: Sender<Packet>, cancel: Cancel) {
		while !cancel.is_cancelled() {
			let mut pkt = Packet::new();

			match iface.recv(pkt.as_mut_buf()) {
				Ok(n) => {
					pkt.set_len(n);
					trace!("tunnel read {n} bytes");

					if !runtime::send(&tx, pkt, &cancel) {
						return;
					}
				}
				Err(err) => {
					// Transient read error: log and retry with a fresh
					// buffer. Never enqueue the partially-read packet.
					warn!("tunnel read failed: {err}");
				}
			}
		}
	}

	fn run_egress(iface: Arc<Iface>, rx: Receiver<Packet>, cancel: Cancel) {
		while let Some(pkt) = runtime::recv(&rx, &cancel) {
			if let Err(err) = iface.send(pkt.as_slice()) {
				warn!("tunnel write failed: {err}");
			}
		}
	}

	/// Yield the next ingress packet. Fails with [`Error::DeviceClosed`] if
	/// the device has been closed and the ingress queue has drained.
	pub fn read_packet(&self) -> Result<Packet, Error> {
		runtime::recv(&self.ingress_rx, &self.cancel).ok_or(Error::DeviceClosed)
	}

	/// Enqueue `pkt` for egress. Fails with [`Error::DeviceClosed`] if the
	/// device is being torn down.
	pub fn write_packet(&self, pkt: Packet) -> Result<(), Error> {
		if runtime::send(&self.egress_tx, pkt, &self.cancel) {
			Ok(())
		} else {
			Err(Error::DeviceClosed)
		}
	}

	/// Signal cancellation and join both workers.
	pub fn close(&self) {
		self.cancel.cancel();

		for handle in self.workers.lock().expect("workers lock poisoned").drain(..) {
			let _ = handle.join();
		}
	}
}

impl Drop for Device {
	fn drop(&mut self) {
		self.close();
	}
}
