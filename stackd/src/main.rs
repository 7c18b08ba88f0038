//! Minimal driver binary: opens a tunnel device, wires the IPv4 and TCP
//! layers onto it, and logs every accepted connection's payload to stderr.
//! A real application-layer consumer lives outside this stack's scope;
//! this loop is just enough to exercise `Engine::accept` end to end.

use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;

use log::{error, info, warn};
use net::ip::Layer as IpLayer;
use net::tcp::Engine;
use tunnel::Device;

fn main() -> ExitCode {
	let level = std::env::var("STACKD_LOG")
		.ok()
		.and_then(|v| log::LevelFilter::from_str(&v).ok())
		.unwrap_or(log::LevelFilter::Info);
	runtime::logger::init(level);

	let name = std::env::args().nth(1).unwrap_or_else(|| "tun0".to_string());

	let device = match Device::open(&name) {
		Ok(device) => Arc::new(device),
		Err(err) => {
			error!("failed to open tunnel device {name:?}: {err}");
			return ExitCode::FAILURE;
		}
	};

	info!("opened tunnel device {:?}", device.name());

	if let Err(err) = device.cancel().bind_ctrlc() {
		warn!("failed to install Ctrl+C handler: {err}");
	}

	device.bind();

	let ip = Arc::new(IpLayer::new());
	ip.manage(device.clone());

	let engine = Arc::new(Engine::new(device.cancel()));
	engine.manage(ip.clone());

	loop {
		match engine.accept() {
			Ok(conn) => {
				info!(
					"accepted connection: local port {} <- remote port {} ({} bytes)",
					conn.src_port,
					conn.dst_port,
					conn.payload().len()
				);
			}
			Err(_) => {
				info!("accept queue closed, shutting down");
				break;
			}
		}
	}

	device.close();
	engine.join();

	ExitCode::SUCCESS
}
