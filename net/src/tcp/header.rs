use bilge::prelude::*;
use utils::error::Error;

use crate::checksum::Checksum;
use crate::ip::IpHeader;

/// The eight independently-meaningful control bits of byte 13. Named for
/// their RFC 793 letters rather than any notion of priority between them:
/// a single segment may carry several at once (e.g. `FIN|ACK`).
#[bitsize(8)]
#[derive(Clone, Copy, FromBits)]
struct FlagsByte {
	fin: bool,
	syn: bool,
	rst: bool,
	psh: bool,
	ack: bool,
	urg: bool,
	ece: bool,
	cwr: bool,
}

/// Byte 12: `reserved` in the low nibble (carried but never acted upon),
/// `data_offset` in the high nibble.
#[bitsize(8)]
#[derive(Clone, Copy, FromBits)]
struct OffsetByte {
	reserved: u4,
	data_offset: u4,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
	pub fin: bool,
	pub syn: bool,
	pub rst: bool,
	pub psh: bool,
	pub ack: bool,
	pub urg: bool,
	pub ece: bool,
	pub cwr: bool,
}

impl TcpFlags {
	pub const fn syn() -> Self {
		Self { fin: false, syn: true, rst: false, psh: false, ack: false, urg: false, ece: false, cwr: false }
	}

	pub const fn ack() -> Self {
		Self { fin: false, syn: false, rst: false, psh: false, ack: true, urg: false, ece: false, cwr: false }
	}

	pub const fn syn_ack() -> Self {
		Self { fin: false, syn: true, rst: false, psh: false, ack: true, urg: false, ece: false, cwr: false }
	}

	pub const fn fin_ack() -> Self {
		Self { fin: true, syn: false, rst: false, psh: false, ack: true, urg: false, ece: false, cwr: false }
	}

	pub const fn psh_ack() -> Self {
		Self { fin: false, syn: false, rst: false, psh: true, ack: true, urg: false, ece: false, cwr: false }
	}
}

/// Decoded form of the first 20 bytes of a TCP segment. Options are not
/// parsed: `data_offset` is always 5 on segments this stack emits, and on
/// ingress the caller skips `data_offset * 4` bytes to find the payload.
#[derive(Debug, Clone, Copy)]
pub struct TcpHeader {
	pub src_port: u16,
	pub dst_port: u16,
	pub seq_num: u32,
	pub ack_num: u32,
	pub data_offset: u8,
	pub reserved: u8,
	pub flags: TcpFlags,
	pub window: u16,
	pub checksum: u16,
	pub urgent_pointer: u16,
}

impl TcpHeader {
	/// Build a fresh header: `data_offset=5`, `window=65535`, checksum and
	/// urgent pointer zero until [`TcpHeader::marshal`] fills the former in.
	pub fn new(src_port: u16, dst_port: u16, seq_num: u32, ack_num: u32, flags: TcpFlags) -> Self {
		Self {
			src_port,
			dst_port,
			seq_num,
			ack_num,
			data_offset: 5,
			reserved: 0,
			flags,
			window: utils::config::TCP_WINDOW,
			checksum: 0,
			urgent_pointer: 0,
		}
	}

	/// Parse the first 20 bytes of `buf` as a TCP header.
	pub fn unmarshal(buf: &[u8]) -> Result<Self, Error> {
		if buf.len() < 20 {
			return Err(Error::BadHeader);
		}

		let offset = OffsetByte::from(buf[12]);
		let fb = FlagsByte::from(buf[13]);

		Ok(Self {
			src_port: u16::from_be_bytes([buf[0], buf[1]]),
			dst_port: u16::from_be_bytes([buf[2], buf[3]]),
			seq_num: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
			ack_num: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
			data_offset: offset.data_offset().value(),
			// Bit 0 of the low nibble is dropped; only the other three bits
			// of the reserved nibble are preserved.
			reserved: offset.reserved().value() & 0x0E,
			flags: TcpFlags {
				fin: fb.fin(),
				syn: fb.syn(),
				rst: fb.rst(),
				psh: fb.psh(),
				ack: fb.ack(),
				urg: fb.urg(),
				ece: fb.ece(),
				cwr: fb.cwr(),
			},
			window: u16::from_be_bytes([buf[14], buf[15]]),
			checksum: u16::from_be_bytes([buf[16], buf[17]]),
			urgent_pointer: u16::from_be_bytes([buf[18], buf[19]]),
		})
	}

	/// Serialize a fixed 20-byte header (`data_offset` is always written as
	/// 5 regardless of `self.data_offset`, matching every segment this stack
	/// ever emits) and compute its checksum over the TCP pseudo-header,
	/// header, and `payload`.
	pub fn marshal(&self, ip_header: &IpHeader, payload: &[u8]) -> [u8; 20] {
		let mut buf = [0u8; 20];

		buf[0..2].copy_from_slice(&self.src_port.to_be_bytes());
		buf[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
		buf[4..8].copy_from_slice(&self.seq_num.to_be_bytes());
		buf[8..12].copy_from_slice(&self.ack_num.to_be_bytes());

		buf[12] = OffsetByte::new(u4::new(0), u4::new(5)).into();

		let fb = FlagsByte::new(
			self.flags.fin,
			self.flags.syn,
			self.flags.rst,
			self.flags.psh,
			self.flags.ack,
			self.flags.urg,
			self.flags.ece,
			self.flags.cwr,
		);
		buf[13] = fb.into();

		buf[14..16].copy_from_slice(&self.window.to_be_bytes());
		// buf[16..18] (checksum) stays zero until after the sum below.
		buf[18..20].copy_from_slice(&self.urgent_pointer.to_be_bytes());

		let mut segment = buf.to_vec();
		segment.extend_from_slice(payload);

		let csum = set_checksum(ip_header, &segment);
		buf[16] = csum[0];
		buf[17] = csum[1];

		buf
	}
}

/// Compute the TCP checksum over the 12-byte IPv4 pseudo-header followed by
/// `tcp_segment` (header + payload), padded to even length with a single
/// zero byte if needed.
pub fn set_checksum(ip_header: &IpHeader, tcp_segment: &[u8]) -> [u8; 2] {
	let mut pseudo = [0u8; 12];
	pseudo[0..4].copy_from_slice(&ip_header.src_ip.octets());
	pseudo[4..8].copy_from_slice(&ip_header.dst_ip.octets());
	pseudo[8] = 0;
	pseudo[9] = 6;
	pseudo[10..12].copy_from_slice(&(tcp_segment.len() as u16).to_be_bytes());

	let mut csum = Checksum::of(&pseudo);
	csum.push(tcp_segment);
	csum.end()
}

#[cfg(test)]
mod tests {
	use std::net::Ipv4Addr;

	use super::*;

	#[test]
	fn round_trips() {
		let ip_header = IpHeader::new(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2), 20 + 2);
		let payload = b"hi";

		let header = TcpHeader::new(80, 40000, 0x1000, 0x2000, TcpFlags::psh_ack());
		let buf = header.marshal(&ip_header, payload);

		let parsed = TcpHeader::unmarshal(&buf).unwrap();

		assert_eq!(parsed.src_port, 80);
		assert_eq!(parsed.dst_port, 40000);
		assert_eq!(parsed.seq_num, 0x1000);
		assert_eq!(parsed.ack_num, 0x2000);
		assert_eq!(parsed.data_offset, 5);
		assert_eq!(parsed.window, utils::config::TCP_WINDOW);
		assert_eq!(parsed.flags, TcpFlags::psh_ack());

		let mut segment = buf.to_vec();
		segment.extend_from_slice(payload);
		let mut pseudo = [0u8; 12];
		pseudo[0..4].copy_from_slice(&ip_header.src_ip.octets());
		pseudo[4..8].copy_from_slice(&ip_header.dst_ip.octets());
		pseudo[9] = 6;
		pseudo[10..12].copy_from_slice(&(segment.len() as u16).to_be_bytes());
		let mut csum = Checksum::of(&pseudo);
		csum.push(&segment);
		assert_eq!(csum.end(), [0, 0]);
	}

	#[test]
	fn rejects_short_buffers() {
		assert!(matches!(TcpHeader::unmarshal(&[0u8; 19]), Err(Error::BadHeader)));
	}
}
