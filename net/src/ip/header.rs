use std::net::Ipv4Addr;

use bilge::prelude::*;
use utils::error::Error;

use crate::checksum::Checksum;

/// DF (don't fragment); the stack never emits fragments and relies on the
/// peer not fragmenting either, so this is set on every outbound datagram.
const FLAG_DONT_FRAGMENT: u8 = 0b010;

/// Decoded form of the first 20 bytes of an IPv4 datagram. Options are not
/// supported: `ihl` is expected to be 5 and anything past byte 20 is simply
/// not part of the header.
#[derive(Debug, Clone, Copy)]
pub struct IpHeader {
	pub version: u8,
	pub ihl: u8,
	pub tos: u8,
	pub total_length: u16,
	pub id: u16,
	pub flags: u8,
	pub fragment_offset: u16,
	pub ttl: u8,
	pub protocol: u8,
	pub checksum: u16,
	pub src_ip: Ipv4Addr,
	pub dst_ip: Ipv4Addr,
}

#[bitsize(16)]
#[derive(Clone, Copy, FromBits)]
struct FlagsFrag {
	fragment_offset: u13,
	flags: u3,
}

impl IpHeader {
	/// Build the header for a fresh outbound datagram: `ihl=5`, DF set, TTL
	/// 64, protocol TCP, checksum left to be filled in by [`IpHeader::marshal`].
	pub fn new(src: Ipv4Addr, dst: Ipv4Addr, payload_len: usize) -> Self {
		Self {
			version: 4,
			ihl: 5,
			tos: 0,
			total_length: (20 + payload_len) as u16,
			id: 0,
			flags: FLAG_DONT_FRAGMENT,
			fragment_offset: 0,
			ttl: utils::config::TTL,
			protocol: 6,
			checksum: 0,
			src_ip: src,
			dst_ip: dst,
		}
	}

	/// Parse the first 20 bytes of `buf` as an IPv4 header. Options are not
	/// parsed: the caller is responsible for skipping `ihl * 4` bytes to
	/// reach the payload.
	pub fn unmarshal(buf: &[u8]) -> Result<Self, Error> {
		if buf.len() < 20 {
			return Err(Error::BadHeader);
		}

		let meta = buf[0];
		let flagsfrag = FlagsFrag::from(u16::from_be_bytes([buf[6], buf[7]]));

		Ok(Self {
			version: meta >> 4,
			ihl: meta & 0x0F,
			tos: buf[1],
			total_length: u16::from_be_bytes([buf[2], buf[3]]),
			id: u16::from_be_bytes([buf[4], buf[5]]),
			flags: flagsfrag.flags().value(),
			fragment_offset: flagsfrag.fragment_offset().value(),
			ttl: buf[8],
			protocol: buf[9],
			checksum: u16::from_be_bytes([buf[10], buf[11]]),
			src_ip: Ipv4Addr::new(buf[12], buf[13], buf[14], buf[15]),
			dst_ip: Ipv4Addr::new(buf[16], buf[17], buf[18], buf[19]),
		})
	}

	/// Serialize a fixed 20-byte header (`ihl=5`, no options). The checksum
	/// is computed over the header with the checksum field held at zero,
	/// then patched in afterwards.
	pub fn marshal(&self) -> [u8; 20] {
		let mut buf = [0u8; 20];

		buf[0] = (4 << 4) | 5;
		buf[1] = self.tos;
		buf[2..4].copy_from_slice(&self.total_length.to_be_bytes());
		buf[4..6].copy_from_slice(&self.id.to_be_bytes());

		let packed: u16 = FlagsFrag::new(u13::new(self.fragment_offset), u3::new(self.flags)).into();
		buf[6..8].copy_from_slice(&packed.to_be_bytes());

		buf[8] = self.ttl;
		buf[9] = self.protocol;
		// buf[10..12] (checksum) stays zero until after the sum below.
		buf[12..16].copy_from_slice(&self.src_ip.octets());
		buf[16..20].copy_from_slice(&self.dst_ip.octets());

		let csum = Checksum::of(&buf).end();
		buf[10] = csum[0];
		buf[11] = csum[1];

		buf
	}
}

/// An IPv4 datagram paired with its decoded header. The payload spans
/// `packet[ip_header.ihl * 4 ..]`.
pub struct IpPacket {
	pub ip_header: IpHeader,
	pub packet: utils::packet::Packet,
}

impl IpPacket {
	pub fn payload(&self) -> &[u8] {
		let start = self.ip_header.ihl as usize * 4;
		&self.packet.as_slice()[start.min(self.packet.len())..]
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn round_trips() {
		let h = IpHeader::new(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2), 40);
		let buf = h.marshal();

		let parsed = IpHeader::unmarshal(&buf).unwrap();

		assert_eq!(parsed.version, 4);
		assert_eq!(parsed.ihl, 5);
		assert_eq!(parsed.total_length, 60);
		assert_eq!(parsed.ttl, 64);
		assert_eq!(parsed.protocol, 6);
		assert_eq!(parsed.src_ip, h.src_ip);
		assert_eq!(parsed.dst_ip, h.dst_ip);
		assert_eq!(parsed.flags, FLAG_DONT_FRAGMENT);

		assert_eq!(Checksum::of(&buf).end(), [0, 0]);
	}

	#[test]
	fn rejects_short_buffers() {
		assert!(matches!(IpHeader::unmarshal(&[0u8; 19]), Err(Error::BadHeader)));
	}
}
