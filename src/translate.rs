//! Stateless IPv4/IPv6 header translation.
//!
//! The dispatcher only depends on the `Translator` trait: give it a
//! destination descriptor, the direction, and a raw network-layer
//! packet, and it either writes a translated packet or silently drops
//! untranslatable input. `Siit` is the shipped implementation: a
//! stateless per-packet mapping between the local IPv4 address and the
//! PLAT-prefixed IPv6 world, recomputing transport checksums itself.
//! No fragmentation support: fragments are untranslatable input.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::os::fd::BorrowedFd;

use tracing::{debug, warn};

use crate::config::NetworkConfig;
use crate::tun::{send_raw6, write_fd, TUN_HEADER_LEN};

const IPV4_HEADER_LEN: usize = 20;
const IPV6_HEADER_LEN: usize = 40;

const PROTO_ICMP: u8 = 1;
const PROTO_TCP: u8 = 6;
const PROTO_UDP: u8 = 17;
const PROTO_ICMPV6: u8 = 58;

const ICMP_ECHO_REPLY: u8 = 0;
const ICMP_ECHO_REQUEST: u8 = 8;
const ICMPV6_ECHO_REQUEST: u8 = 128;
const ICMPV6_ECHO_REPLY: u8 = 129;

/// Per-packet translation, side-effecting on success.
pub trait Translator {
    /// Translate `packet` and write the result to `dest`, or drop it.
    ///
    /// `from_ipv4 = true` means `packet` is an IPv4 packet headed for
    /// the IPv6 uplink; `false` means an IPv6 packet headed for the
    /// local IPv4 side.
    fn translate(&self, dest: BorrowedFd<'_>, cfg: &NetworkConfig, from_ipv4: bool, packet: &[u8]);
}

/// The shipped stateless translator.
pub struct Siit;

impl Translator for Siit {
    fn translate(&self, dest: BorrowedFd<'_>, cfg: &NetworkConfig, from_ipv4: bool, packet: &[u8]) {
        if from_ipv4 {
            let Some((out, dst)) = translate_4to6(cfg, packet) else {
                return;
            };
            if let Err(e) = send_raw6(dest, &out, dst) {
                warn!(error = %e, "raw socket send failed");
            }
        } else {
            let Some(out) = translate_6to4(cfg, packet) else {
                return;
            };
            // The tun device expects the packet-info header back.
            let mut frame = Vec::with_capacity(TUN_HEADER_LEN + out.len());
            frame.extend_from_slice(&0u16.to_ne_bytes());
            frame.extend_from_slice(&(libc::ETH_P_IP as u16).to_be_bytes());
            frame.extend_from_slice(&out);
            if let Err(e) = write_fd(dest, &frame) {
                warn!(error = %e, "tun write failed");
            }
        }
    }
}

/// IPv4 -> IPv6: source becomes the local IPv6 address, destination is
/// the IPv4 destination embedded in the PLAT prefix. Returns the packet
/// and its destination (the raw socket needs it for routing).
pub(crate) fn translate_4to6(cfg: &NetworkConfig, packet: &[u8]) -> Option<(Vec<u8>, Ipv6Addr)> {
    if packet.len() < IPV4_HEADER_LEN || packet[0] >> 4 != 4 {
        return None;
    }
    let ihl = usize::from(packet[0] & 0xf) * 4;
    let total_len = usize::from(u16::from_be_bytes([packet[2], packet[3]]));
    if ihl < IPV4_HEADER_LEN || total_len < ihl || total_len > packet.len() {
        return None;
    }
    // MF set or non-zero offset: a stateless mapping cannot reassemble.
    let frag = u16::from_be_bytes([packet[6], packet[7]]);
    if frag & 0x3fff != 0 {
        return None;
    }

    let ttl = packet[8];
    let proto = packet[9];
    let dst4 = Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]);
    let payload = &packet[ihl..total_len];

    let src6 = cfg.ipv6_local_address;
    let dst6 = embed_ipv4(cfg.plat_prefix, dst4);

    let (next_header, body) = match proto {
        PROTO_TCP | PROTO_UDP => (proto, checksum_transport_v6(proto, payload, src6, dst6)?),
        PROTO_ICMP => (PROTO_ICMPV6, icmp_to_icmpv6(payload, src6, dst6)?),
        _ => return None,
    };

    if IPV6_HEADER_LEN + body.len() > usize::from(cfg.mtu) {
        debug!(len = body.len(), "translated packet exceeds MTU, dropping");
        return None;
    }

    let mut out = Vec::with_capacity(IPV6_HEADER_LEN + body.len());
    out.extend_from_slice(&[0x60, 0, 0, 0]);
    out.extend_from_slice(&(body.len() as u16).to_be_bytes());
    out.push(next_header);
    out.push(ttl);
    out.extend_from_slice(&src6.octets());
    out.extend_from_slice(&dst6.octets());
    out.extend_from_slice(&body);
    Some((out, dst6))
}

/// IPv6 -> IPv4: source comes out of the PLAT prefix, destination is
/// the local IPv4 address.
pub(crate) fn translate_6to4(cfg: &NetworkConfig, packet: &[u8]) -> Option<Vec<u8>> {
    if packet.len() < IPV6_HEADER_LEN || packet[0] >> 4 != 6 {
        return None;
    }
    let payload_len = usize::from(u16::from_be_bytes([packet[4], packet[5]]));
    if packet.len() < IPV6_HEADER_LEN + payload_len {
        return None;
    }
    let next_header = packet[6];
    let hop_limit = packet[7];
    let mut src = [0u8; 16];
    src.copy_from_slice(&packet[8..24]);
    let mut dst = [0u8; 16];
    dst.copy_from_slice(&packet[24..40]);
    let src6 = Ipv6Addr::from(src);
    let dst6 = Ipv6Addr::from(dst);

    // Only traffic for us, from the translated IPv4 internet.
    if dst6 != cfg.ipv6_local_subnet && dst6 != cfg.ipv6_local_address {
        return None;
    }
    let src4 = extract_ipv4(cfg.plat_prefix, src6)?;
    let dst4 = cfg.ipv4_local_address;
    let payload = &packet[IPV6_HEADER_LEN..IPV6_HEADER_LEN + payload_len];

    let (proto, body) = match next_header {
        PROTO_TCP | PROTO_UDP => (
            next_header,
            checksum_transport_v4(next_header, payload, src4, dst4)?,
        ),
        PROTO_ICMPV6 => (PROTO_ICMP, icmpv6_to_icmp(payload)?),
        _ => return None,
    };

    if IPV4_HEADER_LEN + body.len() > usize::from(cfg.ipv4_mtu) {
        debug!(len = body.len(), "translated packet exceeds IPv4 MTU, dropping");
        return None;
    }

    let total_len = (IPV4_HEADER_LEN + body.len()) as u16;
    let mut out = Vec::with_capacity(usize::from(total_len));
    out.push(0x45);
    out.push(0);
    out.extend_from_slice(&total_len.to_be_bytes());
    out.extend_from_slice(&[0, 0]); // identification
    out.extend_from_slice(&0x4000u16.to_be_bytes()); // DF, no fragments
    out.push(hop_limit);
    out.push(proto);
    out.extend_from_slice(&[0, 0]); // checksum placeholder
    out.extend_from_slice(&src4.octets());
    out.extend_from_slice(&dst4.octets());
    let header_sum = fold(sum_bytes(0, &out));
    out[10..12].copy_from_slice(&header_sum.to_be_bytes());
    out.extend_from_slice(&body);
    Some(out)
}

fn embed_ipv4(prefix: Ipv6Addr, addr: Ipv4Addr) -> Ipv6Addr {
    let mut octets = prefix.octets();
    octets[12..16].copy_from_slice(&addr.octets());
    Ipv6Addr::from(octets)
}

fn extract_ipv4(prefix: Ipv6Addr, addr: Ipv6Addr) -> Option<Ipv4Addr> {
    let a = addr.octets();
    let p = prefix.octets();
    if a[..12] != p[..12] {
        return None;
    }
    Some(Ipv4Addr::new(a[12], a[13], a[14], a[15]))
}

fn checksum_offset(proto: u8) -> usize {
    match proto {
        PROTO_UDP => 6,
        _ => 16, // TCP
    }
}

/// Recompute a TCP/UDP checksum against the IPv6 pseudo-header.
fn checksum_transport_v6(
    proto: u8,
    payload: &[u8],
    src: Ipv6Addr,
    dst: Ipv6Addr,
) -> Option<Vec<u8>> {
    let off = checksum_offset(proto);
    if payload.len() < off + 2 {
        return None;
    }
    let mut body = payload.to_vec();
    body[off] = 0;
    body[off + 1] = 0;
    let sum = sum_bytes(pseudo_v6(src, dst, proto, body.len() as u32), &body);
    let mut cksum = fold(sum);
    // In IPv6 a UDP checksum is mandatory; zero means "none".
    if proto == PROTO_UDP && cksum == 0 {
        cksum = 0xffff;
    }
    body[off..off + 2].copy_from_slice(&cksum.to_be_bytes());
    Some(body)
}

/// Recompute a TCP/UDP checksum against the IPv4 pseudo-header.
fn checksum_transport_v4(
    proto: u8,
    payload: &[u8],
    src: Ipv4Addr,
    dst: Ipv4Addr,
) -> Option<Vec<u8>> {
    let off = checksum_offset(proto);
    if payload.len() < off + 2 {
        return None;
    }
    let mut body = payload.to_vec();
    body[off] = 0;
    body[off + 1] = 0;
    let sum = sum_bytes(pseudo_v4(src, dst, proto, body.len() as u16), &body);
    let mut cksum = fold(sum);
    if proto == PROTO_UDP && cksum == 0 {
        cksum = 0xffff;
    }
    body[off..off + 2].copy_from_slice(&cksum.to_be_bytes());
    Some(body)
}

/// Echo request/reply is all a stateless translator can carry; other
/// ICMP types are dropped.
fn icmp_to_icmpv6(payload: &[u8], src: Ipv6Addr, dst: Ipv6Addr) -> Option<Vec<u8>> {
    if payload.len() < 8 {
        return None;
    }
    let new_type = match payload[0] {
        ICMP_ECHO_REQUEST => ICMPV6_ECHO_REQUEST,
        ICMP_ECHO_REPLY => ICMPV6_ECHO_REPLY,
        _ => return None,
    };
    let mut body = payload.to_vec();
    body[0] = new_type;
    body[1] = 0;
    body[2] = 0;
    body[3] = 0;
    // ICMPv6, unlike ICMP, checksums the pseudo-header too.
    let sum = sum_bytes(
        pseudo_v6(src, dst, PROTO_ICMPV6, body.len() as u32),
        &body,
    );
    let cksum = fold(sum);
    body[2..4].copy_from_slice(&cksum.to_be_bytes());
    Some(body)
}

fn icmpv6_to_icmp(payload: &[u8]) -> Option<Vec<u8>> {
    if payload.len() < 8 {
        return None;
    }
    let new_type = match payload[0] {
        ICMPV6_ECHO_REQUEST => ICMP_ECHO_REQUEST,
        ICMPV6_ECHO_REPLY => ICMP_ECHO_REPLY,
        _ => return None,
    };
    let mut body = payload.to_vec();
    body[0] = new_type;
    body[1] = 0;
    body[2] = 0;
    body[3] = 0;
    let cksum = fold(sum_bytes(0, &body));
    body[2..4].copy_from_slice(&cksum.to_be_bytes());
    Some(body)
}

fn sum_bytes(mut sum: u32, data: &[u8]) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for c in &mut chunks {
        sum += u32::from(u16::from_be_bytes([c[0], c[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(u16::from_be_bytes([*last, 0]));
    }
    sum
}

fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

fn pseudo_v6(src: Ipv6Addr, dst: Ipv6Addr, next_header: u8, len: u32) -> u32 {
    let mut sum = sum_bytes(0, &src.octets());
    sum = sum_bytes(sum, &dst.octets());
    sum = sum_bytes(sum, &len.to_be_bytes());
    sum + u32::from(next_header)
}

fn pseudo_v4(src: Ipv4Addr, dst: Ipv4Addr, proto: u8, len: u16) -> u32 {
    let mut sum = sum_bytes(0, &src.octets());
    sum = sum_bytes(sum, &dst.octets());
    sum + u32::from(proto) + u32::from(len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkConfig;

    fn test_config() -> NetworkConfig {
        NetworkConfig {
            ipv6_local_address: "2001:db8:1:2::464".parse().unwrap(),
            ipv6_local_subnet: "2001:db8:1:2::464".parse().unwrap(),
            ipv4_local_address: Ipv4Addr::new(192, 0, 0, 4),
            plat_prefix: "64:ff9b::".parse().unwrap(),
            mtu: 1500,
            ipv4_mtu: 1472,
        }
    }

    /// Verify a transport checksum: summing the pseudo-header and the
    /// body with the checksum in place must fold to zero.
    fn v6_checksum_ok(src: Ipv6Addr, dst: Ipv6Addr, proto: u8, body: &[u8]) -> bool {
        fold(sum_bytes(pseudo_v6(src, dst, proto, body.len() as u32), body)) == 0
    }

    fn v4_checksum_ok(src: Ipv4Addr, dst: Ipv4Addr, proto: u8, body: &[u8]) -> bool {
        fold(sum_bytes(pseudo_v4(src, dst, proto, body.len() as u16), body)) == 0
    }

    /// Minimal IPv4 packet with a valid header checksum.
    fn v4_packet(proto: u8, src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8]) -> Vec<u8> {
        let total = (IPV4_HEADER_LEN + payload.len()) as u16;
        let mut p = vec![0x45, 0];
        p.extend_from_slice(&total.to_be_bytes());
        p.extend_from_slice(&[0, 0, 0, 0]); // id, no fragment flags
        p.push(64); // ttl
        p.push(proto);
        p.extend_from_slice(&[0, 0]);
        p.extend_from_slice(&src.octets());
        p.extend_from_slice(&dst.octets());
        let sum = fold(sum_bytes(0, &p));
        p[10..12].copy_from_slice(&sum.to_be_bytes());
        p.extend_from_slice(payload);
        p
    }

    fn v6_packet(next: u8, src: Ipv6Addr, dst: Ipv6Addr, payload: &[u8]) -> Vec<u8> {
        let mut p = vec![0x60, 0, 0, 0];
        p.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        p.push(next);
        p.push(64);
        p.extend_from_slice(&src.octets());
        p.extend_from_slice(&dst.octets());
        p.extend_from_slice(payload);
        p
    }

    fn udp_payload(data: &[u8]) -> Vec<u8> {
        let len = (8 + data.len()) as u16;
        let mut u = vec![0x30, 0x39, 0x00, 0x35]; // sport 12345, dport 53
        u.extend_from_slice(&len.to_be_bytes());
        u.extend_from_slice(&[0, 0]); // checksum filled by translator
        u.extend_from_slice(data);
        u
    }

    #[test]
    fn udp_4to6_rewrites_addresses_and_checksum() {
        let cfg = test_config();
        let dst4 = Ipv4Addr::new(203, 0, 113, 9);
        let packet = v4_packet(PROTO_UDP, cfg.ipv4_local_address, dst4, &udp_payload(b"hello"));

        let (out, dst) = translate_4to6(&cfg, &packet).unwrap();
        assert_eq!(dst, "64:ff9b::cb00:7109".parse::<Ipv6Addr>().unwrap());
        assert_eq!(out[0] >> 4, 6);
        assert_eq!(out[6], PROTO_UDP);
        assert_eq!(out[7], 64); // hop limit carried from ttl
        assert_eq!(&out[8..24], &cfg.ipv6_local_address.octets());
        assert_eq!(&out[24..40], &dst.octets());
        let body = &out[IPV6_HEADER_LEN..];
        assert_eq!(body.len(), 13);
        assert!(v6_checksum_ok(cfg.ipv6_local_address, dst, PROTO_UDP, body));
    }

    #[test]
    fn tcp_6to4_rewrites_addresses_and_checksums() {
        let cfg = test_config();
        let src6: Ipv6Addr = "64:ff9b::808:808".parse().unwrap();
        // 20-byte TCP header, checksum arbitrary on input
        let mut tcp = vec![0u8; 20];
        tcp[13] = 0x12; // SYN+ACK
        let packet = v6_packet(PROTO_TCP, src6, cfg.ipv6_local_subnet, &tcp);

        let out = translate_6to4(&cfg, &packet).unwrap();
        assert_eq!(out[0], 0x45);
        assert_eq!(out[9], PROTO_TCP);
        assert_eq!(&out[12..16], &[8u8, 8, 8, 8]); // extracted from PLAT prefix
        assert_eq!(&out[16..20], &cfg.ipv4_local_address.octets());
        // IPv4 header checksum must verify
        assert_eq!(fold(sum_bytes(0, &out[..IPV4_HEADER_LEN])), 0);
        let body = &out[IPV4_HEADER_LEN..];
        assert!(v4_checksum_ok(
            Ipv4Addr::new(8, 8, 8, 8),
            cfg.ipv4_local_address,
            PROTO_TCP,
            body
        ));
    }

    #[test]
    fn icmp_echo_maps_to_icmpv6_echo() {
        let cfg = test_config();
        let dst4 = Ipv4Addr::new(198, 51, 100, 1);
        let mut icmp = vec![ICMP_ECHO_REQUEST, 0, 0, 0, 0, 1, 0, 1];
        icmp.extend_from_slice(b"ping");
        let packet = v4_packet(PROTO_ICMP, cfg.ipv4_local_address, dst4, &icmp);

        let (out, dst) = translate_4to6(&cfg, &packet).unwrap();
        assert_eq!(out[6], PROTO_ICMPV6);
        let body = &out[IPV6_HEADER_LEN..];
        assert_eq!(body[0], ICMPV6_ECHO_REQUEST);
        assert!(v6_checksum_ok(cfg.ipv6_local_address, dst, PROTO_ICMPV6, body));

        // And back: an echo reply from the far side
        let mut reply = vec![ICMPV6_ECHO_REPLY, 0, 0, 0, 0, 1, 0, 1];
        reply.extend_from_slice(b"ping");
        let src6 = embed_ipv4(cfg.plat_prefix, dst4);
        let v6 = v6_packet(PROTO_ICMPV6, src6, cfg.ipv6_local_subnet, &reply);
        let back = translate_6to4(&cfg, &v6).unwrap();
        assert_eq!(back[9], PROTO_ICMP);
        assert_eq!(back[IPV4_HEADER_LEN], ICMP_ECHO_REPLY);
        // Plain ICMP checksum, no pseudo-header
        assert_eq!(fold(sum_bytes(0, &back[IPV4_HEADER_LEN..])), 0);
    }

    #[test]
    fn untranslatable_input_is_dropped() {
        let cfg = test_config();
        let dst4 = Ipv4Addr::new(198, 51, 100, 1);

        // Fragment
        let mut frag = v4_packet(PROTO_UDP, cfg.ipv4_local_address, dst4, &udp_payload(b"x"));
        frag[6] = 0x20; // MF
        assert!(translate_4to6(&cfg, &frag).is_none());

        // Unknown transport protocol
        let gre = v4_packet(47, cfg.ipv4_local_address, dst4, &[0u8; 8]);
        assert!(translate_4to6(&cfg, &gre).is_none());

        // Truncated header
        assert!(translate_4to6(&cfg, &[0x45, 0, 0]).is_none());
        assert!(translate_6to4(&cfg, &[0x60, 0, 0]).is_none());

        // IPv6 source outside the PLAT prefix
        let src6: Ipv6Addr = "2001:db8:eeee::1".parse().unwrap();
        let v6 = v6_packet(PROTO_UDP, src6, cfg.ipv6_local_subnet, &udp_payload(b"x"));
        assert!(translate_6to4(&cfg, &v6).is_none());

        // IPv6 destination that is not ours
        let plat_src: Ipv6Addr = "64:ff9b::1".parse().unwrap();
        let other: Ipv6Addr = "2001:db8:ffff::1".parse().unwrap();
        let v6 = v6_packet(PROTO_UDP, plat_src, other, &udp_payload(b"x"));
        assert!(translate_6to4(&cfg, &v6).is_none());
    }

    #[test]
    fn oversize_result_is_dropped() {
        let mut cfg = test_config();
        cfg.mtu = 1280;
        let dst4 = Ipv4Addr::new(198, 51, 100, 1);
        let packet = v4_packet(
            PROTO_UDP,
            cfg.ipv4_local_address,
            dst4,
            &udp_payload(&[0u8; 1400]),
        );
        assert!(translate_4to6(&cfg, &packet).is_none());
    }
}
