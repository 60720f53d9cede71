//! IPv4 packet codec
//!
//! Parses raw packets read from the virtual interface into a borrowed
//! [`PacketView`] and rebuilds them with a small set of mutations applied,
//! recomputing lengths and checksums so the output is a valid packet.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::ops::Range;

use byteorder::{BigEndian, ByteOrder};

use crate::error::{Error, Result};

pub const IPV4_MIN_HEADER_LEN: usize = 20;
pub const TCP_MIN_HEADER_LEN: usize = 20;
pub const UDP_HEADER_LEN: usize = 8;
pub const MAX_PACKET_LEN: usize = 65535;

const IPV4_VERSION: u8 = 4;
const DEFAULT_TTL: u8 = 64;
const FLAG_DONT_FRAGMENT: u16 = 0x4000;
const FLAG_MORE_FRAGMENTS: u16 = 0x2000;
const FRAGMENT_OFFSET_MASK: u16 = 0x1FFF;

// Header field offsets
const IP_TOTAL_LEN: usize = 2;
const IP_FLAGS_FRAGMENT: usize = 6;
const IP_PROTOCOL: usize = 9;
const IP_CHECKSUM: usize = 10;
const IP_SRC: usize = 12;
const IP_DST: usize = 16;
const L4_DST_PORT: usize = 2;
const TCP_CHECKSUM: usize = 16;
const UDP_LENGTH: usize = 4;
const UDP_CHECKSUM: usize = 6;

/// IP protocol number carried by a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpProtocol {
    Tcp,
    Udp,
    Other(u8),
}

impl IpProtocol {
    pub fn number(&self) -> u8 {
        match self {
            IpProtocol::Tcp => 6,
            IpProtocol::Udp => 17,
            IpProtocol::Other(n) => *n,
        }
    }
}

impl From<u8> for IpProtocol {
    fn from(n: u8) -> Self {
        match n {
            6 => IpProtocol::Tcp,
            17 => IpProtocol::Udp,
            other => IpProtocol::Other(other),
        }
    }
}

/// Streaming one's-complement sum (RFC 1071). Handles odd-length chunks by
/// carrying the dangling byte into the next one; a trailing odd byte is
/// zero-padded only for the sum.
#[derive(Debug, Default, Clone)]
pub struct Checksum {
    sum: u64,
    pending: Option<u8>,
}

impl Checksum {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, mut data: &[u8]) -> &mut Self {
        if let Some(hi) = self.pending.take() {
            match data.split_first() {
                Some((lo, rest)) => {
                    self.sum += u64::from(u16::from_be_bytes([hi, *lo]));
                    data = rest;
                }
                None => {
                    self.pending = Some(hi);
                    return self;
                }
            }
        }
        let mut words = data.chunks_exact(2);
        for word in &mut words {
            self.sum += u64::from(BigEndian::read_u16(word));
        }
        if let [last] = words.remainder() {
            self.pending = Some(*last);
        }
        self
    }

    /// Folded 16-bit one's-complement sum (not yet inverted)
    pub fn folded(&self) -> u16 {
        let mut sum = self.sum;
        if let Some(hi) = self.pending {
            sum += u64::from(u16::from_be_bytes([hi, 0]));
        }
        while sum >> 16 != 0 {
            sum = (sum & 0xFFFF) + (sum >> 16);
        }
        sum as u16
    }

    /// Checksum field value
    pub fn finish(&self) -> u16 {
        !self.folded()
    }
}

/// Checksum of a single buffer
pub fn checksum(data: &[u8]) -> u16 {
    Checksum::new().add(data).finish()
}

/// Borrowed interpretation of an IPv4 datagram, optionally carrying a TCP or
/// UDP segment. Valid for as long as the underlying buffer.
#[derive(Debug, Clone, Copy)]
pub struct PacketView<'a> {
    bytes: &'a [u8],
    ip_header_len: usize,
    protocol: IpProtocol,
    source: Ipv4Addr,
    destination: Ipv4Addr,
    ports: Option<(u16, u16)>,
    transport_header_len: usize,
}

impl<'a> PacketView<'a> {
    pub fn source(&self) -> Ipv4Addr {
        self.source
    }

    pub fn destination(&self) -> Ipv4Addr {
        self.destination
    }

    pub fn protocol(&self) -> IpProtocol {
        self.protocol
    }

    pub fn source_port(&self) -> Option<u16> {
        self.ports.map(|(src, _)| src)
    }

    pub fn destination_port(&self) -> Option<u16> {
        self.ports.map(|(_, dst)| dst)
    }

    /// Destination as socket address, when the packet has a TCP/UDP header
    pub fn destination_socket(&self) -> Option<SocketAddrV4> {
        self.destination_port()
            .map(|port| SocketAddrV4::new(self.destination, port))
    }

    /// True when a TCP or UDP header was identified
    pub fn has_transport(&self) -> bool {
        self.ports.is_some()
    }

    pub fn is_tcp(&self) -> bool {
        self.has_transport() && self.protocol == IpProtocol::Tcp
    }

    pub fn is_udp(&self) -> bool {
        self.has_transport() && self.protocol == IpProtocol::Udp
    }

    pub fn total_len(&self) -> usize {
        self.bytes.len()
    }

    pub fn ip_header_len(&self) -> usize {
        self.ip_header_len
    }

    /// Byte range of the transport payload (or of everything after the IP
    /// header when no transport header was identified)
    pub fn payload_range(&self) -> Range<usize> {
        (self.ip_header_len + self.transport_header_len)..self.bytes.len()
    }

    pub fn payload(&self) -> &'a [u8] {
        &self.bytes[self.payload_range()]
    }

    /// The datagram bytes (exactly `total_len` long)
    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    fn transport_header(&self) -> &'a [u8] {
        &self.bytes[self.ip_header_len..self.ip_header_len + self.transport_header_len]
    }
}

/// Interpret `bytes` as an IPv4 packet
pub fn parse(bytes: &[u8]) -> Result<PacketView<'_>> {
    if bytes.len() < IPV4_MIN_HEADER_LEN {
        return Err(Error::MalformedPacket(format!(
            "{} bytes is shorter than an IPv4 header",
            bytes.len()
        )));
    }

    let version = bytes[0] >> 4;
    if version != IPV4_VERSION {
        return Err(Error::MalformedPacket(format!("unsupported IP version {}", version)));
    }

    let ip_header_len = usize::from(bytes[0] & 0x0F) * 4;
    if ip_header_len < IPV4_MIN_HEADER_LEN || ip_header_len > bytes.len() {
        return Err(Error::MalformedPacket(format!(
            "invalid IPv4 header length {}",
            ip_header_len
        )));
    }

    let total_len = usize::from(BigEndian::read_u16(&bytes[IP_TOTAL_LEN..]));
    if total_len < ip_header_len {
        return Err(Error::MalformedPacket(format!(
            "total length {} is smaller than the header",
            total_len
        )));
    }
    if total_len > bytes.len() {
        return Err(Error::MalformedPacket(format!(
            "truncated: total length {} but only {} bytes",
            total_len,
            bytes.len()
        )));
    }
    let bytes = &bytes[..total_len];

    let protocol = IpProtocol::from(bytes[IP_PROTOCOL]);
    let source = read_addr(&bytes[IP_SRC..]);
    let destination = read_addr(&bytes[IP_DST..]);

    // Only unfragmented datagrams carry a complete, checksummable segment
    let flags_fragment = BigEndian::read_u16(&bytes[IP_FLAGS_FRAGMENT..]);
    let fragmented =
        flags_fragment & FRAGMENT_OFFSET_MASK != 0 || flags_fragment & FLAG_MORE_FRAGMENTS != 0;

    let segment = &bytes[ip_header_len..];
    let (ports, transport_header_len) = match protocol {
        _ if fragmented => (None, 0),
        IpProtocol::Tcp => {
            if segment.len() < TCP_MIN_HEADER_LEN {
                return Err(Error::MalformedPacket("truncated TCP header".into()));
            }
            let data_offset = usize::from(segment[12] >> 4) * 4;
            if data_offset < TCP_MIN_HEADER_LEN || data_offset > segment.len() {
                return Err(Error::MalformedPacket(format!(
                    "invalid TCP data offset {}",
                    data_offset
                )));
            }
            (Some(read_ports(segment)), data_offset)
        }
        IpProtocol::Udp => {
            if segment.len() < UDP_HEADER_LEN {
                return Err(Error::MalformedPacket("truncated UDP header".into()));
            }
            let udp_len = usize::from(BigEndian::read_u16(&segment[UDP_LENGTH..]));
            if udp_len != segment.len() {
                return Err(Error::MalformedPacket(format!(
                    "UDP length {} disagrees with IP payload length {}",
                    udp_len,
                    segment.len()
                )));
            }
            (Some(read_ports(segment)), UDP_HEADER_LEN)
        }
        IpProtocol::Other(_) => (None, 0),
    };

    Ok(PacketView {
        bytes,
        ip_header_len,
        protocol,
        source,
        destination,
        ports,
        transport_header_len,
    })
}

/// Changes applied by [`rewrite`]
#[derive(Debug, Default, Clone, Copy)]
pub struct Mutations<'p> {
    pub source: Option<Ipv4Addr>,
    pub destination: Option<Ipv4Addr>,
    pub destination_port: Option<u16>,
    pub payload: Option<&'p [u8]>,
}

impl<'p> Mutations<'p> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn source(mut self, addr: Ipv4Addr) -> Self {
        self.source = Some(addr);
        self
    }

    pub fn destination(mut self, addr: Ipv4Addr) -> Self {
        self.destination = Some(addr);
        self
    }

    pub fn destination_port(mut self, port: u16) -> Self {
        self.destination_port = Some(port);
        self
    }

    pub fn payload(mut self, payload: &'p [u8]) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// Serialize `view` with `mutations` applied. IP total length, UDP length and
/// all checksums are recomputed; everything else is copied verbatim.
pub fn rewrite(view: &PacketView<'_>, mutations: &Mutations<'_>) -> Result<Vec<u8>> {
    if !view.has_transport() && (mutations.destination_port.is_some() || mutations.payload.is_some()) {
        return Err(Error::MalformedPacket(format!(
            "cannot rewrite ports or payload of a {:?} packet",
            view.protocol()
        )));
    }

    let payload = mutations.payload.unwrap_or_else(|| view.payload());
    let ip_header = &view.as_bytes()[..view.ip_header_len];
    let transport_header = view.transport_header();
    let total_len = ip_header.len() + transport_header.len() + payload.len();
    if total_len > MAX_PACKET_LEN {
        return Err(Error::MalformedPacket(format!(
            "rewritten packet would be {} bytes",
            total_len
        )));
    }

    let mut out = Vec::with_capacity(total_len);
    out.extend_from_slice(ip_header);
    out.extend_from_slice(transport_header);
    out.extend_from_slice(payload);

    // IP header
    BigEndian::write_u16(&mut out[IP_TOTAL_LEN..], total_len as u16);
    if let Some(src) = mutations.source {
        out[IP_SRC..IP_SRC + 4].copy_from_slice(&src.octets());
    }
    if let Some(dst) = mutations.destination {
        out[IP_DST..IP_DST + 4].copy_from_slice(&dst.octets());
    }
    BigEndian::write_u16(&mut out[IP_CHECKSUM..], 0);
    let ip_sum = checksum(&out[..ip_header.len()]);
    BigEndian::write_u16(&mut out[IP_CHECKSUM..], ip_sum);

    if !view.has_transport() {
        return Ok(out);
    }

    // Transport header
    let l4 = ip_header.len();
    if let Some(port) = mutations.destination_port {
        BigEndian::write_u16(&mut out[l4 + L4_DST_PORT..], port);
    }
    let segment_len = total_len - l4;
    let checksum_at = match view.protocol() {
        IpProtocol::Udp => {
            BigEndian::write_u16(&mut out[l4 + UDP_LENGTH..], segment_len as u16);
            l4 + UDP_CHECKSUM
        }
        _ => l4 + TCP_CHECKSUM,
    };
    BigEndian::write_u16(&mut out[checksum_at..], 0);

    let mut sum = transport_checksum(&out, view.protocol(), l4);
    if view.protocol() == IpProtocol::Udp && sum == 0 {
        // RFC 768: zero means "no checksum"
        sum = 0xFFFF;
    }
    BigEndian::write_u16(&mut out[checksum_at..], sum);

    Ok(out)
}

/// One's-complement checksum over the IPv4 pseudo-header and the segment
/// starting at `l4` in `packet`
fn transport_checksum(packet: &[u8], protocol: IpProtocol, l4: usize) -> u16 {
    let segment = &packet[l4..];
    let mut pseudo = [0u8; 12];
    pseudo[0..4].copy_from_slice(&packet[IP_SRC..IP_SRC + 4]);
    pseudo[4..8].copy_from_slice(&packet[IP_DST..IP_DST + 4]);
    pseudo[9] = protocol.number();
    BigEndian::write_u16(&mut pseudo[10..], segment.len() as u16);

    Checksum::new().add(&pseudo).add(segment).finish()
}

/// Verify the IPv4 header checksum of a packet
pub fn verify_ip_checksum(view: &PacketView<'_>) -> bool {
    Checksum::new()
        .add(&view.as_bytes()[..view.ip_header_len])
        .folded()
        == 0xFFFF
}

/// Verify the TCP/UDP checksum of a packet. Packets without a transport
/// header verify trivially.
pub fn verify_transport_checksum(view: &PacketView<'_>) -> bool {
    if !view.has_transport() {
        return true;
    }
    let bytes = view.as_bytes();
    let l4 = view.ip_header_len;
    let segment = &bytes[l4..];
    let mut pseudo = [0u8; 12];
    pseudo[0..4].copy_from_slice(&bytes[IP_SRC..IP_SRC + 4]);
    pseudo[4..8].copy_from_slice(&bytes[IP_DST..IP_DST + 4]);
    pseudo[9] = view.protocol().number();
    BigEndian::write_u16(&mut pseudo[10..], segment.len() as u16);

    Checksum::new().add(&pseudo).add(segment).folded() == 0xFFFF
}

/// Build a minimal IPv4/TCP packet (PSH|ACK, no options)
pub fn build_tcp(src: SocketAddrV4, dst: SocketAddrV4, payload: &[u8]) -> Result<Vec<u8>> {
    let mut segment = [0u8; TCP_MIN_HEADER_LEN];
    BigEndian::write_u16(&mut segment[0..], src.port());
    BigEndian::write_u16(&mut segment[2..], dst.port());
    BigEndian::write_u32(&mut segment[4..], 1);
    BigEndian::write_u32(&mut segment[8..], 1);
    segment[12] = ((TCP_MIN_HEADER_LEN / 4) as u8) << 4;
    segment[13] = 0x18;
    BigEndian::write_u16(&mut segment[14..], 0xFFFF);
    build(IpProtocol::Tcp, *src.ip(), *dst.ip(), &segment, payload)
}

/// Build a minimal IPv4/UDP packet
pub fn build_udp(src: SocketAddrV4, dst: SocketAddrV4, payload: &[u8]) -> Result<Vec<u8>> {
    let mut segment = [0u8; UDP_HEADER_LEN];
    BigEndian::write_u16(&mut segment[0..], src.port());
    BigEndian::write_u16(&mut segment[2..], dst.port());
    build(IpProtocol::Udp, *src.ip(), *dst.ip(), &segment, payload)
}

fn build(
    protocol: IpProtocol,
    src: Ipv4Addr,
    dst: Ipv4Addr,
    transport_header: &[u8],
    payload: &[u8],
) -> Result<Vec<u8>> {
    let mut header = [0u8; IPV4_MIN_HEADER_LEN];
    header[0] = (IPV4_VERSION << 4) | (IPV4_MIN_HEADER_LEN / 4) as u8;
    BigEndian::write_u16(&mut header[IP_FLAGS_FRAGMENT..], FLAG_DONT_FRAGMENT);
    header[8] = DEFAULT_TTL;
    header[IP_PROTOCOL] = protocol.number();
    header[IP_SRC..IP_SRC + 4].copy_from_slice(&src.octets());
    header[IP_DST..IP_DST + 4].copy_from_slice(&dst.octets());

    let mut draft = Vec::with_capacity(header.len() + transport_header.len() + payload.len());
    draft.extend_from_slice(&header);
    draft.extend_from_slice(transport_header);
    draft.extend_from_slice(payload);
    if draft.len() > MAX_PACKET_LEN {
        return Err(Error::MalformedPacket(format!("packet would be {} bytes", draft.len())));
    }
    let draft_len = draft.len() as u16;
    BigEndian::write_u16(&mut draft[IP_TOTAL_LEN..], draft_len);
    if protocol == IpProtocol::Udp {
        let udp_len = (transport_header.len() + payload.len()) as u16;
        BigEndian::write_u16(&mut draft[IPV4_MIN_HEADER_LEN + UDP_LENGTH..], udp_len);
    }

    // Let rewrite fill in the checksums
    let view = parse(&draft)?;
    rewrite(&view, &Mutations::new())
}

fn read_addr(bytes: &[u8]) -> Ipv4Addr {
    Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3])
}

fn read_ports(segment: &[u8]) -> (u16, u16) {
    (
        BigEndian::read_u16(&segment[0..]),
        BigEndian::read_u16(&segment[L4_DST_PORT..]),
    )
}
