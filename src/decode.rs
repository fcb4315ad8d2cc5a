use std::net::IpAddr;
use std::sync::Arc;

use etherparse::{NetHeaders, PacketHeaders, TransportHeader};

use crate::errors::DecodeError;
use crate::flow::{FlowKey, Protocol};

const ETHERNET_HEADER_LEN: usize = 14;
const DNS_PORT: u16 = 53;

/// A single raw captured unit of traffic. Immutable once captured.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    /// Capture timestamp, milliseconds since the unix epoch.
    pub ts_ms: u64,
    pub interface: Arc<str>,
}

impl Frame {
    pub fn new(data: Vec<u8>, ts_ms: u64, interface: Arc<str>) -> Self {
        Self {
            data,
            ts_ms,
            interface,
        }
    }
}

/// Compact decoded record derived from exactly one `Frame`. Owned by the
/// pipeline stage that produced it and passed by value downstream.
#[derive(Debug, Clone)]
pub struct ParsedPacket {
    pub interface: Arc<str>,
    pub ts_ms: u64,
    pub source: IpAddr,
    pub destination: IpAddr,
    pub protocol: Protocol,
    /// Wire length of the whole frame in bytes.
    pub size: u64,
    pub source_port: Option<u16>,
    pub destination_port: Option<u16>,
    /// TCP SYN without ACK, the unit the SYN-flood metric counts.
    pub syn: bool,
    /// UDP datagram to or from port 53.
    pub dns_query: bool,
}

impl ParsedPacket {
    pub fn flow_key(&self) -> FlowKey {
        FlowKey::new(self.source, self.protocol)
    }
}

/// Decodes just enough of a frame to classify it: link and network headers,
/// plus the transport ports/flags the flood metrics need. Pure function,
/// safe to call on multiple frames concurrently. Truncated or garbled input
/// yields `MalformedFrame`, never a panic.
pub fn decode(frame: &Frame) -> Result<ParsedPacket, DecodeError> {
    if frame.data.len() < ETHERNET_HEADER_LEN {
        return Err(DecodeError::MalformedFrame(format!(
            "{} bytes, below ethernet header size",
            frame.data.len()
        )));
    }

    let headers = PacketHeaders::from_ethernet_slice(&frame.data)
        .map_err(|e| DecodeError::MalformedFrame(e.to_string()))?;

    let (source, destination) = match &headers.net {
        Some(NetHeaders::Ipv4(ipv4, _)) => (
            IpAddr::from(ipv4.source),
            IpAddr::from(ipv4.destination),
        ),
        Some(NetHeaders::Ipv6(ipv6, _)) => (
            IpAddr::from(ipv6.source),
            IpAddr::from(ipv6.destination),
        ),
        None => return Err(DecodeError::UnknownLinkType),
    };

    let mut packet = ParsedPacket {
        interface: frame.interface.clone(),
        ts_ms: frame.ts_ms,
        source,
        destination,
        protocol: Protocol::Other,
        size: frame.data.len() as u64,
        source_port: None,
        destination_port: None,
        syn: false,
        dns_query: false,
    };

    match &headers.transport {
        Some(TransportHeader::Tcp(tcp)) => {
            packet.protocol = Protocol::Tcp;
            packet.source_port = Some(tcp.source_port);
            packet.destination_port = Some(tcp.destination_port);
            packet.syn = tcp.syn && !tcp.ack;
        }
        Some(TransportHeader::Udp(udp)) => {
            packet.source_port = Some(udp.source_port);
            packet.destination_port = Some(udp.destination_port);
            if udp.source_port == DNS_PORT || udp.destination_port == DNS_PORT {
                packet.protocol = Protocol::Dns;
                // Queries flow toward the resolver; responses come back from it.
                packet.dns_query = udp.destination_port == DNS_PORT;
            } else {
                packet.protocol = Protocol::Udp;
            }
        }
        Some(TransportHeader::Icmpv4(_)) | Some(TransportHeader::Icmpv6(_)) => {
            packet.protocol = Protocol::Icmp;
        }
        _ => {}
    }

    Ok(packet)
}
