use std::fmt;
use std::net::IpAddr;

use serde::Serialize;

/// Closed set of decoded protocol classes. `Dns` is UDP traffic on port 53,
/// split out because query floods are tracked separately from generic UDP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Protocol {
    Tcp,
    Udp,
    Dns,
    Icmp,
    Other,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
            Protocol::Dns => "DNS",
            Protocol::Icmp => "ICMP",
            Protocol::Other => "OTHER",
        };
        write!(f, "{}", name)
    }
}

/// Aggregation key: traffic is bucketed per source address and protocol
/// class. The destination is kept when per-target tracking is wanted; flood
/// detection keys on the source alone, so it defaults to `None`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct FlowKey {
    pub source: IpAddr,
    pub protocol: Protocol,
    pub destination: Option<IpAddr>,
}

impl FlowKey {
    pub fn new(source: IpAddr, protocol: Protocol) -> Self {
        Self {
            source,
            protocol,
            destination: None,
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.destination {
            Some(dst) => write!(f, "{} {} -> {}", self.protocol, self.source, dst),
            None => write!(f, "{} {}", self.protocol, self.source),
        }
    }
}
