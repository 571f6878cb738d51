use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// One captured UDP datagram, as handed from a capture source to the workers.
#[derive(Debug, Clone)]
pub struct CapturedDatagram {
    pub source: SocketAddr,
    pub dest_port: u16,
    pub payload: Vec<u8>,
    pub timestamp: SystemTime,
    /// Link-layer bytes as captured, used by the pcap sink. Empty when the
    /// source could not produce a frame.
    pub frame: Vec<u8>,
    /// Original on-wire length of the frame
    pub wire_len: u32,
}

impl CapturedDatagram {
    pub fn new(source: SocketAddr, dest_port: u16, payload: Vec<u8>, timestamp: SystemTime) -> Self {
        Self {
            source,
            dest_port,
            payload,
            timestamp,
            frame: Vec::new(),
            wire_len: 0,
        }
    }

    pub fn with_frame(mut self, frame: Vec<u8>, wire_len: u32) -> Self {
        self.wire_len = wire_len.max(frame.len() as u32);
        self.frame = frame;
        self
    }

    pub fn source_ip(&self) -> IpAddr {
        self.source.ip()
    }

    /// Capture time relative to the Unix epoch; clamps pre-epoch times to zero.
    pub fn since_epoch(&self) -> Duration {
        self.timestamp.duration_since(UNIX_EPOCH).unwrap_or_default()
    }
}

/// Convert a libpcap `timeval` style pair into a `SystemTime`.
pub fn timeval_to_system_time(secs: i64, usecs: i64) -> SystemTime {
    if secs < 0 {
        return UNIX_EPOCH;
    }
    UNIX_EPOCH + Duration::from_secs(secs as u64) + Duration::from_micros(usecs.max(0) as u64)
}
