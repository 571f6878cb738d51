// Packet sources feeding the dispatch pipeline
pub mod file;
pub mod frame;
pub mod live;
pub mod udp;

pub use file::PcapFileSource;
pub use frame::{decode_frame, LinkKind};
pub use live::{LiveCapture, LiveCaptureConfig};
pub use udp::UdpListener;

use anyhow::Result;
use pcap::{Activated, Capture, Error as PcapError};
use pcap_file::DataLink;
use tracing::{debug, warn};

use crate::packet::{timeval_to_system_time, CapturedDatagram};

/// What a single read from a capture source produced.
#[derive(Debug)]
pub enum SourceEvent {
    Datagram(CapturedDatagram),
    /// Read timed out with nothing to report; lets the producer check for shutdown.
    Idle,
    /// The source has no more traffic and never will.
    Exhausted,
}

/// A producer of UDP datagrams for the worker pool.
pub trait CaptureSource: Send {
    fn next_event(&mut self) -> Result<SourceEvent>;

    /// Link type of the frames in `CapturedDatagram::frame`.
    fn link_type(&self) -> DataLink;

    fn describe(&self) -> String;
}

/// Pull frames from a libpcap handle until one decodes to a UDP datagram.
///
/// With `tolerate_errors` set, read errors are logged and skipped, which suits
/// offline files; otherwise they end the capture.
pub(crate) fn read_next<T: Activated + ?Sized>(
    capture: &mut Capture<T>,
    kind: LinkKind,
    tolerate_errors: bool,
    sequence: &mut u64,
) -> Result<SourceEvent> {
    loop {
        let packet = match capture.next_packet() {
            Ok(packet) => packet,
            Err(PcapError::TimeoutExpired) => return Ok(SourceEvent::Idle),
            Err(PcapError::NoMorePackets) => return Ok(SourceEvent::Exhausted),
            Err(e) if tolerate_errors => {
                warn!("Error reading packet #{}: {}", *sequence + 1, e);
                *sequence += 1;
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        *sequence += 1;
        let timestamp = timeval_to_system_time(packet.header.ts.tv_sec as i64, packet.header.ts.tv_usec as i64);

        match decode_frame(kind, packet.data, packet.header.len, timestamp) {
            Some(datagram) => return Ok(SourceEvent::Datagram(datagram)),
            None => {
                debug!("Skipping frame {}: not UDP over IP", *sequence);
                continue;
            }
        }
    }
}

/// Map a libpcap datalink to the decoder and the capture-file link type.
pub(crate) fn link_for(capture_dlt: i32) -> Result<(LinkKind, DataLink)> {
    let kind = LinkKind::from_datalink(capture_dlt)
        .ok_or_else(|| anyhow::anyhow!("Unsupported link type: {}", capture_dlt))?;
    Ok((kind, DataLink::from(capture_dlt as u32)))
}
