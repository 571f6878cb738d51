use anyhow::{Context, Result};
use pcap::{Capture, Offline};
use pcap_file::DataLink;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::{link_for, read_next, CaptureSource, LinkKind, SourceEvent};

/// Replays a recorded capture file through the pipeline.
pub struct PcapFileSource {
    capture: Capture<Offline>,
    kind: LinkKind,
    datalink: DataLink,
    sequence: u64,
    file_path: PathBuf,
}

impl PcapFileSource {
    pub fn open(file_path: &Path) -> Result<Self> {
        debug!("Opening PCAP file with libpcap: {}", file_path.display());

        let capture = Capture::from_file(file_path)
            .with_context(|| format!("Failed to open PCAP file: {}", file_path.display()))?;
        let (kind, datalink) = link_for(capture.get_datalink().0)?;

        info!("Replaying {} (link {:?})", file_path.display(), kind);

        Ok(Self {
            capture,
            kind,
            datalink,
            sequence: 0,
            file_path: file_path.to_path_buf(),
        })
    }

    /// Frames read so far, including ones that were not UDP.
    pub fn frames_read(&self) -> u64 {
        self.sequence
    }
}

impl CaptureSource for PcapFileSource {
    fn next_event(&mut self) -> Result<SourceEvent> {
        read_next(&mut self.capture, self.kind, true, &mut self.sequence)
    }

    fn link_type(&self) -> DataLink {
        self.datalink
    }

    fn describe(&self) -> String {
        format!("file {}", self.file_path.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::tests::ethernet_frame;
    use pcap_file::pcap::{PcapPacket, PcapWriter};
    use std::net::SocketAddr;
    use std::time::Duration;

    #[test]
    fn test_replay_skips_non_udp_frames() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.pcap");

        let src: SocketAddr = "203.0.113.7:40000".parse().unwrap();
        let ntp = ethernet_frame(src, 123, &[0x23; 48]);
        let mut tcp = ethernet_frame(src, 80, &[0; 10]);
        tcp[14 + 9] = 6;

        {
            let file = std::fs::File::create(&path).unwrap();
            let mut writer = PcapWriter::new(file).unwrap();
            for (i, frame) in [&tcp, &ntp].iter().enumerate() {
                let packet = PcapPacket::new(Duration::from_secs(1_700_000_000 + i as u64), frame.len() as u32, frame);
                writer.write_packet(&packet).unwrap();
            }
        }

        let mut source = PcapFileSource::open(&path).unwrap();
        assert_eq!(source.link_type(), DataLink::ETHERNET);

        match source.next_event().unwrap() {
            SourceEvent::Datagram(d) => {
                assert_eq!(d.source, src);
                assert_eq!(d.since_epoch().as_secs(), 1_700_000_001);
            }
            other => panic!("expected datagram, got {:?}", other),
        }
        assert!(matches!(source.next_event().unwrap(), SourceEvent::Exhausted));
        assert_eq!(source.frames_read(), 2);
    }

    #[test]
    fn test_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(PcapFileSource::open(&dir.path().join("missing.pcap")).is_err());
    }
}
