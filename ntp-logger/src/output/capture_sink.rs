use pcap_file::pcap::{PcapHeader, PcapPacket, PcapWriter};
use pcap_file::DataLink;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use tracing::debug;

use super::{OutputError, RecordSink};
use crate::packet::CapturedDatagram;

/// Writes captured frames into a libpcap file.
pub struct CaptureSink {
    writer: PcapWriter<File>,
}

impl CaptureSink {
    /// Create the file and write the global header.
    pub fn create(path: &Path, link_type: DataLink, snaplen: u32) -> Result<Self, OutputError> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|source| OutputError::Create {
                path: path.to_path_buf(),
                source,
            })?;

        let header = PcapHeader {
            datalink: link_type,
            snaplen,
            ..Default::default()
        };
        let writer = PcapWriter::with_header(file, header)?;

        Ok(Self { writer })
    }
}

impl RecordSink for CaptureSink {
    fn write_record(&mut self, datagram: &CapturedDatagram) -> Result<(), OutputError> {
        if datagram.frame.is_empty() {
            debug!("No frame for datagram from {}, not written to capture file", datagram.source);
            return Ok(());
        }

        let packet = PcapPacket::new(datagram.since_epoch(), datagram.wire_len, &datagram.frame);
        self.writer.write_packet(&packet)?;
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<(), OutputError> {
        let mut file = self.writer.into_writer();
        file.flush()?;
        file.sync_all()?;
        Ok(())
    }
}
