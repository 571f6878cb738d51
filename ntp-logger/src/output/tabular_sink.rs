use csv::{Writer, WriterBuilder};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::path::Path;

use super::{OutputError, RecordSink};
use crate::ntp::NtpHeader;
use crate::packet::CapturedDatagram;

pub const TABULAR_HEADER: [&str; 17] = [
    "region",
    "timestamp",
    "ip",
    "srcport",
    "leap",
    "version",
    "mode",
    "stratum",
    "poll",
    "precision",
    "rootdelay",
    "rootdispersion",
    "refid",
    "reftime",
    "origintime",
    "rxtime",
    "txtime",
];

/// One CSV row. Field order must match `TABULAR_HEADER`.
#[derive(Debug, Serialize)]
struct NtpRow<'a> {
    region: &'a str,
    timestamp: u64,
    ip: String,
    srcport: u16,
    leap: u8,
    version: u8,
    mode: u8,
    stratum: u8,
    poll: i8,
    precision: i8,
    rootdelay: u32,
    rootdispersion: u32,
    refid: u32,
    // NTP timestamps keep only their seconds
    reftime: u32,
    origintime: u32,
    rxtime: u32,
    txtime: u32,
}

/// Writes decoded NTP headers as CSV rows.
pub struct TabularSink {
    writer: Writer<File>,
    region: String,
}

impl TabularSink {
    /// Create the file and write the header row.
    pub fn create(path: &Path, region: &str) -> Result<Self, OutputError> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|source| OutputError::Create {
                path: path.to_path_buf(),
                source,
            })?;

        let mut writer = WriterBuilder::new().has_headers(false).from_writer(file);
        writer.write_record(TABULAR_HEADER)?;
        writer.flush()?;

        Ok(Self {
            writer,
            region: region.to_string(),
        })
    }
}

impl RecordSink for TabularSink {
    fn write_record(&mut self, datagram: &CapturedDatagram) -> Result<(), OutputError> {
        let header = NtpHeader::parse(&datagram.payload)
            .ok_or(OutputError::Truncated(datagram.payload.len()))?;

        let row = NtpRow {
            region: &self.region,
            timestamp: datagram.since_epoch().as_secs(),
            ip: datagram.source_ip().to_string(),
            srcport: datagram.source.port(),
            leap: header.leap,
            version: header.version,
            mode: header.mode,
            stratum: header.stratum,
            poll: header.poll,
            precision: header.precision,
            rootdelay: header.root_delay,
            rootdispersion: header.root_dispersion,
            refid: header.reference_id,
            reftime: header.reference_ts.seconds(),
            origintime: header.origin_ts.seconds(),
            rxtime: header.receive_ts.seconds(),
            txtime: header.transmit_ts.seconds(),
        };

        self.writer.serialize(row)?;
        self.writer.flush()?;
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<(), OutputError> {
        let mut writer = self.writer;
        writer.flush()?;
        Ok(())
    }
}
