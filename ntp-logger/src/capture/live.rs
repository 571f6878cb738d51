use anyhow::{Context, Result};
use pcap::{Active, Capture};
use pcap_file::DataLink;
use tracing::info;

use super::{link_for, read_next, CaptureSource, LinkKind, SourceEvent};

#[derive(Debug, Clone)]
pub struct LiveCaptureConfig {
    pub interface: String,
    pub snaplen: i32,
    pub promiscuous: bool,
    /// Read timeout, so the producer can notice shutdown on a quiet link
    pub timeout_ms: i32,
    /// BPF program applied in the kernel; `None` captures everything.
    pub filter: Option<String>,
}

impl Default for LiveCaptureConfig {
    fn default() -> Self {
        Self {
            interface: "eth0".to_string(),
            snaplen: 1024,
            promiscuous: false,
            timeout_ms: 1000,
            filter: Some("udp dst port 123".to_string()),
        }
    }
}

/// Frames from a network interface, read through libpcap.
pub struct LiveCapture {
    capture: Capture<Active>,
    kind: LinkKind,
    datalink: DataLink,
    interface: String,
    sequence: u64,
}

impl LiveCapture {
    pub fn open(config: &LiveCaptureConfig) -> Result<Self> {
        let mut capture = Capture::from_device(config.interface.as_str())
            .with_context(|| format!("Unknown capture device: {}", config.interface))?
            .promisc(config.promiscuous)
            .snaplen(config.snaplen)
            .timeout(config.timeout_ms)
            .open()
            .with_context(|| format!("Failed to open capture on {}", config.interface))?;

        if let Some(filter) = &config.filter {
            capture
                .filter(filter, true)
                .with_context(|| format!("Invalid capture filter: {}", filter))?;
        }

        let (kind, datalink) = link_for(capture.get_datalink().0)?;

        info!(
            "Capturing on {} (snaplen {}, promiscuous {}, link {:?})",
            config.interface, config.snaplen, config.promiscuous, kind
        );
        if let Some(filter) = &config.filter {
            info!("Capture filter: {}", filter);
        }

        Ok(Self {
            capture,
            kind,
            datalink,
            interface: config.interface.clone(),
            sequence: 0,
        })
    }
}

impl CaptureSource for LiveCapture {
    fn next_event(&mut self) -> Result<SourceEvent> {
        read_next(&mut self.capture, self.kind, false, &mut self.sequence)
    }

    fn link_type(&self) -> DataLink {
        self.datalink
    }

    fn describe(&self) -> String {
        format!("interface {}", self.interface)
    }
}
