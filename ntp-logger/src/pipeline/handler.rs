use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info, warn};

use super::PipelineStats;
use crate::ntp::{build_response, validate, ProtocolVerdict, ResponseParams, NTP_PORT};
use crate::output::OutputManager;
use crate::packet::CapturedDatagram;
use crate::prefix::{IgnorePolicy, PrefixStore};
use crate::responder::Responder;

#[derive(Debug, Clone)]
pub struct HandlerConfig {
    /// Only datagrams addressed to this port are considered
    pub monitored_port: u16,
    pub ignore: IgnorePolicy,
    pub response: ResponseParams,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            monitored_port: NTP_PORT,
            ignore: IgnorePolicy::default(),
            response: ResponseParams::default(),
        }
    }
}

/// Where a datagram ended up on the logging path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    WrongPort,
    NotNtp,
    Ignored,
    Filtered,
    Logged,
    LogFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    pub disposition: Disposition,
    pub responded: bool,
}

/// Per-packet processing shared by all workers. Holds no mutable state of its
/// own; the output manager is the only synchronized resource it touches.
pub struct PacketHandler {
    config: HandlerConfig,
    output: Arc<OutputManager>,
    prefixes: Arc<PrefixStore>,
    responder: Option<Arc<dyn Responder>>,
    stats: Arc<PipelineStats>,
}

impl PacketHandler {
    pub fn new(
        config: HandlerConfig,
        output: Arc<OutputManager>,
        prefixes: Arc<PrefixStore>,
        responder: Option<Arc<dyn Responder>>,
    ) -> Self {
        Self {
            config,
            output,
            prefixes,
            responder,
            stats: Arc::new(PipelineStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }

    pub fn handle(&self, datagram: &CapturedDatagram) -> Outcome {
        PipelineStats::bump(&self.stats.received);

        if datagram.dest_port != self.config.monitored_port {
            PipelineStats::bump(&self.stats.not_ntp);
            return Outcome { disposition: Disposition::WrongPort, responded: false };
        }

        let version = match validate(&datagram.payload) {
            ProtocolVerdict::Ntp { version, .. } => version,
            ProtocolVerdict::NotNtp => {
                PipelineStats::bump(&self.stats.not_ntp);
                return Outcome { disposition: Disposition::NotNtp, responded: false };
            }
        };

        let ip = datagram.source_ip();
        if self.config.ignore.should_ignore(&ip) {
            PipelineStats::bump(&self.stats.ignored);
            debug!("Ignoring NTP packet from {}", ip);
            return Outcome { disposition: Disposition::Ignored, responded: false };
        }

        // Snapshot taken at admission; a concurrent reload cannot change it under us
        let prefixes = self.prefixes.snapshot();
        let disposition = if prefixes.matches(&ip) {
            self.log(datagram, version)
        } else {
            PipelineStats::bump(&self.stats.filtered);
            Disposition::Filtered
        };

        let responded = self.respond(datagram, version);
        Outcome { disposition, responded }
    }

    fn log(&self, datagram: &CapturedDatagram, version: u8) -> Disposition {
        match self.output.write(datagram) {
            Ok(rotation) => {
                PipelineStats::bump(&self.stats.logged);
                info!("Logged: {} (NTP version {})", datagram.source_ip(), version);

                if rotation.rotated() {
                    if let Err(e) = self.prefixes.reload() {
                        warn!("Keeping previous prefix list, reload failed: {:#}", e);
                    }
                }
                Disposition::Logged
            }
            Err(e) => {
                PipelineStats::bump(&self.stats.log_errors);
                warn!("Packet from {} not persisted: {}", datagram.source_ip(), e);
                Disposition::LogFailed
            }
        }
    }

    fn respond(&self, datagram: &CapturedDatagram, version: u8) -> bool {
        let Some(responder) = &self.responder else {
            return false;
        };

        let Some(response) = build_response(version, &datagram.payload, &self.config.response, SystemTime::now()) else {
            return false;
        };

        match responder.send_to(&response, datagram.source) {
            Ok(_) => {
                PipelineStats::bump(&self.stats.responses);
                true
            }
            Err(e) => {
                PipelineStats::bump(&self.stats.send_errors);
                warn!("Error sending NTP response to {}: {}", datagram.source, e);
                false
            }
        }
    }
}
