use parking_lot::Mutex;
use pcap_file::pcap::{PcapPacket, PcapReader, PcapWriter};
use pcap_file::DataLink;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use time::macros::datetime;
use time::OffsetDateTime;

use ntp_logger::capture::frame::build_ipv4_udp;
use ntp_logger::capture::{CaptureSource, PcapFileSource};
use ntp_logger::output::{Clock, OutputConfig, OutputFormat, OutputManager, TABULAR_HEADER};
use ntp_logger::pipeline::{drive_capture, HandlerConfig, OverflowPolicy, PacketHandler, PoolConfig, StatsSnapshot, WorkerPool};
use ntp_logger::prefix::PrefixStore;
use ntp_logger::responder::Responder;

struct FixedClock(OffsetDateTime);

impl Clock for FixedClock {
    fn now(&self) -> OffsetDateTime {
        self.0
    }
}

#[derive(Default)]
struct RecordingResponder {
    sent: Mutex<Vec<(Vec<u8>, SocketAddr)>>,
}

impl Responder for RecordingResponder {
    fn send_to(&self, datagram: &[u8], dest: SocketAddr) -> io::Result<usize> {
        self.sent.lock().push((datagram.to_vec(), dest));
        Ok(datagram.len())
    }
}

fn ntp_request(version: u8, transmit: u64) -> Vec<u8> {
    let mut payload = vec![0u8; 48];
    payload[0] = (version << 3) | 3;
    payload[40..48].copy_from_slice(&transmit.to_be_bytes());
    payload
}

fn ethernet(src: &str, dest_port: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x00, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x08, 0x00];
    frame.extend(build_ipv4_udp(src.parse().unwrap(), Ipv4Addr::new(192, 0, 2, 10), dest_port, payload).unwrap());
    frame
}

fn write_capture(path: &Path, frames: &[Vec<u8>]) {
    let file = std::fs::File::create(path).unwrap();
    let mut writer = PcapWriter::new(file).unwrap();
    for (i, frame) in frames.iter().enumerate() {
        let ts = Duration::from_secs(1_700_000_000 + i as u64);
        writer.write_packet(&PcapPacket::new(ts, frame.len() as u32, frame)).unwrap();
    }
}

struct Run {
    totals: StatsSnapshot,
    responder: Arc<RecordingResponder>,
    output: PathBuf,
}

fn replay(dir: &Path, frames: &[Vec<u8>], format: OutputFormat) -> Run {
    let input = dir.join("input.pcap");
    write_capture(&input, frames);

    let list = dir.join("prefixes.txt");
    std::fs::write(&list, "# monitored networks\n203.0.113.0/24\n2001:db8::/32\n").unwrap();

    let out = dir.join("out");
    std::fs::create_dir_all(&out).unwrap();

    let mut source = PcapFileSource::open(&input).unwrap();
    let output = Arc::new(OutputManager::new(
        OutputConfig {
            directory: out.clone(),
            file_prefix: "ntp".to_string(),
            format,
            region: "west".to_string(),
            link_type: source.link_type(),
            snaplen: 65535,
        },
        Box::new(FixedClock(datetime!(2024-03-10 12:00 UTC))),
    ));

    let responder = Arc::new(RecordingResponder::default());
    let shared: Arc<dyn Responder> = responder.clone();
    let handler = Arc::new(PacketHandler::new(
        HandlerConfig::default(),
        output.clone(),
        Arc::new(PrefixStore::from_file(&list).unwrap()),
        Some(shared),
    ));

    let config = PoolConfig { workers: 3, queue_capacity: 4, overflow: OverflowPolicy::Block, pin_cores: false };
    let pool = WorkerPool::start(&config, handler);
    let running = AtomicBool::new(true);
    drive_capture(&mut source, &pool, &running).unwrap();
    let totals = pool.shutdown();
    output.close().unwrap();

    let name = format!("ntp-2024-03-10.{}", format.extension());
    Run { totals, responder, output: out.join(name) }
}

#[test]
fn test_listed_client_gets_one_row_and_one_reply() {
    let dir = tempfile::tempdir().unwrap();
    let run = replay(
        dir.path(),
        &[ethernet("203.0.113.7:51000", 123, &ntp_request(4, 0xE900_0010_0000_0000))],
        OutputFormat::Tabular,
    );

    let content = std::fs::read_to_string(&run.output).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0], TABULAR_HEADER.join(","));
    assert!(lines[1].starts_with("west,1700000000,203.0.113.7,51000,0,4,3,"), "{}", lines[1]);

    let sent = run.responder.sent.lock();
    assert_eq!(sent.len(), 1);
    let (reply, dest) = &sent[0];
    assert_eq!(*dest, "203.0.113.7:51000".parse::<SocketAddr>().unwrap());
    assert_eq!(reply[0], (4 << 3) | 4);
    // origin timestamp echoes the client's transmit timestamp
    assert_eq!(&reply[24..32], &0xE900_0010_0000_0000u64.to_be_bytes());
}

#[test]
fn test_unlisted_client_is_answered_but_not_logged() {
    let dir = tempfile::tempdir().unwrap();
    let run = replay(
        dir.path(),
        &[ethernet("198.51.100.20:40000", 123, &ntp_request(3, 7))],
        OutputFormat::Tabular,
    );

    let content = std::fs::read_to_string(&run.output).unwrap();
    assert_eq!(content.lines().count(), 1);
    assert_eq!(run.totals.filtered, 1);
    assert_eq!(run.responder.sent.lock().len(), 1);
}

#[test]
fn test_non_ntp_traffic_is_ignored_entirely() {
    let dir = tempfile::tempdir().unwrap();
    let run = replay(
        dir.path(),
        &[
            ethernet("203.0.113.7:40000", 123, &[0x23; 20]),
            ethernet("203.0.113.7:40000", 53, &ntp_request(4, 1)),
            ethernet("203.0.113.1:40000", 123, &ntp_request(4, 1)),
        ],
        OutputFormat::Tabular,
    );

    let content = std::fs::read_to_string(&run.output).unwrap();
    assert_eq!(content.lines().count(), 1);
    assert!(run.responder.sent.lock().is_empty());
    assert_eq!(run.totals.not_ntp, 2);
    assert_eq!(run.totals.ignored, 1);
}

#[test]
fn test_capture_output_keeps_original_frames() {
    let dir = tempfile::tempdir().unwrap();
    let frames: Vec<Vec<u8>> = (0..50u64)
        .map(|i| ethernet(&format!("203.0.113.{}:40000", 10 + i), 123, &ntp_request(4, i)))
        .collect();
    let run = replay(dir.path(), &frames, OutputFormat::Capture);
    assert_eq!(run.totals.logged, 50);

    let mut reader = PcapReader::new(std::fs::File::open(&run.output).unwrap()).unwrap();
    assert_eq!(reader.header().datalink, DataLink::ETHERNET);

    let mut logged = Vec::new();
    while let Some(packet) = reader.next_packet() {
        logged.push(packet.unwrap().data.into_owned());
    }
    logged.sort();
    let mut expected = frames.clone();
    expected.sort();
    assert_eq!(logged, expected);
}
