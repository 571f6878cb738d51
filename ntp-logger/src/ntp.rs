use byteorder::{BigEndian, ByteOrder};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Size of a basic NTP header without extension fields or MAC.
pub const NTP_HEADER_LEN: usize = 48;

/// Well-known NTP port.
pub const NTP_PORT: u16 = 123;

/// Seconds between 1900-01-01 and 1970-01-01.
pub const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

pub const MODE_SERVER: u8 = 4;

const ORIGIN_OFFSET: usize = 24;
const TRANSMIT_OFFSET: usize = 40;

/// Result of classifying a UDP payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVerdict {
    Ntp { version: u8, mode: u8 },
    NotNtp,
}

impl ProtocolVerdict {
    pub fn is_ntp(&self) -> bool {
        matches!(self, ProtocolVerdict::Ntp { .. })
    }

    pub fn version(&self) -> Option<u8> {
        match self {
            ProtocolVerdict::Ntp { version, .. } => Some(*version),
            ProtocolVerdict::NotNtp => None,
        }
    }
}

/// Classify a payload as NTP based on its length and the first header byte.
///
/// Only modes 1 (symmetric active) through 5 (broadcast) and versions 1
/// through 4 are accepted. Control (6) and private (7) traffic is rejected.
pub fn validate(payload: &[u8]) -> ProtocolVerdict {
    if payload.len() < NTP_HEADER_LEN {
        return ProtocolVerdict::NotNtp;
    }

    let version = (payload[0] >> 3) & 0x07;
    let mode = payload[0] & 0x07;

    if !(1..=5).contains(&mode) || !(1..=4).contains(&version) {
        return ProtocolVerdict::NotNtp;
    }

    ProtocolVerdict::Ntp { version, mode }
}

/// 64-bit NTP timestamp: seconds since 1900 in the upper half, fraction in the lower.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct NtpTimestamp(pub u64);

impl NtpTimestamp {
    pub fn from_system_time(t: SystemTime) -> Self {
        let since = t.duration_since(UNIX_EPOCH).unwrap_or_default();
        let seconds = since.as_secs() + NTP_UNIX_OFFSET;
        let fraction = ((since.subsec_nanos() as u64) << 32) / 1_000_000_000;
        NtpTimestamp((seconds << 32) | fraction)
    }

    pub fn seconds(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn fraction(&self) -> u32 {
        self.0 as u32
    }
}

/// Every field of a decoded 48-byte NTP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NtpHeader {
    pub leap: u8,
    pub version: u8,
    pub mode: u8,
    pub stratum: u8,
    pub poll: i8,
    pub precision: i8,
    pub root_delay: u32,
    pub root_dispersion: u32,
    pub reference_id: u32,
    pub reference_ts: NtpTimestamp,
    pub origin_ts: NtpTimestamp,
    pub receive_ts: NtpTimestamp,
    pub transmit_ts: NtpTimestamp,
}

impl NtpHeader {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < NTP_HEADER_LEN {
            return None;
        }

        Some(Self {
            leap: data[0] >> 6,
            version: (data[0] >> 3) & 0x07,
            mode: data[0] & 0x07,
            stratum: data[1],
            poll: data[2] as i8,
            precision: data[3] as i8,
            root_delay: BigEndian::read_u32(&data[4..8]),
            root_dispersion: BigEndian::read_u32(&data[8..12]),
            reference_id: BigEndian::read_u32(&data[12..16]),
            reference_ts: NtpTimestamp(BigEndian::read_u64(&data[16..24])),
            origin_ts: NtpTimestamp(BigEndian::read_u64(&data[24..32])),
            receive_ts: NtpTimestamp(BigEndian::read_u64(&data[32..40])),
            transmit_ts: NtpTimestamp(BigEndian::read_u64(&data[40..48])),
        })
    }
}

/// Fixed values stamped into every synthesized reply.
#[derive(Debug, Clone)]
pub struct ResponseParams {
    pub stratum: u8,
    pub poll: i8,
    pub precision: i8,
    pub root_delay: u32,
    pub root_dispersion: u32,
    pub reference_id: [u8; 4],
    /// How far before "now" the reference timestamp claims the last sync happened.
    pub reference_offset: Duration,
}

impl Default for ResponseParams {
    fn default() -> Self {
        Self {
            stratum: 2,
            poll: 4,
            precision: -10,
            root_delay: 0,
            root_dispersion: 3,
            reference_id: [132, 239, 1, 6],
            reference_offset: Duration::from_secs(3600),
        }
    }
}

/// Build a server-mode reply for a validated request.
///
/// Returns `None` when the request is too short to carry a transmit timestamp.
pub fn build_response(
    version: u8,
    request: &[u8],
    params: &ResponseParams,
    now: SystemTime,
) -> Option<[u8; NTP_HEADER_LEN]> {
    if request.len() < NTP_HEADER_LEN {
        return None;
    }

    let mut response = [0u8; NTP_HEADER_LEN];

    // LI = 0, VN = version, Mode = server
    response[0] = ((version & 0x07) << 3) | MODE_SERVER;
    response[1] = params.stratum;
    response[2] = params.poll as u8;
    response[3] = params.precision as u8;

    BigEndian::write_u32(&mut response[4..8], params.root_delay);
    BigEndian::write_u32(&mut response[8..12], params.root_dispersion);
    response[12..16].copy_from_slice(&params.reference_id);

    let reference_time = now.checked_sub(params.reference_offset).unwrap_or(UNIX_EPOCH);
    let now_ts = NtpTimestamp::from_system_time(now);

    BigEndian::write_u64(&mut response[16..24], NtpTimestamp::from_system_time(reference_time).0);
    // Client's transmit time becomes our origin time, copied verbatim
    response[ORIGIN_OFFSET..ORIGIN_OFFSET + 8]
        .copy_from_slice(&request[TRANSMIT_OFFSET..TRANSMIT_OFFSET + 8]);
    BigEndian::write_u64(&mut response[32..40], now_ts.0);
    BigEndian::write_u64(&mut response[40..48], now_ts.0);

    Some(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(byte0: u8) -> Vec<u8> {
        let mut pkt = vec![0u8; NTP_HEADER_LEN];
        pkt[0] = byte0;
        pkt
    }

    #[test]
    fn test_validate_rejects_short_payloads() {
        for len in 0..NTP_HEADER_LEN {
            let mut pkt = vec![0u8; len];
            if len > 0 {
                pkt[0] = 0x23; // v4 client
            }
            assert_eq!(validate(&pkt), ProtocolVerdict::NotNtp, "len {}", len);
        }
    }

    #[test]
    fn test_validate_length_boundary() {
        let mut pkt = request(0x23);
        assert_eq!(validate(&pkt), ProtocolVerdict::Ntp { version: 4, mode: 3 });
        pkt.pop();
        assert_eq!(pkt.len(), 47);
        assert_eq!(validate(&pkt), ProtocolVerdict::NotNtp);
    }

    #[test]
    fn test_validate_mode_and_version_edges() {
        // mode 0 and 6
        assert!(!validate(&request(4 << 3)).is_ntp());
        assert!(!validate(&request((4 << 3) | 6)).is_ntp());
        // version 0 and 5
        assert!(!validate(&request(3)).is_ntp());
        assert!(!validate(&request((5 << 3) | 3)).is_ntp());
        // extremes that are accepted
        assert!(validate(&request((1 << 3) | 1)).is_ntp());
        assert!(validate(&request((4 << 3) | 5)).is_ntp());
    }

    #[test]
    fn test_validate_all_first_bytes() {
        for b in 0..=255u8 {
            let version = (b >> 3) & 0x07;
            let mode = b & 0x07;
            let expected = (1..=4).contains(&version) && (1..=5).contains(&mode);

            match validate(&request(b)) {
                ProtocolVerdict::Ntp { version: v, mode: m } => {
                    assert!(expected, "byte 0x{:02X} should be rejected", b);
                    assert_eq!((v, m), (version, mode));
                }
                ProtocolVerdict::NotNtp => assert!(!expected, "byte 0x{:02X} should be accepted", b),
            }
        }
    }

    #[test]
    fn test_leap_bits_do_not_affect_verdict() {
        assert_eq!(validate(&request(0xE3)), ProtocolVerdict::Ntp { version: 4, mode: 3 });
    }

    #[test]
    fn test_ntp_timestamp_conversion() {
        let t = UNIX_EPOCH + Duration::new(1_700_000_000, 500_000_000);
        let ts = NtpTimestamp::from_system_time(t);
        assert_eq!(ts.seconds() as u64, 1_700_000_000 + NTP_UNIX_OFFSET);
        assert_eq!(ts.fraction(), 1 << 31);

        let epoch = NtpTimestamp::from_system_time(UNIX_EPOCH);
        assert_eq!(epoch.seconds() as u64, NTP_UNIX_OFFSET);
        assert_eq!(epoch.fraction(), 0);
    }

    #[test]
    fn test_header_parse() {
        let mut pkt = request(0xE3);
        pkt[1] = 2;
        pkt[2] = 6;
        pkt[3] = 0xEC; // -20
        pkt[4..8].copy_from_slice(&[0, 0, 1, 0]);
        pkt[12..16].copy_from_slice(&[10, 0, 0, 1]);
        pkt[40..48].copy_from_slice(&[0xE9, 0, 0, 1, 0x80, 0, 0, 0]);

        let hdr = NtpHeader::parse(&pkt).unwrap();
        assert_eq!(hdr.leap, 3);
        assert_eq!(hdr.version, 4);
        assert_eq!(hdr.mode, 3);
        assert_eq!(hdr.stratum, 2);
        assert_eq!(hdr.poll, 6);
        assert_eq!(hdr.precision, -20);
        assert_eq!(hdr.root_delay, 256);
        assert_eq!(hdr.reference_id, 0x0A00_0001);
        assert_eq!(hdr.transmit_ts.seconds(), 0xE900_0001);
        assert_eq!(hdr.transmit_ts.fraction(), 0x8000_0000);

        assert!(NtpHeader::parse(&pkt[..47]).is_none());
    }

    #[test]
    fn test_build_response_echoes_origin() {
        let mut req = request(0x1B); // v3 client
        let origin = [0xDE, 0xAD, 0xBE, 0xEF, 0x01, 0x02, 0x03, 0x04];
        req[40..48].copy_from_slice(&origin);

        let now = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let params = ResponseParams::default();
        let resp = build_response(3, &req, &params, now).unwrap();

        assert_eq!(&resp[24..32], &origin);
        assert_eq!(validate(&resp), ProtocolVerdict::Ntp { version: 3, mode: MODE_SERVER });
        assert_eq!(resp[0] >> 6, 0);
    }

    #[test]
    fn test_build_response_fixed_fields_and_times() {
        let req = request(0x23);
        let now = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let params = ResponseParams::default();
        let resp = build_response(4, &req, &params, now).unwrap();
        let hdr = NtpHeader::parse(&resp).unwrap();

        assert_eq!(resp[0], 0x24);
        assert_eq!(hdr.stratum, 2);
        assert_eq!(hdr.poll, 4);
        assert_eq!(resp[3], 0xF6);
        assert_eq!(hdr.root_delay, 0);
        assert_eq!(hdr.root_dispersion, 3);
        assert_eq!(&resp[12..16], &[132, 239, 1, 6]);

        let now_secs = (1_700_000_000 + NTP_UNIX_OFFSET) as u32;
        assert_eq!(hdr.receive_ts.seconds(), now_secs);
        assert_eq!(hdr.transmit_ts, hdr.receive_ts);
        assert_eq!(hdr.reference_ts.seconds(), now_secs - 3600);
    }

    #[test]
    fn test_build_response_rejects_short_request() {
        let req = vec![0x23u8; 47];
        assert!(build_response(4, &req, &ResponseParams::default(), SystemTime::now()).is_none());
    }
}
