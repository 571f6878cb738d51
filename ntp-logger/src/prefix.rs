use anyhow::{Context, Result};
use parking_lot::RwLock;
use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

/// An IP network range in CIDR notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    addr: IpAddr,
    prefix_len: u8,
}

impl Cidr {
    /// Prefix lengths beyond the address width are clamped.
    pub fn new(addr: IpAddr, prefix_len: u8) -> Self {
        let max = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        Self {
            addr,
            prefix_len: prefix_len.min(max),
        }
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (&self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(addr)) => {
                let mask = u32::MAX
                    .checked_shl(32 - self.prefix_len as u32)
                    .unwrap_or(0);
                (u32::from(*net) & mask) == (u32::from(*addr) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(addr)) => {
                let mask = u128::MAX
                    .checked_shl(128 - self.prefix_len as u32)
                    .unwrap_or(0);
                (u128::from(*net) & mask) == (u128::from(*addr) & mask)
            }
            _ => false,
        }
    }
}

impl FromStr for Cidr {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (addr, len) = match s.split_once('/') {
            Some((addr, len)) => (addr, Some(len)),
            None => (s, None),
        };

        let addr: IpAddr = addr
            .parse()
            .with_context(|| format!("invalid network address in {:?}", s))?;
        let max = if addr.is_ipv4() { 32 } else { 128 };
        let prefix_len = match len {
            Some(len) => len
                .parse::<u8>()
                .with_context(|| format!("invalid prefix length in {:?}", s))?,
            None => max,
        };
        if prefix_len > max {
            anyhow::bail!("prefix length {} out of range in {:?}", prefix_len, s);
        }

        Ok(Cidr::new(addr, prefix_len))
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

/// Immutable allow-list of networks. Replaced wholesale, never edited in place.
#[derive(Debug, Clone, Default)]
pub struct PrefixSet {
    ranges: Vec<Cidr>,
}

impl PrefixSet {
    pub fn new(ranges: Vec<Cidr>) -> Self {
        Self { ranges }
    }

    /// Parse one CIDR per line. Malformed lines are reported and skipped.
    pub fn parse<R: BufRead>(reader: R) -> Result<Self> {
        let mut ranges = Vec::new();

        for (idx, line) in reader.lines().enumerate() {
            let line = line.context("Failed to read prefix list")?;
            let entry = line.trim();
            if entry.is_empty() || entry.starts_with('#') {
                continue;
            }

            match entry.parse::<Cidr>() {
                Ok(cidr) => ranges.push(cidr),
                Err(e) => warn!("Skipping invalid CIDR on line {}: {} ({})", idx + 1, entry, e),
            }
        }

        Ok(Self { ranges })
    }

    pub fn matches(&self, ip: &IpAddr) -> bool {
        self.ranges.iter().any(|range| range.contains(ip))
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

/// Load a prefix file. Failing to open or read the file is an error; bad lines are not.
pub fn load_prefixes(path: &Path) -> Result<PrefixSet> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open prefix file: {}", path.display()))?;
    PrefixSet::parse(BufReader::new(file))
}

/// Shared handle to the current prefix snapshot.
///
/// Readers clone the inner `Arc` and keep using that snapshot for the whole
/// packet, so a concurrent `replace` never exposes a half-built set.
pub struct PrefixStore {
    current: RwLock<Arc<PrefixSet>>,
    source: Option<PathBuf>,
}

impl PrefixStore {
    pub fn new(set: PrefixSet) -> Self {
        Self {
            current: RwLock::new(Arc::new(set)),
            source: None,
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let set = load_prefixes(path)?;
        info!("Loaded {} prefixes from {}", set.len(), path.display());
        Ok(Self {
            current: RwLock::new(Arc::new(set)),
            source: Some(path.to_path_buf()),
        })
    }

    pub fn snapshot(&self) -> Arc<PrefixSet> {
        self.current.read().clone()
    }

    pub fn replace(&self, set: PrefixSet) {
        *self.current.write() = Arc::new(set);
    }

    /// Re-read the backing file. On failure the previous snapshot stays active.
    pub fn reload(&self) -> Result<usize> {
        let Some(path) = &self.source else {
            return Ok(self.snapshot().len());
        };

        let set = load_prefixes(path)?;
        let count = set.len();
        self.replace(set);
        info!("IP prefix database updated: {} ({} prefixes)", path.display(), count);
        Ok(count)
    }
}

/// Suppresses sources whose textual address ends in a fixed suffix, e.g. router ".1" addresses.
#[derive(Debug, Clone)]
pub struct IgnorePolicy {
    suffix: String,
}

impl IgnorePolicy {
    pub fn new(suffix: impl Into<String>) -> Self {
        Self { suffix: suffix.into() }
    }

    pub fn should_ignore(&self, ip: &IpAddr) -> bool {
        !self.suffix.is_empty() && ip.to_string().ends_with(&self.suffix)
    }
}

impl Default for IgnorePolicy {
    fn default() -> Self {
        Self::new(".1")
    }
}
