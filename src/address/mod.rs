//! Provides functions to parse range specifiers from inline lists or files and
//! expand them into a deduplicated list of probe targets.

mod expander;
pub use expander::{
    advance_v4, advance_v6, last_octet_hosts, v4_mask, v6_mask, Expansion, Ipv4Walk, Ipv6Walk,
    RangeExpander,
};

use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use cidr_utils::cidr::IpInet;
use log::debug;
use thiserror::Error;
use tokio::fs;

/// Errors that abort target loading before any probing starts.
#[derive(Debug, Error)]
pub enum TargetError {
    #[error("invalid range `{spec}`: {reason}")]
    InvalidRange { spec: String, reason: String },

    #[error("could not read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed table in {}: {source}", path.display())]
    Table {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("{} has no `ip` or `address` column", path.display())]
    MissingAddressColumn { path: PathBuf },
}

/// Identity of one concrete probe target.
///
/// Two keys are equal exactly when their `address:port` text matches; an
/// IPv4-mapped 16-byte address is stored in its 4-byte form so that it
/// collapses with the plain 4-byte spelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressKey {
    ip: IpAddr,
    port: u16,
}

impl AddressKey {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        let ip = match ip {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(IpAddr::V6(v6), IpAddr::V4),
            v4 @ IpAddr::V4(_) => v4,
        };
        Self { ip, port }
    }

    pub const fn ip(&self) -> IpAddr {
        self.ip
    }

    pub const fn port(&self) -> u16 {
        self.port
    }

    pub const fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl From<SocketAddr> for AddressKey {
    fn from(socket: SocketAddr) -> Self {
        Self::new(socket.ip(), socket.port())
    }
}

impl fmt::Display for AddressKey {
    /// `1.2.3.4:443` or `[2606:4700::1111]:443`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.socket_addr(), f)
    }
}

/// A parsed range specifier: base address, prefix length and port.
///
/// A bare address is normalized to a /32 or /128 range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeSpec {
    base: IpAddr,
    prefix: u8,
    port: u16,
}

impl RangeSpec {
    /// Parses one specifier such as `1.2.3.0/24`, `1.2.3.4:8443`,
    /// `2606:4700::/48` or `[2606:4700::/48]:2053`.
    ///
    /// A missing, zero or unparsable port falls back to `default_port`.
    pub fn parse(input: &str, default_port: u16) -> Result<Self, TargetError> {
        RangeEntry::from_specifier(input).parse(default_port)
    }

    pub const fn base(&self) -> IpAddr {
        self.base
    }

    pub const fn prefix(&self) -> u8 {
        self.prefix
    }

    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Whether the range holds a single address (/32 or /128).
    pub const fn is_single(&self) -> bool {
        match self.base {
            IpAddr::V4(_) => self.prefix == 32,
            IpAddr::V6(_) => self.prefix == 128,
        }
    }
}

impl fmt::Display for RangeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.base {
            IpAddr::V4(base) => write!(f, "{base}/{}:{}", self.prefix, self.port),
            IpAddr::V6(base) => write!(f, "[{base}/{}]:{}", self.prefix, self.port),
        }
    }
}

/// One input row before parsing: the range text and its optional port text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeEntry {
    pub range: String,
    pub port: Option<String>,
}

impl RangeEntry {
    /// Splits a `range[:port]` specifier. Unbracketed 16-byte ranges never
    /// carry a port; use `[range]:port` for those.
    pub fn from_specifier(input: &str) -> Self {
        let input = input.trim();

        let (range, port) = if let Some(rest) = input.strip_prefix('[') {
            match rest.split_once(']') {
                Some((range, tail)) => (range, tail.strip_prefix(':')),
                None => (input, None),
            }
        } else {
            match input.split_once(':') {
                Some((range, port)) if !port.contains(':') => (range, Some(port)),
                _ => (input, None),
            }
        };

        Self {
            range: range.trim().to_owned(),
            port: port.map(|port| port.trim().to_owned()),
        }
    }

    pub fn parse(&self, default_port: u16) -> Result<RangeSpec, TargetError> {
        let port = self
            .port
            .as_deref()
            .and_then(|port| port.parse::<u16>().ok())
            .filter(|&port| port != 0)
            .unwrap_or(default_port);

        let invalid = |reason: String| TargetError::InvalidRange {
            spec: self.range.clone(),
            reason,
        };

        let (base, prefix) = if self.range.contains('/') {
            let inet = IpInet::from_str(&self.range).map_err(|e| invalid(e.to_string()))?;
            (inet.address(), inet.network_length())
        } else {
            let ip = IpAddr::from_str(&self.range).map_err(|e| invalid(e.to_string()))?;
            let prefix = if ip.is_ipv4() { 32 } else { 128 };
            (ip, prefix)
        };

        Ok(RangeSpec { base, prefix, port })
    }
}

/// Where the range specifiers of a run come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSource {
    /// Comma-separated specifiers, e.g. `1.1.1.0/24,1.0.0.1:8443`.
    Inline(String),
    /// A newline-delimited text file, or a `.csv` file with an `ip` column and
    /// an optional `port` column.
    File(PathBuf),
}

impl TargetSource {
    /// Reads every non-blank entry of the source.
    pub async fn entries(&self) -> Result<Vec<RangeEntry>, TargetError> {
        match self {
            Self::Inline(text) => Ok(text
                .split(',')
                .map(str::trim)
                .filter(|spec| !spec.is_empty())
                .map(RangeEntry::from_specifier)
                .collect()),
            Self::File(path) => {
                let content = fs::read_to_string(path)
                    .await
                    .map_err(|source| TargetError::Io {
                        path: path.clone(),
                        source,
                    })?;

                if is_table(path) {
                    read_table(path, &content)
                } else {
                    Ok(read_lines(&content))
                }
            }
        }
    }
}

impl fmt::Display for TargetSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inline(_) => f.write_str("the address list"),
            Self::File(path) => write!(f, "{}", path.display()),
        }
    }
}

fn is_table(path: &Path) -> bool {
    path.extension()
        .is_some_and(|extension| extension.eq_ignore_ascii_case("csv"))
}

/// Parses a newline-delimited list. `#` starts a comment line.
fn read_lines(content: &str) -> Vec<RangeEntry> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(RangeEntry::from_specifier)
        .collect()
}

/// Parses a table whose header names an `ip` (or `address`) column and
/// optionally a `port` column. Rows with a blank address cell are skipped.
fn read_table(path: &Path, content: &str) -> Result<Vec<RangeEntry>, TargetError> {
    let table_error = |source| TargetError::Table {
        path: path.to_owned(),
        source,
    };

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(content.as_bytes());

    let headers = reader.headers().map_err(table_error)?.clone();
    let column = |names: &[&str]| {
        headers
            .iter()
            .position(|header| names.iter().any(|name| header.eq_ignore_ascii_case(name)))
    };

    let address_column =
        column(&["ip", "address"]).ok_or_else(|| TargetError::MissingAddressColumn {
            path: path.to_owned(),
        })?;
    let port_column = column(&["port"]);

    let mut entries = Vec::new();
    for record in reader.records() {
        let record = record.map_err(table_error)?;
        let Some(range) = record.get(address_column).filter(|cell| !cell.is_empty()) else {
            continue;
        };
        let port = port_column
            .and_then(|index| record.get(index))
            .filter(|cell| !cell.is_empty())
            .map(str::to_owned);

        entries.push(RangeEntry {
            range: range.to_owned(),
            port,
        });
    }

    Ok(entries)
}

/// Insertion-ordered set of targets for one run.
#[derive(Debug, Default, Clone)]
pub struct TargetSet {
    order: Vec<AddressKey>,
    seen: HashSet<AddressKey>,
}

impl TargetSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `key` unless it is already present. Returns whether it was added.
    pub fn insert(&mut self, key: AddressKey) -> bool {
        if !self.seen.insert(key) {
            return false;
        }
        self.order.push(key);
        true
    }

    /// Adds every new key of `keys`, returning how many were new.
    pub fn extend_from<I: IntoIterator<Item = AddressKey>>(&mut self, keys: I) -> usize {
        keys.into_iter().filter(|&key| self.insert(key)).count()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, key: &AddressKey) -> bool {
        self.seen.contains(key)
    }

    pub fn as_slice(&self) -> &[AddressKey] {
        &self.order
    }

    pub fn into_vec(self) -> Vec<AddressKey> {
        self.order
    }
}

/// Reads `source`, parses every entry and expands it into a deduplicated
/// target set.
///
/// Every entry is parsed before expansion starts, so an invalid specifier
/// anywhere in the input aborts the load without a partial result.
///
/// ```rust
/// # use rangeping::address::{load_targets, RangeExpander, TargetSource};
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let source = TargetSource::Inline("1.1.1.1,1.1.1.1:8080".to_owned());
/// let targets = load_targets(&source, &RangeExpander::new(false), 443).await.unwrap();
/// assert_eq!(targets.len(), 2);
/// # });
/// ```
pub async fn load_targets(
    source: &TargetSource,
    expander: &RangeExpander,
    default_port: u16,
) -> Result<TargetSet, TargetError> {
    let specs = source
        .entries()
        .await?
        .iter()
        .map(|entry| entry.parse(default_port))
        .collect::<Result<Vec<_>, _>>()?;

    let mut targets = TargetSet::new();
    for spec in &specs {
        let added = targets.extend_from(expander.expand(spec));
        debug!("{spec} expanded to {added} new targets");
    }

    debug!(
        "Loaded {} targets from {} ranges (exhaustive: {})",
        targets.len(),
        specs.len(),
        expander.is_exhaustive()
    );
    Ok(targets)
}
