//! Provides a means to read, parse and hold configuration options for runs.
use crate::address::TargetSource;
use crate::scanner::ResultFilter;
use clap::{Parser, ValueEnum};
use log::warn;
use reqwest::Url;
use serde_derive::Deserialize;
use std::fs;
use std::num::{NonZeroU8, NonZeroUsize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_PORT: u16 = 443;
const DEFAULT_TRIES: NonZeroU8 = match NonZeroU8::new(4) {
    Some(tries) => tries,
    None => unreachable!(),
};
const DEFAULT_CONCURRENCY: NonZeroUsize = match NonZeroUsize::new(200) {
    Some(concurrency) => concurrency,
    None => unreachable!(),
};
const MAX_CONCURRENCY: usize = 1000;
const DEFAULT_INPUT_FILE: &str = "ip.txt";

/// Page answering `HEAD` on every edge address of the default CDN.
pub const DEFAULT_PROBE_URL: &str = "https://cloudflare.com/cdn-cgi/trace";

/// Which latency probe a run uses.
///   - Tcp times a TCP handshake with the target port.
///   - Icmp runs the system `ping` once per target; it ignores the port.
///   - Http times one `HEAD` request and records the answering location.
#[derive(Deserialize, Debug, ValueEnum, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProbeMode {
    Tcp,
    Icmp,
    Http,
}

impl ProbeMode {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Tcp => "TCP",
            Self::Icmp => "ICMP",
            Self::Http => "HTTP",
        }
    }
}

/// Errors raised while building the run configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("port must be between 1 and 65535")]
    InvalidPort,

    #[error("invalid probe URL `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("found {reason} in configuration file {}", path.display())]
    File { path: PathBuf, reason: String },
}

/// Settings of the application-layer probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpSettings {
    /// Requested URL; its host is resolved to the target and its port replaced.
    pub url: Url,
    /// Status code counted as success. `None` accepts 200, 301 and 302.
    pub expected_status: Option<u16>,
    /// Location tags to keep. Empty keeps every location.
    pub locations: Vec<String>,
    pub timeout: Duration,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            url: Url::parse(DEFAULT_PROBE_URL).expect("default probe URL is valid"),
            expected_status: None,
            locations: Vec::new(),
            timeout: Duration::from_millis(1500),
        }
    }
}

/// Validated, immutable configuration of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanConfig {
    /// Port of targets whose specifier does not carry one.
    pub port: u16,
    /// Maximum number of targets measured at the same time.
    pub concurrency: NonZeroUsize,
    /// Attempts per target; see [`crate::probe::Probe::attempts`].
    pub tries: NonZeroU8,
    pub mode: ProbeMode,
    /// Expand every address of 4-byte ranges instead of sampling.
    pub exhaustive: bool,
    /// Handshake timeout of the TCP probe.
    pub connect_timeout: Duration,
    pub http: HttpSettings,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            concurrency: DEFAULT_CONCURRENCY,
            tries: DEFAULT_TRIES,
            mode: ProbeMode::Icmp,
            exhaustive: false,
            connect_timeout: Duration::from_secs(1),
            http: HttpSettings::default(),
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "rangeping",
    version = env!("CARGO_PKG_VERSION"),
    max_term_width = 120,
    help_template = "{bin} {version}\n{about}\n\nUSAGE:\n    {usage}\n\nOPTIONS:\n{options}",
)]
#[allow(clippy::struct_excessive_bools)]
/// Expand address ranges, probe every candidate and rank the reachable ones by latency.
pub struct Opts {
    /// A comma-delimited list of CIDRs or addresses, each optionally followed by `:port`
    /// (`[range]:port` for IPv6). Takes precedence over --file.
    #[arg(short, long)]
    pub addresses: Option<String>,

    /// A newline-delimited file of ranges, or a CSV file with an `ip` column and an
    /// optional `port` column.
    #[arg(short, long, default_value = DEFAULT_INPUT_FILE)]
    pub file: PathBuf,

    /// Port used for ranges that do not specify one.
    #[arg(short, long, default_value = "443", value_parser = clap::value_parser!(u16).range(1..))]
    pub port: u16,

    /// Maximum number of targets measured at once. 0 is corrected to 200, values above
    /// 1000 are lowered to 1000.
    #[arg(short = 'n', long, default_value = "200")]
    pub concurrency: usize,

    /// Attempts per target. The icmp mode always sends a single echo request.
    /// If set to 0, rangeping will correct it to 4.
    #[arg(short, long, default_value = "4")]
    pub tries: u8,

    /// The probe used to measure latency.
    #[arg(short, long, value_enum, ignore_case = true, default_value = "icmp")]
    pub mode: ProbeMode,

    /// Probe every address of each range instead of one random address per /24.
    #[arg(long)]
    pub all: bool,

    /// TCP handshake timeout in milliseconds.
    #[arg(long, default_value = "1000")]
    pub timeout: u32,

    /// URL requested by the http probe.
    #[arg(long, default_value = DEFAULT_PROBE_URL)]
    pub url: String,

    /// Status code the http probe accepts. Defaults to 200, 301 and 302.
    #[arg(long)]
    pub http_status: Option<u16>,

    /// Comma-delimited location tags kept by the http probe, e.g. SJC,LAX.
    #[arg(long, value_delimiter = ',')]
    pub colo: Option<Vec<String>>,

    /// Drop results whose average delay is above this many milliseconds.
    #[arg(long, default_value = "9999")]
    pub max_delay: u64,

    /// Drop results whose average delay is below this many milliseconds.
    #[arg(long, default_value = "0")]
    pub min_delay: u64,

    /// Drop results whose loss rate is above this ratio (0.0 - 1.0).
    #[arg(long, default_value = "1")]
    pub max_loss: f64,

    /// How many results to print. 0 prints none.
    #[arg(long, default_value = "10")]
    pub print_num: usize,

    /// Write every result to this CSV file.
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Whether to ignore the configuration file or not.
    #[arg(long)]
    pub no_config: bool,

    /// Custom path to config file
    #[arg(short, long, value_parser)]
    pub config_path: Option<PathBuf>,

    /// Greppable mode. Only output `address:port,delay` lines.
    #[arg(short, long)]
    pub greppable: bool,

    /// Accessible mode. Turns off features which negatively affect screen readers.
    #[arg(long)]
    pub accessible: bool,

    /// Automatically ups the ULIMIT with the value you provided.
    #[arg(short, long)]
    pub ulimit: Option<u64>,
}

#[cfg(not(tarpaulin_include))]
impl Opts {
    pub fn read() -> Self {
        Self::parse()
    }

    /// Merges values found within the user configuration file into the
    /// command line arguments.
    pub fn merge(&mut self, config: &Config) {
        if !self.no_config {
            self.merge_required(config);
            self.merge_optional(config);
        }
    }

    fn merge_required(&mut self, config: &Config) {
        macro_rules! merge_required {
            ($($field: ident),+) => {
                $(
                    if let Some(e) = &config.$field {
                        self.$field = e.clone();
                    }
                )+
            }
        }

        merge_required!(
            file, port, concurrency, tries, mode, all, timeout, url, max_delay, min_delay,
            max_loss, print_num, greppable, accessible
        );
    }

    fn merge_optional(&mut self, config: &Config) {
        macro_rules! merge_optional {
            ($($field: ident),+) => {
                $(
                    if config.$field.is_some() {
                        self.$field = config.$field.clone();
                    }
                )+
            }
        }

        merge_optional!(addresses, http_status, colo, output, ulimit);
    }
}

impl Opts {
    /// Validates the options into the configuration handed to the expander,
    /// the probes and the prober.
    pub fn scan_config(&self) -> Result<ScanConfig, ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidPort);
        }

        let concurrency = match NonZeroUsize::new(self.concurrency) {
            None => {
                warn!("Concurrency 0 is invalid, using {DEFAULT_CONCURRENCY}");
                DEFAULT_CONCURRENCY
            }
            Some(n) if n.get() > MAX_CONCURRENCY => {
                warn!("Concurrency {n} is too high, using {MAX_CONCURRENCY}");
                NonZeroUsize::new(MAX_CONCURRENCY).unwrap_or(DEFAULT_CONCURRENCY)
            }
            Some(n) => n,
        };

        let tries = NonZeroU8::new(self.tries).unwrap_or_else(|| {
            warn!("0 tries is invalid, using {DEFAULT_TRIES}");
            DEFAULT_TRIES
        });

        let invalid_url = |reason: String| ConfigError::InvalidUrl {
            url: self.url.clone(),
            reason,
        };
        let url = Url::parse(&self.url).map_err(|e| invalid_url(e.to_string()))?;
        if url.host_str().is_none() {
            return Err(invalid_url("the URL has no host".to_owned()));
        }

        Ok(ScanConfig {
            port: self.port,
            concurrency,
            tries,
            mode: self.mode,
            exhaustive: self.all,
            connect_timeout: Duration::from_millis(u64::from(self.timeout)),
            http: HttpSettings {
                url,
                expected_status: self.http_status,
                locations: self.colo.clone().unwrap_or_default(),
                ..HttpSettings::default()
            },
        })
    }

    /// Inline addresses win over the input file.
    pub fn target_source(&self) -> TargetSource {
        match &self.addresses {
            Some(addresses) if !addresses.trim().is_empty() => {
                TargetSource::Inline(addresses.clone())
            }
            _ => TargetSource::File(self.file.clone()),
        }
    }

    pub fn result_filter(&self) -> ResultFilter {
        ResultFilter {
            min_delay: Duration::from_millis(self.min_delay),
            max_delay: Duration::from_millis(self.max_delay),
            max_loss_rate: self.max_loss,
        }
    }
}

impl Default for Opts {
    fn default() -> Self {
        Self {
            addresses: None,
            file: PathBuf::from(DEFAULT_INPUT_FILE),
            port: DEFAULT_PORT,
            concurrency: 0,
            tries: 0,
            mode: ProbeMode::Icmp,
            all: false,
            timeout: 1000,
            url: DEFAULT_PROBE_URL.to_owned(),
            http_status: None,
            colo: None,
            max_delay: 9999,
            min_delay: 0,
            max_loss: 1.0,
            print_num: 10,
            output: None,
            no_config: true,
            config_path: None,
            greppable: true,
            accessible: false,
            ulimit: None,
        }
    }
}

/// Struct used to deserialize the options specified within our config file.
/// These will be further merged with our command line arguments in order to
/// generate the final Opts struct.
#[cfg(not(tarpaulin_include))]
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    addresses: Option<String>,
    file: Option<PathBuf>,
    port: Option<u16>,
    concurrency: Option<usize>,
    tries: Option<u8>,
    mode: Option<ProbeMode>,
    all: Option<bool>,
    timeout: Option<u32>,
    url: Option<String>,
    http_status: Option<u16>,
    colo: Option<Vec<String>>,
    max_delay: Option<u64>,
    min_delay: Option<u64>,
    max_loss: Option<f64>,
    print_num: Option<usize>,
    output: Option<PathBuf>,
    greppable: Option<bool>,
    accessible: Option<bool>,
    ulimit: Option<u64>,
}

#[cfg(not(tarpaulin_include))]
impl Config {
    /// Reads the configuration file with TOML format and parses it into a
    /// Config struct. A missing file yields an empty configuration.
    ///
    /// # Format
    ///
    /// addresses = "1.1.1.0/24,1.0.0.0/24"
    /// port = 2053
    /// mode = "tcp"
    /// tries = 3
    /// colo = ["SJC", "LAX"]
    ///
    pub fn read(custom_config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let Some(config_path) = custom_config_path.or_else(default_config_path) else {
            return Ok(Self::default());
        };
        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&config_path).map_err(|e| ConfigError::File {
            path: config_path.clone(),
            reason: e.to_string(),
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::File {
            path: config_path,
            reason: e.to_string(),
        })
    }
}

/// Constructs default path to config toml
pub fn default_config_path() -> Option<PathBuf> {
    let mut config_path = dirs::home_dir()?;
    config_path.push(".rangeping.toml");
    Some(config_path)
}

#[cfg(test)]
mod tests {
    use clap::{CommandFactory, Parser};
    use parameterized::parameterized;
    use std::time::Duration;

    use super::{Config, ConfigError, Opts, ProbeMode, TargetSource};

    impl Config {
        fn sample() -> Self {
            Self {
                addresses: Some("1.1.1.0/24".to_owned()),
                port: Some(2053),
                concurrency: Some(50),
                tries: Some(2),
                mode: Some(ProbeMode::Http),
                all: Some(true),
                colo: Some(vec!["SJC".to_owned()]),
                greppable: Some(false),
                ..Self::default()
            }
        }
    }

    #[test]
    fn verify_cli() {
        Opts::command().debug_assert();
    }

    #[parameterized(input = {
        vec!["rangeping", "-a", "1.1.1.0/24"],
        vec!["rangeping", "-a", "1.1.1.0/24", "--mode", "TCP", "-p", "80"],
        vec!["rangeping", "--file", "ranges.csv", "--mode", "http", "--colo", "SJC,LAX"],
    }, mode = {
        ProbeMode::Icmp,
        ProbeMode::Tcp,
        ProbeMode::Http,
    })]
    fn parse_probe_mode(input: Vec<&str>, mode: ProbeMode) {
        let opts = Opts::parse_from(input);
        assert_eq!(opts.mode, mode);
    }

    #[test]
    fn reject_port_zero() {
        assert!(Opts::try_parse_from(["rangeping", "-p", "0"]).is_err());
    }

    #[test]
    fn parse_colo_list() {
        let opts = Opts::parse_from(["rangeping", "--colo", "SJC,LAX"]);
        assert_eq!(opts.colo, Some(vec!["SJC".to_owned(), "LAX".to_owned()]));
    }

    #[test]
    fn opts_no_merge_when_config_is_ignored() {
        let mut opts = Opts::default();
        let config = Config::sample();

        opts.merge(&config);

        assert_eq!(opts.addresses, None);
        assert_eq!(opts.port, 443);
        assert_eq!(opts.mode, ProbeMode::Icmp);
        assert!(opts.greppable);
    }

    #[test]
    fn opts_merge_required_arguments() {
        let mut opts = Opts::default();
        let config = Config::sample();

        opts.merge_required(&config);

        assert_eq!(opts.port, 2053);
        assert_eq!(opts.concurrency, 50);
        assert_eq!(opts.tries, 2);
        assert_eq!(opts.mode, ProbeMode::Http);
        assert!(opts.all);
        assert!(!opts.greppable);
        assert_eq!(opts.addresses, None);
    }

    #[test]
    fn opts_merge_optional_arguments() {
        let mut opts = Opts::default();
        let config = Config::sample();

        opts.merge_optional(&config);

        assert_eq!(opts.addresses, config.addresses);
        assert_eq!(opts.colo, config.colo);
        assert_eq!(opts.http_status, None);
    }

    #[test]
    fn config_from_toml() {
        let config: Config =
            toml::from_str("port = 80\nmode = \"tcp\"\ncolo = [\"FRA\"]\n").unwrap();
        assert_eq!(config.port, Some(80));
        assert_eq!(config.mode, Some(ProbeMode::Tcp));
        assert_eq!(config.colo, Some(vec!["FRA".to_owned()]));
    }

    #[test]
    fn scan_config_corrects_zero_values() {
        let config = Opts::default().scan_config().unwrap();

        assert_eq!(config.concurrency.get(), 200);
        assert_eq!(config.tries.get(), 4);
        assert_eq!(config.connect_timeout, Duration::from_secs(1));
    }

    #[test]
    fn scan_config_clamps_concurrency() {
        let opts = Opts {
            concurrency: 5000,
            ..Opts::default()
        };
        assert_eq!(opts.scan_config().unwrap().concurrency.get(), 1000);
    }

    #[test]
    fn scan_config_keeps_http_settings() {
        let opts = Opts {
            url: "http://speed.example.net/probe".to_owned(),
            http_status: Some(204),
            colo: Some(vec!["SJC".to_owned()]),
            all: true,
            ..Opts::default()
        };
        let config = opts.scan_config().unwrap();

        assert!(config.exhaustive);
        assert_eq!(config.http.url.host_str(), Some("speed.example.net"));
        assert_eq!(config.http.expected_status, Some(204));
        assert_eq!(config.http.locations, ["SJC"]);
    }

    #[parameterized(url = { "not a url", "unix:/run/socket" })]
    fn scan_config_rejects_bad_url(url: &str) {
        let opts = Opts {
            url: url.to_owned(),
            ..Opts::default()
        };
        assert!(matches!(
            opts.scan_config(),
            Err(ConfigError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn scan_config_rejects_port_zero_from_config() {
        let opts = Opts {
            port: 0,
            ..Opts::default()
        };
        assert!(matches!(opts.scan_config(), Err(ConfigError::InvalidPort)));
    }

    #[test]
    fn inline_addresses_win_over_file() {
        let opts = Opts {
            addresses: Some("1.1.1.1".to_owned()),
            ..Opts::default()
        };
        assert_eq!(
            opts.target_source(),
            TargetSource::Inline("1.1.1.1".to_owned())
        );

        let opts = Opts {
            addresses: Some("  ".to_owned()),
            ..Opts::default()
        };
        assert_eq!(opts.target_source(), TargetSource::File("ip.txt".into()));
    }
}
