use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use pgwire::tokio::tokio_rustls::rustls::ServerConfig as RustlsConfig;
use pgwire::tokio::TlsAcceptor;

use crate::limits::MAX_ACCOUNT_LEN;
use crate::model::{day_index, Account, Day, Secs};

pub const BPS_DENOMINATOR: u32 = 10_000;

/// Process-wide protocol constants, fixed at start-up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolConfig {
    charity: Account,
    charity_bps: u32,
    day_zero: Secs,
}

impl ProtocolConfig {
    pub fn new(charity: Account, charity_bps: u32, day_zero: Secs) -> Result<Self, ConfigError> {
        if charity.is_empty() || charity.as_str().len() > MAX_ACCOUNT_LEN {
            return Err(ConfigError::Invalid {
                var: "charity account",
                value: charity.to_string(),
            });
        }
        if charity_bps > BPS_DENOMINATOR {
            return Err(ConfigError::Invalid {
                var: "charity bps",
                value: charity_bps.to_string(),
            });
        }
        Ok(Self {
            charity,
            charity_bps,
            day_zero,
        })
    }

    pub fn charity(&self) -> &Account {
        &self.charity
    }

    pub fn charity_bps(&self) -> u32 {
        self.charity_bps
    }

    pub fn day_zero(&self) -> Secs {
        self.day_zero
    }

    pub fn today(&self, now: Secs) -> Day {
        day_index(now, self.day_zero)
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Missing(&'static str),
    Invalid { var: &'static str, value: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Missing(var) => write!(f, "{var} must be set"),
            ConfigError::Invalid { var, value } => write!(f, "invalid {var}: {value:?}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Everything the server binary reads from its environment.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub protocol: ProtocolConfig,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let charity = lookup("STAYLEDGER_CHARITY_ACCOUNT")
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::Missing("STAYLEDGER_CHARITY_ACCOUNT"))?;
        let charity_bps = parse_or(&lookup, "STAYLEDGER_CHARITY_BPS", 500u32)?;
        let day_zero = parse_or(&lookup, "STAYLEDGER_DAY_ZERO", 0 as Secs)?;
        let protocol = ProtocolConfig::new(Account::new(charity), charity_bps, day_zero)?;

        Ok(Self {
            bind: lookup("STAYLEDGER_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_or(&lookup, "STAYLEDGER_PORT", 5433u16)?,
            data_dir: PathBuf::from(lookup("STAYLEDGER_DATA_DIR").unwrap_or_else(|| "./data".into())),
            password: lookup("STAYLEDGER_PASSWORD").unwrap_or_else(|| "stayledger".into()),
            max_connections: parse_or(&lookup, "STAYLEDGER_MAX_CONNECTIONS", 256usize)?,
            compact_threshold: parse_or(&lookup, "STAYLEDGER_COMPACT_THRESHOLD", 1000u64)?,
            metrics_port: parse_opt(&lookup, "STAYLEDGER_METRICS_PORT")?,
            tls_cert: lookup("STAYLEDGER_TLS_CERT"),
            tls_key: lookup("STAYLEDGER_TLS_KEY"),
            protocol,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    /// Build a TLS acceptor when both cert and key are configured.
    pub fn tls_acceptor(&self) -> io::Result<Option<TlsAcceptor>> {
        let (cert_path, key_path) = match (self.tls_cert.as_deref(), self.tls_key.as_deref()) {
            (None, None) => return Ok(None),
            (Some(c), Some(k)) => (c, k),
            _ => {
                return Err(io::Error::new(
                    ErrorKind::InvalidInput,
                    "both STAYLEDGER_TLS_CERT and STAYLEDGER_TLS_KEY must be set, or neither",
                ));
            }
        };

        let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
            .collect::<Result<_, _>>()?;
        let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
            .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "no private key found in key file"))?;

        let mut config = RustlsConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;
        config.alpn_protocols = vec![b"postgresql".to_vec()];

        Ok(Some(TlsAcceptor::from(Arc::new(config))))
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    Ok(parse_opt(lookup, var)?.unwrap_or(default))
}

fn parse_opt<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value: raw }),
    }
}
