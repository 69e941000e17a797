use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use pgwire::tokio::tokio_rustls::rustls::ServerConfig;
use pgwire::tokio::TlsAcceptor;

const WAL_FILE_NAME: &str = "gearbook.wal";

/// Server settings, read once at startup from `GEARBOOK_*` variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// Appends between WAL compactions.
    pub compact_threshold: u64,
    /// Bound on each lock wait and each commit.
    pub persist_timeout: Duration,
    pub metrics_port: Option<u16>,
    pub tls: Option<TlsFiles>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub cert: PathBuf,
    pub key: PathBuf,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unset and empty variables take their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let tls = match (get("GEARBOOK_TLS_CERT"), get("GEARBOOK_TLS_KEY")) {
            (None, None) => None,
            (Some(cert), Some(key)) => Some(TlsFiles {
                cert: cert.into(),
                key: key.into(),
            }),
            _ => return Err(ConfigError::TlsPair),
        };

        let persist_timeout_ms: u64 = parse_var(&get, "GEARBOOK_PERSIST_TIMEOUT_MS", 2000)?;
        let config = Self {
            bind: get("GEARBOOK_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_var(&get, "GEARBOOK_PORT", 5434)?,
            data_dir: get("GEARBOOK_DATA_DIR")
                .unwrap_or_else(|| "./data".into())
                .into(),
            password: get("GEARBOOK_PASSWORD").unwrap_or_else(|| "gearbook".into()),
            max_connections: parse_var(&get, "GEARBOOK_MAX_CONNECTIONS", 256)?,
            compact_threshold: parse_var(&get, "GEARBOOK_COMPACT_THRESHOLD", 1000)?,
            persist_timeout: Duration::from_millis(persist_timeout_ms),
            metrics_port: get("GEARBOOK_METRICS_PORT")
                .map(|raw| parse_value("GEARBOOK_METRICS_PORT", &raw))
                .transpose()?,
            tls,
        };

        for (var, zero) in [
            ("GEARBOOK_MAX_CONNECTIONS", config.max_connections == 0),
            ("GEARBOOK_COMPACT_THRESHOLD", config.compact_threshold == 0),
            ("GEARBOOK_PERSIST_TIMEOUT_MS", config.persist_timeout.is_zero()),
        ] {
            if zero {
                return Err(ConfigError::Invalid {
                    var,
                    value: "0".into(),
                    reason: "must be positive".into(),
                });
            }
        }
        Ok(config)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join(WAL_FILE_NAME)
    }

    pub fn tls_acceptor(&self) -> Result<Option<TlsAcceptor>, ConfigError> {
        match &self.tls {
            None => Ok(None),
            Some(files) => load_tls_acceptor(&files.cert, &files.key)
                .map(Some)
                .map_err(ConfigError::Tls),
        }
    }
}

fn parse_var<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match get(var) {
        Some(raw) => parse_value(var, &raw),
        None => Ok(default),
    }
}

fn parse_value<T: std::str::FromStr>(var: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        var,
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

fn load_tls_acceptor(cert_path: &Path, key_path: &Path) -> io::Result<TlsAcceptor> {
    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
        .collect::<Result<_, _>>()?;

    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no private key found in key file"))?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    config.alpn_protocols = vec![b"postgresql".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}={value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("both GEARBOOK_TLS_CERT and GEARBOOK_TLS_KEY must be set, or neither")]
    TlsPair,
    #[error("loading TLS material: {0}")]
    Tls(#[source] io::Error),
}
