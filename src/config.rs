use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use pgwire::tokio::TlsAcceptor;
use pgwire::tokio::tokio_rustls::rustls::ServerConfig;

/// Server settings, read once from `BUNKHOUSE_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "bunkhouse".into(),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unparseable numbers fall back to the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            port: parse_var(&lookup, "BUNKHOUSE_PORT").unwrap_or(defaults.port),
            bind: lookup("BUNKHOUSE_BIND").unwrap_or(defaults.bind),
            data_dir: lookup("BUNKHOUSE_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            password: lookup("BUNKHOUSE_PASSWORD").unwrap_or(defaults.password),
            max_connections: parse_var(&lookup, "BUNKHOUSE_MAX_CONNECTIONS")
                .unwrap_or(defaults.max_connections),
            compact_threshold: parse_var(&lookup, "BUNKHOUSE_COMPACT_THRESHOLD")
                .unwrap_or(defaults.compact_threshold),
            metrics_port: parse_var(&lookup, "BUNKHOUSE_METRICS_PORT"),
            tls_cert: lookup("BUNKHOUSE_TLS_CERT"),
            tls_key: lookup("BUNKHOUSE_TLS_KEY"),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    /// TLS acceptor from the configured PEM files, `None` when TLS is off.
    pub fn tls_acceptor(&self) -> io::Result<Option<TlsAcceptor>> {
        load_tls_acceptor(self.tls_cert.as_deref(), self.tls_key.as_deref())
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|s| s.trim().parse().ok())
}

pub fn load_tls_acceptor(
    cert_path: Option<&str>,
    key_path: Option<&str>,
) -> io::Result<Option<TlsAcceptor>> {
    let (cert_path, key_path) = match (cert_path, key_path) {
        (None, None) => return Ok(None),
        (Some(c), Some(k)) => (c, k),
        _ => {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                "both BUNKHOUSE_TLS_CERT and BUNKHOUSE_TLS_KEY must be set, or neither",
            ));
        }
    };

    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
        .collect::<Result<_, _>>()?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
        .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "no private key in key file"))?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;
    config.alpn_protocols = vec![b"postgresql".to_vec()];

    Ok(Some(TlsAcceptor::from(Arc::new(config))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Config {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn defaults_without_env() {
        let config = config_from(&[]);
        assert_eq!(config, Config::default());
        assert_eq!(config.listen_addr(), "0.0.0.0:5433");
        assert!(config.tls_acceptor().unwrap().is_none());
    }

    #[test]
    fn env_overrides() {
        let config = config_from(&[
            ("BUNKHOUSE_PORT", "6000"),
            ("BUNKHOUSE_BIND", "127.0.0.1"),
            ("BUNKHOUSE_DATA_DIR", "/var/lib/bunkhouse"),
            ("BUNKHOUSE_PASSWORD", "s3cret"),
            ("BUNKHOUSE_MAX_CONNECTIONS", " 12 "),
            ("BUNKHOUSE_COMPACT_THRESHOLD", "50"),
            ("BUNKHOUSE_METRICS_PORT", "9100"),
        ]);
        assert_eq!(config.listen_addr(), "127.0.0.1:6000");
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/bunkhouse"));
        assert_eq!(config.password, "s3cret");
        assert_eq!(config.max_connections, 12);
        assert_eq!(config.compact_threshold, 50);
        assert_eq!(config.metrics_port, Some(9100));
    }

    #[test]
    fn bad_numbers_fall_back() {
        let config = config_from(&[("BUNKHOUSE_PORT", "not-a-port"), ("BUNKHOUSE_METRICS_PORT", "")]);
        assert_eq!(config.port, 5433);
        assert_eq!(config.metrics_port, None);
    }

    #[test]
    fn tls_needs_cert_and_key() {
        let config = config_from(&[("BUNKHOUSE_TLS_CERT", "/tmp/cert.pem")]);
        let err = config.tls_acceptor().err().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }
}
