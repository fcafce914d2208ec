use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, bail};

/// Placeholder JWT secrets that MUST NOT be used.
const PLACEHOLDER_SECRETS: &[&str] = &[
    "change-me-to-a-random-string",
    "dev-secret-change-me",
];

#[derive(Debug, Clone)]
pub struct Config {
    pub jwt_secret: String,
    pub db_path: PathBuf,
    pub addr: SocketAddr,
    pub typing_sweep_secs: u64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let jwt_secret = lookup("MURMUR_JWT_SECRET").unwrap_or_default();
        if jwt_secret.is_empty() || PLACEHOLDER_SECRETS.contains(&jwt_secret.as_str()) {
            bail!("MURMUR_JWT_SECRET is unset or still a placeholder; it must match the identity provider's signing secret");
        }

        let db_path: PathBuf = lookup("MURMUR_DB_PATH")
            .unwrap_or_else(|| "murmur.db".into())
            .into();
        let host = lookup("MURMUR_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let port: u16 = lookup("MURMUR_PORT")
            .unwrap_or_else(|| "3000".into())
            .parse()
            .context("MURMUR_PORT must be a port number")?;
        let addr: SocketAddr = format!("{}:{}", host, port)
            .parse()
            .context("MURMUR_HOST must be an IP address")?;
        let typing_sweep_secs: u64 = lookup("MURMUR_TYPING_SWEEP_SECS")
            .and_then(|v| v.parse().ok())
            .filter(|secs| *secs > 0)
            .unwrap_or(60);

        Ok(Self {
            jwt_secret,
            db_path,
            addr,
            typing_sweep_secs,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> anyhow::Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply() {
        let config = load(&[("MURMUR_JWT_SECRET", "s3cret")]).unwrap();
        assert_eq!(config.db_path, PathBuf::from("murmur.db"));
        assert_eq!(config.addr, "0.0.0.0:3000".parse().unwrap());
        assert_eq!(config.typing_sweep_secs, 60);
    }

    #[test]
    fn placeholder_secret_is_refused() {
        assert!(load(&[]).is_err());
        assert!(load(&[("MURMUR_JWT_SECRET", "dev-secret-change-me")]).is_err());
    }

    #[test]
    fn bad_port_is_an_error() {
        let result = load(&[("MURMUR_JWT_SECRET", "s3cret"), ("MURMUR_PORT", "http")]);
        assert!(result.is_err());
    }

    #[test]
    fn overrides_are_read() {
        let config = load(&[
            ("MURMUR_JWT_SECRET", "s3cret"),
            ("MURMUR_DB_PATH", "/tmp/chat.db"),
            ("MURMUR_HOST", "127.0.0.1"),
            ("MURMUR_PORT", "8080"),
            ("MURMUR_TYPING_SWEEP_SECS", "5"),
        ])
        .unwrap();
        assert_eq!(config.db_path, PathBuf::from("/tmp/chat.db"));
        assert_eq!(config.addr, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(config.typing_sweep_secs, 5);
    }
}
