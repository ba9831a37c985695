use anyhow::{Context, Result};
use discovery_core::{BalancingPolicy, DialOptions};
use discovery_zk::ZkConfig;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "config/discovery.yaml";

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Deserialize)]
pub struct FileConfig {
    pub servers: Vec<String>,
    #[serde(default = "default_scheme")]
    pub scheme: String,
    #[serde(default)]
    pub root_prefix: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub refresh_secs: Option<u64>,
    #[serde(default)]
    pub session_timeout_secs: Option<u64>,
    #[serde(default)]
    pub connect_timeout_secs: Option<u64>,
    #[serde(default)]
    pub balancer: BalancingPolicy,
    #[serde(default)]
    pub register: Option<RegisterConfig>,
    #[serde(default)]
    pub watch: Vec<String>,
    #[serde(default = "default_poll_secs")]
    pub poll_secs: u64,
    #[serde(default)]
    pub log_format: LogFormat,
}

/// The instance this daemon announces
#[derive(Debug, Deserialize)]
pub struct RegisterConfig {
    pub service: String,
    pub host: String,
    pub port: u16,
}

fn default_scheme() -> String {
    "openim".to_string()
}

fn default_poll_secs() -> u64 {
    30
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(raw)?)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_secs.max(1))
    }

    pub fn to_zk_config(&self) -> Result<ZkConfig> {
        let mut builder = ZkConfig::builder(self.servers.clone(), self.scheme.clone())
            .balancer(self.balancer);

        if let Some(prefix) = &self.root_prefix {
            builder = builder.root_prefix(prefix.clone());
        }
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => {
                builder = builder.credentials(username.clone(), password.clone());
            }
            (None, None) => {}
            _ => anyhow::bail!("username and password must be set together"),
        }
        if let Some(secs) = self.refresh_secs {
            builder = builder.refresh_interval(Duration::from_secs(secs));
        }
        if let Some(secs) = self.session_timeout_secs {
            builder = builder.session_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = self.connect_timeout_secs {
            builder = builder
                .dial_options(DialOptions::new().with_connect_timeout(Duration::from_secs(secs)));
        }

        Ok(builder.build()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let config = FileConfig::parse("servers: [\"127.0.0.1:2181\"]\n").unwrap();
        assert_eq!(config.scheme, "openim");
        assert_eq!(config.poll_secs, 30);
        assert_eq!(config.balancer, BalancingPolicy::RoundRobin);
        assert_eq!(config.log_format, LogFormat::Text);
        assert!(config.register.is_none());

        let zk = config.to_zk_config().unwrap();
        assert_eq!(zk.root_path(), "/openim");
    }

    #[test]
    fn test_parse_full_config() {
        let raw = r#"
servers:
  - zk-0:2181
  - zk-1:2181
scheme: chat
root_prefix: /prod
username: admin
password: secret
refresh_secs: 60
balancer: pick_first
register:
  service: order-svc
  host: 10.0.0.5
  port: 9000
watch: [user-svc, msg-svc]
log_format: json
"#;
        let config = FileConfig::parse(raw).unwrap();
        assert_eq!(config.balancer, BalancingPolicy::PickFirst);
        assert_eq!(config.watch, vec!["user-svc", "msg-svc"]);
        assert_eq!(config.register.as_ref().unwrap().port, 9000);
        assert_eq!(config.log_format, LogFormat::Json);

        let zk = config.to_zk_config().unwrap();
        assert_eq!(zk.root_path(), "/prod/chat");
        assert_eq!(zk.refresh_interval, Duration::from_secs(60));
        assert!(zk.credentials.is_some());
    }

    #[test]
    fn test_half_credentials_rejected() {
        let config = FileConfig::parse("servers: [a]\nusername: admin\n").unwrap();
        assert!(config.to_zk_config().is_err());
    }
}
