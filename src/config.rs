use anyhow::{anyhow, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

const USER_AGENT: &str = "sipedge";

#[derive(Parser, Debug)]
#[command(version, about = "Stateful SIP edge proxy")]
pub struct Cli {
    /// Optional TOML configuration file; environment variables override it
    #[clap(long)]
    pub conf: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SipProtocol {
    Udp,
    Tcp,
    Tls,
}

impl Default for SipProtocol {
    fn default() -> Self {
        Self::Udp
    }
}

impl FromStr for SipProtocol {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "udp" => Ok(Self::Udp),
            "tcp" => Ok(Self::Tcp),
            "tls" => Ok(Self::Tls),
            other => Err(anyhow!("unknown SIP protocol: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum LocationStoreConfig {
    Memory,
    Redis { url: String },
}

impl Default for LocationStoreConfig {
    fn default() -> Self {
        Self::Redis {
            url: "localhost:6379".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_addr")]
    pub addr: String,
    #[serde(default = "default_sip_port")]
    pub sip_port: u16,
    #[serde(default)]
    pub sip_protocol: SipProtocol,
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,
    #[serde(default)]
    pub location_store: LocationStoreConfig,
    /// Money deducted per connected-call second
    #[serde(default = "default_bill_rate")]
    pub bill_rate: f64,
    #[serde(default = "default_bill_workers")]
    pub bill_workers: usize,
    #[serde(default = "default_bill_queue_depth")]
    pub bill_queue_depth: usize,
    /// Failed REGISTER attempts before the source IP is blacklisted
    #[serde(default = "default_fw_threshold")]
    pub fw_threshold: u32,
    /// Registration TTL in seconds
    #[serde(default = "default_reg_ttl")]
    pub reg_ttl: u64,
    #[serde(default)]
    pub record_route: bool,
    /// Dial prefixes recognized by the routing fan-out, longest match wins
    #[serde(default = "default_country_codes")]
    pub country_codes: Vec<String>,
    pub useragent: Option<String>,
    pub log_level: Option<String>,
    pub log_file: Option<String>,
    pub ssl_private_key: Option<String>,
    pub ssl_certificate: Option<String>,
}

fn default_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_sip_port() -> u16 {
    5060
}

fn default_admin_port() -> u16 {
    8080
}

fn default_bill_rate() -> f64 {
    0.01
}

fn default_bill_workers() -> usize {
    100
}

fn default_bill_queue_depth() -> usize {
    10_000
}

fn default_fw_threshold() -> u32 {
    5
}

fn default_reg_ttl() -> u64 {
    3600
}

fn default_country_codes() -> Vec<String> {
    [
        "972", "971", "970", "966", "965", "964", "963", "962", "961", "20", "90", "44", "1",
        "49", "33", "86",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            sip_port: default_sip_port(),
            sip_protocol: SipProtocol::default(),
            admin_port: default_admin_port(),
            location_store: LocationStoreConfig::default(),
            bill_rate: default_bill_rate(),
            bill_workers: default_bill_workers(),
            bill_queue_depth: default_bill_queue_depth(),
            fw_threshold: default_fw_threshold(),
            reg_ttl: default_reg_ttl(),
            record_route: false,
            country_codes: default_country_codes(),
            useragent: Some(USER_AGENT.to_string()),
            log_level: None,
            log_file: None,
            ssl_private_key: None,
            ssl_certificate: None,
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let config = toml::from_str(
            &std::fs::read_to_string(path).map_err(|e| anyhow!("{}: {}", e, path))?,
        )?;
        Ok(config)
    }

    /// Overlay the environment table on top of the file (or default) layer.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(url) = std::env::var("LOCATION_STORE_URL") {
            self.location_store = LocationStoreConfig::Redis { url };
        }
        if let Ok(port) = std::env::var("SIP_PORT") {
            self.sip_port = port.parse().map_err(|e| anyhow!("SIP_PORT: {}", e))?;
        }
        if let Ok(proto) = std::env::var("SIP_PROTOCOL") {
            self.sip_protocol = proto.parse()?;
        }
        if let Ok(port) = std::env::var("ADMIN_PORT") {
            self.admin_port = port.parse().map_err(|e| anyhow!("ADMIN_PORT: {}", e))?;
        }
        if let Ok(rate) = std::env::var("BILL_RATE") {
            self.bill_rate = rate.parse().map_err(|e| anyhow!("BILL_RATE: {}", e))?;
        }
        if let Ok(workers) = std::env::var("BILL_WORKERS") {
            self.bill_workers = workers.parse().map_err(|e| anyhow!("BILL_WORKERS: {}", e))?;
        }
        if let Ok(depth) = std::env::var("BILL_QUEUE_DEPTH") {
            self.bill_queue_depth = depth
                .parse()
                .map_err(|e| anyhow!("BILL_QUEUE_DEPTH: {}", e))?;
        }
        if let Ok(threshold) = std::env::var("FW_THRESHOLD") {
            self.fw_threshold = threshold
                .parse()
                .map_err(|e| anyhow!("FW_THRESHOLD: {}", e))?;
        }
        if let Ok(ttl) = std::env::var("REG_TTL") {
            self.reg_ttl = ttl.parse().map_err(|e| anyhow!("REG_TTL: {}", e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let config = Config::default();
        assert_eq!(config.sip_port, 5060);
        assert_eq!(config.sip_protocol, SipProtocol::Udp);
        assert_eq!(config.admin_port, 8080);
        assert_eq!(config.bill_rate, 0.01);
        assert_eq!(config.bill_workers, 100);
        assert_eq!(config.bill_queue_depth, 10_000);
        assert_eq!(config.fw_threshold, 5);
        assert_eq!(config.reg_ttl, 3600);
        assert!(!config.record_route);
        assert!(matches!(
            config.location_store,
            LocationStoreConfig::Redis { ref url } if url == "localhost:6379"
        ));
    }

    #[test]
    fn protocol_parsing() {
        assert_eq!("udp".parse::<SipProtocol>().unwrap(), SipProtocol::Udp);
        assert_eq!("TCP".parse::<SipProtocol>().unwrap(), SipProtocol::Tcp);
        assert_eq!("tls".parse::<SipProtocol>().unwrap(), SipProtocol::Tls);
        assert!("sctp".parse::<SipProtocol>().is_err());
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = Config::default();
        let dumped = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&dumped).unwrap();
        assert_eq!(parsed.sip_port, config.sip_port);
        assert_eq!(parsed.country_codes, config.country_codes);
    }

    #[test]
    fn partial_file_uses_defaults() {
        let parsed: Config = toml::from_str("sip_port = 15060\n").unwrap();
        assert_eq!(parsed.sip_port, 15060);
        assert_eq!(parsed.bill_workers, 100);
        assert_eq!(parsed.country_codes.len(), 16);
    }
}
