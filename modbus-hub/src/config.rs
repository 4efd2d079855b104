//! Hub configuration.
//!
//! A configuration file holds an array of `[[hub]]` tables, e.g.
//!
//! ```toml
//! [[hub]]
//! name = "boiler"
//! type = "tcp"
//! host = "192.168.1.20"
//! port = 502
//! timeout = 5
//!
//! [[hub]]
//! name = "panel"
//! type = "serial"
//! port = "/dev/ttyUSB0"
//! baudrate = 9600
//! bytesize = 8
//! method = "rtu"
//! parity = "N"
//! stopbits = 1
//! ```
use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{HubError, Result};

/// Name given to hubs configured without one.
pub const DEFAULT_HUB: &str = "modbus_hub";
pub const DEFAULT_PORT: u16 = 502;
pub const DEFAULT_TIMEOUT: u64 = 3;
const DEFAULT_SERIAL_MESSAGE_WAIT: u64 = 30;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Immutable configuration of one hub.
pub struct HubConfig {
    #[serde(default)]
    pub name: String,
    #[serde(flatten)]
    pub kind: ConnectionKind,
    /// Seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Seconds to wait after connecting before the first transaction.
    #[serde(default)]
    pub delay: u64,
    /// Pause after every transaction, in milliseconds. Serial links default to 30.
    #[serde(default, rename = "message_wait_milliseconds")]
    pub message_wait: Option<u64>,
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ConnectionKind {
    #[serde(rename = "serial")]
    Serial(SerialParams),
    #[serde(rename = "tcp")]
    Tcp(NetParams),
    #[serde(rename = "udp")]
    Udp(NetParams),
    #[serde(rename = "rtuovertcp")]
    RtuOverTcp(NetParams),
    /// Virtual slave listening for Modbus TCP masters.
    #[serde(rename = "tcp-server")]
    TcpServer(NetParams),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetParams {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialParams {
    /// Device path, e.g. `/dev/ttyUSB0`.
    pub port: String,
    pub baudrate: u32,
    pub bytesize: u8,
    pub method: SerialMethod,
    pub parity: Parity,
    pub stopbits: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerialMethod {
    Rtu,
    Ascii,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Parity {
    #[serde(rename = "E")]
    Even,
    #[serde(rename = "O")]
    Odd,
    #[serde(rename = "N")]
    None,
}

impl HubConfig {
    pub fn new(name: impl Into<String>, kind: ConnectionKind) -> Self {
        Self {
            name: name.into(),
            kind,
            timeout: DEFAULT_TIMEOUT,
            delay: 0,
            message_wait: None,
        }
    }

    pub fn tcp(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self::new(name, ConnectionKind::Tcp(NetParams::new(host, port)))
    }

    pub fn tcp_server(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self::new(name, ConnectionKind::TcpServer(NetParams::new(host, port)))
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout = seconds;
        self
    }

    pub fn with_delay(mut self, seconds: u64) -> Self {
        self.delay = seconds;
        self
    }

    pub fn with_message_wait(mut self, milliseconds: u64) -> Self {
        self.message_wait = Some(milliseconds);
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay)
    }

    pub fn message_wait(&self) -> Duration {
        let default = match self.kind {
            ConnectionKind::Serial(_) => DEFAULT_SERIAL_MESSAGE_WAIT,
            _ => 0,
        };
        Duration::from_millis(self.message_wait.unwrap_or(default))
    }

    pub fn is_server(&self) -> bool {
        matches!(self.kind, ConnectionKind::TcpServer(_))
    }

    /// Key identifying the physical endpoint: the device path for serial
    /// links, `host_port` otherwise.
    pub fn endpoint(&self) -> String {
        match &self.kind {
            ConnectionKind::Serial(serial) => serial.port.clone(),
            ConnectionKind::Tcp(net)
            | ConnectionKind::Udp(net)
            | ConnectionKind::RtuOverTcp(net)
            | ConnectionKind::TcpServer(net) => format!("{}_{}", net.host, net.port),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(HubError::config("hub name must not be empty"));
        }
        if self.timeout == 0 {
            return Err(HubError::config(format!("{}: timeout must be positive", self.name)));
        }
        match &self.kind {
            ConnectionKind::Serial(serial) => serial.validate(&self.name),
            ConnectionKind::Tcp(net)
            | ConnectionKind::Udp(net)
            | ConnectionKind::RtuOverTcp(net)
            | ConnectionKind::TcpServer(net) => {
                if net.host.trim().is_empty() {
                    return Err(HubError::config(format!("{}: host is required", self.name)));
                }
                Ok(())
            }
        }
    }
}

impl NetParams {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl SerialParams {
    fn validate(&self, hub: &str) -> Result<()> {
        if self.port.trim().is_empty() {
            return Err(HubError::config(format!("{hub}: serial port is required")));
        }
        if self.baudrate == 0 {
            return Err(HubError::config(format!("{hub}: baudrate must be positive")));
        }
        if !(5..=8).contains(&self.bytesize) {
            return Err(HubError::config(format!(
                "{hub}: bytesize {} not in 5..=8",
                self.bytesize
            )));
        }
        if !matches!(self.stopbits, 1 | 2) {
            return Err(HubError::config(format!(
                "{hub}: stopbits {} must be 1 or 2",
                self.stopbits
            )));
        }
        Ok(())
    }
}

/// Give unnamed hubs a default name and drop hubs whose name or endpoint
/// duplicates an earlier one.
pub fn validate_hubs(hubs: Vec<HubConfig>) -> Vec<HubConfig> {
    let mut names = HashSet::new();
    let mut endpoints = HashSet::new();
    let mut unnamed = 0;
    let mut valid = Vec::with_capacity(hubs.len());

    for mut hub in hubs {
        let endpoint = hub.endpoint();
        if hub.name.trim().is_empty() {
            hub.name = match unnamed {
                0 => DEFAULT_HUB.to_owned(),
                n => format!("{DEFAULT_HUB}_{n}"),
            };
            unnamed += 1;
            warn!(endpoint = %endpoint, name = %hub.name, "hub is missing a name");
        }
        if endpoints.contains(&endpoint) || names.contains(&hub.name) {
            warn!(endpoint = %endpoint, name = %hub.name, "duplicate hub, not loaded");
            continue;
        }
        endpoints.insert(endpoint);
        names.insert(hub.name.clone());
        valid.push(hub);
    }

    valid
}

#[derive(Debug, Deserialize)]
struct HubsFile {
    #[serde(default, rename = "hub")]
    hubs: Vec<HubConfig>,
}

/// Parse and validate a TOML document with `[[hub]]` tables.
pub fn from_toml_str(document: &str) -> Result<Vec<HubConfig>> {
    let file: HubsFile = toml::from_str(document).map_err(|e| HubError::config(e.to_string()))?;
    let hubs = validate_hubs(file.hubs);
    for hub in &hubs {
        hub.validate()?;
    }
    Ok(hubs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_connection_kind() {
        let hubs = from_toml_str(
            r#"
            [[hub]]
            name = "net"
            type = "tcp"
            host = "10.0.0.1"

            [[hub]]
            name = "dgram"
            type = "udp"
            host = "10.0.0.2"
            port = 5020
            timeout = 1

            [[hub]]
            name = "bridge"
            type = "rtuovertcp"
            host = "10.0.0.3"
            port = 4001
            delay = 2

            [[hub]]
            name = "slave"
            type = "tcp-server"
            host = "0.0.0.0"
            port = 5502

            [[hub]]
            name = "bus"
            type = "serial"
            port = "/dev/ttyUSB0"
            baudrate = 19200
            bytesize = 8
            method = "rtu"
            parity = "E"
            stopbits = 1
            "#,
        )
        .unwrap();

        assert_eq!(hubs.len(), 5);
        assert_eq!(hubs[0], HubConfig::tcp("net", "10.0.0.1", DEFAULT_PORT));
        assert_eq!(hubs[1].kind, ConnectionKind::Udp(NetParams::new("10.0.0.2", 5020)));
        assert_eq!(hubs[1].timeout(), Duration::from_secs(1));
        assert_eq!(hubs[2].delay(), Duration::from_secs(2));
        assert!(hubs[3].is_server());
        let ConnectionKind::Serial(serial) = &hubs[4].kind else {
            panic!("expected serial hub");
        };
        assert_eq!(serial.parity, Parity::Even);
        assert_eq!(serial.method, SerialMethod::Rtu);
        assert_eq!(hubs[4].message_wait(), Duration::from_millis(30));
        assert_eq!(hubs[0].message_wait(), Duration::ZERO);
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let toml = "[[hub]]\nname = \"x\"\ntype = \"carrier-pigeon\"\nhost = \"a\"\n";
        let err = from_toml_str(toml).unwrap_err();
        assert!(matches!(err, HubError::Config(_)));
    }

    #[test]
    fn serial_ranges_are_checked() {
        let params = SerialParams {
            port: "/dev/ttyS0".into(),
            baudrate: 9600,
            bytesize: 9,
            method: SerialMethod::Rtu,
            parity: Parity::None,
            stopbits: 1,
        };
        let hub = HubConfig::new("bus", ConnectionKind::Serial(params.clone()));
        assert!(hub.validate().is_err());

        let serial = SerialParams {
            bytesize: 8,
            stopbits: 3,
            ..params.clone()
        };
        let hub = HubConfig::new("bus", ConnectionKind::Serial(serial));
        assert!(hub.validate().is_err());

        let serial = SerialParams {
            bytesize: 7,
            ..params
        };
        let hub = HubConfig::new("bus", ConnectionKind::Serial(serial));
        assert!(hub.validate().is_ok());
    }

    #[test]
    fn network_hubs_need_a_host() {
        assert!(HubConfig::tcp("x", " ", 502).validate().is_err());
        assert!(HubConfig::tcp("x", "localhost", 502).with_timeout(0).validate().is_err());
        assert!(HubConfig::tcp("", "localhost", 502).validate().is_err());
    }

    #[test]
    fn duplicates_are_dropped_and_names_defaulted() {
        let hubs = validate_hubs(vec![
            HubConfig::tcp("a", "host", 502),
            HubConfig::tcp("a", "other", 502),
            HubConfig::tcp("b", "host", 502),
            HubConfig::tcp("", "third", 502),
            HubConfig::tcp("", "fourth", 502),
        ]);
        let names = hubs.iter().map(|hub| hub.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["a", DEFAULT_HUB, "modbus_hub_1"]);
    }
}
