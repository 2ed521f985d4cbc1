use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub channel: Vec<ChannelConfig>,
    #[serde(default)]
    pub connection: Vec<ConnectionConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfig {
    /// Channel number the NABU selects with CHANGE_CHANNEL. Zero is the
    /// "no channel" sentinel on connections and is not a valid number.
    pub number: i16,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ChannelKindConfig,
    /// Directory the channel's image files live in.
    pub directory: PathBuf,
    #[serde(default)]
    pub default_file: Option<String>,
    #[serde(default)]
    pub retronet: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKindConfig {
    /// Raw image files; the daemon wraps each segment itself.
    Nabu,
    /// Pre-wrapped archives; segments are extracted and re-CRC'd.
    Pak,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    #[serde(rename = "type")]
    pub kind: ConnectionKindConfig,
    /// Serial device path, or numeric TCP port.
    pub port: String,
    /// Channel to pre-select before the NABU asks.
    #[serde(default)]
    pub channel: Option<i16>,
    /// Image file to pre-select on the channel.
    #[serde(default)]
    pub file: Option<String>,
    /// Root of this connection's local storage.
    #[serde(default)]
    pub file_root: Option<PathBuf>,
    /// Serial only. Unset means the NABU-native rate with fallback.
    #[serde(default)]
    pub baud: Option<u32>,
    #[serde(default = "ConnectionConfig::default_stop_bits")]
    pub stop_bits: u8,
    #[serde(default)]
    pub flow_control: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKindConfig {
    Serial,
    Tcp,
}

impl ConnectionConfig {
    // The NABU's UART loses sync on long bursts at 1 stop bit.
    fn default_stop_bits() -> u8 {
        2
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let txt = fs::read_to_string(path)
            .with_context(|| format!("unable to read config {}", path.display()))?;
        let cfg: Config = toml::from_str(&txt)
            .with_context(|| format!("unable to parse config {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        for chan in &self.channel {
            if chan.number == 0 {
                bail!("channel '{}': number must be non-zero", chan.name);
            }
        }
        for conn in &self.connection {
            match conn.kind {
                ConnectionKindConfig::Serial => {
                    if conn.stop_bits != 1 && conn.stop_bits != 2 {
                        bail!("serial {}: stop_bits must be 1 or 2", conn.port);
                    }
                }
                ConnectionKindConfig::Tcp => {
                    let port: u16 = conn
                        .port
                        .parse()
                        .with_context(|| format!("invalid TCP port number: {}", conn.port))?;
                    if port == 0 {
                        bail!("invalid TCP port number: {}", conn.port);
                    }
                }
            }
        }
        Ok(())
    }
}
