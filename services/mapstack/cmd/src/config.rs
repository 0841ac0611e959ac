//! Configuration handling for the mapstack node.
//!
//! Settings start from defaults, are overlaid by an optional YAML file and
//! finally by `MAPSTACK_*` environment variables.

use anyhow::{bail, Context, Result};
use mapstack_routing::{AddressFilter, DEFAULT_QUEUE_DEPTH};
use mapstack_wire::{AddressType, DecoderConfig, DEFAULT_CONTROL_PREFIX, DEFAULT_OUTPUT_CAPACITY};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Serial framing used on stdin/stdout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Framing {
    /// Control-prefix byte stuffing
    #[default]
    Mep,
    /// Newline-terminated packets, for terminals
    Np,
}

/// EEPROM image settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EepromConfig {
    /// Image file; the edge table is not persisted without one
    pub path: Option<PathBuf>,
    /// Image size in bytes
    pub size: usize,
}

impl Default for EepromConfig {
    fn default() -> Self {
        Self {
            path: None,
            size: 256,
        }
    }
}

/// Node configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Serial framing
    pub framing: Framing,
    /// MEP control prefix byte
    pub control_prefix: u8,
    /// Address type the routing graph answers commands on
    pub local_address_type: u8,
    /// Address value the routing graph answers commands on
    pub local_address_value: u8,
    /// Inbound packet sizing
    pub decoder: DecoderConfig,
    /// Packet slots in the pool
    pub max_packets: usize,
    /// Bytes of packet capacity the pool may hand out
    pub packet_budget: usize,
    /// Encoder output queue size in bytes
    pub output_buffer: usize,
    /// Depth of the queue in front of the echo server
    pub queue_depth: usize,
    /// Reject inbound packets without a checksum
    pub require_checksum: bool,
    /// Strip verified checksums from inbound packets
    pub remove_checksums: bool,
    /// Edge table persistence
    pub eeprom: EepromConfig,
    /// Scheduler tick, e.g. `10ms`
    pub tick_interval: String,
    /// Edges installed when no stored table exists
    pub edges: Vec<AddressFilter>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            framing: Framing::Mep,
            control_prefix: DEFAULT_CONTROL_PREFIX,
            local_address_type: AddressType::DeviceLocalStatic as u8,
            local_address_value: 1,
            decoder: DecoderConfig::default(),
            max_packets: mapstack_wire::DEFAULT_MAX_PACKETS,
            packet_budget: 4096,
            output_buffer: DEFAULT_OUTPUT_CAPACITY,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            require_checksum: false,
            remove_checksums: true,
            eeprom: EepromConfig::default(),
            tick_interval: "10ms".to_string(),
            edges: Vec::new(),
        }
    }
}

/// Parse a control prefix given as a character (`<`), hex (`0x3c`) or decimal
pub fn parse_control_prefix(value: &str) -> Result<u8> {
    let value = value.trim();
    let byte = if let Some(hex) = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        u8::from_str_radix(hex, 16)?
    } else if let Ok(byte) = value.parse::<u8>() {
        byte
    } else {
        let mut chars = value.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) if c.is_ascii() => c as u8,
            _ => bail!("invalid control prefix {:?}", value),
        }
    };
    Ok(byte)
}

impl NodeConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => {
                let config: NodeConfig = serde_yaml::from_str(&content)
                    .with_context(|| format!("parsing config file {:?}", path))?;
                info!("Loaded configuration from {:?}", path);
                config
            }
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;

        info!(
            "Final node configuration: framing={:?}, prefix={:#04x}, local address={}/{}, tick={}",
            config.framing,
            config.control_prefix,
            config.local_address_type,
            config.local_address_value,
            config.tick_interval
        );
        Ok(config)
    }

    /// Apply `MAPSTACK_*` overrides looked up through `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(prefix) = lookup("MAPSTACK_CONTROL_PREFIX") {
            self.control_prefix = parse_control_prefix(&prefix)?;
            info!("Control prefix overridden by environment: {:#04x}", self.control_prefix);
        }
        if let Some(framing) = lookup("MAPSTACK_FRAMING") {
            self.framing = match framing.to_lowercase().as_str() {
                "mep" => Framing::Mep,
                "np" => Framing::Np,
                other => bail!("invalid framing {:?}", other),
            };
            info!("Framing overridden by environment: {:?}", self.framing);
        }
        if let Some(value) = lookup("MAPSTACK_LOCAL_ADDRESS_TYPE") {
            self.local_address_type = value
                .parse()
                .with_context(|| format!("MAPSTACK_LOCAL_ADDRESS_TYPE={}", value))?;
        }
        if let Some(value) = lookup("MAPSTACK_LOCAL_ADDRESS_VALUE") {
            self.local_address_value = value
                .parse()
                .with_context(|| format!("MAPSTACK_LOCAL_ADDRESS_VALUE={}", value))?;
        }
        if let Some(value) = lookup("MAPSTACK_REQUIRE_CHECKSUM") {
            self.require_checksum = value.eq_ignore_ascii_case("true") || value == "1";
        }
        if let Some(path) = lookup("MAPSTACK_EEPROM_PATH") {
            info!("EEPROM image overridden by environment: {}", path);
            self.eeprom.path = Some(PathBuf::from(path));
        }
        if let Some(tick) = lookup("MAPSTACK_TICK_INTERVAL") {
            self.tick_interval = tick;
        }
        Ok(())
    }

    /// Check values the stack would otherwise reject later
    pub fn validate(&self) -> Result<()> {
        mapstack_wire::ControlPrefix::new(self.control_prefix)
            .map_err(|e| anyhow::anyhow!("control_prefix: {}", e))?;
        self.decoder
            .validate()
            .map_err(|e| anyhow::anyhow!("decoder: {}", e))?;
        if self.local_address_type >= AddressType::Extended as u8 {
            bail!("local_address_type {} is out of range", self.local_address_type);
        }
        if self.packet_budget < self.decoder.max_capacity {
            bail!("packet_budget cannot hold one full-size packet");
        }
        if self.output_buffer < 2 {
            bail!("output_buffer must hold a control sequence");
        }
        if self.queue_depth == 0 {
            bail!("queue_depth must be at least 1");
        }
        self.tick_interval()?;
        Ok(())
    }

    /// Parsed scheduler tick
    pub fn tick_interval(&self) -> Result<Duration> {
        humantime::parse_duration(&self.tick_interval)
            .with_context(|| format!("tick_interval {:?}", self.tick_interval))
    }
}
