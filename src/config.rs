use eyre::{Result, WrapErr};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::protocol::{Address, GATEWAY_ADDRESS_DEFAULT, SWARM_ID_DEFAULT};
use crate::sailbot::SailBot;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Config {
    /// Tick interval [s].
    #[serde(default = "default_interval")]
    pub interval: f64,

    #[serde(default = "default_gateway")]
    pub gateway: Address,

    /// Written as 4 hex digits.
    #[serde(default = "default_swarm_id", with = "hex_u16")]
    pub swarm_id: u16,

    pub bots: Vec<Bot>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Bot {
    pub address: Address,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub heading: Option<u16>,
}

fn default_interval() -> f64 {
    crate::fleet::DEFAULT_INTERVAL.as_secs_f64()
}

fn default_gateway() -> Address {
    GATEWAY_ADDRESS_DEFAULT
}

fn default_swarm_id() -> u16 {
    SWARM_ID_DEFAULT
}

mod hex_u16 {
    use super::*;

    pub fn serialize<S: Serializer>(v: &u16, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format!("{:04x}", v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u16, D::Error> {
        let s = String::deserialize(d)?;
        let hex = s.strip_prefix("0x").unwrap_or(&s);
        u16::from_str_radix(hex, 16).map_err(serde::de::Error::custom)
    }
}

impl Config {
    pub fn default() -> Config {
        Config {
            interval: default_interval(),
            gateway: GATEWAY_ADDRESS_DEFAULT,
            swarm_id: SWARM_ID_DEFAULT,
            bots: vec![Bot {
                address: Address(0x1234567890123456),
                latitude: None,
                longitude: None,
                heading: None,
            }],
        }
    }

    #[cfg(test)]
    pub fn test_config() -> Config {
        Config {
            interval: 0.1,
            gateway: Address(0xff),
            swarm_id: 0x2a,
            bots: vec![
                Bot {
                    address: Address(1),
                    latitude: Some(48.83),
                    longitude: Some(2.41),
                    heading: Some(90),
                },
                Bot {
                    address: Address(2),
                    latitude: None,
                    longitude: None,
                    heading: None,
                },
            ],
        }
    }

    pub fn from_path<P: AsRef<Path>>(p: P) -> Result<Config> {
        let p = p.as_ref();

        let f = fs::read_to_string(p)
            .wrap_err_with(|| format!("could not read config file: {:?}", p))?;
        toml::from_str(&f).wrap_err_with(|| format!("could not parse config file: {:?}", p))
    }

    pub fn interval(&self) -> Result<Duration> {
        ensure!(
            self.interval.is_finite() && self.interval > 0.0,
            "interval must be a positive number of seconds, got: {}",
            self.interval
        );

        Duration::try_from_secs_f64(self.interval)
            .wrap_err_with(|| format!("interval out of range: {}", self.interval))
    }

    /// Build the bots described by the configuration, in order.
    pub fn sailbots(&self) -> Result<Vec<SailBot>> {
        ensure!(!self.bots.is_empty(), "no bots configured");

        self.bots
            .iter()
            .map(|b| {
                let mut bot = SailBot::new(b.address).with_link(self.gateway, self.swarm_id);

                match (b.latitude, b.longitude) {
                    (Some(lat), Some(lon)) => bot = bot.with_position(lat, lon),
                    (None, None) => {}
                    _ => bail!("{}: both latitude and longitude must be given", b.address),
                }

                if let Some(heading) = b.heading {
                    bot = bot.with_heading(heading);
                }

                Ok(bot)
            })
            .collect()
    }
}
