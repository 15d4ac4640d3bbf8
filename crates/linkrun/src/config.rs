//! # Configuration
//!
//! Settings for the two roles. Both are plain data with defaults and fluent
//! setters; they derive `Deserialize` so a host can load them from its own
//! configuration files.

use std::time::Duration;

use serde::Deserialize;

use crate::error::Error;
use crate::error::Result;
use crate::verify::Identity;

/// Settings for the accepting side.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Pause between a transport connecting and the verification challenge
    /// being sent, giving the initiating side time to install its handlers.
    pub verification_delay: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            verification_delay: Duration::from_millis(250),
        }
    }
}

impl HubConfig {
    pub fn verification_delay(mut self, delay: Duration) -> Self {
        self.verification_delay = delay;
        self
    }
}

/// Settings for the initiating side.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Where the connector should connect to.
    pub address: String,
    /// Announced during verification; must not be blank.
    pub id: String,
    pub name: String,
    pub port: i32,
    /// Whether to connect again after the connection ends.
    pub reconnect: bool,
    /// Pause between failed connection attempts.
    pub reconnect_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            id: String::new(),
            name: String::new(),
            port: 0,
            reconnect: true,
            reconnect_delay: Duration::from_secs(2),
        }
    }
}

impl ClientConfig {
    pub fn new(address: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn port(mut self, port: i32) -> Self {
        self.port = port;
        self
    }

    pub fn reconnect(mut self, reconnect: bool) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Checks the settings a connection cannot work without.
    pub fn validate(&self) -> Result<()> {
        if self.address.trim().is_empty() {
            return Err(Error::Config("address must be set".into()));
        }
        if self.id.trim().is_empty() {
            return Err(Error::Config("id must be set".into()));
        }
        if !(0..=i32::from(u16::MAX)).contains(&self.port) {
            return Err(Error::Config(format!("port {} is out of range", self.port)));
        }
        Ok(())
    }

    /// The identity announced in the verification response.
    pub fn identity(&self) -> Identity {
        Identity {
            name: self.name.clone(),
            id: self.id.clone(),
            port: self.port,
        }
    }
}
