// -*- coding: utf-8 -*-
//
// Licensed under the Apache License version 2.0
// or the MIT license, at your option.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! This crate implements the configuration file parsing of `portknock`.
//!
//! Defaults for missing configuration entries and the bootstrap
//! example configuration are implemented here.

#![forbid(unsafe_code)]

use serde::{Deserialize, Deserializer};
use std::{
    collections::HashSet,
    fs,
    net::Ipv4Addr,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;

/// The default configuration path.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/portknock/config.yaml";

/// Grant duration used when `expire_seconds` is missing or not positive.
const DEFAULT_EXPIRE_SECONDS: i64 = 300;

/// Commented example configuration written on first start.
const EXAMPLE_CONFIG: &str = "\
# portknock example configuration.
#
# Every service entry must contain:
# - name: unique service identifier
# - interface: network interface to capture on (e.g. eth0)
# - knock_ports: ordered knock sequence
# - allow_port: the protected port (e.g. SSH 22)
# Optional:
# - expire_seconds: grant duration (default 300)
# - step_timeout_seconds: per-step limit (default: expire_seconds)
# - whitelist: IPv4 addresses granted at startup

services:
  # Remove the leading '#' and adjust the values to enable a service.
  #
  #- name: SSHGuard
  #  interface: eth0
  #  knock_ports: [1000, 2000, 3000]
  #  allow_port: 22
  #  expire_seconds: 60
  #  step_timeout_seconds: 5
";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration YAML: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),

    #[error("Configuration: {field}: {message}")]
    Validation { field: String, message: String },

    #[error(
        "No configuration found. \
         A commented example has been written to '{0}'. \
         Please edit it and enable at least one service."
    )]
    ExampleWritten(PathBuf),
}

fn invalid(field: impl Into<String>, message: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        field: field.into(),
        message: message.into(),
    }
}

/// Deserialize a list key whose value may be left empty.
///
/// YAML renders a key without a value as `null`, which serde would
/// reject for a plain `Vec`. The bootstrap example config ships with
/// all service entries commented out, so `services:` parses as `null`
/// and must become the empty list for validation to report it.
fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

/// One knock protected service.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    /// Unique service identifier.
    pub name: String,

    /// Network interface the capture binds to.
    pub interface: String,

    /// Ordered knock sequence. Duplicates are allowed and matched positionally.
    pub knock_ports: Vec<u16>,

    /// The protected port.
    pub allow_port: u16,

    #[serde(default)]
    expire_seconds: i64,

    /// Maximum inter-step duration.
    ///
    /// Parsed and validated, but per-step enforcement is pending;
    /// only the global staleness window is enforced right now.
    #[serde(default)]
    step_timeout_seconds: i64,

    /// Source addresses granted at startup, without expiry.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub whitelist: Vec<Ipv4Addr>,
}

impl ServiceConfig {
    /// Duration a completed knock sequence keeps the allow port open.
    pub fn grant_duration(&self) -> Duration {
        Duration::from_secs(self.expire_seconds as u64)
    }

    /// Maximum duration between two accepted knock steps.
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_seconds as u64)
    }

    /// Check whether `port` is a member of the knock sequence.
    pub fn is_knock_port(&self, port: u16) -> bool {
        self.knock_ports.contains(&port)
    }

    fn apply_defaults(&mut self) {
        if self.expire_seconds <= 0 {
            self.expire_seconds = DEFAULT_EXPIRE_SECONDS;
        }
        if self.step_timeout_seconds <= 0 {
            self.step_timeout_seconds = self.expire_seconds;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(invalid("services.name", "service name must not be empty"));
        }
        if self.interface.trim().is_empty() {
            return Err(invalid(
                format!("services.{}.interface", self.name),
                "interface must not be empty",
            ));
        }
        if self.knock_ports.is_empty() {
            return Err(invalid(
                format!("services.{}.knock_ports", self.name),
                "the knock sequence must contain at least one port",
            ));
        }
        if self.knock_ports.contains(&self.allow_port) {
            return Err(invalid(
                format!("services.{}.allow_port", self.name),
                format!(
                    "protected port {} must not be part of its own knock sequence",
                    self.allow_port
                ),
            ));
        }
        Ok(())
    }
}

/// The parsed top level configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub services: Vec<ServiceConfig>,
}

impl Config {
    /// Get the default configuration path.
    pub fn default_path() -> PathBuf {
        PathBuf::from(DEFAULT_CONFIG_PATH)
    }

    /// Read and parse the configuration file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse a configuration from a YAML string and validate it.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let mut config: Self = serde_yaml_ng::from_str(yaml)?;
        for service in &mut config.services {
            service.apply_defaults();
        }
        config.validate()?;
        Ok(config)
    }

    /// Make sure a configuration file exists at `path`.
    ///
    /// If it does not, write the commented example configuration
    /// and return [ConfigError::ExampleWritten].
    pub fn ensure_exists(path: &Path) -> Result<(), ConfigError> {
        if path.exists() {
            return Ok(());
        }
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(path, EXAMPLE_CONFIG)?;
        Err(ConfigError::ExampleWritten(path.to_path_buf()))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.services.is_empty() {
            return Err(invalid("services", "the services list must not be empty"));
        }
        let mut names = HashSet::new();
        for service in &self.services {
            service.validate()?;
            if !names.insert(service.name.as_str()) {
                return Err(invalid(
                    "services.name",
                    format!("duplicate service name '{}'", service.name),
                ));
            }
        }
        Ok(())
    }
}


// vim: ts=4 sw=4 expandtab
