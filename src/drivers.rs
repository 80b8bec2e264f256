//! Collection-driver bindings.
//!
//! A driver is whatever gathers the probe data for a host: a daemon pushed to
//! over UDP, a local executable, or a command run on the monitored host over
//! ssh. The engine only knows the closed set of binding kinds here; the probe
//! implementations behind them are out of scope.
//!
//! Descriptors come from the config file and are resolved once at startup. A
//! malformed descriptor is fatal; per-host delivery failures are logged and
//! absorbed, the next monitor cycle retries.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::process::Stdio;

use rsa::RsaPublicKey;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::{DriverConfig, DriverEndpointConfig, HostConfig};
use crate::protocol::Message;
use crate::transport::{UdpSender, crypto};

#[derive(Debug)]
pub enum DriverError {
    /// A driver descriptor could not be resolved. Fatal at startup.
    ConfigInvalid(String),

    /// Delivery to the driver failed. Never fatal.
    SendFailed(String),

    /// The host references a driver no descriptor defines.
    UnknownDriver(String),
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverError::ConfigInvalid(msg) => write!(f, "invalid driver config: {}", msg),
            DriverError::SendFailed(msg) => write!(f, "driver send failed: {}", msg),
            DriverError::UnknownDriver(name) => write!(f, "unknown driver: {}", name),
        }
    }
}

impl std::error::Error for DriverError {}

/// A resolved driver endpoint.
#[derive(Debug)]
enum Endpoint {
    Udp {
        address: Option<SocketAddr>,
        public_key: Option<RsaPublicKey>,
    },
    Local {
        command: String,
        arguments: Vec<String>,
    },
    Ssh {
        host: String,
        command: String,
    },
}

/// One loaded driver.
#[derive(Debug)]
pub struct DriverBinding {
    name: String,
    endpoint: Endpoint,
}

impl DriverBinding {
    fn load(config: &DriverConfig) -> Result<Self, DriverError> {
        let endpoint = match &config.endpoint {
            DriverEndpointConfig::Udp {
                address,
                public_key,
            } => {
                let address = address
                    .as_deref()
                    .map(|a| {
                        a.parse().map_err(|_| {
                            DriverError::ConfigInvalid(format!(
                                "driver {}: bad address {a:?}",
                                config.name
                            ))
                        })
                    })
                    .transpose()?;

                let public_key = public_key
                    .as_deref()
                    .map(|path| {
                        crypto::load_public_key(path).map_err(|e| {
                            DriverError::ConfigInvalid(format!(
                                "driver {}: cannot load public key: {e}",
                                config.name
                            ))
                        })
                    })
                    .transpose()?;

                Endpoint::Udp {
                    address,
                    public_key,
                }
            }

            DriverEndpointConfig::Local { command, arguments } => {
                if command.is_empty() {
                    return Err(DriverError::ConfigInvalid(format!(
                        "driver {}: empty command",
                        config.name
                    )));
                }
                Endpoint::Local {
                    command: command.clone(),
                    arguments: arguments.clone(),
                }
            }

            DriverEndpointConfig::Ssh { host, command } => {
                if host.is_empty() || command.is_empty() {
                    return Err(DriverError::ConfigInvalid(format!(
                        "driver {}: ssh needs host and command",
                        config.name
                    )));
                }
                Endpoint::Ssh {
                    host: host.clone(),
                    command: command.clone(),
                }
            }
        };

        Ok(Self {
            name: config.name.clone(),
            endpoint,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// All loaded drivers plus the shared outbound socket.
#[derive(Debug)]
pub struct DriverRegistry {
    drivers: HashMap<String, DriverBinding>,
    sender: UdpSender,
}

impl DriverRegistry {
    /// Resolve every descriptor. Any failure here aborts daemon startup.
    pub fn load(configs: &[DriverConfig], sender: UdpSender) -> Result<Self, DriverError> {
        let mut drivers = HashMap::new();
        for config in configs {
            let binding = DriverBinding::load(config)?;
            info!("loaded driver {}", binding.name);
            if drivers.insert(binding.name.clone(), binding).is_some() {
                return Err(DriverError::ConfigInvalid(format!(
                    "duplicate driver name: {}",
                    config.name
                )));
            }
        }
        Ok(Self { drivers, sender })
    }

    pub fn get(&self, name: &str) -> Option<&DriverBinding> {
        self.drivers.get(name)
    }

    /// Check that every configured host names a loaded driver. A dangling
    /// reference would otherwise fail on every send, so it is fatal at
    /// startup like any other driver misconfiguration.
    pub fn validate_hosts(&self, hosts: &[HostConfig]) -> Result<(), DriverError> {
        for host in hosts {
            if !self.drivers.contains_key(&host.im_mad) {
                return Err(DriverError::UnknownDriver(format!(
                    "host {} ({}) references driver {:?}, which is not configured",
                    host.id, host.name, host.im_mad
                )));
            }
        }
        Ok(())
    }

    /// Deliver `message` through the named driver. For UDP drivers
    /// `address_override` (the per-host address) takes precedence over the
    /// driver default.
    pub async fn send(
        &self,
        driver: &str,
        address_override: Option<SocketAddr>,
        message: &Message,
    ) -> Result<(), DriverError> {
        let binding = self
            .drivers
            .get(driver)
            .ok_or_else(|| DriverError::UnknownDriver(driver.to_string()))?;

        match &binding.endpoint {
            Endpoint::Udp {
                address,
                public_key,
            } => {
                let target = address_override.or(*address).ok_or_else(|| {
                    DriverError::SendFailed(format!(
                        "driver {driver}: no address for host {}",
                        message.host_id
                    ))
                })?;

                debug!(
                    "driver {driver}: {} for host {} -> {target}",
                    message.msg_type, message.host_id
                );
                self.sender
                    .send(target, message, public_key.as_ref())
                    .await
                    .map_err(|e| DriverError::SendFailed(e.to_string()))
            }

            Endpoint::Local { command, arguments } => {
                self.pipe_to_process(Command::new(command).args(arguments), message)
                    .await
            }

            Endpoint::Ssh { host, command } => {
                self.pipe_to_process(Command::new("ssh").arg(host).arg(command), message)
                    .await
            }
        }
    }

    /// Spawn the process and hand it the encoded message on stdin. The
    /// process outlives this call; replies come back over the listener.
    async fn pipe_to_process(
        &self,
        command: &mut Command,
        message: &Message,
    ) -> Result<(), DriverError> {
        let raw = message
            .encode(crate::protocol::DEFAULT_MAX_MESSAGE_SIZE)
            .map_err(|e| DriverError::SendFailed(e.to_string()))?;

        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| DriverError::SendFailed(format!("spawn failed: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(&raw).await {
                warn!("driver stdin write failed: {e}");
            }
        }

        // reap in the background, the reply path is the listener
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if !status.success() => {
                    warn!("driver process exited with {status}");
                }
                Err(e) => warn!("driver process wait failed: {e}"),
                Ok(_) => {}
            }
        });

        Ok(())
    }
}
