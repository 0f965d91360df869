//! MQTT broker connection settings and the `rumqttc::MqttOptions` they build.
//!
//! Loading the actual PEM/CA bytes is the one place this module touches
//! the filesystem directly — parsing/validating certificate content itself
//! is an external collaborator's job (spec.md §1 lists "TLS material
//! loading" as out of scope); this module only reads the bytes the caller
//! pointed it at and hands them to `rumqttc`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rumqttc::{MqttOptions, Transport};
use thiserror::Error;

pub const CLIENT_ID: &str = "cbus-mqttd";
const DEFAULT_TLS_PORT: u16 = 8883;
const DEFAULT_PLAIN_PORT: u16 = 1883;

#[derive(Debug, Error)]
pub enum BrokerConfigError {
    #[error("failed to read broker auth file {path}: {source}")]
    ReadAuth { path: String, #[source] source: std::io::Error },
    #[error("broker auth file {0} must contain exactly two lines (username, password)")]
    MalformedAuth(String),
    #[error("failed to read TLS CA file {path}: {source}")]
    ReadCa { path: String, #[source] source: std::io::Error },
    #[error("failed to read TLS client cert {path}: {source}")]
    ReadClientCert { path: String, #[source] source: std::io::Error },
    #[error("failed to read TLS client key {path}: {source}")]
    ReadClientKey { path: String, #[source] source: std::io::Error },
}

/// Broker connection settings resolved from the CLI (spec.md §6.3).
#[derive(Clone, Debug, Default)]
pub struct BrokerConfig {
    pub address: String,
    /// `None` means "auto": 1883 if TLS is disabled, 8883 otherwise.
    pub port: Option<u16>,
    pub keepalive: Duration,
    pub tls_disabled: bool,
    pub auth: Option<(String, String)>,
    pub ca_path: Option<PathBuf>,
    pub client_cert_path: Option<PathBuf>,
    pub client_key_path: Option<PathBuf>,
}

impl BrokerConfig {
    pub fn resolved_port(&self) -> u16 {
        self.port.unwrap_or(if self.tls_disabled {
            DEFAULT_PLAIN_PORT
        } else {
            DEFAULT_TLS_PORT
        })
    }

    /// Builds the `MqttOptions` this config describes, reading any TLS
    /// material from disk along the way.
    pub fn to_mqtt_options(&self) -> Result<MqttOptions, BrokerConfigError> {
        let mut options = MqttOptions::new(CLIENT_ID, &self.address, self.resolved_port());
        options.set_keep_alive(self.keepalive);
        if let Some((user, pass)) = &self.auth {
            options.set_credentials(user, pass);
        }
        options.set_transport(self.build_transport()?);
        Ok(options)
    }

    fn build_transport(&self) -> Result<Transport, BrokerConfigError> {
        if self.tls_disabled {
            return Ok(Transport::tcp());
        }

        let ca = self
            .ca_path
            .as_ref()
            .map(|path| read_file(path, |path, source| BrokerConfigError::ReadCa { path, source }))
            .transpose()?;
        let client_auth = match (&self.client_cert_path, &self.client_key_path) {
            (Some(cert_path), Some(key_path)) => {
                let cert = read_file(cert_path, |path, source| BrokerConfigError::ReadClientCert {
                    path,
                    source,
                })?;
                let key = read_file(key_path, |path, source| BrokerConfigError::ReadClientKey {
                    path,
                    source,
                })?;
                Some((cert, key))
            }
            // Pairing is already validated in config.rs at startup; treat an
            // unpaired half here (should be unreachable) the same as absent.
            _ => None,
        };

        match ca {
            Some(ca) => Ok(Transport::tls(ca, client_auth, None)),
            None => Ok(Transport::tls_with_default_config()),
        }
    }
}

fn read_file(
    path: &Path,
    to_error: impl FnOnce(String, std::io::Error) -> BrokerConfigError,
) -> Result<Vec<u8>, BrokerConfigError> {
    std::fs::read(path).map_err(|source| to_error(path.display().to_string(), source))
}

/// Parses a `--broker-auth` file: exactly two lines, username then password.
pub fn load_broker_auth(path: &Path) -> Result<(String, String), BrokerConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| BrokerConfigError::ReadAuth {
        path: path.display().to_string(),
        source,
    })?;
    let mut lines = contents.lines();
    let (Some(user), Some(pass)) = (lines.next(), lines.next()) else {
        return Err(BrokerConfigError::MalformedAuth(path.display().to_string()));
    };
    if lines.next().is_some() {
        return Err(BrokerConfigError::MalformedAuth(path.display().to_string()));
    }
    Ok((user.to_string(), pass.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn resolved_port_defaults_by_tls_state() {
        let mut config = BrokerConfig {
            address: "localhost".to_string(),
            keepalive: Duration::from_secs(60),
            tls_disabled: true,
            ..Default::default()
        };
        assert_eq!(config.resolved_port(), DEFAULT_PLAIN_PORT);
        config.tls_disabled = false;
        assert_eq!(config.resolved_port(), DEFAULT_TLS_PORT);
        config.port = Some(1234);
        assert_eq!(config.resolved_port(), 1234);
    }

    #[test]
    fn load_broker_auth_parses_two_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "alice").unwrap();
        writeln!(file, "hunter2").unwrap();
        let (user, pass) = load_broker_auth(file.path()).unwrap();
        assert_eq!(user, "alice");
        assert_eq!(pass, "hunter2");
    }

    #[test]
    fn load_broker_auth_rejects_extra_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "alice").unwrap();
        writeln!(file, "hunter2").unwrap();
        writeln!(file, "extra").unwrap();
        assert!(matches!(
            load_broker_auth(file.path()),
            Err(BrokerConfigError::MalformedAuth(_))
        ));
    }
}
