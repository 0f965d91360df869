//! Command-line surface, built the way
//! `examples/other_examples/.../cmd_args.rs` structures a `clap::Parser`
//! derive: one flat struct, grouped by a doc-comment banner per concern,
//! with `requires`/`conflicts_with` encoding the pairing rules argparse
//! would otherwise check by hand in `original_source/cbus/daemon/cli.py`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgGroup, Parser};

use crate::mqtt::config::{load_broker_auth, BrokerConfig};
use crate::pci::SessionConfig;

const ENV_VERBOSITY: &str = "CMQTTD_VERBOSITY";

#[derive(Debug, Parser)]
#[command(
    name = "cmqttd",
    about = "Bridges a Clipsal C-Bus lighting network to MQTT / Home Assistant",
    group(ArgGroup::new("pci_target").args(["tcp", "serial"]).required(true)),
)]
pub struct Cli {
    // --- PCI / CNI connection -----------------------------------------
    /// IP address and TCP port of the CNI/PCI (e.g. 192.168.1.10:10001).
    #[arg(short = 't', long, value_name = "ADDR:PORT")]
    pub tcp: Option<SocketAddr>,

    /// Path to a local serial device connected to a PCI (e.g. /dev/ttyUSB0).
    #[arg(long, value_name = "DEVICE")]
    pub serial: Option<PathBuf>,

    // --- MQTT options --------------------------------------------------
    /// Address of the MQTT broker.
    #[arg(short = 'b', long)]
    pub broker_address: String,

    /// Port to use; omit for automatic (1883 plain, 8883 TLS).
    #[arg(short = 'p', long)]
    pub broker_port: Option<u16>,

    /// MQTT keep-alive, in seconds.
    #[arg(long, default_value_t = 60, value_name = "SECONDS")]
    pub broker_keepalive: u64,

    /// Disable TLS (insecure).
    #[arg(long)]
    pub broker_disable_tls: bool,

    /// File containing a username and password, one per line.
    #[arg(short = 'A', long, value_name = "FILE")]
    pub broker_auth: Option<PathBuf>,

    /// Path to a PEM file of CA certificates to trust.
    #[arg(short = 'c', long, value_name = "FILE")]
    pub broker_ca: Option<PathBuf>,

    /// PEM client certificate, for mutual TLS.
    #[arg(short = 'k', long, requires = "broker_client_key", value_name = "FILE")]
    pub broker_client_cert: Option<PathBuf>,

    /// PEM client private key, for mutual TLS.
    #[arg(short = 'K', long, requires = "broker_client_cert", value_name = "FILE")]
    pub broker_client_key: Option<PathBuf>,

    // --- Time settings ---------------------------------------------------
    /// Send a time synchronisation broadcast every n seconds (0 to disable).
    #[arg(short = 'T', long, default_value_t = 300, value_name = "SECONDS")]
    pub timesync: u64,

    /// Do not respond to Clock Request SAL messages.
    #[arg(short = 'C', long)]
    pub no_clock: bool,

    /// Request status updates every n seconds (0 to disable).
    #[arg(short = 'S', long, default_value_t = 300, value_name = "SECONDS")]
    pub status_resync: u64,

    // --- Label options ---------------------------------------------------
    /// Path to a group label map (JSON; see labels.rs).
    #[arg(short = 'P', long, value_name = "FILE")]
    pub project_file: Option<PathBuf>,

    /// Name of the C-Bus network to use when the project has multiple.
    #[arg(short = 'N', long)]
    pub cbus_network: Option<String>,

    // --- Logging options --------------------------------------------------
    /// Destination to write logs; stderr if omitted.
    #[arg(short = 'l', long, value_name = "FILE")]
    pub log_file: Option<PathBuf>,

    /// Verbosity to emit. Falls back to `CMQTTD_VERBOSITY` if unset.
    #[arg(short = 'v', long, env = ENV_VERBOSITY, default_value = "INFO")]
    pub verbosity: String,
}

impl Cli {
    pub fn broker_config(&self) -> Result<BrokerConfig, crate::mqtt::config::BrokerConfigError> {
        let auth = self
            .broker_auth
            .as_deref()
            .map(load_broker_auth)
            .transpose()?;
        Ok(BrokerConfig {
            address: self.broker_address.clone(),
            port: self.broker_port,
            keepalive: Duration::from_secs(self.broker_keepalive),
            tls_disabled: self.broker_disable_tls,
            auth,
            ca_path: self.broker_ca.clone(),
            client_cert_path: self.broker_client_cert.clone(),
            client_key_path: self.broker_client_key.clone(),
        })
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            timesync_interval: Duration::from_secs(self.timesync),
            handle_clock_requests: !self.no_clock,
        }
    }

    pub fn status_resync_interval(&self) -> Duration {
        Duration::from_secs(self.status_resync)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn tcp_and_serial_are_mutually_exclusive() {
        let result = Cli::try_parse_from([
            "cmqttd",
            "--tcp",
            "192.168.1.10:10001",
            "--serial",
            "/dev/ttyUSB0",
            "-b",
            "localhost",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn one_of_tcp_or_serial_is_required() {
        let result = Cli::try_parse_from(["cmqttd", "-b", "localhost"]);
        assert!(result.is_err());
    }

    #[test]
    fn client_cert_without_key_is_rejected() {
        let result = Cli::try_parse_from([
            "cmqttd",
            "--tcp",
            "192.168.1.10:10001",
            "-b",
            "localhost",
            "--broker-client-cert",
            "cert.pem",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn minimal_valid_invocation_parses() {
        let cli = Cli::try_parse_from([
            "cmqttd",
            "--tcp",
            "192.168.1.10:10001",
            "-b",
            "localhost",
        ])
        .unwrap();
        assert_eq!(cli.broker_address, "localhost");
        assert_eq!(cli.timesync, 300);
        assert!(!cli.no_clock);
    }
}
