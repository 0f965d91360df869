//! Process lifecycle: connects (and reconnects) the PCI session, wires its
//! event stream into the MQTT gateway, and drives shutdown.
//!
//! Grounded on `original_source/cbus/daemon/cmqttd.py::_main`'s "connect,
//! run until the connection is lost, clean up, repeat" loop, adapted onto
//! the teacher's `CancellationToken`-cloned-into-every-task shutdown idiom
//! from `mqtt/mqtt_handler.rs::MQTTHandle::start_connection`.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cli::Cli;
use crate::labels::LabelMap;
use crate::mqtt::gateway::{Gateway, GatewayConfig};
use crate::pci::{PciHandle, PciSession, SessionConfig, Transport};
use crate::throttler;

/// Backoff between PCI reconnect attempts. The PCI session itself already
/// retries unacknowledged commands on a 1s cadence; a full transport
/// reconnect is a heavier failure and gets a longer, fixed pause rather than
/// hammering a CNI that's still booting.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const PCI_EVENT_CHANNEL_CAP: usize = 256;
const MQTT_EVENT_CHANNEL_CAP: usize = 10;
/// Grace period for in-flight MQTT publishes after shutdown is requested
/// (spec.md §5).
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

pub async fn run(cli: Cli) -> color_eyre::Result<()> {
    let shutdown = CancellationToken::new();
    let labels = match &cli.project_file {
        Some(path) => LabelMap::load(path)?,
        None => LabelMap::default(),
    };

    let (pci_events_tx, pci_events_rx) = mpsc::channel(PCI_EVENT_CHANNEL_CAP);
    let (pci_handle_tx, pci_handle_rx) = watch::channel(None);
    let throttler = throttler::spawn(shutdown.clone());

    let gateway_config = GatewayConfig {
        broker: cli.broker_config()?,
        labels,
        status_resync_interval: cli.status_resync_interval(),
        mqtt_event_cap: MQTT_EVENT_CHANNEL_CAP,
    };
    let gateway = Gateway::connect(gateway_config, pci_events_rx, pci_handle_rx, throttler).await?;
    let gateway_shutdown = shutdown.clone();
    let gateway_task = tokio::spawn(gateway.run(gateway_shutdown));

    let pci_shutdown = shutdown.clone();
    let session_config = cli.session_config();
    let pci_task = tokio::spawn(run_pci_loop(
        cli,
        session_config,
        pci_shutdown,
        pci_events_tx,
        pci_handle_tx,
    ));

    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl-C handler");
    info!("shutdown signal received");
    shutdown.cancel();

    let _ = tokio::time::timeout(SHUTDOWN_GRACE, gateway_task).await;
    pci_task.abort();

    Ok(())
}

/// Connects to the PCI, runs its session to completion, and reconnects with
/// a fixed delay until `shutdown` is cancelled. Publishes the session's
/// current [`PciHandle`] to `pci_handle_tx` on every (re)connect so the
/// gateway always has a fresh handle to issue commands against, and clears
/// it back to `None` whenever the connection drops.
async fn run_pci_loop(
    cli: Cli,
    session_config: SessionConfig,
    shutdown: CancellationToken,
    events: mpsc::Sender<crate::pci::PciEvent>,
    pci_handle_tx: watch::Sender<Option<PciHandle>>,
) {
    loop {
        if shutdown.is_cancelled() {
            return;
        }

        let transport = match connect(&cli).await {
            Ok(t) => t,
            Err(e) => {
                error!(error = %e, "failed to connect to PCI, retrying");
                if wait_or_shutdown(&shutdown).await {
                    return;
                }
                continue;
            }
        };

        let (resetting, handle) =
            PciSession::create(transport, session_config, shutdown.clone(), events.clone());
        let ready = match resetting.run_reset().await {
            Ok(ready) => ready,
            Err(e) => {
                error!(error = %e, "PCI reset sequence failed, reconnecting");
                if wait_or_shutdown(&shutdown).await {
                    return;
                }
                continue;
            }
        };

        let _ = pci_handle_tx.send(Some(handle));
        let error = ready.run().await;
        let _ = pci_handle_tx.send(None);
        warn!(%error, "PCI session ended, reconnecting");

        if wait_or_shutdown(&shutdown).await {
            return;
        }
    }
}

async fn connect(cli: &Cli) -> Result<Transport, crate::pci::TransportError> {
    if let Some(addr) = &cli.tcp {
        Transport::connect_tcp(&addr.to_string()).await
    } else {
        let device = cli
            .serial
            .as_ref()
            .expect("clap guarantees exactly one of --tcp/--serial is set")
            .to_string_lossy()
            .into_owned();
        Transport::open_serial(&device)
    }
}

/// Sleeps for [`RECONNECT_DELAY`] unless shutdown is requested first.
/// Returns `true` if the caller should stop reconnecting.
async fn wait_or_shutdown(shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => true,
        _ = tokio::time::sleep(RECONNECT_DELAY) => false,
    }
}
