//! The MQTT Gateway: owns the broker connection, publishes Home Assistant
//! discovery and state, and turns `.../set` commands into PCI calls.
//!
//! Grounded on `original_source/cbus/daemon/mqtt_gateway.py` (`CBusHandler`
//! and `MqttClient`), adapted onto `rumqttc`'s `AsyncClient`/`EventLoop`
//! split the way the teacher's `mqtt/mqtt_handler.rs` drives the same
//! crate. Unlike the teacher, there's no UI or config-portal to poll here:
//! the gateway's only inputs are the PCI event stream and the broker's
//! event loop, so they're read from a single `tokio::select!`.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, Incoming, Packet as MqttPacket, QoS};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::codec::Application;
use crate::labels::LabelMap;
use crate::mqtt::config::BrokerConfig;
use crate::pci::{PciEvent, PciHandle};
use crate::throttler::ThrottlerHandle;
use crate::topics;

/// Lighting applications this gateway originates commands and status
/// requests on. spec.md §4.5: "for each supported lighting application" —
/// in practice the daemon only ever runs the default Lighting application.
pub const SUPPORTED_LIGHTING_APPLICATIONS: &[Application] = &[Application::LIGHTING];

const META_TOPIC: &str = "homeassistant/binary_sensor/cbus_cmqttd";
const STATUS_BLOCK_SIZE: u8 = 32;
const STATUS_RETRY_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("failed to build broker connection options: {0}")]
    Config(#[from] crate::mqtt::config::BrokerConfigError),
    #[error("failed to subscribe to command topic: {0}")]
    Subscribe(#[from] rumqttc::ClientError),
}

/// Incoming `.../set` command payload (spec.md §4.5 / §6.2).
#[derive(Debug, Deserialize)]
struct CommandPayload {
    state: String,
    brightness: Option<i64>,
    transition: Option<i64>,
}

pub struct GatewayConfig {
    pub broker: BrokerConfig,
    pub labels: LabelMap,
    /// `Duration::ZERO` disables the loop (spec.md §6.3 `--status-resync 0`).
    pub status_resync_interval: Duration,
    pub mqtt_event_cap: usize,
}

/// The running MQTT Gateway. `published` is the Published-GA Set from
/// spec.md §3: mutated only from [`Gateway::run`]'s own loop, so it needs no
/// lock despite being read from several event branches.
pub struct Gateway {
    client: AsyncClient,
    eventloop: EventLoop,
    labels: LabelMap,
    published: HashMap<Application, HashSet<u8>>,
    pci_events: mpsc::Receiver<PciEvent>,
    pci_handle: watch::Receiver<Option<PciHandle>>,
    throttler: ThrottlerHandle,
    status_resync_interval: Duration,
}

impl Gateway {
    /// Connects to the broker and subscribes to the command wildcard. Does
    /// not yet publish discovery configs — that happens in [`Gateway::run`]
    /// so a single `?` in `main` covers both connect and initial publish
    /// failures the same way.
    pub async fn connect(
        cfg: GatewayConfig,
        pci_events: mpsc::Receiver<PciEvent>,
        pci_handle: watch::Receiver<Option<PciHandle>>,
        throttler: ThrottlerHandle,
    ) -> Result<Self, GatewayError> {
        let options = cfg.broker.to_mqtt_options()?;
        let (client, eventloop) = AsyncClient::new(options, cfg.mqtt_event_cap);
        client
            .subscribe(topics::COMMAND_SUBSCRIPTION, QoS::ExactlyOnce)
            .await?;
        Ok(Self {
            client,
            eventloop,
            labels: cfg.labels,
            published: HashMap::new(),
            pci_events,
            pci_handle,
            throttler,
            status_resync_interval: cfg.status_resync_interval,
        })
    }

    /// Runs until `shutdown` is cancelled. Publishes the meta device and the
    /// label map's discovery configs once at the top, then services the PCI
    /// event stream, the broker's event loop, and the status-resync timer.
    pub async fn run(mut self, shutdown: CancellationToken) {
        self.publish_meta_device().await;
        self.publish_labelled_discovery().await;

        let resync_period = if self.status_resync_interval.is_zero() {
            // A disabled loop still needs an `Interval` to select on; park it
            // far beyond any real run's lifetime instead of special-casing
            // the `select!` arm.
            Duration::from_secs(365 * 24 * 60 * 60)
        } else {
            self.status_resync_interval
        };
        let mut resync_interval = tokio::time::interval(resync_period);
        resync_interval.reset();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("MQTT gateway shutting down");
                    return;
                }
                event = self.pci_events.recv() => {
                    match event {
                        Some(event) => self.handle_pci_event(event).await,
                        None => {
                            warn!("PCI event channel closed, MQTT gateway has nothing left to drive it");
                            return;
                        }
                    }
                }
                notification = self.eventloop.poll() => {
                    match notification {
                        Ok(Event::Incoming(Incoming::Publish(publish))) => {
                            self.handle_command(&publish.topic, &publish.payload).await;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(error = %e, "MQTT event loop error; rumqttc will reconnect internally");
                        }
                    }
                }
                _ = resync_interval.tick(), if !self.status_resync_interval.is_zero() => {
                    if !self.enqueue_status_sweep().await {
                        warn!("status-resync sweep could not be enqueued, retrying sooner");
                        resync_interval.reset_after(STATUS_RETRY_DELAY);
                    }
                }
            }
        }
    }

    async fn handle_pci_event(&mut self, event: PciEvent) {
        match event {
            PciEvent::ConnectionUp => {
                info!("PCI connection up, sweeping status for supported lighting applications");
                if !self.enqueue_status_sweep().await {
                    warn!("initial status sweep could not be fully enqueued");
                }
            }
            PciEvent::ConnectionDown { reason } => {
                debug!(?reason, "PCI connection down, clearing published-GA set");
                self.published.clear();
            }
            PciEvent::LightingOn { app, group, source } => {
                self.ensure_published(app, group).await;
                self.publish_state(app, group, true, 255, 0, source).await;
            }
            PciEvent::LightingOff { app, group, source } => {
                self.ensure_published(app, group).await;
                self.publish_state(app, group, false, 0, 0, source).await;
            }
            PciEvent::LightingRamp {
                app,
                group,
                source,
                duration_secs,
                level,
            } => {
                self.ensure_published(app, group).await;
                self.publish_state(app, group, level > 0, level, duration_secs, source)
                    .await;
            }
            PciEvent::LightingTerminateRamp { app, group, source } => {
                debug!(?app, group, ?source, "ramp terminated, no state change to publish");
            }
            PciEvent::LevelReport {
                app,
                block_start,
                levels,
            } => {
                for (offset, level) in levels.into_iter().enumerate() {
                    let Some(level) = level else { continue };
                    let Some(group) = group_in_block(block_start, offset) else { continue };
                    self.ensure_published(app, group).await;
                    match level {
                        0 => self.publish_state(app, group, false, 0, 0, None).await,
                        255 => self.publish_state(app, group, true, 255, 0, None).await,
                        level => self.publish_state(app, group, true, level, 0, None).await,
                    }
                }
            }
            PciEvent::BinaryReport {
                app,
                block_start,
                states,
            } => {
                for (offset, state) in states.into_iter().enumerate() {
                    let Some(state) = state else { continue };
                    let Some(group) = group_in_block(block_start, offset) else { continue };
                    self.ensure_published(app, group).await;
                    self.publish_binary_sensor(app, group, state).await;
                }
            }
            PciEvent::ClockRequest { source } => {
                debug!(?source, "clock request answered by the PCI session");
            }
            PciEvent::CommandFailed { code } => {
                error!(code = code as char, "PCI rejected a previously-sent command");
            }
            PciEvent::Error { reason } => {
                warn!(reason, "PCI session reported an error");
            }
        }
    }

    async fn handle_command(&mut self, topic: &str, payload: &[u8]) {
        let Some((app, group)) = topics::parse_command_topic(topic) else {
            return;
        };
        let command: CommandPayload = match serde_json::from_slice(payload) {
            Ok(c) => c,
            Err(e) => {
                error!(topic, error = %e, "malformed JSON command payload");
                return;
            }
        };
        let Some(handle) = self.pci_handle.borrow().clone() else {
            warn!(topic, "PCI is not connected, dropping command");
            return;
        };

        let brightness = command.brightness.unwrap_or(255).clamp(0, 255) as u8;
        let transition = command.transition.unwrap_or(0).clamp(0, u16::MAX as i64) as u16;
        let client = self.client.clone();

        match command.state.to_ascii_uppercase().as_str() {
            "ON" if brightness == 255 && transition == 0 => {
                self.throttler.enqueue(async move {
                    if let Err(e) = handle.lighting_on(&[group], app).await {
                        error!(error = %e, group, "lighting_on command failed");
                        return;
                    }
                    publish_state(&client, app, group, true, 255, 0, None).await;
                });
            }
            "ON" => {
                self.throttler.enqueue(async move {
                    if let Err(e) = handle.lighting_ramp(group, app, transition, brightness).await {
                        error!(error = %e, group, "lighting_ramp command failed");
                        return;
                    }
                    publish_state(&client, app, group, true, brightness, transition, None).await;
                });
            }
            "OFF" => {
                self.throttler.enqueue(async move {
                    if let Err(e) = handle.lighting_off(&[group], app).await {
                        error!(error = %e, group, "lighting_off command failed");
                        return;
                    }
                    publish_state(&client, app, group, false, 0, 0, None).await;
                });
            }
            other => {
                error!(topic, state = other, "invalid command state, ignoring");
            }
        }
    }

    async fn enqueue_status_sweep(&self) -> bool {
        let Some(handle) = self.pci_handle.borrow().clone() else {
            warn!("PCI is not connected, skipping status sweep");
            return false;
        };
        let mut all_enqueued = true;
        for &app in SUPPORTED_LIGHTING_APPLICATIONS {
            for block_start in (0..=255u16).step_by(STATUS_BLOCK_SIZE as usize) {
                let block_start = block_start as u8;
                let handle = handle.clone();
                let accepted = self.throttler.enqueue(async move {
                    if let Err(e) = handle
                        .request_status(block_start, STATUS_BLOCK_SIZE, app)
                        .await
                    {
                        error!(error = %e, block_start, "status request failed");
                    }
                });
                all_enqueued &= accepted;
            }
        }
        all_enqueued
    }

    async fn ensure_published(&mut self, app: Application, group: u8) {
        if self
            .published
            .get(&app)
            .is_some_and(|groups| groups.contains(&group))
        {
            return;
        }
        self.publish_light_discovery(app, group).await;
        self.published.entry(app).or_default().insert(group);
    }

    async fn publish_light_discovery(&self, app: Application, group: u8) {
        let name = self
            .labels
            .group_name(app, group)
            .map(str::to_string)
            .unwrap_or_else(|| default_light_name(app, group));
        let light_uid = format!("cbus_light_{}", topics::ga_string(group, app, true));
        let device = json!({
            "identifiers": [light_uid.clone()],
            "manufacturer": "Clipsal",
            "model": "C-Bus Lighting Application",
            "via_device": "cmqttd",
        });
        let config = json!({
            "name": name,
            "unique_id": light_uid,
            "cmd_t": topics::light_set_topic(group, app),
            "stat_t": topics::light_state_topic(group, app),
            "schema": "json",
            "brightness": true,
            "device": device,
        });
        self.do_publish(topics::light_config_topic(group, app), config, true)
            .await;

        let sensor_uid = format!("cbus_bin_sensor_{}", topics::ga_string(group, app, true));
        let sensor_config = json!({
            "name": format!("{name} (as binary sensor)"),
            "unique_id": sensor_uid,
            "stat_t": topics::binary_sensor_state_topic(group, app),
            "device": {
                "identifiers": [sensor_uid],
                "manufacturer": "Clipsal",
                "model": "C-Bus Lighting Application",
                "via_device": "cmqttd",
            },
        });
        self.do_publish(
            topics::binary_sensor_config_topic(group, app),
            sensor_config,
            true,
        )
        .await;
    }

    async fn publish_labelled_discovery(&mut self) {
        let pairs: Vec<(Application, u8)> = self
            .labels
            .applications()
            .flat_map(|(app, labels)| labels.groups.keys().map(move |&group| (app, group)))
            .collect();
        for (app, group) in pairs {
            self.publish_light_discovery(app, group).await;
            self.published.entry(app).or_default().insert(group);
        }
    }

    async fn publish_meta_device(&self) {
        let payload = json!({
            "~": META_TOPIC,
            "name": "cmqttd",
            "unique_id": "cmqttd",
            "stat_t": "~/state",
            "device": {
                "identifiers": ["cmqttd"],
                "manufacturer": "micolous",
                "model": "libcbus",
                "name": "cmqttd",
            },
        });
        self.do_publish(format!("{META_TOPIC}/config"), payload, true)
            .await;
    }

    async fn publish_state(
        &self,
        app: Application,
        group: u8,
        on: bool,
        brightness: u8,
        transition: u16,
        source: Option<u8>,
    ) {
        publish_state(&self.client, app, group, on, brightness, transition, source).await;
    }

    async fn publish_binary_sensor(&self, app: Application, group: u8, state: bool) {
        let payload = if state { "ON" } else { "OFF" };
        self.do_publish(topics::binary_sensor_state_topic(group, app), payload, true)
            .await;
    }

    async fn do_publish(&self, topic: String, payload: impl ToPublishPayload, retain: bool) {
        if let Err(e) = self
            .client
            .publish(&topic, QoS::AtLeastOnce, retain, payload.into_payload())
            .await
        {
            warn!(topic, error = %e, "failed to publish to MQTT broker");
        }
    }
}

/// Free-function twin of [`Gateway::publish_state`], usable from throttled
/// command tasks that only hold a cloned `AsyncClient`.
async fn publish_state(
    client: &AsyncClient,
    app: Application,
    group: u8,
    on: bool,
    brightness: u8,
    transition: u16,
    source: Option<u8>,
) {
    let payload = json!({
        "state": if on { "ON" } else { "OFF" },
        "brightness": brightness,
        "transition": transition,
        "cbus_source_addr": source,
    });
    if let Err(e) = client
        .publish(
            topics::light_state_topic(group, app),
            QoS::AtLeastOnce,
            true,
            payload.to_string(),
        )
        .await
    {
        warn!(group, error = %e, "failed to publish light state");
    }
    let binary_payload = if on { "ON" } else { "OFF" };
    if let Err(e) = client
        .publish(
            topics::binary_sensor_state_topic(group, app),
            QoS::AtLeastOnce,
            true,
            binary_payload,
        )
        .await
    {
        warn!(group, error = %e, "failed to publish binary sensor state");
    }
}

fn default_light_name(app: Application, group: u8) -> String {
    format!("C-Bus Light {}", topics::ga_string(group, app, true))
}

/// `block_start + offset` as a valid group address, or `None` if it would
/// spill past the `StatusRequest`'s 32-group block (spec.md §8 property 7:
/// sweeps cover `0..255` with no overlap and no gaps, so a block that starts
/// at 224 only has 32 valid slots before it runs off the top of the range).
fn group_in_block(block_start: u8, offset: usize) -> Option<u8> {
    u8::try_from(offset).ok().and_then(|o| block_start.checked_add(o))
}

trait ToPublishPayload {
    fn into_payload(self) -> String;
}

impl ToPublishPayload for serde_json::Value {
    fn into_payload(self) -> String {
        self.to_string()
    }
}

impl ToPublishPayload for &str {
    fn into_payload(self) -> String {
        self.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_in_block_respects_the_32_group_window() {
        assert_eq!(group_in_block(224, 0), Some(224));
        assert_eq!(group_in_block(224, 31), Some(255));
        // offset 32 would be group 256, out of the u8 range entirely.
        assert_eq!(group_in_block(224, 32), None);
    }

    #[test]
    fn default_light_name_uses_zero_padded_ga_string() {
        assert_eq!(default_light_name(Application::LIGHTING, 7), "C-Bus Light 007");
    }
}
