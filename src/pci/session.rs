//! The PCI session state machine: reset sequence, confirmation-tracked
//! command dispatch, retry loop, and the timesync loop.
//!
//! Grounded on `original_source/cbus/protocol/pciprotocol.py` (reset
//! sequence, `_get_confirmation_code`, `_check_pending_confirmations`,
//! `timesync`) and, for the typestate shape itself, on the teacher's
//! `mqtt::mqtt_handler::MQTTConnection<S: MQTTState>` machine. Unlike that
//! machine, a lost connection here isn't a state to transition back into —
//! spec.md's data model says PCI Session state is "recreated on each
//! reconnect", so `run()` simply ends and the caller builds a fresh
//! `Disconnected` session over a new transport.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Datelike, Local, Timelike};
use statum::{machine, state};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::codec::{
    decode_packet, encode_packet, find_crlf, Application, Cal, DecodeError,
    DeviceManagementPacket, ExtendedReportData, Packet, PointToMultipointPacket,
    PointToPointPacket, Sal, SendOptions,
};
use crate::confirmation::{self, ConfirmationRegistry};

use super::transport::Transport;

/// spec.md §4.4: "callers passing more [than 9 group addresses] MUST receive
/// an error".
pub const MAX_BATCH_GROUPS: usize = 9;
const RETRY_INTERVAL: Duration = Duration::from_secs(1);
const MAX_RETRIES: u8 = 3;
/// spec.md §4.4: "a running tally of consecutive abandonments ... >= 10
/// ... triggers an error-level log".
const CONSECUTIVE_ABANDON_THRESHOLD: usize = 10;
/// "the PCI is slow" — a fixed gap before every write (spec.md §4.4).
const WRITE_GAP: Duration = Duration::from_millis(100);
const READ_CHUNK: usize = 512;
/// A disabled periodic loop is modelled as a very long interval rather than
/// special-cased control flow in `run`'s `select!`.
const DISABLED_INTERVAL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("too many group addresses in one packet: {0} (max {MAX_BATCH_GROUPS})")]
    TooManyGroups(usize),
    #[error("PCI transport error: {0}")]
    Transport(#[from] std::io::Error),
    #[error("PCI session is shutting down")]
    ShuttingDown,
}

/// Events the session reports to its owner (the MQTT gateway). A narrow,
/// one-way interface — the gateway never reaches into the session's
/// internals (spec.md §9: "break the cycle with an explicit interface").
#[derive(Debug, Clone)]
pub enum PciEvent {
    ConnectionUp,
    ConnectionDown {
        reason: Option<String>,
    },
    LightingOn {
        app: Application,
        group: u8,
        source: Option<u8>,
    },
    LightingOff {
        app: Application,
        group: u8,
        source: Option<u8>,
    },
    LightingRamp {
        app: Application,
        group: u8,
        source: Option<u8>,
        duration_secs: u16,
        level: u8,
    },
    LightingTerminateRamp {
        app: Application,
        group: u8,
        source: Option<u8>,
    },
    LevelReport {
        app: Application,
        block_start: u8,
        levels: Vec<Option<u8>>,
    },
    BinaryReport {
        app: Application,
        block_start: u8,
        states: Vec<Option<bool>>,
    },
    ClockRequest {
        source: Option<u8>,
    },
    CommandFailed {
        code: u8,
    },
    Error {
        reason: String,
    },
}

#[derive(Clone, Copy, Debug)]
pub struct SessionConfig {
    /// `Duration::ZERO` disables the loop, per spec.md §6.3 `--timesync 0`.
    pub timesync_interval: Duration,
    pub handle_clock_requests: bool,
}

struct PendingSend {
    bytes: Vec<u8>,
    attempts: u8,
    last_attempt: Instant,
}

enum Command {
    Send {
        packet: Packet,
        confirmation: bool,
        basic_mode: bool,
        reply: oneshot::Sender<Result<Option<u8>, SessionError>>,
    },
}

/// Handle used by the MQTT gateway (and the session's own reset/timesync
/// logic) to issue commands without touching session internals directly.
#[derive(Clone)]
pub struct PciHandle {
    commands: mpsc::Sender<Command>,
}

impl PciHandle {
    pub async fn send(
        &self,
        packet: Packet,
        confirmation: bool,
        basic_mode: bool,
    ) -> Result<Option<u8>, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Send {
                packet,
                confirmation,
                basic_mode,
                reply,
            })
            .await
            .map_err(|_| SessionError::ShuttingDown)?;
        rx.await.map_err(|_| SessionError::ShuttingDown)?
    }

    fn batch(groups: &[u8]) -> Result<(), SessionError> {
        if groups.len() > MAX_BATCH_GROUPS {
            return Err(SessionError::TooManyGroups(groups.len()));
        }
        Ok(())
    }

    pub async fn lighting_on(
        &self,
        groups: &[u8],
        app: Application,
    ) -> Result<Option<u8>, SessionError> {
        Self::batch(groups)?;
        let sal = groups.iter().map(|&group| Sal::LightingOn { app, group }).collect();
        self.send(multipoint(sal), true, false).await
    }

    pub async fn lighting_off(
        &self,
        groups: &[u8],
        app: Application,
    ) -> Result<Option<u8>, SessionError> {
        Self::batch(groups)?;
        let sal = groups.iter().map(|&group| Sal::LightingOff { app, group }).collect();
        self.send(multipoint(sal), true, false).await
    }

    pub async fn lighting_terminate_ramp(
        &self,
        groups: &[u8],
        app: Application,
    ) -> Result<Option<u8>, SessionError> {
        Self::batch(groups)?;
        let sal = groups
            .iter()
            .map(|&group| Sal::LightingTerminateRamp { app, group })
            .collect();
        self.send(multipoint(sal), true, false).await
    }

    pub async fn lighting_ramp(
        &self,
        group: u8,
        app: Application,
        duration_secs: u16,
        level: u8,
    ) -> Result<Option<u8>, SessionError> {
        let sal = vec![Sal::LightingRamp {
            app,
            group,
            duration_secs,
            level,
        }];
        self.send(multipoint(sal), true, false).await
    }

    pub async fn request_status(
        &self,
        group_start: u8,
        group_count: u8,
        app: Application,
    ) -> Result<Option<u8>, SessionError> {
        let sal = vec![Sal::StatusRequest {
            app,
            group_start,
            group_count,
        }];
        self.send(multipoint(sal), true, false).await
    }

    pub async fn identify(&self, unit: u8, attribute: u8) -> Result<Option<u8>, SessionError> {
        let packet = Packet::PointToPoint(PointToPointPacket {
            unit_address: unit,
            cal: vec![Cal::Identify { attribute }],
        });
        self.send(packet, true, false).await
    }

    pub async fn clock_broadcast(
        &self,
        when: Option<DateTime<Local>>,
    ) -> Result<Option<u8>, SessionError> {
        let packet = multipoint(vec![clock_update_sal(when.unwrap_or_else(Local::now))]);
        self.send(packet, true, false).await
    }
}

fn multipoint(sal: Vec<Sal>) -> Packet {
    Packet::PointToMultipoint(PointToMultipointPacket {
        source_address: None,
        sal,
    })
}

fn clock_update_sal(now: DateTime<Local>) -> Sal {
    Sal::ClockUpdate {
        year: now.year() as u16,
        month: now.month() as u8,
        day: now.day() as u8,
        day_of_week: now.weekday().num_days_from_monday() as u8,
        hour: now.hour() as u8,
        minute: now.minute() as u8,
        second: now.second() as u8,
    }
}

#[state]
#[derive(Debug, Clone, Copy)]
pub enum SessionState {
    Disconnected,
    Resetting,
    Ready,
}

#[machine]
pub struct PciSession<S: SessionState> {
    transport: Transport,
    confirmations: Arc<Mutex<ConfirmationRegistry>>,
    pending: Arc<Mutex<HashMap<u8, PendingSend>>>,
    events: mpsc::Sender<PciEvent>,
    commands: mpsc::Receiver<Command>,
    config: SessionConfig,
    shutdown: CancellationToken,
    strict_checksum: bool,
    consecutive_abandons: Arc<AtomicUsize>,
    read_buf: Vec<u8>,
}

impl PciSession<Disconnected> {
    /// Builds a fresh session over a newly-opened transport. `events` is
    /// owned by the caller (the supervisor) and outlives any number of
    /// reconnects; only the command channel and its [`PciHandle`] are
    /// specific to this connection attempt.
    pub fn create(
        transport: Transport,
        config: SessionConfig,
        shutdown: CancellationToken,
        events: mpsc::Sender<PciEvent>,
    ) -> (PciSession<Resetting>, PciHandle) {
        let (commands_tx, commands_rx) = mpsc::channel(256);
        let session = Self::new(
            transport,
            Arc::new(Mutex::new(ConfirmationRegistry::new())),
            Arc::new(Mutex::new(HashMap::new())),
            events,
            commands_rx,
            config,
            shutdown,
            false,
            Arc::new(AtomicUsize::new(0)),
            Vec::new(),
        );
        (session.transition(), PciHandle { commands: commands_tx })
    }
}

impl PciSession<Resetting> {
    /// Runs the exact basic-mode reset sequence from spec.md §4.4: three
    /// `Reset`s, then the four device-management option packets, in order,
    /// with no confirmation requested for any of them.
    pub async fn run_reset(mut self) -> Result<PciSession<Ready>, SessionError> {
        info!("running PCI reset sequence");
        let basic = SendOptions {
            confirmation: None,
            basic_mode: true,
            checksum: false,
        };
        for attempt in 1..=3 {
            debug!(attempt, "sending reset packet");
            self.write_raw(&encode_packet(&Packet::Reset, &basic)).await?;
        }
        for (parameter, value) in [(0x21u8, 0xFFu8), (0x22, 0xFF), (0x42, 0x0E), (0x30, 0x79)] {
            let packet = Packet::DeviceManagement(DeviceManagementPacket {
                parameter,
                value,
                checksum: false,
            });
            self.write_raw(&encode_packet(&packet, &basic)).await?;
        }
        // Option byte 0x30/0x79 turns on SRCHK (strict checksum checking),
        // so decoding from here on must verify the checksum (spec.md §4.1).
        self.strict_checksum = true;
        info!("PCI reset complete, session ready");
        let _ = self.events.send(PciEvent::ConnectionUp).await;
        Ok(self.transition())
    }

    async fn write_raw(&mut self, bytes: &[u8]) -> Result<(), SessionError> {
        tokio::time::sleep(WRITE_GAP).await;
        self.transport.write_all(bytes).await?;
        self.transport.flush().await?;
        Ok(())
    }
}

impl PciSession<Ready> {
    /// Runs until the transport errors, the peer closes the connection, or
    /// `shutdown` is cancelled. Consumes `self`: the caller is expected to
    /// build a brand new session over a fresh transport to reconnect.
    pub async fn run(mut self) -> SessionError {
        let mut retry_interval = tokio::time::interval(RETRY_INTERVAL);
        let timesync_period = if self.config.timesync_interval.is_zero() {
            DISABLED_INTERVAL
        } else {
            self.config.timesync_interval
        };
        let mut timesync_interval = tokio::time::interval(timesync_period);
        let mut chunk = vec![0u8; READ_CHUNK];

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    return SessionError::Transport(std::io::Error::new(
                        std::io::ErrorKind::Interrupted,
                        "shutdown requested",
                    ));
                }
                command = self.commands.recv() => {
                    match command {
                        Some(Command::Send { packet, confirmation, basic_mode, reply }) => {
                            let result = self.send_and_track(&packet, confirmation, basic_mode).await;
                            let _ = reply.send(result);
                        }
                        None => {
                            // All handles dropped: nothing can ever reach this
                            // session again. Ending the loop here (rather than
                            // looping on an immediately-ready `None` forever)
                            // avoids spinning `select!` hot.
                            return self.disconnect(Some("all PCI handles dropped".to_string())).await;
                        }
                    }
                }
                read_result = self.transport.read(&mut chunk) => {
                    match read_result {
                        Ok(0) => return self.disconnect(None).await,
                        Ok(n) => {
                            self.read_buf.extend_from_slice(&chunk[..n]);
                            self.drain_buffer().await;
                        }
                        Err(e) => return self.disconnect(Some(e.to_string())).await,
                    }
                }
                _ = retry_interval.tick() => {
                    self.run_retry_pass().await;
                }
                _ = timesync_interval.tick(), if !self.config.timesync_interval.is_zero() => {
                    self.emit_timesync().await;
                }
            }
        }
    }

    async fn write_raw(&mut self, bytes: &[u8]) -> Result<(), SessionError> {
        tokio::time::sleep(WRITE_GAP).await;
        self.transport.write_all(bytes).await?;
        self.transport.flush().await?;
        Ok(())
    }

    /// `Acquire code -> write bytes -> insert into pending table` as one
    /// sequence, matching spec.md §5's atomicity requirement: ack handling
    /// never observes a code in the pending table without its bytes.
    async fn send_and_track(
        &mut self,
        packet: &Packet,
        confirmation: bool,
        basic_mode: bool,
    ) -> Result<Option<u8>, SessionError> {
        let code = if confirmation {
            Some(confirmation::acquire(&self.confirmations).await)
        } else {
            None
        };
        let opts = SendOptions {
            confirmation: code,
            basic_mode,
            checksum: false,
        };
        let bytes = encode_packet(packet, &opts);
        if let Err(e) = self.write_raw(&bytes).await {
            if let Some(code) = code {
                self.confirmations.lock().await.release(code);
            }
            return Err(e);
        }
        if let Some(code) = code {
            self.pending.lock().await.insert(
                code,
                PendingSend {
                    bytes,
                    attempts: 1,
                    last_attempt: Instant::now(),
                },
            );
        }
        Ok(code)
    }

    async fn run_retry_pass(&mut self) {
        let reaped = self.confirmations.lock().await.reap_timed_out();
        if !reaped.is_empty() {
            let mut pending = self.pending.lock().await;
            for code in reaped {
                pending.remove(&code);
            }
        }

        let now = Instant::now();
        let (mut to_retry, mut to_abandon) = (Vec::new(), Vec::new());
        {
            let pending = self.pending.lock().await;
            for (&code, send) in pending.iter() {
                if now.duration_since(send.last_attempt) < RETRY_INTERVAL {
                    continue;
                }
                if send.attempts < MAX_RETRIES {
                    to_retry.push((code, send.bytes.clone()));
                } else {
                    to_abandon.push(code);
                }
            }
        }

        for code in &to_abandon {
            self.pending.lock().await.remove(code);
            self.confirmations.lock().await.release(*code);
            warn!(code = *code as char, "abandoning unacknowledged command after max retries");
        }
        if !to_abandon.is_empty() {
            let total = self
                .consecutive_abandons
                .fetch_add(to_abandon.len(), Ordering::SeqCst)
                + to_abandon.len();
            if total >= CONSECUTIVE_ABANDON_THRESHOLD {
                error!(total, "consecutive command abandonments; connection may be unstable");
                self.consecutive_abandons.store(0, Ordering::SeqCst);
            }
        }

        for (code, bytes) in to_retry {
            {
                let mut pending = self.pending.lock().await;
                if let Some(send) = pending.get_mut(&code) {
                    send.attempts += 1;
                    send.last_attempt = Instant::now();
                }
            }
            if let Err(e) = self.write_raw(&bytes).await {
                warn!(error = %e, code = code as char, "failed to rewrite retried command");
            }
        }
    }

    async fn emit_timesync(&mut self) {
        let packet = multipoint(vec![clock_update_sal(Local::now())]);
        match self.send_and_track(&packet, true, false).await {
            Ok(_) => debug!("sent timesync clock broadcast"),
            Err(e) => error!(error = %e, "timesync broadcast failed"),
        }
    }

    async fn drain_buffer(&mut self) {
        loop {
            match decode_packet(&self.read_buf, self.strict_checksum) {
                Ok((packet, consumed)) => {
                    self.read_buf.drain(..consumed);
                    self.dispatch_packet(packet).await;
                }
                Err(DecodeError::Incomplete) => break,
                Err(DecodeError::Invalid(e)) => {
                    warn!(reason = %e.reason, raw = ?e.raw, "discarding malformed C-Bus frame");
                    let consumed = find_crlf(&self.read_buf)
                        .map(|t| t + 2)
                        .unwrap_or(self.read_buf.len());
                    self.read_buf.drain(..consumed);
                }
            }
        }
    }

    async fn dispatch_packet(&mut self, packet: Packet) {
        match packet {
            Packet::Confirmation { code, success } => self.handle_confirmation(code, success).await,
            Packet::PciError => {
                warn!("PCI reported it cannot accept data");
                let _ = self
                    .events
                    .send(PciEvent::Error {
                        reason: "pci cannot accept data".to_string(),
                    })
                    .await;
            }
            Packet::PowerOn => info!("PCI power-on notification received"),
            Packet::Reset => debug!("PCI echoed a reset frame"),
            Packet::DeviceManagement(dm) => {
                debug!(parameter = dm.parameter, value = dm.value, "device management echo")
            }
            Packet::PointToMultipoint(p) => {
                for sal in p.sal {
                    self.dispatch_sal(p.source_address, sal).await;
                }
            }
            Packet::PointToPoint(p) => {
                for cal in p.cal {
                    self.dispatch_cal(cal).await;
                }
            }
        }
    }

    async fn dispatch_sal(&mut self, source: Option<u8>, sal: Sal) {
        let event = match sal {
            Sal::LightingOn { app, group } => Some(PciEvent::LightingOn { app, group, source }),
            Sal::LightingOff { app, group } => Some(PciEvent::LightingOff { app, group, source }),
            Sal::LightingRamp {
                app,
                group,
                duration_secs,
                level,
            } => Some(PciEvent::LightingRamp {
                app,
                group,
                source,
                duration_secs,
                level,
            }),
            Sal::LightingTerminateRamp { app, group } => {
                Some(PciEvent::LightingTerminateRamp { app, group, source })
            }
            Sal::ClockRequest => {
                if self.config.handle_clock_requests {
                    let packet = multipoint(vec![clock_update_sal(Local::now())]);
                    if let Err(e) = self.send_and_track(&packet, true, false).await {
                        warn!(error = %e, "failed to answer clock request");
                    }
                }
                Some(PciEvent::ClockRequest { source })
            }
            Sal::ClockUpdate { .. } => {
                debug!("ignoring clock update broadcast from another unit");
                None
            }
            Sal::StatusRequest { .. } => {
                debug!("ignoring status request echo");
                None
            }
        };
        if let Some(event) = event {
            let _ = self.events.send(event).await;
        }
    }

    async fn dispatch_cal(&mut self, cal: Cal) {
        match cal {
            Cal::Identify { .. } => debug!("ignoring identify CAL echo"),
            Cal::ExtendedReport {
                child_app,
                block_start,
                report,
            } => {
                let event = match report {
                    ExtendedReportData::Level(levels) => PciEvent::LevelReport {
                        app: Application(child_app),
                        block_start,
                        levels,
                    },
                    ExtendedReportData::Binary(states) => PciEvent::BinaryReport {
                        app: Application(child_app),
                        block_start,
                        states,
                    },
                };
                let _ = self.events.send(event).await;
            }
        }
    }

    async fn handle_confirmation(&mut self, code: u8, success: bool) {
        let had_pending = self.pending.lock().await.remove(&code).is_some();
        self.confirmations.lock().await.release(code);
        if !had_pending {
            warn!(code = code as char, "confirmation for unknown or already-resolved command");
            return;
        }
        if success {
            self.consecutive_abandons.store(0, Ordering::SeqCst);
        } else {
            let _ = self.events.send(PciEvent::CommandFailed { code }).await;
        }
    }

    async fn disconnect(self, reason: Option<String>) -> SessionError {
        warn!(?reason, "PCI transport disconnected");
        self.pending.lock().await.clear();
        self.confirmations.lock().await.reap_timed_out();
        *self.confirmations.lock().await = ConfirmationRegistry::new();
        let _ = self
            .events
            .send(PciEvent::ConnectionDown {
                reason: reason.clone(),
            })
            .await;
        SessionError::Transport(std::io::Error::new(
            std::io::ErrorKind::ConnectionAborted,
            reason.unwrap_or_else(|| "connection closed".to_string()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn batching_rejects_more_than_nine_groups() {
        let groups: Vec<u8> = (1..=10).collect();
        assert!(matches!(
            PciHandle::batch(&groups),
            Err(SessionError::TooManyGroups(10))
        ));
    }

    #[test]
    fn batching_accepts_exactly_nine_groups() {
        let groups: Vec<u8> = (1..=9).collect();
        assert!(PciHandle::batch(&groups).is_ok());
    }

    #[test]
    fn clock_update_sal_uses_monday_zero_weekday() {
        // 2024-01-01 is a Monday.
        let when = Local.with_ymd_and_hms(2024, 1, 1, 10, 30, 0).unwrap();
        match clock_update_sal(when) {
            Sal::ClockUpdate { day_of_week, year, .. } => {
                assert_eq!(day_of_week, 0);
                assert_eq!(year, 2024);
            }
            other => panic!("unexpected SAL: {other:?}"),
        }
    }
}
