//! Host-side board simulation.
//!
//! Every [`crate::hal`] trait has an in-memory implementation here so the
//! bridge can run on a workstation and in tests. State is shared through
//! `Arc`, so a clone handed to the bridge and the clone kept by a test see
//! the same pin levels, transfers and history.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

use crate::bridge::{Hardware, Platform};
use crate::config::{BridgeSettings, SimSettings};
use crate::context::{BridgeContext, Collaborators};
use crate::error::HalError;
use crate::hal::{
    NetworkProvisioner, RadioPowerSave, RetainedOutput, ServiceAdvertiser, SpiDevice, Status,
    StatusIndicator, SystemControl,
};
use crate::pipeline::{GpioEvent, IsrHandle};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinEvent {
    HoldDisable,
    HoldEnable,
    Level(bool),
}

#[derive(Debug)]
struct PinState {
    held: bool,
    level: bool,
    fail_writes: bool,
    events: Vec<PinEvent>,
}

/// Output pin that rejects level changes while retention is enabled.
///
/// Starts low with retention enabled, as the pins are left by board init.
#[derive(Debug, Clone)]
pub struct SimPin {
    name: &'static str,
    state: Arc<Mutex<PinState>>,
    level_tx: Arc<watch::Sender<bool>>,
}

impl SimPin {
    pub fn new(name: &'static str) -> Self {
        let (level_tx, _) = watch::channel(false);
        Self {
            name,
            state: Arc::new(Mutex::new(PinState {
                held: true,
                level: false,
                fail_writes: false,
                events: Vec::new(),
            })),
            level_tx: Arc::new(level_tx),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn events(&self) -> Vec<PinEvent> {
        lock(&self.state).events.clone()
    }

    pub fn level(&self) -> bool {
        lock(&self.state).level
    }

    pub fn is_held(&self) -> bool {
        lock(&self.state).held
    }

    /// Makes subsequent level writes fail.
    pub fn fail_writes(&self, fail: bool) {
        lock(&self.state).fail_writes = fail;
    }

    /// Level changes as seen by the other side of the wire.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.level_tx.subscribe()
    }
}

impl RetainedOutput for SimPin {
    fn set_level(&mut self, high: bool) -> Result<(), HalError> {
        let mut state = lock(&self.state);
        if state.fail_writes {
            return Err(HalError::new(format!("{}: gpio write failed", self.name)));
        }
        if state.held {
            return Err(HalError::new(format!(
                "{}: level change while retention is enabled",
                self.name
            )));
        }
        state.level = high;
        state.events.push(PinEvent::Level(high));
        drop(state);
        self.level_tx.send_replace(high);
        Ok(())
    }

    fn hold_enable(&mut self) -> Result<(), HalError> {
        let mut state = lock(&self.state);
        state.held = true;
        state.events.push(PinEvent::HoldEnable);
        Ok(())
    }

    fn hold_disable(&mut self) -> Result<(), HalError> {
        let mut state = lock(&self.state);
        state.held = false;
        state.events.push(PinEvent::HoldDisable);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct SpiState {
    config_writes: Vec<Vec<u8>>,
    sample_reads: u64,
    fail_next: usize,
}

/// Acquisition MCU side of the SPI bus.
///
/// Written blocks are recorded as configurations. Each read returns a
/// numbered sample block: byte 0 is the data-valid marker, byte 1 the TX/RX
/// configuration id, bytes 2..4 the acquisition number (little-endian) and
/// the rest a ramp of `i16` samples.
#[derive(Debug, Clone)]
pub struct SimSpi {
    state: Arc<Mutex<SpiState>>,
    chip_select: Option<SimPin>,
    configured: Arc<watch::Sender<usize>>,
}

impl Default for SimSpi {
    fn default() -> Self {
        Self::new()
    }
}

impl SimSpi {
    pub fn new() -> Self {
        let (configured, _) = watch::channel(0);
        Self {
            state: Arc::new(Mutex::new(SpiState::default())),
            chip_select: None,
            configured: Arc::new(configured),
        }
    }

    /// Fails any transfer attempted while `cs` still has retention enabled.
    pub fn with_chip_select(cs: SimPin) -> Self {
        Self {
            chip_select: Some(cs),
            ..Self::new()
        }
    }

    pub fn config_writes(&self) -> Vec<Vec<u8>> {
        lock(&self.state).config_writes.clone()
    }

    pub fn sample_reads(&self) -> u64 {
        lock(&self.state).sample_reads
    }

    /// Makes the next `n` transfers fail.
    pub fn fail_next(&self, n: usize) {
        lock(&self.state).fail_next = n;
    }

    /// Number of configuration blocks received so far.
    pub fn configured(&self) -> watch::Receiver<usize> {
        self.configured.subscribe()
    }

    fn begin(&self, state: &mut SpiState) -> Result<(), HalError> {
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(HalError::new("spi transfer failed"));
        }
        if let Some(cs) = &self.chip_select {
            if cs.is_held() {
                return Err(HalError::new("spi transfer with chip select retained"));
            }
        }
        Ok(())
    }
}

impl SpiDevice for SimSpi {
    fn write(&mut self, tx: &[u8]) -> Result<(), HalError> {
        let mut state = lock(&self.state);
        self.begin(&mut state)?;
        state.config_writes.push(tx.to_vec());
        let count = state.config_writes.len();
        drop(state);
        self.configured.send_replace(count);
        trace!(len = tx.len(), "sim spi write");
        Ok(())
    }

    fn read(&mut self, rx: &mut [u8]) -> Result<(), HalError> {
        let mut state = lock(&self.state);
        self.begin(&mut state)?;
        let acq_nr = state.sample_reads as u16;
        state.sample_reads += 1;
        drop(state);

        rx.fill(0);
        if rx.len() >= 4 {
            rx[2..4].copy_from_slice(&acq_nr.to_le_bytes());
            for (i, chunk) in rx[4..].chunks_exact_mut(2).enumerate() {
                let sample = ((i as i32 + acq_nr as i32) % 512 - 256) as i16;
                chunk.copy_from_slice(&sample.to_le_bytes());
            }
        }
        trace!(acq_nr, "sim spi read");
        Ok(())
    }
}

/// The acquisition MCU's data-ready line.
///
/// Acknowledges a rising link-ready after `ack_delay`. Once a configuration
/// has arrived it raises data ready every `sample_interval`, except while
/// link ready is high.
pub struct SimCompanion {
    isr: IsrHandle,
    link_ready: watch::Receiver<bool>,
    configured: watch::Receiver<usize>,
    settings: SimSettings,
}

impl SimCompanion {
    pub fn new(isr: IsrHandle, board: &SimBoard, settings: SimSettings) -> Self {
        Self {
            isr,
            link_ready: board.link_ready.subscribe(),
            configured: board.spi.configured(),
            settings,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.settings.sample_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                changed = self.link_ready.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let high = *self.link_ready.borrow_and_update();
                    if high {
                        tokio::time::sleep(self.settings.ack_delay).await;
                        if !self.isr.on_edge() {
                            debug!("link ready ack dropped");
                        }
                    }
                }
                _ = ticker.tick() => {
                    let configured = *self.configured.borrow() > 0;
                    if configured && !*self.link_ready.borrow() && !self.isr.on_edge() {
                        trace!("sample edge dropped");
                    }
                }
            }
        }
        debug!("sim companion stopped");
    }
}

/// Records every power-save request; `true` means suspended.
#[derive(Debug, Clone, Default)]
pub struct SimRadio {
    calls: Arc<Mutex<Vec<bool>>>,
}

impl SimRadio {
    pub fn calls(&self) -> Vec<bool> {
        lock(&self.calls).clone()
    }
}

impl RadioPowerSave for SimRadio {
    fn suspend(&self, suspend: bool) -> Result<(), HalError> {
        lock(&self.calls).push(suspend);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SimNetwork {
    result: Result<IpAddr, String>,
}

impl Default for SimNetwork {
    fn default() -> Self {
        Self::ready(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }
}

impl SimNetwork {
    pub fn ready(ip: IpAddr) -> Self {
        Self { result: Ok(ip) }
    }

    pub fn failing(reason: impl Into<String>) -> Self {
        Self {
            result: Err(reason.into()),
        }
    }
}

impl NetworkProvisioner for SimNetwork {
    fn wait_ready(&self) -> Result<IpAddr, HalError> {
        self.result.clone().map_err(HalError::new)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub name: String,
    pub proto: String,
    pub port: u16,
}

#[derive(Debug, Clone, Default)]
pub struct SimAdvertiser {
    adverts: Arc<Mutex<Vec<Advertisement>>>,
}

impl SimAdvertiser {
    pub fn adverts(&self) -> Vec<Advertisement> {
        lock(&self.adverts).clone()
    }
}

impl ServiceAdvertiser for SimAdvertiser {
    fn advertise(&self, name: &str, proto: &str, port: u16) -> Result<(), HalError> {
        debug!(name, proto, port, "advertising service");
        lock(&self.adverts).push(Advertisement {
            name: name.to_string(),
            proto: proto.to_string(),
            port,
        });
        Ok(())
    }
}

/// Status indicator that remembers every state it was put in.
#[derive(Debug, Clone)]
pub struct StatusBoard {
    history: Arc<Mutex<Vec<Status>>>,
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self {
            history: Arc::new(Mutex::new(vec![Status::Off])),
        }
    }
}

impl StatusBoard {
    pub fn current(&self) -> Status {
        lock(&self.history).last().copied().unwrap_or(Status::Off)
    }

    pub fn history(&self) -> Vec<Status> {
        lock(&self.history).clone()
    }
}

impl StatusIndicator for StatusBoard {
    fn set(&self, status: Status) {
        let mut history = lock(&self.history);
        if history.last() != Some(&status) {
            debug!(%status, "status");
            history.push(status);
        }
    }
}

/// Restart unwinds the calling task, which is all a host process can do
/// short of exiting.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimSystem;

impl SystemControl for SimSystem {
    fn restart(&self) -> ! {
        panic!("device restart requested")
    }
}

/// One simulated gateway board with all peripherals wired up.
#[derive(Debug, Clone)]
pub struct SimBoard {
    pub spi: SimSpi,
    pub chip_select: SimPin,
    pub link_ready: SimPin,
    pub radio: SimRadio,
    pub network: SimNetwork,
    pub advertiser: SimAdvertiser,
    pub status: StatusBoard,
}

impl Default for SimBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl SimBoard {
    pub fn new() -> Self {
        let chip_select = SimPin::new("spi_cs");
        Self {
            spi: SimSpi::with_chip_select(chip_select.clone()),
            chip_select,
            link_ready: SimPin::new("link_ready"),
            radio: SimRadio::default(),
            network: SimNetwork::default(),
            advertiser: SimAdvertiser::default(),
            status: StatusBoard::default(),
        }
    }

    pub fn hardware(&self) -> Hardware {
        Hardware {
            spi: Box::new(self.spi.clone()),
            chip_select: Box::new(self.chip_select.clone()),
            link_ready: Box::new(self.link_ready.clone()),
        }
    }

    pub fn platform(&self, system: Box<dyn SystemControl>) -> Platform {
        Platform {
            network: Arc::new(self.network.clone()),
            advertiser: Box::new(self.advertiser.clone()),
            radio: Box::new(self.radio.clone()),
            status: Arc::new(self.status.clone()),
            system,
        }
    }

    /// A context wired to this board without a listener or consumer task.
    pub fn context(&self, settings: BridgeSettings) -> (Arc<BridgeContext>, mpsc::Receiver<GpioEvent>) {
        let link = self.hardware().into_link(settings.spi_lock_timeout);
        let collaborators = Collaborators {
            radio: Box::new(self.radio.clone()),
            status: Arc::new(self.status.clone()),
            system: Box::new(SimSystem),
        };
        BridgeContext::new(settings, link, collaborators)
    }

    pub fn companion(&self, isr: IsrHandle, settings: SimSettings) -> SimCompanion {
        SimCompanion::new(isr, self, settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn sample_blocks_carry_acquisition_number() {
        let mut spi = SimSpi::new();
        let mut block = [0u8; 16];
        spi.read(&mut block).expect("read");
        spi.read(&mut block).expect("read");
        assert_eq!(u16::from_le_bytes([block[2], block[3]]), 1);
        assert_eq!(i16::from_le_bytes([block[4], block[5]]), -255);
    }

    #[test]
    fn status_board_collapses_repeats() {
        let status = StatusBoard::default();
        status.set(Status::Idle);
        status.set(Status::Idle);
        status.set(Status::Transmitting);
        assert_eq!(status.history(), vec![Status::Off, Status::Idle, Status::Transmitting]);
        assert_eq!(status.current(), Status::Transmitting);
    }

    #[test]
    fn failing_network_reports_reason() {
        let err = SimNetwork::failing("no ap").wait_ready().unwrap_err();
        assert_eq!(err.to_string(), "no ap");
    }

    #[tokio::test]
    async fn companion_acks_rising_link_ready() {
        let board = SimBoard::new();
        let (ctx, mut rx) = board.context(BridgeSettings::default());
        let settings = SimSettings {
            sample_interval: Duration::from_secs(60),
            ack_delay: Duration::from_millis(1),
        };
        let task = board.companion(ctx.isr_handle(), settings).spawn();

        ctx.link().set_link_ready(true).expect("raise");
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("ack in time")
            .expect("event");
        assert_eq!(event.pin, crate::pipeline::DATA_READY_PIN);
        task.abort();
    }
}
