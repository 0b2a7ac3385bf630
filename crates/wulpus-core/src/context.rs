//! Process-wide bridge state.
//!
//! One [`BridgeContext`] is built at startup and shared by the accept loop,
//! the session orchestrator and the data-ready consumer. It owns the SPI
//! link, the session socket, the data-ready semaphore, the sending side of
//! the GPIO event queue and the streaming flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tracing::debug;

use crate::config::BridgeSettings;
use crate::hal::{RadioPowerSave, StatusIndicator, SystemControl};
use crate::link::HardwareLink;
use crate::pipeline::{GpioEvent, IsrHandle, DATA_READY_PIN};
use crate::socket::Connection;

/// Binary semaphore: giving twice before a take leaves a single token.
#[derive(Debug, Default)]
pub struct BinarySemaphore {
    token: AtomicBool,
    notify: Notify,
}

impl BinarySemaphore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn give(&self) {
        self.token.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    pub fn try_take(&self) -> bool {
        self.token.swap(false, Ordering::AcqRel)
    }

    /// Waits up to `timeout` for the token.
    pub async fn take(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if self.try_take() {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_take();
            }
        }
    }

    pub fn clear(&self) {
        self.try_take();
    }

    pub fn is_given(&self) -> bool {
        self.token.load(Ordering::Acquire)
    }
}

/// Platform services used while a session is running.
pub struct Collaborators {
    pub radio: Box<dyn RadioPowerSave>,
    pub status: Arc<dyn StatusIndicator>,
    pub system: Box<dyn SystemControl>,
}

pub struct BridgeContext {
    settings: BridgeSettings,
    link: HardwareLink,
    connection: Connection,
    data_ready: BinarySemaphore,
    events: mpsc::Sender<GpioEvent>,
    transmits_enabled: AtomicBool,
    collaborators: Collaborators,
}

impl BridgeContext {
    /// Returns the context and the receiving end of the GPIO event queue,
    /// which belongs to the data-ready consumer.
    pub fn new(
        settings: BridgeSettings,
        link: HardwareLink,
        collaborators: Collaborators,
    ) -> (Arc<Self>, mpsc::Receiver<GpioEvent>) {
        let (events, rx) = mpsc::channel(settings.event_queue_depth);
        let connection = Connection::create(settings.send_lock_timeout);
        let ctx = Arc::new(Self {
            settings,
            link,
            connection,
            data_ready: BinarySemaphore::new(),
            events,
            transmits_enabled: AtomicBool::new(false),
            collaborators,
        });
        (ctx, rx)
    }

    pub fn settings(&self) -> &BridgeSettings {
        &self.settings
    }

    pub fn link(&self) -> &HardwareLink {
        &self.link
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn data_ready(&self) -> &BinarySemaphore {
        &self.data_ready
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    /// Handle for the data-ready GPIO interrupt.
    pub fn isr_handle(&self) -> IsrHandle {
        IsrHandle::new(self.events.clone(), DATA_READY_PIN)
    }

    pub fn transmits_enabled(&self) -> bool {
        self.transmits_enabled.load(Ordering::Acquire)
    }

    pub fn set_transmits_enabled(&self, enabled: bool) {
        let prev = self.transmits_enabled.swap(enabled, Ordering::AcqRel);
        if prev != enabled {
            debug!(enabled, "transmits toggled");
        }
    }
}
