//! Startup and the accept loop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::BridgeSettings;
use crate::context::{BridgeContext, Collaborators};
use crate::error::{HalError, StartupError, TransportError};
use crate::hal::{
    NetworkProvisioner, RadioPowerSave, RetainedOutput, ServiceAdvertiser, SpiDevice, Status,
    StatusIndicator, SystemControl,
};
use crate::link::HardwareLink;
use crate::pipeline::{run_data_ready_consumer, IsrHandle};
use crate::session::{Session, SessionEnd};
use crate::socket::Listener;

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Board peripherals wired to the acquisition MCU.
pub struct Hardware {
    pub spi: Box<dyn SpiDevice>,
    pub chip_select: Box<dyn RetainedOutput>,
    pub link_ready: Box<dyn RetainedOutput>,
}

impl Hardware {
    pub fn into_link(self, lock_timeout: Duration) -> HardwareLink {
        HardwareLink::new(self.spi, self.chip_select, self.link_ready, lock_timeout)
    }
}

pub struct Platform {
    pub network: Arc<dyn NetworkProvisioner>,
    pub advertiser: Box<dyn ServiceAdvertiser>,
    pub radio: Box<dyn RadioPowerSave>,
    pub status: Arc<dyn StatusIndicator>,
    pub system: Box<dyn SystemControl>,
}

pub struct Bridge {
    ctx: Arc<BridgeContext>,
    listener: Listener,
    consumer: JoinHandle<()>,
}

impl Bridge {
    /// Waits for the network, binds the listener, advertises the service and
    /// starts the data-ready consumer.
    pub async fn start(
        settings: BridgeSettings,
        hardware: Hardware,
        platform: Platform,
    ) -> Result<Self, StartupError> {
        let Platform {
            network,
            advertiser,
            radio,
            status,
            system,
        } = platform;

        status.set(Status::Off);
        status.set(Status::Provisioning);
        let ip = tokio::task::spawn_blocking(move || network.wait_ready())
            .await
            .map_err(|e| StartupError::Network(HalError::new(e.to_string())))?
            .map_err(StartupError::Network)?;
        info!(%ip, "network ready");

        let listener = match Listener::bind(settings.listen).await {
            Ok(listener) => listener,
            Err(err) => {
                status.set(Status::Error);
                return Err(err.into());
            }
        };
        let port = listener.local_addr()?.port();
        if let Err(err) = advertiser.advertise(&settings.service_name, "tcp", port) {
            warn!(error = %err, "service advertisement failed");
        }

        let link = hardware.into_link(settings.spi_lock_timeout);
        let collaborators = Collaborators {
            radio,
            status: status.clone(),
            system,
        };
        let (ctx, events) = BridgeContext::new(settings, link, collaborators);
        let consumer = tokio::spawn(run_data_ready_consumer(ctx.clone(), events));

        status.set(Status::Idle);
        Ok(Self {
            ctx,
            listener,
            consumer,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.listener.local_addr()
    }

    pub fn context(&self) -> &Arc<BridgeContext> {
        &self.ctx
    }

    pub fn isr_handle(&self) -> IsrHandle {
        self.ctx.isr_handle()
    }

    /// Serves clients one at a time, forever. A `RESET` restarts the device
    /// and does not return.
    pub async fn run(self) {
        loop {
            let stream = match self.listener.accept().await {
                Ok((stream, _peer)) => stream,
                Err(err) => {
                    warn!(error = %err, "accept failed, retrying");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    continue;
                }
            };
            if self.consumer.is_finished() {
                error!("data ready consumer stopped");
            }
            if let SessionEnd::Restart = serve_connection(&self.ctx, stream).await {
                self.ctx.collaborators().system.restart();
            }
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}

/// Runs one session on `stream` and cleans up after it.
pub async fn serve_connection(ctx: &BridgeContext, stream: TcpStream) -> SessionEnd {
    let collaborators = ctx.collaborators();
    if let Err(err) = ctx.connection().attach(stream).await {
        return SessionEnd::Failed(err.into());
    }
    ctx.data_ready().clear();
    if let Err(err) = collaborators.radio.suspend(true) {
        warn!(error = %err, "failed to suspend radio power save");
    }
    collaborators.status.set(Status::Transmitting);

    let end = Session::new(ctx).run().await;
    match &end {
        SessionEnd::Closed => info!("session closed by client"),
        SessionEnd::Restart => info!("restart requested by client"),
        SessionEnd::Failed(err) => match err {
            crate::error::BridgeError::Transport(TransportError::Closed) => {
                info!("client disconnected")
            }
            other => warn!(error = %other, "session aborted"),
        },
    }

    if let Err(err) = ctx.connection().close().await {
        debug!(error = %err, "socket already closed");
    }
    if let Err(err) = collaborators.radio.suspend(false) {
        warn!(error = %err, "failed to resume radio power save");
    }
    collaborators.status.set(Status::Idle);
    end
}
