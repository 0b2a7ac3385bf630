//! Data-ready event pipeline.
//!
//! The GPIO interrupt only pushes an event into a bounded queue. The consumer
//! task drains the queue, gives the data-ready semaphore and, while streaming
//! is enabled and a client is connected, clocks one sample block over SPI and
//! forwards it as a `GET_DATA` frame.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use wulpus_proto::{Command, CommandHeader, SAMPLE_BLOCK_LEN};

use crate::command::send_command;
use crate::context::BridgeContext;
use crate::error::BridgeResult;

/// GPIO number of the data-ready input on the gateway board.
pub const DATA_READY_PIN: u8 = 5;

pub const GET_DATA_HEADER: CommandHeader =
    CommandHeader::new(Command::GetData, SAMPLE_BLOCK_LEN as u16);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpioEvent {
    pub pin: u8,
}

/// Interrupt-side producer. Cheap to clone; never blocks.
#[derive(Debug, Clone)]
pub struct IsrHandle {
    tx: mpsc::Sender<GpioEvent>,
    pin: u8,
}

impl IsrHandle {
    pub(crate) fn new(tx: mpsc::Sender<GpioEvent>, pin: u8) -> Self {
        Self { tx, pin }
    }

    /// Call from the edge interrupt. Returns `false` when the queue is full
    /// or the consumer is gone and the edge was dropped.
    pub fn on_edge(&self) -> bool {
        self.tx.try_send(GpioEvent { pin: self.pin }).is_ok()
    }
}

/// Consumer task body. Runs for the life of the bridge: `ctx` keeps a sender
/// of the event queue alive, so the queue never closes while this task holds
/// it.
pub async fn run_data_ready_consumer(ctx: Arc<BridgeContext>, mut events: mpsc::Receiver<GpioEvent>) {
    while let Some(event) = events.recv().await {
        handle_event(&ctx, event).await;
    }
    debug!("gpio event queue closed");
}

pub(crate) async fn handle_event(ctx: &BridgeContext, event: GpioEvent) {
    trace!(pin = event.pin, "data ready");
    ctx.data_ready().give();

    if !ctx.transmits_enabled() || !ctx.connection().is_open() {
        return;
    }
    if let Err(err) = forward_sample(ctx).await {
        warn!(error = %err, "dropping sample");
    }
}

async fn forward_sample(ctx: &BridgeContext) -> BridgeResult<()> {
    let mut block = [0u8; SAMPLE_BLOCK_LEN];
    ctx.link().read_sample(&mut block).await?;
    send_command(ctx.connection(), &GET_DATA_HEADER, &block).await
}

/// Re-queues a data-ready edge that was consumed before streaming started.
///
/// If the companion raised data ready while transmits were off, the sample
/// was never read and the semaphore is still set. Taking it and injecting an
/// event makes the consumer read that sample now.
pub fn recover_missed_edge(ctx: &BridgeContext) -> bool {
    if !ctx.data_ready().try_take() {
        return false;
    }
    let queued = ctx.isr_handle().on_edge();
    if queued {
        debug!("re-queued pending data ready edge");
    } else {
        warn!("event queue full, pending sample not re-queued");
    }
    queued
}
