//! SPI and GPIO link to the acquisition MCU.
//!
//! Transfers are fixed-size per direction: a [`CONFIG_BLOCK_LEN`] block out,
//! a [`SAMPLE_BLOCK_LEN`] block in. The bus is shared between the command
//! path and the streaming path and is only ever touched under the bus lock.

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, MutexGuard};
use tracing::debug;
use wulpus_proto::{CONFIG_BLOCK_LEN, SAMPLE_BLOCK_LEN};

use crate::error::{HalError, HandshakeError};
use crate::hal::{RetainedOutput, SpiDevice};
use crate::retention::{write_retained, HoldReleased};

struct SpiPort {
    spi: Box<dyn SpiDevice>,
    chip_select: Box<dyn RetainedOutput>,
}

impl SpiPort {
    /// Runs one transfer with chip-select retention released around it.
    fn transaction<T>(
        &mut self,
        f: impl FnOnce(&mut dyn SpiDevice) -> Result<T, HalError>,
    ) -> Result<T, HalError> {
        let _cs = HoldReleased::new(&mut *self.chip_select)?;
        f(&mut *self.spi)
    }
}

pub struct HardwareLink {
    bus: AsyncMutex<SpiPort>,
    link_ready: Mutex<Box<dyn RetainedOutput>>,
    lock_timeout: Duration,
}

impl HardwareLink {
    pub fn new(
        spi: Box<dyn SpiDevice>,
        chip_select: Box<dyn RetainedOutput>,
        link_ready: Box<dyn RetainedOutput>,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            bus: AsyncMutex::new(SpiPort { spi, chip_select }),
            link_ready: Mutex::new(link_ready),
            lock_timeout,
        }
    }

    pub fn set_link_ready(&self, high: bool) -> Result<(), HalError> {
        let mut pin = self.link_ready.lock().unwrap_or_else(|e| e.into_inner());
        write_retained(&mut **pin, high)?;
        debug!(high, "link ready");
        Ok(())
    }

    async fn lock_bus(&self) -> Result<MutexGuard<'_, SpiPort>, HandshakeError> {
        tokio::time::timeout(self.lock_timeout, self.bus.lock())
            .await
            .map_err(|_| HandshakeError::SpiBusy(self.lock_timeout))
    }

    pub async fn write_config(&self, block: &[u8; CONFIG_BLOCK_LEN]) -> Result<(), HandshakeError> {
        let mut port = self.lock_bus().await?;
        port.transaction(|spi| spi.write(block))?;
        debug!(len = block.len(), "configuration block written");
        Ok(())
    }

    pub async fn read_sample(&self, block: &mut [u8; SAMPLE_BLOCK_LEN]) -> Result<(), HandshakeError> {
        let mut port = self.lock_bus().await?;
        port.transaction(|spi| spi.read(block))?;
        Ok(())
    }
}

/// Copies `payload` into a zeroed configuration block.
pub fn config_block(payload: &[u8]) -> Result<[u8; CONFIG_BLOCK_LEN], HandshakeError> {
    if payload.len() > CONFIG_BLOCK_LEN {
        return Err(HandshakeError::PayloadTooLarge {
            len: payload.len(),
            block: CONFIG_BLOCK_LEN,
        });
    }
    let mut block = [0u8; CONFIG_BLOCK_LEN];
    block[..payload.len()].copy_from_slice(payload);
    Ok(block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{PinEvent, SimPin, SimSpi};

    fn link_with(spi: &SimSpi, cs: &SimPin, ready: &SimPin, timeout: Duration) -> HardwareLink {
        HardwareLink::new(
            Box::new(spi.clone()),
            Box::new(cs.clone()),
            Box::new(ready.clone()),
            timeout,
        )
    }

    #[test]
    fn config_block_is_zero_padded() {
        let block = config_block(&[1, 2, 3]).expect("block");
        assert_eq!(&block[..3], &[1, 2, 3]);
        assert!(block[3..].iter().all(|b| *b == 0));
    }

    #[test]
    fn config_block_rejects_oversized_payload() {
        let err = config_block(&[0u8; CONFIG_BLOCK_LEN + 1]).unwrap_err();
        assert!(matches!(err, HandshakeError::PayloadTooLarge { .. }));
    }

    #[tokio::test]
    async fn write_brackets_transfer_with_chip_select_release() {
        let cs = SimPin::new("cs");
        let spi = SimSpi::with_chip_select(cs.clone());
        let ready = SimPin::new("link_ready");
        let link = link_with(&spi, &cs, &ready, Duration::from_millis(100));

        link.write_config(&config_block(b"cfg").expect("block"))
            .await
            .expect("write");

        assert_eq!(spi.config_writes().len(), 1);
        assert_eq!(&spi.config_writes()[0][..3], b"cfg");
        assert_eq!(cs.events(), vec![PinEvent::HoldDisable, PinEvent::HoldEnable]);
        assert!(cs.is_held());
    }

    #[tokio::test]
    async fn read_returns_numbered_sample_blocks() {
        let cs = SimPin::new("cs");
        let spi = SimSpi::with_chip_select(cs.clone());
        let ready = SimPin::new("link_ready");
        let link = link_with(&spi, &cs, &ready, Duration::from_millis(100));

        let mut block = [0u8; SAMPLE_BLOCK_LEN];
        link.read_sample(&mut block).await.expect("first");
        assert_eq!(u16::from_le_bytes([block[2], block[3]]), 0);
        link.read_sample(&mut block).await.expect("second");
        assert_eq!(u16::from_le_bytes([block[2], block[3]]), 1);
        assert_eq!(spi.sample_reads(), 2);
    }

    #[tokio::test]
    async fn spi_failure_still_restores_chip_select_hold() {
        let cs = SimPin::new("cs");
        let spi = SimSpi::with_chip_select(cs.clone());
        spi.fail_next(1);
        let ready = SimPin::new("link_ready");
        let link = link_with(&spi, &cs, &ready, Duration::from_millis(100));

        let mut block = [0u8; SAMPLE_BLOCK_LEN];
        let err = link.read_sample(&mut block).await.unwrap_err();
        assert!(matches!(err, HandshakeError::Spi(_)));
        assert!(cs.is_held());
        link.read_sample(&mut block).await.expect("recovers");
    }

    #[tokio::test]
    async fn busy_bus_times_out() {
        let cs = SimPin::new("cs");
        let spi = SimSpi::with_chip_select(cs.clone());
        let ready = SimPin::new("link_ready");
        let link = link_with(&spi, &cs, &ready, Duration::from_millis(20));

        let _held = link.bus.lock().await;
        let mut block = [0u8; SAMPLE_BLOCK_LEN];
        let err = link.read_sample(&mut block).await.unwrap_err();
        assert!(matches!(err, HandshakeError::SpiBusy(_)));
    }

    #[test]
    fn link_ready_write_follows_retention_order() {
        let cs = SimPin::new("cs");
        let spi = SimSpi::with_chip_select(cs.clone());
        let ready = SimPin::new("link_ready");
        let link = link_with(&spi, &cs, &ready, Duration::from_millis(20));

        link.set_link_ready(true).expect("high");
        link.set_link_ready(false).expect("low");
        assert_eq!(
            ready.events(),
            vec![
                PinEvent::HoldDisable,
                PinEvent::Level(true),
                PinEvent::HoldEnable,
                PinEvent::HoldDisable,
                PinEvent::Level(false),
                PinEvent::HoldEnable,
            ]
        );
    }
}
