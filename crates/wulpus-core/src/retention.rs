//! Retention discipline for held output pins.
//!
//! A held pin must have retention disabled before its level changes and
//! re-enabled afterwards, otherwise it can glitch while the chip enters or
//! leaves light sleep. [`HoldReleased`] is the only way the bridge touches a
//! [`RetainedOutput`]: creating it disables retention, dropping it restores
//! retention.

use tracing::warn;

use crate::error::HalError;
use crate::hal::RetainedOutput;

pub struct HoldReleased<'a, P: RetainedOutput + ?Sized> {
    pin: &'a mut P,
}

impl<'a, P: RetainedOutput + ?Sized> HoldReleased<'a, P> {
    pub fn new(pin: &'a mut P) -> Result<Self, HalError> {
        pin.hold_disable()?;
        Ok(Self { pin })
    }

    pub fn set_level(&mut self, high: bool) -> Result<(), HalError> {
        self.pin.set_level(high)
    }
}

impl<P: RetainedOutput + ?Sized> Drop for HoldReleased<'_, P> {
    fn drop(&mut self) {
        if let Err(err) = self.pin.hold_enable() {
            warn!(error = %err, "failed to re-enable pin retention");
        }
    }
}

/// Drives a retained pin to `high`.
pub fn write_retained<P: RetainedOutput + ?Sized>(pin: &mut P, high: bool) -> Result<(), HalError> {
    let mut released = HoldReleased::new(pin)?;
    released.set_level(high)
}
