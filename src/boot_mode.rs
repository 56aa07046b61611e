//! Boot-pin sequencing over the modem control lines.
//!
//! Typical Bouffalo Lab boards wire DTR to the BOOT strap and RTS to the chip
//! enable pin through the USB-UART bridge, so asserting a line pulls the pin.

use std::time::Duration;

use crate::transport::{Transport, TransportError};

pub const DEFAULT_PIN_DELAY: Duration = Duration::from_millis(50);

/// Hold BOOT while pulsing reset so the chip starts in its boot ROM.
pub fn enter_boot_rom<T: Transport>(t: &mut T, delay: Duration) -> Result<(), TransportError> {
    tracing::debug!(port = t.name(), "enter boot ROM via DTR/RTS");
    t.set_boot_lines(true, true)?;
    std::thread::sleep(delay);
    t.set_boot_lines(true, false)?;
    std::thread::sleep(delay);
    t.set_boot_lines(false, false)?;
    // Let the ROM bring up its UART before the sync burst.
    std::thread::sleep(delay);
    Ok(())
}

/// Pulse reset with BOOT released so the application starts.
pub fn reset_to_app<T: Transport>(t: &mut T, delay: Duration) -> Result<(), TransportError> {
    tracing::debug!(port = t.name(), "reset to application via RTS");
    t.set_boot_lines(false, true)?;
    std::thread::sleep(delay);
    t.set_boot_lines(false, false)?;
    Ok(())
}
