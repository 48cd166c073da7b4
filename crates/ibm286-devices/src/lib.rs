//! Keyboard controller (component D) and CMOS/RTC (component E).

mod cmos;
mod keyboard;

pub use cmos::Cmos;
pub use keyboard::{FastA20Port, IrqSink, KeyboardController, SystemControlSink};
