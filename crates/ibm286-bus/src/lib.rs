//! Physical memory and port I/O routing for the IBM-PC-compatible platform
//! (components A and B): the leaves every other subsystem is built on.

mod memory;
mod ports;

pub use memory::Memory;
pub use ports::{PortHandler, PortRegistry};
