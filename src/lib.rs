//! Umbrella crate re-exporting the machine so a single dependency pulls in
//! the whole 80286-class core: CPU, FPU, PIC cascade, keyboard controller,
//! and CMOS.

pub use ibm286_machine::*;

pub use ibm286_cpu::{self as cpu, Cpu, CpuBus, Exception, RunOutcome, TripleFault};
pub use ibm286_devices as devices;
pub use ibm286_fpu::{self as fpu, Fpu};
pub use ibm286_pic::{self as pic, PicPair};
