//! The 256-entry host-interrupt-callback table: installable hooks that
//! preempt the normal IVT/IDT dispatch for a software `INT n`, used by a
//! BIOS-disk backend or other host-side service routine that wants to
//! answer a call without the guest ever seeing a real handler.
//!
//! Only explicit `INT n` (opcode 0xCD) consults this table — CPU-raised
//! faults always go through the normal gate.

use crate::bus::CpuBus;
use crate::state::CpuState;

/// Returns `true` if the callback fully handled the interrupt (the guest
/// should resume at the instruction after `INT n` without any IVT/IDT
/// dispatch), or `false` to fall through to normal delivery.
pub type HostInterrupt = Box<dyn FnMut(&mut CpuState, &mut dyn CpuBus) -> bool>;

pub struct HostInterruptTable {
    handlers: Vec<Option<HostInterrupt>>,
}

impl Default for HostInterruptTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HostInterruptTable {
    pub fn new() -> Self {
        let mut handlers = Vec::with_capacity(256);
        handlers.resize_with(256, || None);
        Self { handlers }
    }

    pub fn install(&mut self, vector: u8, handler: HostInterrupt) {
        self.handlers[vector as usize] = Some(handler);
    }

    pub fn uninstall(&mut self, vector: u8) {
        self.handlers[vector as usize] = None;
    }

    /// Runs the installed callback for `vector`, if any, against a
    /// type-erased bus. Returns whether it claimed the interrupt.
    pub fn dispatch(&mut self, vector: u8, state: &mut CpuState, bus: &mut dyn CpuBus) -> bool {
        match &mut self.handlers[vector as usize] {
            Some(handler) => handler(state, bus),
            None => false,
        }
    }

    pub fn is_installed(&self, vector: u8) -> bool {
        self.handlers[vector as usize].is_some()
    }
}

/// Installs the two INT 15h functions the original BIOS-disk backend
/// short-circuits at the CPU level: AH=0x87 (block move) reports success
/// without touching memory (the real copy is the host backend's job), and
/// AH=0x88 reports a fixed 15 MiB of extended memory in AX.
pub fn install_int15_stubs(table: &mut HostInterruptTable) {
    table.install(
        0x15,
        Box::new(|state: &mut CpuState, _bus: &mut dyn CpuBus| -> bool {
            let ah = state.read_gpr8(4); // AH half of AX
            match ah {
                0x87 => {
                    state.write_gpr8(4, 0);
                    state.set_flag(crate::state::FLAG_CF, false);
                    true
                }
                0x88 => {
                    state.write_gpr16(crate::state::gpr::AX, 15 * 1024);
                    state.set_flag(crate::state::FLAG_CF, false);
                    true
                }
                _ => false,
            }
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::FlatTestBus;
    use crate::exec::Cpu;
    use crate::state::{gpr, FLAG_CF};

    #[test]
    fn int15_88_reports_fixed_extended_memory_without_delivering_the_vector() {
        let mut cpu = Cpu::new();
        install_int15_stubs(&mut cpu.host_interrupts);
        let mut bus = FlatTestBus::new(0x1_0000);
        cpu.state.segments.cs.base = 0;
        cpu.state.ip = 0;
        cpu.state.write_gpr8(4, 0x88); // AH
        // INT 15h, then a marker instruction right after it.
        bus.load(0, &[0xCD, 0x15, 0x90]); // NOP after

        cpu.run_instruction(&mut bus).unwrap();

        assert_eq!(cpu.state.read_gpr16(gpr::AX), 15 * 1024);
        assert!(!cpu.state.flag(FLAG_CF));
        // Control returns right after the INT, not through the IVT.
        assert_eq!(cpu.state.ip, 2);
    }

    #[test]
    fn uninstalled_vector_falls_through_to_normal_delivery() {
        let mut cpu = Cpu::new();
        install_int15_stubs(&mut cpu.host_interrupts);
        let mut bus = FlatTestBus::new(0x2_0000);
        cpu.state.segments.cs.selector = 0x1000;
        cpu.state.segments.cs.base = 0x10000;
        cpu.state.ip = 0;
        cpu.state.segments.ss.base = 0x1_0000;
        cpu.state.write_gpr16(gpr::SP, 0xFFFE);
        cpu.state.write_gpr8(4, 0x01); // an AH function with no stub
        bus.write_u16(0x15 * 4, 0x4444).unwrap();
        bus.write_u16(0x15 * 4 + 2, 0x5555).unwrap();
        bus.load(0x10000, &[0xCD, 0x15]);

        cpu.run_instruction(&mut bus).unwrap();

        assert_eq!(cpu.state.segments.cs.selector, 0x5555);
        assert_eq!(cpu.state.ip, 0x4444);
    }
}
