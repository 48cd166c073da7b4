//! The 80286 interpreter: architectural state, the `CpuBus` seam it
//! executes against, and the fetch-decode-execute loop with its integrated
//! x87 coprocessor.

pub mod alu;
pub mod bus;
pub mod decode;
pub mod exception;
pub mod exec;
pub mod host;
pub mod interrupt;
pub mod segment;
pub mod state;

pub use bus::CpuBus;
pub use exception::Exception;
pub use exec::{Cpu, StepExit};
pub use host::{install_int15_stubs, HostInterrupt, HostInterruptTable};
pub use interrupt::TripleFault;
pub use state::{CpuMode, CpuState};

use state::FLAG_TF;

/// What happened when `Cpu::run_instruction` stepped one instruction and
/// settled any fault or pending trap it raised.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// The instruction retired normally.
    Continue,
    /// As `Continue`, but the next instruction must not recognize a
    /// hardware interrupt (the one-instruction shadow after
    /// `CLI`/`STI`/`MOV SS,...`/`POP SS`).
    ContinueInhibitInterrupts,
    /// `HLT` retired; the CPU stays halted until `unhalt` is called.
    Halted,
}

impl Cpu {
    /// Executes one instruction, delivering any exception it raises (or the
    /// pending single-step trap from the previous instruction) through the
    /// normal interrupt-gate machinery rather than surfacing it to the
    /// caller. Only a double fault that itself faults during delivery
    /// escalates out, as `TripleFault` — real hardware resets in response,
    /// and callers are expected to do the same.
    pub fn run_instruction(&mut self, bus: &mut impl CpuBus) -> Result<RunOutcome, TripleFault> {
        if self.state.halted {
            return Ok(RunOutcome::Halted);
        }

        let trap_pending = self.state.trap_pending;
        self.state.trap_pending = false;

        match exec::step(&mut self.state, &mut self.fpu, bus) {
            Ok(StepExit::Continue) => {
                self.state.trap_pending = self.state.flag(FLAG_TF);
                if trap_pending {
                    interrupt::intcall(&mut self.state, bus, Exception::Debug)?;
                }
                Ok(RunOutcome::Continue)
            }
            Ok(StepExit::Branch) => {
                self.state.trap_pending = self.state.flag(FLAG_TF);
                if trap_pending {
                    interrupt::intcall(&mut self.state, bus, Exception::Debug)?;
                }
                Ok(RunOutcome::Continue)
            }
            Ok(StepExit::ContinueInhibitInterrupts) => {
                // CLI/STI/MOV SS/POP SS suppress only hardware interrupt
                // recognition, not the trap flag itself.
                self.state.trap_pending = self.state.flag(FLAG_TF);
                if trap_pending {
                    interrupt::intcall(&mut self.state, bus, Exception::Debug)?;
                }
                Ok(RunOutcome::ContinueInhibitInterrupts)
            }
            Ok(StepExit::Halted) => Ok(RunOutcome::Halted),
            Err(Exception::SoftwareInterrupt(vector))
                if self.host_interrupts.is_installed(vector) =>
            {
                if !self.host_interrupts.dispatch(vector, &mut self.state, bus) {
                    interrupt::intcall(
                        &mut self.state,
                        bus,
                        Exception::SoftwareInterrupt(vector),
                    )?;
                }
                self.state.trap_pending = self.state.flag(FLAG_TF);
                if trap_pending {
                    interrupt::intcall(&mut self.state, bus, Exception::Debug)?;
                }
                Ok(RunOutcome::Continue)
            }
            Err(exception) => {
                interrupt::intcall(&mut self.state, bus, exception)?;
                Ok(RunOutcome::Continue)
            }
        }
    }

    /// Delivers a maskable external interrupt (typically from the PIC),
    /// escalating to a triple fault if delivery itself faults repeatedly.
    /// Callers must check `IF` themselves before calling this — the CPU
    /// never polls a PIC on its own.
    pub fn deliver_external_interrupt(
        &mut self,
        bus: &mut impl CpuBus,
        vector: u8,
    ) -> Result<(), TripleFault> {
        self.state.halted = false;
        interrupt::deliver_interrupt(&mut self.state, bus, vector)
    }

    /// Wakes a halted CPU without delivering an interrupt, for the `RESET`
    /// line and NMI (which the interpreter doesn't model as a vectored
    /// `Exception` since it isn't raised internally).
    pub fn unhalt(&mut self) {
        self.state.halted = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::FlatTestBus;
    use crate::state::{gpr, FLAG_IF};

    #[test]
    fn halted_cpu_reports_halted_until_unhalted() {
        let mut cpu = Cpu::new();
        let mut bus = FlatTestBus::new(0x1_0000);
        cpu.state.segments.cs.base = 0;
        cpu.state.ip = 0;
        bus.load(0, &[0xF4]); // HLT
        assert_eq!(
            cpu.run_instruction(&mut bus).unwrap(),
            RunOutcome::Continue
        );
        assert_eq!(cpu.run_instruction(&mut bus).unwrap(), RunOutcome::Halted);
        cpu.unhalt();
        assert!(!cpu.state.halted);
    }

    #[test]
    fn divide_by_zero_is_delivered_as_int0_in_real_mode() {
        let mut cpu = Cpu::new();
        let mut bus = FlatTestBus::new(0x2_0000);
        cpu.state.segments.cs.selector = 0x1000;
        cpu.state.segments.cs.base = 0x10000;
        cpu.state.ip = 0;
        cpu.state.segments.ss.base = 0x1_0000;
        cpu.state.write_gpr16(gpr::SP, 0xFFFE);
        bus.write_u16(0, 0x2222).unwrap();
        bus.write_u16(2, 0x3333).unwrap();
        // DIV CL with AX=1, CL=0.
        bus.load(0x10000, &[0xF6, 0xF1]);
        cpu.state.write_gpr16(gpr::AX, 1);
        cpu.state.write_gpr8(1, 0);

        cpu.run_instruction(&mut bus).unwrap();

        assert_eq!(cpu.state.segments.cs.selector, 0x3333);
        assert_eq!(cpu.state.ip, 0x2222);
    }

    #[test]
    fn trap_flag_delivers_int1_after_the_next_instruction_retires() {
        let mut cpu = Cpu::new();
        let mut bus = FlatTestBus::new(0x2_0000);
        cpu.state.segments.cs.selector = 0x1000;
        cpu.state.segments.cs.base = 0x10000;
        cpu.state.ip = 0;
        cpu.state.segments.ss.base = 0x1_0000;
        cpu.state.write_gpr16(gpr::SP, 0xFFFE);
        cpu.state.set_flag(FLAG_IF, true);
        cpu.state.set_flag(crate::state::FLAG_TF, true);
        bus.write_u16(1 * 4, 0x4444).unwrap();
        bus.write_u16(1 * 4 + 2, 0x5555).unwrap();
        // Two NOPs: the first retires with TF already set, queuing the trap
        // that fires once the second instruction has also retired.
        bus.load(0x10000, &[0x90, 0x90]);

        cpu.run_instruction(&mut bus).unwrap(); // first NOP, arms trap_pending
        assert!(cpu.state.trap_pending);
        cpu.run_instruction(&mut bus).unwrap(); // second NOP, then INT1 fires

        assert_eq!(cpu.state.segments.cs.selector, 0x5555);
        assert_eq!(cpu.state.ip, 0x4444);
    }
}
