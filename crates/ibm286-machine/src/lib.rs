//! Wires the CPU core (components F/G) to physical memory and port I/O
//! (A/B), the PIC cascade (C), the keyboard controller (D), and CMOS (E)
//! into one runnable machine, and drives the cooperative execution loop.

use std::cell::{Cell, Ref, RefCell, RefMut};
use std::rc::Rc;

use ibm286_bus::{Memory, PortHandler, PortRegistry};
use ibm286_cpu::state::{CpuMode, FLAG_IF};
use ibm286_cpu::{install_int15_stubs, Cpu, CpuBus, Exception, RunOutcome, TripleFault};
use ibm286_devices::{Cmos, FastA20Port, IrqSink, KeyboardController, SystemControlSink};
use ibm286_pic::PicPair;

/// Physical memory plus port I/O: the concrete `CpuBus` the interpreter
/// executes against. A20 masking happens here rather than inside `Memory`
/// itself, since whether it applies depends on the CPU's current mode
/// (real only), which only the driver loop tracks.
pub struct MachineBus {
    pub memory: Memory,
    pub ports: PortRegistry,
    a20: Rc<Cell<bool>>,
    real_mode: bool,
}

impl MachineBus {
    fn translate(&self, addr: u32) -> u32 {
        if self.real_mode && !self.a20.get() {
            addr & 0x000F_FFFF
        } else {
            addr
        }
    }
}

impl CpuBus for MachineBus {
    fn read_u8(&mut self, addr: u32) -> Result<u8, Exception> {
        Ok(self.memory.read_u8(self.translate(addr)))
    }

    fn write_u8(&mut self, addr: u32, value: u8) -> Result<(), Exception> {
        self.memory.write_u8(self.translate(addr), value);
        Ok(())
    }

    fn in8(&mut self, port: u16) -> u8 {
        self.ports.read8(port)
    }

    fn out8(&mut self, port: u16, value: u8) {
        self.ports.write8(port, value);
    }

    fn in16(&mut self, port: u16) -> u16 {
        self.ports.read16(port)
    }

    fn out16(&mut self, port: u16, value: u16) {
        self.ports.write16(port, value);
    }
}

/// Forwards a shared device's port accesses through the registry without
/// giving the registry ownership, so the machine can keep its own handle
/// for direct access (scancode injection, CMOS inspection).
struct Shared<H>(Rc<RefCell<H>>);

impl<H: PortHandler> PortHandler for Shared<H> {
    fn read8(&mut self, port: u16) -> u8 {
        self.0.borrow_mut().read8(port)
    }
    fn write8(&mut self, port: u16, value: u8) {
        self.0.borrow_mut().write8(port, value)
    }
    fn read16(&mut self, port: u16) -> u16 {
        self.0.borrow_mut().read16(port)
    }
    fn write16(&mut self, port: u16, value: u16) {
        self.0.borrow_mut().write16(port, value)
    }
}

struct PicIrqSink {
    pic: Rc<RefCell<PicPair>>,
}

impl IrqSink for PicIrqSink {
    fn raise_irq(&mut self, irq: u8) {
        self.pic.borrow_mut().doirq(irq);
    }
}

/// Bridges the i8042's and port 0x92's A20/reset side effects back into
/// the machine, shared by both so either path can flip the same line.
#[derive(Clone)]
struct SystemControl {
    a20: Rc<Cell<bool>>,
    reset_requested: Rc<Cell<bool>>,
}

impl SystemControlSink for SystemControl {
    fn set_a20(&mut self, enabled: bool) {
        self.a20.set(enabled);
    }

    fn request_reset(&mut self) {
        self.reset_requested.set(true);
    }

    fn a20_enabled(&self) -> Option<bool> {
        Some(self.a20.get())
    }
}

/// A complete machine: the CPU core, its bus, and the peripherals wired
/// onto it. Construct with the desired RAM size, load firmware/an image
/// with `load_image`, then drive it with `step`/`run`.
pub struct Machine {
    pub cpu: Cpu,
    pub bus: MachineBus,
    pic: Rc<RefCell<PicPair>>,
    keyboard: Rc<RefCell<KeyboardController>>,
    cmos: Rc<RefCell<Cmos>>,
    a20: Rc<Cell<bool>>,
    reset_requested: Rc<Cell<bool>>,
}

impl Machine {
    pub fn new(memory_size: usize) -> Self {
        let a20 = Rc::new(Cell::new(false));
        let reset_requested = Rc::new(Cell::new(false));
        let pic = Rc::new(RefCell::new(PicPair::new()));

        let keyboard = Rc::new(RefCell::new(KeyboardController::new()));
        keyboard
            .borrow_mut()
            .set_irq_sink(Box::new(PicIrqSink { pic: pic.clone() }));
        keyboard
            .borrow_mut()
            .set_system_control_sink(Box::new(SystemControl {
                a20: a20.clone(),
                reset_requested: reset_requested.clone(),
            }));

        let mut fast_a20 = FastA20Port::new();
        fast_a20.set_system_control_sink(Box::new(SystemControl {
            a20: a20.clone(),
            reset_requested: reset_requested.clone(),
        }));

        let cmos = Rc::new(RefCell::new(Cmos::new()));

        let mut ports = PortRegistry::new();
        let (master, slave) = PicPair::into_port_handlers(pic.clone());
        ports.register(0x20, 2, master);
        ports.register(0xA0, 2, slave);
        ports.register(0x60, 1, Box::new(Shared(keyboard.clone())));
        ports.register(0x64, 1, Box::new(Shared(keyboard.clone())));
        ports.register(0x70, 2, Box::new(Shared(cmos.clone())));
        ports.register(0x92, 1, Box::new(fast_a20));

        let bus = MachineBus {
            memory: Memory::new(memory_size),
            ports,
            a20: a20.clone(),
            real_mode: true,
        };

        let mut cpu = Cpu::new();
        install_int15_stubs(&mut cpu.host_interrupts);

        Self {
            cpu,
            bus,
            pic,
            keyboard,
            cmos,
            a20,
            reset_requested,
        }
    }

    /// Loads a firmware or disk image at a fixed physical address, for
    /// staging ROM/BIOS content before the first `step`.
    pub fn load_image(&mut self, addr: u32, data: &[u8]) {
        self.bus.memory.load(addr, data);
    }

    pub fn inject_scancode(&mut self, scancode: u8) {
        self.keyboard.borrow_mut().inject_scancode(scancode);
    }

    pub fn cmos(&self) -> Ref<'_, Cmos> {
        self.cmos.borrow()
    }

    pub fn cmos_mut(&self) -> RefMut<'_, Cmos> {
        self.cmos.borrow_mut()
    }

    pub fn a20_enabled(&self) -> bool {
        self.a20.get()
    }

    /// `cpu_reset`: rebuilds the register file and descriptor caches
    /// (CS:IP = F000:FFF0, MSW = 0xFFF0, GDTR.limit = 0xFFFF, IDTR.limit =
    /// 0x03FF), disables A20, and restores the keyboard controller's
    /// power-on defaults. CMOS survives reset, matching its battery-backed
    /// hardware counterpart.
    pub fn reset(&mut self) {
        self.cpu.state.reset();
        self.a20.set(false);
        self.reset_requested.set(false);
        self.keyboard.borrow_mut().reset();
    }

    /// Executes one instruction, then services the PIC and the i8042
    /// reset line at the instruction boundary, matching the IRQ
    /// observability rule: an interrupt asserted during instruction i
    /// becomes visible only between i and i+1, and only when IF is set
    /// and the just-retired instruction didn't arm a one-instruction
    /// interrupt shadow.
    pub fn step(&mut self) -> Result<(), TripleFault> {
        self.bus.real_mode = self.cpu.state.mode == CpuMode::Real;
        let outcome = self.cpu.run_instruction(&mut self.bus)?;

        if self.reset_requested.get() {
            self.reset();
            return Ok(());
        }

        let interruptible = !matches!(outcome, RunOutcome::ContinueInhibitInterrupts);
        if interruptible && self.cpu.state.flag(FLAG_IF) && self.pic.borrow().has_pending() {
            if let Some(vector) = self.pic.borrow_mut().acknowledge() {
                self.cpu.deliver_external_interrupt(&mut self.bus, vector)?;
            }
        }
        Ok(())
    }

    /// Runs `count` instructions, stopping early (returning `Err`) on a
    /// triple fault. Callers that want to react to one (e.g. reset and
    /// keep going) should call `step` in their own loop instead.
    pub fn run(&mut self, count: usize) -> Result<(), TripleFault> {
        for _ in 0..count {
            self.step()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ivt_entry(machine: &mut Machine, vector: u8, cs: u16, ip: u16) {
        let addr = vector as u32 * 4;
        machine.bus.memory.write_u16(addr, ip);
        machine.bus.memory.write_u16(addr + 2, cs);
    }

    #[test]
    fn reset_vector_matches_power_on_state() {
        let machine = Machine::new(0x10_0000);
        assert_eq!(machine.cpu.state.segments.cs.selector, 0xF000);
        assert_eq!(machine.cpu.state.ip, 0xFFF0);
        assert_eq!(machine.cpu.state.control.msw, 0xFFF0);
        assert_eq!(machine.cpu.state.tables.idtr.limit, 0x03FF);
        assert!(!machine.a20_enabled());
    }

    #[test]
    fn fast_a20_port_disables_real_mode_wraparound() {
        let mut machine = Machine::new(0x11_0000);
        machine.bus.memory.write_u8(0x10_0000, 0x5A);
        assert_eq!(machine.bus.read_u8(0x00_0000).unwrap(), 0x5A);

        machine.bus.out8(0x92, 0x02); // drive A20 high through the shortcut
        assert!(machine.a20_enabled());
        machine.bus.memory.write_u8(0x00_0000, 0x00);
        assert_eq!(machine.bus.read_u8(0x10_0000).unwrap(), 0x5A);
    }

    #[test]
    fn reset_command_byte_reinitializes_cpu_and_keyboard() {
        let mut machine = Machine::new(0x10_0000);
        machine.cpu.state.ip = 0x1234;
        machine.inject_scancode(0x1E);
        machine.keyboard.borrow_mut().write8(0x64, 0xAD);

        machine.reset();

        assert_eq!(machine.cpu.state.ip, 0xFFF0);
        assert!(!machine.a20_enabled());
    }

    #[test]
    fn pic_irq_wakes_halted_cpu_through_the_keyboard_path() {
        let mut machine = Machine::new(0x10_0000);
        machine.cpu.state.segments.cs.selector = 0;
        machine.cpu.state.segments.cs.base = 0;
        machine.cpu.state.ip = 0;
        machine.cpu.state.segments.ss.base = 0x2_0000;
        machine.cpu.state.write_gpr16(ibm286_cpu::state::gpr::SP, 0xFFFE);
        machine.cpu.state.set_flag(FLAG_IF, true);
        ivt_entry(&mut machine, 0x09, 0x4000, 0x0000); // base 0x08 + IRQ1

        // Program the PIC: master vector base 0x08, IRQ1 unmasked.
        machine.bus.ports.write8(0x20, 0x11);
        machine.bus.ports.write8(0x21, 0x08);
        machine.bus.ports.write8(0x21, 0x04);
        machine.bus.ports.write8(0x21, 0x01);
        machine.bus.ports.write8(0x21, 0x00);

        machine.bus.memory.write_bytes(0, &[0xF4]); // HLT
        machine.step().unwrap();
        assert!(machine.cpu.state.halted);

        machine.inject_scancode(0x1E); // raises IRQ1
        machine.step().unwrap();

        assert!(!machine.cpu.state.halted);
        assert_eq!(machine.cpu.state.segments.cs.selector, 0x4000);
        assert_eq!(machine.cpu.state.ip, 0x0000);
    }
}
