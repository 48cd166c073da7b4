//! i8042 keyboard controller, A20 gate, and CPU reset line (component D).

use std::collections::VecDeque;

use ibm286_bus::PortHandler;

const DATA_PORT: u16 = 0x60;
const STATUS_PORT: u16 = 0x64;
const FAST_A20_PORT: u16 = 0x92;

const STATUS_OUTPUT_FULL: u8 = 0x01;
const STATUS_INPUT_FULL: u8 = 0x02;
const STATUS_AUX_DATA: u8 = 0x20;

const CMD_IRQ1_ENABLE: u8 = 0x01;
const CMD_KEYBOARD_DISABLE: u8 = 0x10;
const CMD_MOUSE_DISABLE: u8 = 0x20;
const CMD_IRQ12_ENABLE: u8 = 0x02;

const FIFO_CAPACITY: usize = 16;

/// Receiver for IRQ lines the keyboard controller can assert.
pub trait IrqSink {
    fn raise_irq(&mut self, irq: u8);
}

/// Receiver for system-level side effects of i8042 commands: the A20 gate
/// and the CPU reset line.
pub trait SystemControlSink {
    fn set_a20(&mut self, enabled: bool);
    fn request_reset(&mut self);

    /// Current A20 state, if this sink can report it (used so the output
    /// port read-back reflects external changes made through port 0x92).
    fn a20_enabled(&self) -> Option<bool> {
        None
    }
}

/// A pending command awaiting its follow-up data byte on port 0x60.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum PendingCommand {
    WriteCommandByte,
    WriteOutputPort,
    WriteMouseOutputBuffer,
    WriteToMouse,
}

/// A ring buffer of one output byte plus up to 16 queued scancodes.
struct OutputFifo {
    ring: VecDeque<(u8, bool)>,
}

impl OutputFifo {
    fn new() -> Self {
        Self {
            ring: VecDeque::with_capacity(FIFO_CAPACITY),
        }
    }

    fn push(&mut self, byte: u8, aux: bool) {
        if self.ring.len() == FIFO_CAPACITY {
            self.ring.pop_front();
        }
        self.ring.push_back((byte, aux));
    }

    fn pop(&mut self) -> Option<(u8, bool)> {
        self.ring.pop_front()
    }
}

pub struct KeyboardController {
    status: u8,
    command_byte: u8,
    output_port: u8,
    output_reg: u8,
    output_aux: bool,
    pending: Option<PendingCommand>,
    fifo: OutputFifo,
    irq_sink: Option<Box<dyn IrqSink>>,
    sys_ctrl: Option<Box<dyn SystemControlSink>>,
}

impl Default for KeyboardController {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyboardController {
    pub fn new() -> Self {
        Self {
            status: 0x14,
            command_byte: 0x45,
            output_port: 0xDD,
            output_reg: 0,
            output_aux: false,
            pending: None,
            fifo: OutputFifo::new(),
            irq_sink: None,
            sys_ctrl: None,
        }
    }

    /// Restores the power-on defaults (status 0x14, command byte 0x45,
    /// output port 0xDD) without disturbing the wired-up sinks.
    pub fn reset(&mut self) {
        self.status = 0x14;
        self.command_byte = 0x45;
        self.output_port = 0xDD;
        self.output_reg = 0;
        self.output_aux = false;
        self.pending = None;
        self.fifo = OutputFifo::new();
    }

    pub fn set_irq_sink(&mut self, sink: Box<dyn IrqSink>) {
        self.irq_sink = Some(sink);
    }

    pub fn set_system_control_sink(&mut self, sink: Box<dyn SystemControlSink>) {
        self.sys_ctrl = Some(sink);
    }

    /// Pushes one scancode byte through the 16-entry FIFO, as a keyboard
    /// (non-auxiliary) byte.
    pub fn inject_scancode(&mut self, scancode: u8) {
        self.deliver(scancode, false);
    }

    fn deliver(&mut self, byte: u8, aux: bool) {
        if self.status & STATUS_OUTPUT_FULL == 0 {
            self.promote(byte, aux);
        } else {
            self.fifo.push(byte, aux);
        }
    }

    fn promote(&mut self, byte: u8, aux: bool) {
        self.output_reg = byte;
        self.output_aux = aux;
        self.status |= STATUS_OUTPUT_FULL;
        if aux {
            self.status |= STATUS_AUX_DATA;
        } else {
            self.status &= !STATUS_AUX_DATA;
        }
        let irq = if aux { 12 } else { 1 };
        let enabled = if aux {
            self.command_byte & CMD_IRQ12_ENABLE != 0
        } else {
            self.command_byte & CMD_IRQ1_ENABLE != 0
        };
        if enabled {
            if let Some(sink) = self.irq_sink.as_mut() {
                sink.raise_irq(irq);
            }
        }
    }

    fn read_data(&mut self) -> u8 {
        let value = self.output_reg;
        match self.fifo.pop() {
            Some((next, aux)) => self.promote(next, aux),
            None => self.status &= !(STATUS_OUTPUT_FULL | STATUS_AUX_DATA),
        }
        value
    }

    fn write_data(&mut self, byte: u8) {
        self.status &= !STATUS_INPUT_FULL;
        match self.pending.take() {
            Some(PendingCommand::WriteCommandByte) => self.command_byte = byte,
            Some(PendingCommand::WriteOutputPort) => self.set_output_port(byte),
            Some(PendingCommand::WriteMouseOutputBuffer) => self.deliver(byte, true),
            Some(PendingCommand::WriteToMouse) => {
                // No mouse model is wired up; the byte is simply consumed.
            }
            None => {}
        }
    }

    fn set_output_port(&mut self, byte: u8) {
        self.output_port = byte;
        self.set_a20((byte & 0x02) != 0);
    }

    fn set_a20(&mut self, enabled: bool) {
        if let Some(sink) = self.sys_ctrl.as_mut() {
            sink.set_a20(enabled);
        }
    }

    fn write_command(&mut self, command: u8) {
        self.status |= STATUS_INPUT_FULL;
        match command {
            0x20 => {
                self.status &= !STATUS_INPUT_FULL;
                self.deliver(self.command_byte, false);
            }
            0x60 => self.pending = Some(PendingCommand::WriteCommandByte),
            0xAA => {
                self.status &= !STATUS_INPUT_FULL;
                self.deliver(0x55, false);
            }
            0xAD => {
                self.status &= !STATUS_INPUT_FULL;
                self.command_byte |= CMD_KEYBOARD_DISABLE;
            }
            0xAE => {
                self.status &= !STATUS_INPUT_FULL;
                self.command_byte &= !CMD_KEYBOARD_DISABLE;
            }
            0xA7 => {
                self.status &= !STATUS_INPUT_FULL;
                self.command_byte |= CMD_MOUSE_DISABLE;
            }
            0xA8 => {
                self.status &= !STATUS_INPUT_FULL;
                self.command_byte &= !CMD_MOUSE_DISABLE;
            }
            0xD0 => {
                self.status &= !STATUS_INPUT_FULL;
                self.deliver(self.output_port, false);
            }
            0xD1 => self.pending = Some(PendingCommand::WriteOutputPort),
            0xD3 => self.pending = Some(PendingCommand::WriteMouseOutputBuffer),
            0xD4 => self.pending = Some(PendingCommand::WriteToMouse),
            0xFE => {
                self.status &= !STATUS_INPUT_FULL;
                if let Some(sink) = self.sys_ctrl.as_mut() {
                    sink.request_reset();
                }
            }
            _ => self.status &= !STATUS_INPUT_FULL,
        }
    }

    fn read_status(&self) -> u8 {
        self.status
    }

    fn read_output_port(&self) -> u8 {
        match self.sys_ctrl.as_ref().and_then(|s| s.a20_enabled()) {
            Some(true) => self.output_port | 0x02,
            Some(false) => self.output_port & !0x02,
            None => self.output_port,
        }
    }
}

impl PortHandler for KeyboardController {
    fn read8(&mut self, port: u16) -> u8 {
        match port {
            DATA_PORT => self.read_data(),
            STATUS_PORT => self.read_status(),
            _ => 0xFF,
        }
    }

    fn write8(&mut self, port: u16, value: u8) {
        match port {
            DATA_PORT => self.write_data(value),
            STATUS_PORT => self.write_command(value),
            _ => {}
        }
    }
}

/// Port 0x92's "fast A20" shortcut: a single latched byte whose bit 1 wires
/// directly to the A20 line, independent of the i8042 output-port path.
pub struct FastA20Port {
    latch: u8,
    sys_ctrl: Option<Box<dyn SystemControlSink>>,
}

impl Default for FastA20Port {
    fn default() -> Self {
        Self {
            latch: 0,
            sys_ctrl: None,
        }
    }
}

impl FastA20Port {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_system_control_sink(&mut self, sink: Box<dyn SystemControlSink>) {
        self.sys_ctrl = Some(sink);
    }
}

impl PortHandler for FastA20Port {
    fn read8(&mut self, port: u16) -> u8 {
        if port == FAST_A20_PORT {
            match self.sys_ctrl.as_ref().and_then(|s| s.a20_enabled()) {
                Some(true) => self.latch | 0x02,
                Some(false) => self.latch & !0x02,
                None => self.latch,
            }
        } else {
            0xFF
        }
    }

    fn write8(&mut self, port: u16, value: u8) {
        if port == FAST_A20_PORT {
            self.latch = value;
            if let Some(sink) = self.sys_ctrl.as_mut() {
                sink.set_a20(value & 0x02 != 0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    #[derive(Clone)]
    struct TestSink {
        a20: Rc<Cell<bool>>,
        resets: Rc<Cell<u32>>,
        irqs: Rc<RefCell<Vec<u8>>>,
    }

    impl IrqSink for TestSink {
        fn raise_irq(&mut self, irq: u8) {
            self.irqs.borrow_mut().push(irq);
        }
    }

    impl SystemControlSink for TestSink {
        fn set_a20(&mut self, enabled: bool) {
            self.a20.set(enabled);
        }
        fn request_reset(&mut self) {
            self.resets.set(self.resets.get() + 1);
        }
        fn a20_enabled(&self) -> Option<bool> {
            Some(self.a20.get())
        }
    }

    fn wired() -> (KeyboardController, TestSink) {
        let sink = TestSink {
            a20: Rc::new(Cell::new(false)),
            resets: Rc::new(Cell::new(0)),
            irqs: Rc::new(RefCell::new(Vec::new())),
        };
        let mut kbc = KeyboardController::new();
        kbc.set_irq_sink(Box::new(sink.clone()));
        kbc.set_system_control_sink(Box::new(sink.clone()));
        (kbc, sink)
    }

    #[test]
    fn injected_scancode_raises_irq1_and_is_readable() {
        let (mut kbc, sink) = wired();
        kbc.inject_scancode(0x1E);
        assert_eq!(&*sink.irqs.borrow(), &[1]);
        assert_ne!(kbc.read8(0x64) & 0x01, 0);
        assert_eq!(kbc.read8(0x60), 0x1E);
        assert_eq!(kbc.read8(0x64) & 0x01, 0);
    }

    #[test]
    fn fifo_holds_sixteen_entries_and_drains_in_order() {
        let (mut kbc, _sink) = wired();
        for i in 0..20u8 {
            kbc.inject_scancode(i);
        }
        let mut drained = Vec::new();
        while kbc.read8(0x64) & 0x01 != 0 {
            drained.push(kbc.read8(0x60));
        }
        // First byte promoted immediately; FIFO holds at most 16 more.
        assert_eq!(drained.len(), 17);
        assert_eq!(drained[0], 0);
    }

    #[test]
    fn write_output_port_drives_a20() {
        let (mut kbc, sink) = wired();
        kbc.write8(0x64, 0xD1);
        kbc.write8(0x60, 0x03);
        assert!(sink.a20.get());
        kbc.write8(0x64, 0xD1);
        kbc.write8(0x60, 0x01);
        assert!(!sink.a20.get());
    }

    #[test]
    fn pulse_reset_command_requests_reset() {
        let (mut kbc, sink) = wired();
        kbc.write8(0x64, 0xFE);
        assert_eq!(sink.resets.get(), 1);
    }

    #[test]
    fn disable_enable_keyboard_toggles_command_byte_bit4() {
        let (mut kbc, _sink) = wired();
        kbc.write8(0x64, 0xAD);
        assert_ne!(kbc.command_byte & CMD_KEYBOARD_DISABLE, 0);
        kbc.write8(0x64, 0xAE);
        assert_eq!(kbc.command_byte & CMD_KEYBOARD_DISABLE, 0);
    }

    #[test]
    fn reset_restores_power_on_defaults() {
        let (mut kbc, _sink) = wired();
        kbc.write8(0x64, 0xAD); // disable keyboard
        kbc.inject_scancode(0x1E);
        kbc.reset();
        assert_eq!(kbc.command_byte, 0x45);
        assert_eq!(kbc.status, 0x14);
        assert_eq!(kbc.output_port, 0xDD);
    }

    #[test]
    fn fast_a20_port_readback() {
        let mut port = FastA20Port::new();
        port.write8(0x92, 0x02);
        assert_eq!(port.read8(0x92), 0x02);
    }

    #[test]
    fn fast_a20_port_drives_sink_and_reflects_it_back() {
        let sink = TestSink {
            a20: Rc::new(Cell::new(false)),
            resets: Rc::new(Cell::new(0)),
            irqs: Rc::new(RefCell::new(Vec::new())),
        };
        let mut port = FastA20Port::new();
        port.set_system_control_sink(Box::new(sink.clone()));

        port.write8(0x92, 0x02);
        assert!(sink.a20.get());
        assert_ne!(port.read8(0x92) & 0x02, 0);

        port.write8(0x92, 0x00);
        assert!(!sink.a20.get());
        assert_eq!(port.read8(0x92) & 0x02, 0);
    }
}
