//! The master/slave 8259A PIC cascade (component C).
//!
//! Port layout: master at 0x20/0x21, slave at 0xA0/0xA1. The cascade line is
//! fixed at IRQ 2 on the master, matching the IBM PC/AT wiring.

use std::cell::RefCell;
use std::rc::Rc;

use ibm286_bus::PortHandler;

const ICW1_IS_ICW1: u8 = 0b0001_0000;
const ICW1_SINGLE: u8 = 0b0000_0010;
const ICW1_IC4_NEEDED: u8 = 0b0000_0001;

const ICW2_VECTOR_MASK: u8 = 0b1111_1000;

const OCW_IS_OCW3: u8 = 0b0000_1000;
const OCW2_EOI: u8 = 0b0010_0000;
const OCW2_SPECIFIC_EOI: u8 = 0b0110_0000;
const OCW3_RR_VALID: u8 = 0b0000_0010;
const OCW3_RR_SELECT_ISR: u8 = 0b0000_0001;

const CASCADE_IRQ: u8 = 2;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum ReadSelect {
    Irr,
    Isr,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum IcwStep {
    /// Steady state: data-port writes set the IMR.
    Normal,
    ExpectingIcw2,
    ExpectingIcw3,
    ExpectingIcw4,
}

/// A single 8259A controller, either the master or a cascaded slave.
pub struct Pic {
    imr: u8,
    irr: u8,
    isr: u8,
    read_select: ReadSelect,
    icw1: u8,
    icw3: u8,
    icw4: u8,
    icwstep: IcwStep,
    intoffset: u8,
    is_slave: bool,
}

impl Pic {
    fn new(is_slave: bool) -> Self {
        Self {
            imr: 0,
            irr: 0,
            isr: 0,
            read_select: ReadSelect::Irr,
            icw1: 0,
            icw3: 0,
            icw4: 0,
            icwstep: IcwStep::Normal,
            intoffset: 0,
            is_slave,
        }
    }

    pub fn imr(&self) -> u8 {
        self.imr
    }

    pub fn irr(&self) -> u8 {
        self.irr
    }

    pub fn isr(&self) -> u8 {
        self.isr
    }

    fn command_write(&mut self, byte: u8) {
        if byte & ICW1_IS_ICW1 != 0 {
            self.icw1 = byte;
            self.imr = 0;
            self.isr = 0;
            self.irr = 0;
            self.read_select = ReadSelect::Irr;
            self.icwstep = IcwStep::ExpectingIcw2;
            return;
        }
        if byte & OCW_IS_OCW3 == 0 {
            // OCW2 (EOI variants).
            if byte & 0xE0 == OCW2_SPECIFIC_EOI {
                let line = byte & 0x07;
                self.irr &= !(1 << line);
                self.isr &= !(1 << line);
            } else if byte & OCW2_EOI != 0 {
                if let Some(line) = self.highest_set_bit(self.isr) {
                    self.isr &= !(1 << line);
                }
            }
        } else {
            // OCW3.
            if byte & OCW3_RR_VALID != 0 {
                self.read_select = if byte & OCW3_RR_SELECT_ISR != 0 {
                    ReadSelect::Isr
                } else {
                    ReadSelect::Irr
                };
            }
        }
    }

    fn data_write(&mut self, byte: u8) {
        match self.icwstep {
            IcwStep::Normal => self.imr = byte,
            IcwStep::ExpectingIcw2 => {
                self.intoffset = byte & ICW2_VECTOR_MASK;
                self.icwstep = if self.icw1 & ICW1_SINGLE == 0 {
                    IcwStep::ExpectingIcw3
                } else if self.icw1 & ICW1_IC4_NEEDED != 0 {
                    IcwStep::ExpectingIcw4
                } else {
                    IcwStep::Normal
                };
            }
            IcwStep::ExpectingIcw3 => {
                self.icw3 = byte;
                self.icwstep = if self.icw1 & ICW1_IC4_NEEDED != 0 {
                    IcwStep::ExpectingIcw4
                } else {
                    IcwStep::Normal
                };
            }
            IcwStep::ExpectingIcw4 => {
                self.icw4 = byte;
                self.icwstep = IcwStep::Normal;
            }
        }
    }

    fn command_read(&self) -> u8 {
        match self.read_select {
            ReadSelect::Irr => self.irr,
            ReadSelect::Isr => self.isr,
        }
    }

    fn data_read(&self) -> u8 {
        self.imr
    }

    fn highest_set_bit(&self, byte: u8) -> Option<u8> {
        (0..8).find(|bit| byte & (1 << bit) != 0)
    }

    /// Sets IRQ `n`'s request bit, masked by the IMR at latch time: a
    /// masked IRQ never reaches IRR, so unmasking it later does not
    /// retroactively deliver an edge that arrived while masked.
    fn raise(&mut self, n: u8) {
        self.irr |= (1 << n) & !self.imr;
    }

    /// Highest-priority unmasked, not-already-in-service IRQ, if any.
    fn pending(&self) -> Option<u8> {
        let ready = self.irr & !self.imr & !self.isr;
        self.highest_set_bit(ready)
    }

    fn acknowledge(&mut self, n: u8) -> u8 {
        self.irr &= !(1 << n);
        self.isr |= 1 << n;
        (self.intoffset & ICW2_VECTOR_MASK) + n
    }
}

struct MasterPort {
    pair: Rc<RefCell<PicPair>>,
}

impl PortHandler for MasterPort {
    fn read8(&mut self, port: u16) -> u8 {
        let pair = self.pair.borrow();
        match port {
            0x20 => pair.master.command_read(),
            0x21 => pair.master.data_read(),
            _ => 0xFF,
        }
    }
    fn write8(&mut self, port: u16, value: u8) {
        let mut pair = self.pair.borrow_mut();
        match port {
            0x20 => pair.master.command_write(value),
            0x21 => pair.master.data_write(value),
            _ => {}
        }
    }
}

struct SlavePort {
    pair: Rc<RefCell<PicPair>>,
}

impl PortHandler for SlavePort {
    fn read8(&mut self, port: u16) -> u8 {
        let pair = self.pair.borrow();
        match port {
            0xA0 => pair.slave.command_read(),
            0xA1 => pair.slave.data_read(),
            _ => 0xFF,
        }
    }
    fn write8(&mut self, port: u16, value: u8) {
        let mut pair = self.pair.borrow_mut();
        match port {
            0xA0 => pair.slave.command_write(value),
            0xA1 => pair.slave.data_write(value),
            _ => {}
        }
    }
}

/// The cascaded master/slave pair, addressable as two independent 8259As
/// that happen to share the master's IRQ 2 line.
pub struct PicPair {
    pub master: Pic,
    pub slave: Pic,
}

impl Default for PicPair {
    fn default() -> Self {
        Self::new()
    }
}

impl PicPair {
    pub fn new() -> Self {
        Self {
            master: Pic::new(false),
            slave: Pic::new(true),
        }
    }

    /// Raises IRQ `n` (0-7) on the master, or IRQ `n` (8-15, i.e. the
    /// slave's 0-7) on the slave, cascading through IRQ 2 on the master.
    pub fn doirq(&mut self, n: u8) {
        if n < 8 {
            self.master.raise(n);
        } else {
            self.slave.raise(n - 8);
            if self.slave.pending().is_some() {
                self.master.raise(CASCADE_IRQ);
            }
        }
    }

    /// True if an unmasked interrupt is ready for delivery.
    pub fn has_pending(&self) -> bool {
        self.next_vector_peek().is_some()
    }

    fn next_vector_peek(&self) -> Option<(bool, u8)> {
        match self.master.pending() {
            Some(CASCADE_IRQ) => self.slave.pending().map(|bit| (true, bit)),
            Some(bit) => Some((false, bit)),
            None => None,
        }
    }

    /// Acknowledges the highest-priority pending interrupt, updating IRR/ISR
    /// on the responsible controller(s), and returns its vector.
    pub fn acknowledge(&mut self) -> Option<u8> {
        match self.next_vector_peek()? {
            (true, slave_bit) => {
                // The master also records IRQ 2 as in-service while the
                // slave's vector is being delivered.
                self.master.acknowledge(CASCADE_IRQ);
                Some(self.slave.acknowledge(slave_bit))
            }
            (false, bit) => Some(self.master.acknowledge(bit)),
        }
    }

    /// Wraps this pair as two port-registry handlers for 0x20/0x21 and
    /// 0xA0/0xA1, sharing the same underlying state.
    pub fn into_port_handlers(
        pair: Rc<RefCell<PicPair>>,
    ) -> (Box<dyn PortHandler>, Box<dyn PortHandler>) {
        (
            Box::new(MasterPort { pair: pair.clone() }),
            Box::new(SlavePort { pair }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn program_basic(pair: &mut PicPair) {
        // ICW1: edge-triggered, cascade, ICW4 needed.
        pair.master.command_write(0x11);
        pair.master.data_write(0x08); // ICW2: vector base 0x08
        pair.master.data_write(0x04); // ICW3: slave on IRQ2
        pair.master.data_write(0x01); // ICW4: 8086 mode

        pair.slave.command_write(0x11);
        pair.slave.data_write(0x70); // ICW2: vector base 0x70
        pair.slave.data_write(0x02); // ICW3: cascade identity
        pair.slave.data_write(0x01);

        pair.master.data_write(0x00); // IMR = 0, all unmasked
        pair.slave.data_write(0x00);
    }

    #[test]
    fn programming_then_unmasking_delivers_in_priority_order() {
        let mut pair = PicPair::new();
        program_basic(&mut pair);

        pair.doirq(3);
        pair.doirq(1);

        assert!(pair.has_pending());
        assert_eq!(pair.acknowledge(), Some(0x08 + 1));
        assert_eq!(pair.acknowledge(), Some(0x08 + 3));
        assert_eq!(pair.acknowledge(), None);
    }

    #[test]
    fn non_specific_eoi_clears_only_highest_isr_bit() {
        let mut pair = PicPair::new();
        program_basic(&mut pair);

        pair.doirq(1);
        pair.doirq(5);
        pair.acknowledge();
        pair.acknowledge();
        assert_eq!(pair.master.isr, 0b0010_0010);

        pair.master.command_write(0x20); // non-specific EOI
        assert_eq!(pair.master.isr, 0b0010_0000);
    }

    #[test]
    fn slave_irq_cascades_through_master_irq2() {
        let mut pair = PicPair::new();
        program_basic(&mut pair);

        pair.doirq(8 + 3); // slave IRQ 3
        assert_eq!(pair.master.irr & (1 << CASCADE_IRQ), 1 << CASCADE_IRQ);
        assert_eq!(pair.acknowledge(), Some(0x70 + 3));
    }

    #[test]
    fn masked_irq_does_not_deliver() {
        let mut pair = PicPair::new();
        program_basic(&mut pair);
        pair.master.data_write(0xFF & !(1 << 2)); // mask everything but cascade
        pair.doirq(1);
        assert!(!pair.has_pending());
    }

    #[test]
    fn masked_irq_is_not_latched_for_later_unmasking() {
        let mut pair = PicPair::new();
        program_basic(&mut pair);
        pair.master.data_write(0xFF & !(1 << 2)); // mask everything but cascade
        pair.doirq(1);
        pair.master.data_write(0x00); // unmask everything
        assert!(!pair.has_pending());
    }

    #[test]
    fn specific_eoi_clears_irr_and_isr_for_the_named_line() {
        let mut pair = PicPair::new();
        program_basic(&mut pair);

        pair.doirq(1);
        pair.doirq(3);
        assert_eq!(pair.master.irr & (1 << 3), 1 << 3);
        pair.acknowledge(); // services IRQ1, leaves IRQ3 pending in IRR

        pair.master.command_write(0x60 | 3); // specific EOI for IRQ3
        assert_eq!(pair.master.irr & (1 << 3), 0);
        assert_eq!(pair.master.isr & (1 << 3), 0);
    }

    #[test]
    fn set_priority_ocw2_is_not_mistaken_for_specific_eoi() {
        let mut pair = PicPair::new();
        program_basic(&mut pair);

        pair.doirq(1);
        pair.acknowledge();
        assert_eq!(pair.master.isr & (1 << 1), 1 << 1);

        pair.master.command_write(0x40); // set-priority OCW2, not an EOI
        assert_eq!(pair.master.isr & (1 << 1), 1 << 1);
    }
}
