//! CPU-raised exceptions, named after the interrupt vector each one
//! delivers through rather than a generic error code.

/// A condition that aborts the current instruction and redirects control
/// through the corresponding interrupt vector. `MemoryFault` is not a real
/// 80286 exception; it is how a bus implementation reports an address that
/// fell outside its backing store, and the CPU turns it into a #GP(0) at
/// the delivery site.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Exception {
    /// INT 0: DIV/IDIV by zero, or a quotient that overflows its destination.
    DivideError,
    /// INT 1: trap-flag single-step, raised after the instruction retires.
    Debug,
    /// INT 2: non-maskable interrupt (not raised by the interpreter itself).
    Nmi,
    /// INT 3: breakpoint (`INT3` opcode).
    Breakpoint,
    /// INT 4: `INTO` when OF is set.
    Overflow,
    /// INT 5: `BOUND` when the index is outside `[lower, upper]`.
    BoundRange,
    /// INT 6: undefined opcode, or a privileged form used outside CPL0.
    InvalidOpcode,
    /// INT 7: an ESC opcode executed while MSW.TS is set.
    DeviceNotAvailable,
    /// INT 8: a fault raised while already delivering another fault.
    DoubleFault,
    /// INT 10: a task-state or descriptor-table reference failed validation.
    InvalidTss,
    /// INT 11: a present-bit-clear segment or gate was referenced.
    SegmentNotPresent,
    /// INT 12: a stack-segment limit or present-bit check failed.
    StackFault,
    /// INT 13: the catch-all protection fault (bad selector, privilege
    /// violation, limit violation outside the stack, bad descriptor type).
    GeneralProtection,
    /// Not a real 80286 vector: a bus access landed outside addressable
    /// memory. The interpreter maps this to #GP(0) when it reaches a fault
    /// boundary.
    MemoryFault,
    /// `INT n`: a software-invoked interrupt. Not a fault — delivery never
    /// restarts this instruction — but it goes through the same gate
    /// lookup and double-fault escalation as a real exception, so it rides
    /// the same channel instead of a separate one.
    SoftwareInterrupt(u8),
}

impl Exception {
    /// The interrupt vector this exception is delivered through. All of
    /// these are faults on the 80286: they restart the faulting
    /// instruction's CS:IP rather than pointing past it.
    pub fn vector(self) -> u8 {
        match self {
            Exception::DivideError => 0,
            Exception::Debug => 1,
            Exception::Nmi => 2,
            Exception::Breakpoint => 3,
            Exception::Overflow => 4,
            Exception::BoundRange => 5,
            Exception::InvalidOpcode => 6,
            Exception::DeviceNotAvailable => 7,
            Exception::DoubleFault => 8,
            Exception::InvalidTss => 10,
            Exception::SegmentNotPresent => 11,
            Exception::StackFault => 12,
            Exception::GeneralProtection | Exception::MemoryFault => 13,
            Exception::SoftwareInterrupt(vector) => vector,
        }
    }

    /// Whether the 80286 pushes a (zero, in our case) error code for this
    /// vector. Vectors 8 and 10-13 push an error code; the rest don't.
    pub fn has_error_code(self) -> bool {
        matches!(
            self,
            Exception::DoubleFault
                | Exception::InvalidTss
                | Exception::SegmentNotPresent
                | Exception::StackFault
                | Exception::GeneralProtection
                | Exception::MemoryFault
        )
    }

    pub fn gp(selector_error: u16) -> (Exception, u16) {
        (Exception::GeneralProtection, selector_error)
    }
}
