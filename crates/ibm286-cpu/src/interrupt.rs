//! Interrupt and exception delivery: real-mode IVT dispatch, protected-mode
//! IDT gates with inter-privilege stack switching, and `IRET`.

use crate::bus::CpuBus;
use crate::exception::Exception;
use crate::segment::{self, Role};
use crate::state::{
    gpr, CpuState, SegmentReg, ACCESS_DPL_MASK, ACCESS_DPL_SHIFT, ACCESS_PRESENT, ACCESS_S,
    ACCESS_TYPE_CODE, FLAGS_RESERVED_ON, FLAG_IF, FLAG_TF, SYSTEM_TYPE_INTERRUPT_GATE,
    SYSTEM_TYPE_TRAP_GATE,
};

/// A condition delivery itself cannot recover from: a fault while already
/// delivering a double fault. The caller (the machine driving the CPU) is
/// expected to reset the processor in response, matching a real triple
/// fault's effect.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TripleFault;

fn push16(state: &mut CpuState, bus: &mut impl CpuBus, value: u16) -> Result<(), Exception> {
    let sp = state.read_gpr16(gpr::SP).wrapping_sub(2);
    state.write_gpr16(gpr::SP, sp);
    let addr = state.segments.ss.base.wrapping_add(sp as u32);
    bus.write_u16(addr, value)
}

fn pop16(state: &mut CpuState, bus: &mut impl CpuBus) -> Result<u16, Exception> {
    let sp = state.read_gpr16(gpr::SP);
    let addr = state.segments.ss.base.wrapping_add(sp as u32);
    let value = bus.read_u16(addr)?;
    state.write_gpr16(gpr::SP, sp.wrapping_add(2));
    Ok(value)
}

fn deliver_real_mode(
    state: &mut CpuState,
    bus: &mut impl CpuBus,
    vector: u8,
) -> Result<(), Exception> {
    let entry = (vector as u32) * 4;
    let new_ip = bus.read_u16(entry)?;
    let new_cs_sel = bus.read_u16(entry + 2)?;
    push16(state, bus, state.flags)?;
    push16(state, bus, state.segments.cs.selector)?;
    push16(state, bus, state.ip)?;
    state.set_flag(FLAG_IF, false);
    state.set_flag(FLAG_TF, false);
    state.segments.cs = SegmentReg {
        selector: new_cs_sel,
        base: (new_cs_sel as u32) << 4,
        limit: 0xFFFF,
        access: ACCESS_PRESENT,
    };
    state.ip = new_ip;
    Ok(())
}

fn deliver_protected_mode(
    state: &mut CpuState,
    bus: &mut impl CpuBus,
    vector: u8,
    error_code: Option<u16>,
) -> Result<(), Exception> {
    let idtr = state.tables.idtr;
    if (vector as u32) * 8 + 7 > idtr.limit as u32 {
        return Err(Exception::GeneralProtection);
    }
    let gate_addr = idtr.base + (vector as u32) * 8;
    let offset = bus.read_u16(gate_addr)?;
    let selector = bus.read_u16(gate_addr + 2)?;
    let access = bus.read_u8(gate_addr + 5)?;

    if access & ACCESS_S != 0 {
        return Err(Exception::GeneralProtection);
    }
    let gate_type = access & 0b1111;
    if gate_type != SYSTEM_TYPE_INTERRUPT_GATE && gate_type != SYSTEM_TYPE_TRAP_GATE {
        return Err(Exception::GeneralProtection);
    }
    if access & ACCESS_PRESENT == 0 {
        return Err(Exception::SegmentNotPresent);
    }

    let cur_cpl = state.cpl();
    let (desc_addr, mut code_seg) = segment::fetch(state, bus, selector)?;
    if code_seg.access & ACCESS_S == 0 || code_seg.access & ACCESS_TYPE_CODE == 0 {
        return Err(Exception::GeneralProtection);
    }
    let target_dpl = (code_seg.access & ACCESS_DPL_MASK) >> ACCESS_DPL_SHIFT;
    if target_dpl > cur_cpl {
        // A gate can only transfer to the same or a more privileged level.
        return Err(Exception::GeneralProtection);
    }
    if code_seg.access & ACCESS_PRESENT == 0 {
        return Err(Exception::SegmentNotPresent);
    }
    if code_seg.access & crate::state::ACCESS_ACCESSED == 0 {
        code_seg.access |= crate::state::ACCESS_ACCESSED;
        bus.write_u8(desc_addr + 5, code_seg.access)?;
    }
    code_seg.selector = (selector & !0b11) | target_dpl;

    let new_cpl = target_dpl;
    if new_cpl < cur_cpl {
        // Inter-privilege transfer: switch to SP0/SS0 from the current TSS
        // (offsets 2 and 4 of the 80286 TSS layout) before pushing anything.
        if state.tables.tr.limit < 5 {
            return Err(Exception::InvalidTss);
        }
        let tss_base = state.tables.tr.base;
        let new_sp = bus.read_u16(tss_base + 2)?;
        let new_ss_sel = bus.read_u16(tss_base + 4)?;
        let new_ss = segment::load_segment(state, bus, Role::Stack, new_ss_sel, new_cpl)?;

        let old_ss_selector = state.segments.ss.selector;
        let old_sp = state.read_gpr16(gpr::SP);
        state.segments.ss = new_ss;
        state.write_gpr16(gpr::SP, new_sp);

        push16(state, bus, old_ss_selector)?;
        push16(state, bus, old_sp)?;
        push16(state, bus, state.flags)?;
        push16(state, bus, state.segments.cs.selector)?;
        push16(state, bus, state.ip)?;
        if let Some(code) = error_code {
            push16(state, bus, code)?;
        }
    } else {
        push16(state, bus, state.flags)?;
        push16(state, bus, state.segments.cs.selector)?;
        push16(state, bus, state.ip)?;
        if let Some(code) = error_code {
            push16(state, bus, code)?;
        }
    }

    if gate_type == SYSTEM_TYPE_INTERRUPT_GATE {
        state.set_flag(FLAG_IF, false);
    }
    state.set_flag(FLAG_TF, false);
    state.segments.cs = code_seg;
    state.ip = offset;
    Ok(())
}

fn deliver_once(
    state: &mut CpuState,
    bus: &mut impl CpuBus,
    vector: u8,
    error_code: Option<u16>,
) -> Result<(), Exception> {
    if state.protected() {
        deliver_protected_mode(state, bus, vector, error_code)
    } else {
        deliver_real_mode(state, bus, vector)
    }
}

/// Delivers `exception`, escalating to a double fault (#8) if delivery
/// itself faults, and reporting a triple fault if delivery of #8 faults in
/// turn. Pushes an error code of 0 for vectors that don't carry one of
/// their own (the 80286 never computes a real selector-error code; the
/// spec preserves this rather than synthesizing one).
pub fn intcall(
    state: &mut CpuState,
    bus: &mut impl CpuBus,
    exception: Exception,
) -> Result<(), TripleFault> {
    let error_code = exception.has_error_code().then_some(0u16);
    match deliver_once(state, bus, exception.vector(), error_code) {
        Ok(()) => Ok(()),
        Err(_) => match deliver_once(state, bus, Exception::DoubleFault.vector(), Some(0)) {
            Ok(()) => Ok(()),
            Err(_) => Err(TripleFault),
        },
    }
}

/// Raises an externally-vectored interrupt (from the PIC, or software
/// `INT n`) that is not itself a CPU exception, so it has no error code and
/// does not participate in double-fault escalation on its own first
/// attempt — but a fault while delivering it still escalates to #8.
pub fn deliver_interrupt(
    state: &mut CpuState,
    bus: &mut impl CpuBus,
    vector: u8,
) -> Result<(), TripleFault> {
    match deliver_once(state, bus, vector, None) {
        Ok(()) => Ok(()),
        Err(_) => match deliver_once(state, bus, Exception::DoubleFault.vector(), Some(0)) {
            Ok(()) => Ok(()),
            Err(_) => Err(TripleFault),
        },
    }
}

/// `IRET`: pops IP, CS, FLAGS, and — if returning to a less privileged
/// level — SP and SS as well.
pub fn iret(state: &mut CpuState, bus: &mut impl CpuBus) -> Result<(), Exception> {
    let new_ip = pop16(state, bus)?;
    let new_cs_sel = pop16(state, bus)?;
    let new_flags = pop16(state, bus)?;

    if !state.protected() {
        state.ip = new_ip;
        state.segments.cs = SegmentReg {
            selector: new_cs_sel,
            base: (new_cs_sel as u32) << 4,
            limit: 0xFFFF,
            access: ACCESS_PRESENT,
        };
        state.flags = new_flags | FLAGS_RESERVED_ON;
        return Ok(());
    }

    let new_rpl = (new_cs_sel & 0b11) as u8;
    let cur_cpl = state.cpl();
    if new_rpl < cur_cpl {
        return Err(Exception::GeneralProtection);
    }
    let new_cs = segment::load_segment(state, bus, Role::Code, new_cs_sel, new_rpl)?;

    if new_rpl > cur_cpl {
        let new_sp = pop16(state, bus)?;
        let new_ss_sel = pop16(state, bus)?;
        let new_ss = segment::load_segment(state, bus, Role::Stack, new_ss_sel, new_rpl)?;
        state.segments.cs = new_cs;
        state.ip = new_ip;
        state.flags = new_flags | FLAGS_RESERVED_ON;
        state.segments.ss = new_ss;
        state.write_gpr16(gpr::SP, new_sp);
    } else {
        state.segments.cs = new_cs;
        state.ip = new_ip;
        state.flags = new_flags | FLAGS_RESERVED_ON;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::FlatTestBus;
    use crate::state::{CpuMode, MSW_PE};

    #[test]
    fn real_mode_int_pushes_frame_and_clears_if_tf() {
        let mut state = CpuState::new();
        let mut bus = FlatTestBus::new(0x2_0000);
        bus.write_u16(0x10 * 4, 0x1111).unwrap();
        bus.write_u16(0x10 * 4 + 2, 0x2222).unwrap();

        state.segments.cs.selector = 0x1234;
        state.segments.cs.base = 0x12340;
        state.segments.ss.selector = 0x2000;
        state.segments.ss.base = 0x20000;
        state.write_gpr16(gpr::SP, 0xFFFE);
        state.ip = 0x5678;
        state.set_flag(FLAG_IF, true);

        deliver_interrupt(&mut state, &mut bus, 0x10).unwrap();

        assert_eq!(state.segments.cs.selector, 0x2222);
        assert_eq!(state.ip, 0x1111);
        assert_eq!(state.read_gpr16(gpr::SP), 0xFFF8);
        assert!(!state.flag(FLAG_IF));

        assert_eq!(bus.read_u16(0x20000 + 0xFFF8).unwrap(), 0x5678);
        assert_eq!(bus.read_u16(0x20000 + 0xFFFA).unwrap(), 0x1234);
    }

    #[test]
    fn real_mode_iret_restores_frame() {
        let mut state = CpuState::new();
        let mut bus = FlatTestBus::new(0x2_0000);
        state.segments.ss.base = 0x20000;
        state.write_gpr16(gpr::SP, 0xFFF8);
        bus.write_u16(0x20000 + 0xFFF8, 0x5678).unwrap();
        bus.write_u16(0x20000 + 0xFFFA, 0x1234).unwrap();
        bus.write_u16(0x20000 + 0xFFFC, 0x0202).unwrap();

        iret(&mut state, &mut bus).unwrap();

        assert_eq!(state.ip, 0x5678);
        assert_eq!(state.segments.cs.selector, 0x1234);
        assert_eq!(state.flags & 0x0202, 0x0202);
        assert_eq!(state.read_gpr16(gpr::SP), 0xFFFE);
    }

    #[test]
    fn protected_mode_same_level_int_pushes_without_stack_switch() {
        let mut state = CpuState::new();
        let mut bus = FlatTestBus::new(0x1_0000);
        state.mode = CpuMode::Protected;
        state.control.msw |= MSW_PE;
        state.tables.idtr.base = 0x1000;
        state.tables.idtr.limit = 0x7FF;

        // IDT[0x21]: interrupt gate to selector 0x08, offset 0x3000, DPL0.
        let gate_addr = 0x1000 + 0x21 * 8;
        bus.write_u16(gate_addr, 0x3000).unwrap();
        bus.write_u16(gate_addr + 2, 0x08).unwrap();
        bus.write_u8(gate_addr + 5, 0b1000_1110).unwrap();

        // GDT[1] (selector 0x08): code segment, base 0, limit 0xFFFF, DPL0.
        let gdt_base = 0x2000;
        state.tables.gdtr.base = gdt_base;
        state.tables.gdtr.limit = 0xFFFF;
        bus.write_u16(gdt_base + 8, 0xFFFF).unwrap();
        bus.write_u8(gdt_base + 8 + 5, 0b1001_1010).unwrap();

        state.segments.cs.selector = 0x08;
        state.segments.ss.selector = 0x10;
        state.segments.ss.base = 0x3_0000;
        state.write_gpr16(gpr::SP, 0x8000);
        state.ip = 0x1000;
        state.set_flag(FLAG_IF, true);

        deliver_interrupt(&mut state, &mut bus, 0x21).unwrap();

        assert_eq!(state.segments.cs.selector, 0x08);
        assert_eq!(state.ip, 0x3000);
        assert!(!state.flag(FLAG_IF));
        assert_eq!(state.read_gpr16(gpr::SP), 0x7FFA);
    }

    #[test]
    fn fault_during_delivery_escalates_to_double_fault() {
        let mut state = CpuState::new();
        let mut bus = FlatTestBus::new(0x1000);
        state.mode = CpuMode::Protected;
        state.control.msw |= MSW_PE;
        // IDTR limit too small to cover vector 6's gate at all, and also
        // too small for vector 8's gate: every delivery attempt faults.
        state.tables.idtr.base = 0;
        state.tables.idtr.limit = 0;

        let result = intcall(&mut state, &mut bus, Exception::InvalidOpcode);
        assert_eq!(result, Err(TripleFault));
    }
}
