//! Descriptor-cache loading: the validation a selector goes through before
//! its base/limit/access get latched into a segment register.

use crate::bus::CpuBus;
use crate::exception::Exception;
use crate::state::{
    CpuState, SegmentReg, TableReg, ACCESS_ACCESSED, ACCESS_PRESENT, ACCESS_S, ACCESS_TYPE_CODE,
    ACCESS_TYPE_CONFORMING, ACCESS_TYPE_WRITABLE,
};

/// What a selector is being loaded into, since the validation rules differ
/// for code, stack, and plain data/extra segments.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Code,
    Stack,
    Data,
}

fn raw_descriptor(
    state: &CpuState,
    bus: &mut impl CpuBus,
    selector: u16,
) -> Result<(u32, u64), Exception> {
    let table = if selector & 0b100 != 0 {
        TableReg {
            base: state.tables.ldtr.base,
            limit: state.tables.ldtr.limit,
        }
    } else {
        state.tables.gdtr
    };
    let index = (selector & !0b111) as u32;
    if index + 7 > table.limit as u32 {
        return Err(Exception::GeneralProtection);
    }
    let addr = table.base.wrapping_add(index);
    let lo = bus.read_u32(addr)?;
    let hi = bus.read_u32(addr + 4)?;
    Ok((addr, (lo as u64) | ((hi as u64) << 32)))
}

fn decode_descriptor(raw: u64) -> SegmentReg {
    let limit_low = (raw & 0xFFFF) as u32;
    let base_low = ((raw >> 16) & 0xFFFFFF) as u32;
    let access = ((raw >> 40) & 0xFF) as u8;
    SegmentReg {
        selector: 0,
        base: base_low,
        limit: limit_low as u16,
        access,
    }
}

/// Fetches and decodes a descriptor without any role-specific validation,
/// for callers (interrupt-gate dispatch) that apply their own rules.
pub(crate) fn fetch(
    state: &CpuState,
    bus: &mut impl CpuBus,
    selector: u16,
) -> Result<(u32, SegmentReg), Exception> {
    let (addr, raw) = raw_descriptor(state, bus, selector)?;
    let mut seg = decode_descriptor(raw);
    seg.selector = selector;
    Ok((addr, seg))
}

/// Loads `selector` into a segment register per the 80286's seven-step
/// descriptor validation:
///
/// 1. NULL selector is only legal for DS/ES, and only outside the table
///    index itself; loading it elsewhere is a #GP.
/// 2. The selector's index must lie within its descriptor table's limit.
/// 3. The descriptor's type must match the role being loaded (code segment
///    for CS, writable data for SS, any data/code-readable segment for
///    DS/ES).
/// 4. Privilege: a data/extra segment needs `max(CPL, RPL) <= DPL`; a
///    stack segment needs `RPL == CPL == DPL` exactly; a non-conforming
///    code segment needs `DPL == CPL`, a conforming one needs `DPL <= CPL`.
/// 5. The present bit must be set, or this raises #NP (#SS for a stack
///    segment) instead of #GP.
/// 6. For a stack segment specifically, the type must be writable data.
/// 7. Once every check passes, the descriptor's base/limit/access are
///    latched into the cache and, for code/data, the accessed bit is set
///    in the table entry.
pub fn load_segment(
    state: &mut CpuState,
    bus: &mut impl CpuBus,
    role: Role,
    selector: u16,
    cpl: u8,
) -> Result<SegmentReg, Exception> {
    if !state.protected() {
        return Ok(SegmentReg {
            selector,
            base: (selector as u32) << 4,
            limit: 0xFFFF,
            access: ACCESS_PRESENT,
        });
    }

    let index = selector & !0b111;
    if index == 0 && role == Role::Data {
        return Ok(SegmentReg {
            selector,
            base: 0,
            limit: 0,
            access: 0,
        });
    }
    if index == 0 {
        return Err(Exception::GeneralProtection);
    }

    let rpl = (selector & 0b11) as u8;
    let (addr, raw) = raw_descriptor(state, bus, selector)?;
    let mut seg = decode_descriptor(raw);
    seg.selector = selector;

    if seg.access & ACCESS_S == 0 {
        return Err(Exception::GeneralProtection);
    }
    let is_code = seg.access & ACCESS_TYPE_CODE != 0;
    match role {
        Role::Code if !is_code => return Err(Exception::GeneralProtection),
        Role::Stack if is_code || seg.access & ACCESS_TYPE_WRITABLE == 0 => {
            return Err(Exception::GeneralProtection)
        }
        _ => {}
    }

    let dpl = seg.dpl();
    match role {
        Role::Code => {
            let conforming = seg.access & ACCESS_TYPE_CONFORMING != 0;
            if conforming {
                if dpl > cpl {
                    return Err(Exception::GeneralProtection);
                }
            } else if dpl != cpl {
                return Err(Exception::GeneralProtection);
            }
        }
        Role::Stack => {
            if rpl != cpl || dpl != cpl {
                return Err(Exception::GeneralProtection);
            }
        }
        Role::Data => {
            if cpl.max(rpl) > dpl {
                return Err(Exception::GeneralProtection);
            }
        }
    }

    if seg.access & ACCESS_PRESENT == 0 {
        return Err(if role == Role::Stack {
            Exception::StackFault
        } else {
            Exception::SegmentNotPresent
        });
    }

    if seg.access & ACCESS_ACCESSED == 0 {
        seg.access |= ACCESS_ACCESSED;
        let access_byte_addr = addr + 5;
        bus.write_u8(access_byte_addr, seg.access)?;
    }

    Ok(seg)
}

/// `LGDT`/`LIDT`: load a 6-byte pseudo-descriptor (limit:16, base:32) from
/// memory into GDTR/IDTR. Unprivileged in real mode; CPL0-only once in
/// protected mode (enforced by the caller, which knows the addressing mode).
pub fn read_pseudo_descriptor(bus: &mut impl CpuBus, addr: u32) -> Result<TableReg, Exception> {
    let limit = bus.read_u16(addr)?;
    let base = bus.read_u32(addr.wrapping_add(2))?;
    Ok(TableReg { base, limit })
}

pub fn write_pseudo_descriptor(
    bus: &mut impl CpuBus,
    addr: u32,
    table: TableReg,
) -> Result<(), Exception> {
    bus.write_u16(addr, table.limit)?;
    bus.write_u32(addr.wrapping_add(2), table.base)
}

/// `LLDT`: loads LDTR from a GDT selector referencing an LDT-type system
/// descriptor. A null selector clears LDTR (no LDT present).
pub fn load_ldtr(
    state: &mut CpuState,
    bus: &mut impl CpuBus,
    selector: u16,
) -> Result<(), Exception> {
    if selector & !0b111 == 0 {
        state.tables.ldtr = SegmentReg::default();
        return Ok(());
    }
    if selector & 0b100 != 0 {
        // An LDT selector must itself reference the GDT.
        return Err(Exception::GeneralProtection);
    }
    let (_, raw) = raw_descriptor(state, bus, selector)?;
    let mut seg = decode_descriptor(raw);
    seg.selector = selector;
    if seg.access & ACCESS_S != 0 || seg.access & 0b1111 != crate::state::SYSTEM_TYPE_LDT {
        return Err(Exception::GeneralProtection);
    }
    if seg.access & ACCESS_PRESENT == 0 {
        return Err(Exception::SegmentNotPresent);
    }
    state.tables.ldtr = seg;
    Ok(())
}

/// `LTR`: loads TR from a GDT selector referencing an available
/// (not-busy) TSS descriptor, and marks it busy in the table.
pub fn load_tr(
    state: &mut CpuState,
    bus: &mut impl CpuBus,
    selector: u16,
) -> Result<(), Exception> {
    if selector & !0b111 == 0 || selector & 0b100 != 0 {
        return Err(Exception::GeneralProtection);
    }
    let (addr, raw) = raw_descriptor(state, bus, selector)?;
    let mut seg = decode_descriptor(raw);
    seg.selector = selector;
    if seg.access & ACCESS_S != 0 || seg.access & 0b1111 != crate::state::SYSTEM_TYPE_AVAILABLE_TSS
    {
        return Err(Exception::GeneralProtection);
    }
    if seg.access & ACCESS_PRESENT == 0 {
        return Err(Exception::SegmentNotPresent);
    }
    seg.access = (seg.access & !0b1111) | crate::state::SYSTEM_TYPE_BUSY_TSS;
    bus.write_u8(addr + 5, seg.access)?;
    state.tables.tr = seg;
    Ok(())
}
