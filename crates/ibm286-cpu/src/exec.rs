//! Fetch-decode-execute for one instruction: the opcode dispatch table,
//! REP-prefixed string instructions, and the HLT/trap/fault bookkeeping
//! around a single `step`.

use ibm286_fpu::{ArithOp as FpuArithOp, Fpu};

use crate::alu::{self, ShiftOp};
use crate::bus::CpuBus;
use crate::decode::{decode_ea, read_modrm, read_prefixes, Ea, Fetcher, ModRm, Prefixes, Rep, SegOverride};
use crate::exception::Exception;
use crate::interrupt;
use crate::segment::{self, Role};
use crate::state::{
    gpr, CpuMode, CpuState, SegmentReg, ACCESS_PRESENT, FLAG_AF, FLAG_CF, FLAG_DF, FLAG_IF,
    FLAG_OF, FLAG_PF, FLAG_SF, FLAG_TF, FLAG_ZF, MSW_EM, MSW_PE, MSW_TS,
};

/// The outcome of executing one instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepExit {
    /// Ordinary fallthrough; the driver loop may poll for interrupts next.
    Continue,
    /// A `CLI`/`STI`/`MOV SS,...`/pop-SS instruction just retired: the
    /// 80286 suppresses interrupt recognition for exactly one more
    /// instruction so a stack-pointer load can't be split from its
    /// segment load by an interrupt.
    ContinueInhibitInterrupts,
    /// A jump, call, return, or loop instruction retired.
    Branch,
    /// `HLT` retired; the CPU stays halted until an unmasked interrupt or
    /// reset arrives.
    Halted,
}

pub struct Cpu {
    pub state: CpuState,
    pub fpu: Fpu,
    pub host_interrupts: crate::host::HostInterruptTable,
}

impl Cpu {
    pub fn new() -> Self {
        Self {
            state: CpuState::new(),
            fpu: Fpu::new(),
            host_interrupts: crate::host::HostInterruptTable::new(),
        }
    }

    pub fn reset(&mut self) {
        self.state.reset();
        self.fpu.finit();
    }
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}

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

fn read_ea8(
    state: &mut CpuState,
    bus: &mut impl CpuBus,
    ea: Ea,
) -> Result<u8, Exception> {
    match ea {
        Ea::Reg(r) => Ok(state.read_gpr8(r as usize)),
        Ea::Mem { seg, offset } => bus.read_u8(seg.base.wrapping_add(offset as u32)),
    }
}

fn write_ea8(
    state: &mut CpuState,
    bus: &mut impl CpuBus,
    ea: Ea,
    value: u8,
) -> Result<(), Exception> {
    match ea {
        Ea::Reg(r) => {
            state.write_gpr8(r as usize, value);
            Ok(())
        }
        Ea::Mem { seg, offset } => bus.write_u8(seg.base.wrapping_add(offset as u32), value),
    }
}

fn read_ea16(
    state: &mut CpuState,
    bus: &mut impl CpuBus,
    ea: Ea,
) -> Result<u16, Exception> {
    match ea {
        Ea::Reg(r) => Ok(state.read_gpr16(r as usize)),
        Ea::Mem { seg, offset } => bus.read_u16(seg.base.wrapping_add(offset as u32)),
    }
}

fn write_ea16(
    state: &mut CpuState,
    bus: &mut impl CpuBus,
    ea: Ea,
    value: u16,
) -> Result<(), Exception> {
    match ea {
        Ea::Reg(r) => {
            state.write_gpr16(r as usize, value);
            Ok(())
        }
        Ea::Mem { seg, offset } => bus.write_u16(seg.base.wrapping_add(offset as u32), value),
    }
}

fn segment_by_index(state: &CpuState, index: u8) -> SegmentReg {
    match index & 0b11 {
        0 => state.segments.es,
        1 => state.segments.cs,
        2 => state.segments.ss,
        _ => state.segments.ds,
    }
}

fn set_segment(state: &mut CpuState, index: u8, seg: SegmentReg) {
    match index & 0b11 {
        0 => state.segments.es = seg,
        1 => state.segments.cs = seg,
        2 => state.segments.ss = seg,
        _ => state.segments.ds = seg,
    }
}

/// Executes one instruction from CS:IP, returning how it exited or the
/// exception it raised (callers deliver the exception themselves so the
/// same `intcall` escalation path used for external interrupts applies).
pub fn step(state: &mut CpuState, fpu: &mut Fpu, bus: &mut impl CpuBus) -> Result<StepExit, Exception> {
    let instr_start_ip = state.ip;
    let mut f = Fetcher::new(state, bus);
    let (prefixes, opcode) = read_prefixes(&mut f)?;

    let cpl_check_privileged = |state: &CpuState| -> Result<(), Exception> {
        if state.protected() && state.cpl() != 0 {
            Err(Exception::GeneralProtection)
        } else {
            Ok(())
        }
    };

    let outcome: Result<StepExit, Exception> = match opcode {
        0x00..=0x3D if is_arith_opcode(opcode) => {
            exec_arith_group(state, bus, &prefixes, opcode)?;
            Ok(StepExit::Continue)
        }
        0x27 => {
            let al = state.read_gpr8(0);
            let r = alu::daa(state, al);
            state.write_gpr8(0, r);
            Ok(StepExit::Continue)
        }
        0x2F => {
            let al = state.read_gpr8(0);
            let r = alu::das(state, al);
            state.write_gpr8(0, r);
            Ok(StepExit::Continue)
        }
        0x37 => {
            let al = state.read_gpr8(0);
            let ah = state.read_gpr8(4);
            let (al, ah) = alu::aaa(state, al, ah);
            state.write_gpr8(0, al);
            state.write_gpr8(4, ah);
            Ok(StepExit::Continue)
        }
        0x3F => {
            let al = state.read_gpr8(0);
            let ah = state.read_gpr8(4);
            let (al, ah) = alu::aas(state, al, ah);
            state.write_gpr8(0, al);
            state.write_gpr8(4, ah);
            Ok(StepExit::Continue)
        }
        0x40..=0x47 => {
            let r = (opcode - 0x40) as usize;
            let v = alu::inc16(state, state.read_gpr16(r));
            state.write_gpr16(r, v);
            Ok(StepExit::Continue)
        }
        0x48..=0x4F => {
            let r = (opcode - 0x48) as usize;
            let v = alu::dec16(state, state.read_gpr16(r));
            state.write_gpr16(r, v);
            Ok(StepExit::Continue)
        }
        0x50..=0x57 => {
            let r = (opcode - 0x50) as usize;
            let v = state.read_gpr16(r);
            push16(state, bus, v)?;
            Ok(StepExit::Continue)
        }
        0x58..=0x5F => {
            let r = (opcode - 0x58) as usize;
            let v = pop16(state, bus)?;
            state.write_gpr16(r, v);
            Ok(StepExit::Continue)
        }
        0x60 => {
            let sp = state.read_gpr16(gpr::SP);
            for r in [gpr::AX, gpr::CX, gpr::DX, gpr::BX, 0xFFFF, gpr::BP, gpr::SI, gpr::DI] {
                let v = if r == 0xFFFF { sp } else { state.read_gpr16(r) };
                push16(state, bus, v)?;
            }
            Ok(StepExit::Continue)
        }
        0x61 => {
            for r in [gpr::DI, gpr::SI, gpr::BP, usize::MAX, gpr::BX, gpr::DX, gpr::CX, gpr::AX] {
                let v = pop16(state, bus)?;
                if r != usize::MAX {
                    state.write_gpr16(r, v);
                }
            }
            Ok(StepExit::Continue)
        }
        0x62 => {
            exec_bound(state, bus, &prefixes)?;
            Ok(StepExit::Continue)
        }
        0x63 => {
            exec_arpl(state, bus)?;
            Ok(StepExit::Continue)
        }
        0x68 => {
            let mut f = Fetcher::new(state, bus);
            let imm = f.u16()?;
            push16(state, bus, imm)?;
            Ok(StepExit::Continue)
        }
        0x6A => {
            let mut f = Fetcher::new(state, bus);
            let imm = f.i8()? as i16 as u16;
            push16(state, bus, imm)?;
            Ok(StepExit::Continue)
        }
        0x69 | 0x6B => {
            exec_imul_imm(state, bus, &prefixes, opcode == 0x6B)?;
            Ok(StepExit::Continue)
        }
        0x6C..=0x6F => {
            exec_string_ins_outs(state, bus, &prefixes, opcode, instr_start_ip)
        }
        0x70..=0x7F => {
            exec_jcc(state, bus, opcode)?;
            Ok(StepExit::Branch)
        }
        0x80 | 0x81 | 0x83 => {
            exec_group1(state, bus, &prefixes, opcode)?;
            Ok(StepExit::Continue)
        }
        0x84 | 0x85 => {
            exec_test_rm(state, bus, &prefixes, opcode)?;
            Ok(StepExit::Continue)
        }
        0x86 | 0x87 => {
            exec_xchg(state, bus, &prefixes, opcode)?;
            Ok(StepExit::Continue)
        }
        0x88..=0x8B => {
            exec_mov_rm(state, bus, &prefixes, opcode)?;
            Ok(StepExit::Continue)
        }
        0x8C => {
            exec_mov_seg_to_rm(state, bus, &prefixes)?;
            Ok(StepExit::Continue)
        }
        0x8D => {
            exec_lea(state, bus, &prefixes)?;
            Ok(StepExit::Continue)
        }
        0x8E => {
            exec_mov_rm_to_seg(state, bus, &prefixes)?;
            Ok(StepExit::ContinueInhibitInterrupts)
        }
        0x8F => {
            exec_pop_rm(state, bus, &prefixes)?;
            Ok(StepExit::Continue)
        }
        0x90 => Ok(StepExit::Continue),
        0x91..=0x97 => {
            let r = (opcode - 0x90) as usize;
            let ax = state.read_gpr16(gpr::AX);
            let other = state.read_gpr16(r);
            state.write_gpr16(gpr::AX, other);
            state.write_gpr16(r, ax);
            Ok(StepExit::Continue)
        }
        0x98 => {
            let al = state.read_gpr8(0) as i8 as i16 as u16;
            state.write_gpr16(gpr::AX, al);
            Ok(StepExit::Continue)
        }
        0x99 => {
            let ax = state.read_gpr16(gpr::AX) as i16;
            state.write_gpr16(gpr::DX, if ax < 0 { 0xFFFF } else { 0 });
            Ok(StepExit::Continue)
        }
        0x9C => {
            push16(state, bus, state.flags)?;
            Ok(StepExit::Continue)
        }
        0x9D => {
            let v = pop16(state, bus)?;
            state.flags = v | crate::state::FLAGS_RESERVED_ON;
            Ok(StepExit::Continue)
        }
        0xA0..=0xA3 => {
            exec_mov_moffs(state, bus, &prefixes, opcode)?;
            Ok(StepExit::Continue)
        }
        0xA4 | 0xA5 => exec_string_movs(state, bus, &prefixes, opcode, instr_start_ip),
        0xA6 | 0xA7 => exec_string_cmps(state, bus, &prefixes, opcode, instr_start_ip),
        0xA8 | 0xA9 => {
            exec_test_acc(state, bus, opcode)?;
            Ok(StepExit::Continue)
        }
        0xAA | 0xAB => exec_string_stos(state, bus, &prefixes, opcode, instr_start_ip),
        0xAC | 0xAD => exec_string_lods(state, bus, &prefixes, opcode, instr_start_ip),
        0xAE | 0xAF => exec_string_scas(state, bus, &prefixes, opcode, instr_start_ip),
        0xB0..=0xB7 => {
            let mut f = Fetcher::new(state, bus);
            let imm = f.u8()?;
            state.write_gpr8((opcode - 0xB0) as usize, imm);
            Ok(StepExit::Continue)
        }
        0xB8..=0xBF => {
            let mut f = Fetcher::new(state, bus);
            let imm = f.u16()?;
            state.write_gpr16((opcode - 0xB8) as usize, imm);
            Ok(StepExit::Continue)
        }
        0xC0 | 0xC1 | 0xD0..=0xD3 => {
            exec_shift_group(state, bus, &prefixes, opcode)?;
            Ok(StepExit::Continue)
        }
        0xC2 => {
            let mut f = Fetcher::new(state, bus);
            let imm = f.u16()?;
            let ip = pop16(state, bus)?;
            state.ip = ip;
            let sp = state.read_gpr16(gpr::SP).wrapping_add(imm);
            state.write_gpr16(gpr::SP, sp);
            Ok(StepExit::Branch)
        }
        0xC3 => {
            let ip = pop16(state, bus)?;
            state.ip = ip;
            Ok(StepExit::Branch)
        }
        0xC6 | 0xC7 => {
            exec_mov_imm_rm(state, bus, &prefixes, opcode)?;
            Ok(StepExit::Continue)
        }
        0xC8 => {
            exec_enter(state, bus)?;
            Ok(StepExit::Continue)
        }
        0xC9 => {
            let bp = state.read_gpr16(gpr::BP);
            state.write_gpr16(gpr::SP, bp);
            let bp = pop16(state, bus)?;
            state.write_gpr16(gpr::BP, bp);
            Ok(StepExit::Continue)
        }
        0xCA => {
            let mut f = Fetcher::new(state, bus);
            let imm = f.u16()?;
            let ip = pop16(state, bus)?;
            let cs = pop16(state, bus)?;
            let sp = state.read_gpr16(gpr::SP).wrapping_add(imm);
            state.write_gpr16(gpr::SP, sp);
            state.ip = ip;
            state.segments.cs = segment::load_segment(state, bus, Role::Code, cs, state.cpl())?;
            Ok(StepExit::Branch)
        }
        0xCB => {
            let ip = pop16(state, bus)?;
            let cs = pop16(state, bus)?;
            state.ip = ip;
            state.segments.cs = segment::load_segment(state, bus, Role::Code, cs, state.cpl())?;
            Ok(StepExit::Branch)
        }
        0xCC => Err(Exception::Breakpoint),
        0xCD => {
            let mut f = Fetcher::new(state, bus);
            let vector = f.u8()?;
            Err(Exception::SoftwareInterrupt(vector))
        }
        0xCE => {
            if state.flag(FLAG_OF) {
                Err(Exception::Overflow)
            } else {
                Ok(StepExit::Continue)
            }
        }
        0xCF => {
            interrupt::iret(state, bus)?;
            Ok(StepExit::Branch)
        }
        0xD4 => {
            let mut f = Fetcher::new(state, bus);
            let base = f.u8()?;
            let al = state.read_gpr8(0);
            let (al, ah) = alu::aam(state, al, base).map_err(|_| Exception::DivideError)?;
            state.write_gpr8(0, al);
            state.write_gpr8(4, ah);
            Ok(StepExit::Continue)
        }
        0xD5 => {
            let mut f = Fetcher::new(state, bus);
            let base = f.u8()?;
            let al = state.read_gpr8(0);
            let ah = state.read_gpr8(4);
            let al = alu::aad(state, al, ah, base).map_err(|_| Exception::DivideError)?;
            state.write_gpr8(0, al);
            state.write_gpr8(4, 0);
            Ok(StepExit::Continue)
        }
        0xD7 => {
            let bx = state.read_gpr16(gpr::BX);
            let al = state.read_gpr8(0);
            let seg = prefixes.segment(state, SegOverride::Ds);
            let addr = seg.base.wrapping_add(bx.wrapping_add(al as u16) as u32);
            let v = bus.read_u8(addr)?;
            state.write_gpr8(0, v);
            Ok(StepExit::Continue)
        }
        0xD8..=0xDF => {
            exec_esc(state, fpu, bus, &prefixes, opcode)?;
            Ok(StepExit::Continue)
        }
        0xE0..=0xE3 => {
            exec_loop(state, bus, opcode)?;
            Ok(StepExit::Branch)
        }
        0xE4 | 0xE5 | 0xE6 | 0xE7 => {
            exec_io_imm(state, bus, opcode)?;
            Ok(StepExit::Continue)
        }
        0xE8 => {
            let mut f = Fetcher::new(state, bus);
            let rel = f.u16()? as i16;
            let return_ip = f.state.ip;
            push16(state, bus, return_ip)?;
            state.ip = return_ip.wrapping_add(rel as u16);
            Ok(StepExit::Branch)
        }
        0xE9 => {
            let mut f = Fetcher::new(state, bus);
            let rel = f.u16()? as i16;
            state.ip = state.ip.wrapping_add(rel as u16);
            Ok(StepExit::Branch)
        }
        0xEA => {
            let mut f = Fetcher::new(state, bus);
            let offset = f.u16()?;
            let sel = f.u16()?;
            state.ip = offset;
            state.segments.cs = segment::load_segment(state, bus, Role::Code, sel, state.cpl())?;
            Ok(StepExit::Branch)
        }
        0xEB => {
            let mut f = Fetcher::new(state, bus);
            let rel = f.i8()?;
            state.ip = state.ip.wrapping_add(rel as i16 as u16);
            Ok(StepExit::Branch)
        }
        0xEC | 0xED | 0xEE | 0xEF => {
            exec_io_dx(state, bus, opcode)?;
            Ok(StepExit::Continue)
        }
        0xF0 => Ok(StepExit::Continue),
        0xF4 => {
            cpl_check_privileged(state)?;
            state.halted = true;
            Ok(StepExit::Halted)
        }
        0xF5 => {
            state.set_flag(FLAG_CF, !state.flag(FLAG_CF));
            Ok(StepExit::Continue)
        }
        0xF6 | 0xF7 => {
            exec_group3(state, bus, &prefixes, opcode)
        }
        0xF8 => {
            state.set_flag(FLAG_CF, false);
            Ok(StepExit::Continue)
        }
        0xF9 => {
            state.set_flag(FLAG_CF, true);
            Ok(StepExit::Continue)
        }
        0xFA => {
            cpl_check_privileged(state)?;
            state.set_flag(FLAG_IF, false);
            Ok(StepExit::ContinueInhibitInterrupts)
        }
        0xFB => {
            cpl_check_privileged(state)?;
            state.set_flag(FLAG_IF, true);
            Ok(StepExit::ContinueInhibitInterrupts)
        }
        0xFC => {
            state.set_flag(FLAG_DF, false);
            Ok(StepExit::Continue)
        }
        0xFD => {
            state.set_flag(FLAG_DF, true);
            Ok(StepExit::Continue)
        }
        0xFE | 0xFF => exec_group5(state, bus, &prefixes, opcode),
        0x06 | 0x07 | 0x0E | 0x16 | 0x17 | 0x1E | 0x1F => {
            exec_push_pop_seg(state, bus, opcode)
        }
        0x0F => exec_two_byte(state, bus, &prefixes),
        _ => Err(Exception::InvalidOpcode),
    };

    // A genuine fault restarts at the instruction that raised it; `INT n`
    // is not a fault and its return address is correctly wherever fetch
    // already left IP (just past the instruction).
    if let Err(exception) = &outcome {
        if !matches!(exception, Exception::SoftwareInterrupt(_)) {
            state.ip = instr_start_ip;
        }
    }
    outcome
}

fn is_arith_opcode(opcode: u8) -> bool {
    // The eight arithmetic groups (ADD OR ADC SBB AND SUB XOR CMP) each
    // occupy a contiguous 8-opcode block in this range; 0x0F is the
    // two-byte escape and is handled separately.
    opcode != 0x0F && (opcode & 0xC0) == 0x00 && (opcode & 0x07) <= 0x05
}

fn arith_index(opcode: u8) -> u8 {
    opcode >> 3
}

fn apply_arith(state: &mut CpuState, index: u8, a: u16, b: u16, is_byte: bool) -> (u16, bool) {
    if is_byte {
        let a = a as u8;
        let b = b as u8;
        let r = match index {
            0 => alu::add8(state, a, b, false),
            1 => alu::or8(state, a, b),
            2 => alu::add8(state, a, b, state.flag(FLAG_CF)),
            3 => alu::sub8(state, a, b, state.flag(FLAG_CF)),
            4 => alu::and8(state, a, b),
            5 => alu::sub8(state, a, b, false),
            6 => alu::xor8(state, a, b),
            _ => alu::sub8(state, a, b, false),
        };
        (r as u16, index == 7)
    } else {
        let r = match index {
            0 => alu::add16(state, a, b, false),
            1 => alu::or16(state, a, b),
            2 => alu::add16(state, a, b, state.flag(FLAG_CF)),
            3 => alu::sub16(state, a, b, state.flag(FLAG_CF)),
            4 => alu::and16(state, a, b),
            5 => alu::sub16(state, a, b, false),
            6 => alu::xor16(state, a, b),
            _ => alu::sub16(state, a, b, false),
        };
        (r, index == 7)
    }
}

fn exec_arith_group(
    state: &mut CpuState,
    bus: &mut impl CpuBus,
    prefixes: &Prefixes,
    opcode: u8,
) -> Result<(), Exception> {
    let form = opcode & 0x07;
    let index = arith_index(opcode);
    let is_byte = form & 1 == 0;
    match form {
        0x00 | 0x01 => {
            let mut f = Fetcher::new(state, bus);
            let modrm = read_modrm(&mut f)?;
            let ea = decode_ea(&mut f, prefixes, modrm)?;
            let b = state.read_gpr8_or_16(modrm.reg, is_byte);
            let a = if is_byte {
                read_ea8(state, bus, ea)? as u16
            } else {
                read_ea16(state, bus, ea)?
            };
            let (r, is_cmp) = apply_arith(state, index, a, b, is_byte);
            if !is_cmp {
                if is_byte {
                    write_ea8(state, bus, ea, r as u8)?;
                } else {
                    write_ea16(state, bus, ea, r)?;
                }
            }
        }
        0x02 | 0x03 => {
            let mut f = Fetcher::new(state, bus);
            let modrm = read_modrm(&mut f)?;
            let ea = decode_ea(&mut f, prefixes, modrm)?;
            let a = state.read_gpr8_or_16(modrm.reg, is_byte);
            let b = if is_byte {
                read_ea8(state, bus, ea)? as u16
            } else {
                read_ea16(state, bus, ea)?
            };
            let (r, is_cmp) = apply_arith(state, index, a, b, is_byte);
            if !is_cmp {
                state.write_gpr8_or_16(modrm.reg, r, is_byte);
            }
        }
        0x04 | 0x05 => {
            let mut f = Fetcher::new(state, bus);
            let imm = if is_byte {
                f.u8()? as u16
            } else {
                f.u16()?
            };
            let a = state.read_gpr8_or_16(0, is_byte);
            let (r, is_cmp) = apply_arith(state, index, a, imm, is_byte);
            if !is_cmp {
                state.write_gpr8_or_16(0, r, is_byte);
            }
        }
        _ => unreachable!(),
    }
    Ok(())
}

fn exec_group1(
    state: &mut CpuState,
    bus: &mut impl CpuBus,
    prefixes: &Prefixes,
    opcode: u8,
) -> Result<(), Exception> {
    let is_byte = opcode == 0x80;
    let mut f = Fetcher::new(state, bus);
    let modrm = read_modrm(&mut f)?;
    let ea = decode_ea(&mut f, prefixes, modrm)?;
    let imm: u16 = match opcode {
        0x80 => {
            let mut f = Fetcher::new(state, bus);
            f.u8()? as u16
        }
        0x81 => {
            let mut f = Fetcher::new(state, bus);
            f.u16()?
        }
        0x83 => {
            let mut f = Fetcher::new(state, bus);
            f.i8()? as i16 as u16
        }
        _ => unreachable!(),
    };
    let a = if is_byte {
        read_ea8(state, bus, ea)? as u16
    } else {
        read_ea16(state, bus, ea)?
    };
    let (r, is_cmp) = apply_arith(state, modrm.reg, a, imm, is_byte);
    if !is_cmp {
        if is_byte {
            write_ea8(state, bus, ea, r as u8)?;
        } else {
            write_ea16(state, bus, ea, r)?;
        }
    }
    Ok(())
}

fn exec_test_rm(
    state: &mut CpuState,
    bus: &mut impl CpuBus,
    prefixes: &Prefixes,
    opcode: u8,
) -> Result<(), Exception> {
    let is_byte = opcode == 0x84;
    let mut f = Fetcher::new(state, bus);
    let modrm = read_modrm(&mut f)?;
    let ea = decode_ea(&mut f, prefixes, modrm)?;
    let b = state.read_gpr8_or_16(modrm.reg, is_byte);
    let a = if is_byte {
        read_ea8(state, bus, ea)? as u16
    } else {
        read_ea16(state, bus, ea)?
    };
    if is_byte {
        alu::and8(state, a as u8, b as u8);
    } else {
        alu::and16(state, a, b);
    }
    Ok(())
}

fn exec_test_acc(state: &mut CpuState, bus: &mut impl CpuBus, opcode: u8) -> Result<(), Exception> {
    let is_byte = opcode == 0xA8;
    let mut f = Fetcher::new(state, bus);
    if is_byte {
        let imm = f.u8()?;
        let al = state.read_gpr8(0);
        alu::and8(state, al, imm);
    } else {
        let imm = f.u16()?;
        let ax = state.read_gpr16(gpr::AX);
        alu::and16(state, ax, imm);
    }
    Ok(())
}

fn exec_xchg(
    state: &mut CpuState,
    bus: &mut impl CpuBus,
    prefixes: &Prefixes,
    opcode: u8,
) -> Result<(), Exception> {
    let is_byte = opcode == 0x86;
    let mut f = Fetcher::new(state, bus);
    let modrm = read_modrm(&mut f)?;
    let ea = decode_ea(&mut f, prefixes, modrm)?;
    if is_byte {
        let a = read_ea8(state, bus, ea)?;
        let b = state.read_gpr8(modrm.reg as usize);
        write_ea8(state, bus, ea, b)?;
        state.write_gpr8(modrm.reg as usize, a);
    } else {
        let a = read_ea16(state, bus, ea)?;
        let b = state.read_gpr16(modrm.reg as usize);
        write_ea16(state, bus, ea, b)?;
        state.write_gpr16(modrm.reg as usize, a);
    }
    Ok(())
}

fn exec_mov_rm(
    state: &mut CpuState,
    bus: &mut impl CpuBus,
    prefixes: &Prefixes,
    opcode: u8,
) -> Result<(), Exception> {
    let is_byte = opcode & 1 == 0;
    let reg_is_dst = opcode & 2 != 0;
    let mut f = Fetcher::new(state, bus);
    let modrm = read_modrm(&mut f)?;
    let ea = decode_ea(&mut f, prefixes, modrm)?;
    if reg_is_dst {
        let v = if is_byte {
            read_ea8(state, bus, ea)? as u16
        } else {
            read_ea16(state, bus, ea)?
        };
        state.write_gpr8_or_16(modrm.reg, v, is_byte);
    } else {
        let v = state.read_gpr8_or_16(modrm.reg, is_byte);
        if is_byte {
            write_ea8(state, bus, ea, v as u8)?;
        } else {
            write_ea16(state, bus, ea, v)?;
        }
    }
    Ok(())
}

fn exec_mov_imm_rm(
    state: &mut CpuState,
    bus: &mut impl CpuBus,
    prefixes: &Prefixes,
    opcode: u8,
) -> Result<(), Exception> {
    let is_byte = opcode == 0xC6;
    let mut f = Fetcher::new(state, bus);
    let modrm = read_modrm(&mut f)?;
    let ea = decode_ea(&mut f, prefixes, modrm)?;
    let mut f = Fetcher::new(state, bus);
    let imm = if is_byte { f.u8()? as u16 } else { f.u16()? };
    if is_byte {
        write_ea8(state, bus, ea, imm as u8)?;
    } else {
        write_ea16(state, bus, ea, imm)?;
    }
    Ok(())
}

fn exec_mov_moffs(
    state: &mut CpuState,
    bus: &mut impl CpuBus,
    prefixes: &Prefixes,
    opcode: u8,
) -> Result<(), Exception> {
    let is_byte = opcode & 1 == 0;
    let to_acc = opcode < 0xA2;
    let mut f = Fetcher::new(state, bus);
    let offset = f.u16()?;
    let seg = prefixes.segment(state, SegOverride::Ds);
    let addr = seg.base.wrapping_add(offset as u32);
    if to_acc {
        if is_byte {
            let v = bus.read_u8(addr)?;
            state.write_gpr8(0, v);
        } else {
            let v = bus.read_u16(addr)?;
            state.write_gpr16(gpr::AX, v);
        }
    } else if is_byte {
        bus.write_u8(addr, state.read_gpr8(0))?;
    } else {
        bus.write_u16(addr, state.read_gpr16(gpr::AX))?;
    }
    Ok(())
}

fn exec_lea(state: &mut CpuState, bus: &mut impl CpuBus, prefixes: &Prefixes) -> Result<(), Exception> {
    let mut f = Fetcher::new(state, bus);
    let modrm = read_modrm(&mut f)?;
    let ea = decode_ea(&mut f, prefixes, modrm)?;
    match ea {
        Ea::Mem { offset, .. } => state.write_gpr16(modrm.reg as usize, offset),
        Ea::Reg(_) => return Err(Exception::InvalidOpcode),
    }
    Ok(())
}

fn exec_mov_seg_to_rm(
    state: &mut CpuState,
    bus: &mut impl CpuBus,
    prefixes: &Prefixes,
) -> Result<(), Exception> {
    let mut f = Fetcher::new(state, bus);
    let modrm = read_modrm(&mut f)?;
    let ea = decode_ea(&mut f, prefixes, modrm)?;
    let seg = segment_by_index(state, modrm.reg);
    write_ea16(state, bus, ea, seg.selector)
}

fn exec_mov_rm_to_seg(
    state: &mut CpuState,
    bus: &mut impl CpuBus,
    prefixes: &Prefixes,
) -> Result<(), Exception> {
    let mut f = Fetcher::new(state, bus);
    let modrm = read_modrm(&mut f)?;
    let ea = decode_ea(&mut f, prefixes, modrm)?;
    let selector = read_ea16(state, bus, ea)?;
    let role = if modrm.reg & 0b11 == 2 {
        Role::Stack
    } else {
        Role::Data
    };
    let cpl = state.cpl();
    let seg = segment::load_segment(state, bus, role, selector, cpl)?;
    set_segment(state, modrm.reg, seg);
    Ok(())
}

fn exec_pop_rm(state: &mut CpuState, bus: &mut impl CpuBus, prefixes: &Prefixes) -> Result<(), Exception> {
    let v = pop16(state, bus)?;
    let mut f = Fetcher::new(state, bus);
    let modrm = read_modrm(&mut f)?;
    let ea = decode_ea(&mut f, prefixes, modrm)?;
    write_ea16(state, bus, ea, v)
}

fn exec_push_pop_seg(state: &mut CpuState, bus: &mut impl CpuBus, opcode: u8) -> Result<StepExit, Exception> {
    let (index, is_push) = match opcode {
        0x06 => (0u8, true),
        0x07 => (0u8, false),
        0x0E => (1u8, true),
        0x16 => (2u8, true),
        0x17 => (2u8, false),
        0x1E => (3u8, true),
        0x1F => (3u8, false),
        _ => unreachable!(),
    };
    if is_push {
        let seg = segment_by_index(state, index);
        push16(state, bus, seg.selector)?;
        Ok(StepExit::Continue)
    } else {
        let selector = pop16(state, bus)?;
        let role = if index == 2 { Role::Stack } else { Role::Data };
        let cpl = state.cpl();
        let seg = segment::load_segment(state, bus, role, selector, cpl)?;
        set_segment(state, index, seg);
        Ok(StepExit::ContinueInhibitInterrupts)
    }
}

fn exec_jcc(state: &mut CpuState, bus: &mut impl CpuBus, opcode: u8) -> Result<(), Exception> {
    let mut f = Fetcher::new(state, bus);
    let rel = f.i8()?;
    let taken = condition(state, opcode & 0x0F);
    if taken {
        state.ip = state.ip.wrapping_add(rel as i16 as u16);
    }
    Ok(())
}

fn condition(state: &CpuState, cc: u8) -> bool {
    let cf = state.flag(FLAG_CF);
    let zf = state.flag(FLAG_ZF);
    let sf = state.flag(FLAG_SF);
    let of = state.flag(FLAG_OF);
    let pf = state.flag(FLAG_PF);
    match cc {
        0x0 => of,
        0x1 => !of,
        0x2 => cf,
        0x3 => !cf,
        0x4 => zf,
        0x5 => !zf,
        0x6 => cf || zf,
        0x7 => !cf && !zf,
        0x8 => sf,
        0x9 => !sf,
        0xA => pf,
        0xB => !pf,
        0xC => sf != of,
        0xD => sf == of,
        0xE => zf || (sf != of),
        0xF => !zf && (sf == of),
        _ => unreachable!(),
    }
}

fn exec_loop(state: &mut CpuState, bus: &mut impl CpuBus, opcode: u8) -> Result<(), Exception> {
    let mut f = Fetcher::new(state, bus);
    let rel = f.i8()?;
    let cx = state.read_gpr16(gpr::CX).wrapping_sub(if opcode == 0xE3 { 0 } else { 1 });
    if opcode != 0xE3 {
        state.write_gpr16(gpr::CX, cx);
    }
    let take = match opcode {
        0xE0 => cx != 0 && !state.flag(FLAG_ZF),
        0xE1 => cx != 0 && state.flag(FLAG_ZF),
        0xE2 => cx != 0,
        0xE3 => state.read_gpr16(gpr::CX) == 0,
        _ => unreachable!(),
    };
    if take {
        state.ip = state.ip.wrapping_add(rel as i16 as u16);
    }
    Ok(())
}

fn exec_shift_group(
    state: &mut CpuState,
    bus: &mut impl CpuBus,
    prefixes: &Prefixes,
    opcode: u8,
) -> Result<(), Exception> {
    let is_byte = opcode == 0xC0 || opcode == 0xD0 || opcode == 0xD2;
    let mut f = Fetcher::new(state, bus);
    let modrm = read_modrm(&mut f)?;
    let ea = decode_ea(&mut f, prefixes, modrm)?;
    let count: u8 = match opcode {
        0xC0 | 0xC1 => {
            let mut f = Fetcher::new(state, bus);
            f.u8()? & 0x1F
        }
        0xD0 | 0xD1 => 1,
        0xD2 | 0xD3 => state.read_gpr8(1) & 0x1F, // CL
        _ => unreachable!(),
    };
    let op = match modrm.reg {
        0 => ShiftOp::Rol,
        1 => ShiftOp::Ror,
        2 => ShiftOp::Rcl,
        3 => ShiftOp::Rcr,
        4 | 6 => ShiftOp::Shl,
        5 => ShiftOp::Shr,
        7 => ShiftOp::Sar,
        _ => unreachable!(),
    };
    if is_byte {
        let v = read_ea8(state, bus, ea)?;
        let r = alu::shift8(state, op, v, count);
        write_ea8(state, bus, ea, r)?;
    } else {
        let v = read_ea16(state, bus, ea)?;
        let r = alu::shift16(state, op, v, count);
        write_ea16(state, bus, ea, r)?;
    }
    Ok(())
}

fn exec_group3(
    state: &mut CpuState,
    bus: &mut impl CpuBus,
    prefixes: &Prefixes,
    opcode: u8,
) -> Result<StepExit, Exception> {
    let is_byte = opcode == 0xF6;
    let mut f = Fetcher::new(state, bus);
    let modrm = read_modrm(&mut f)?;
    let ea = decode_ea(&mut f, prefixes, modrm)?;
    match modrm.reg {
        0 | 1 => {
            let mut f = Fetcher::new(state, bus);
            if is_byte {
                let imm = f.u8()?;
                let v = read_ea8(state, bus, ea)?;
                alu::and8(state, v, imm);
            } else {
                let imm = f.u16()?;
                let v = read_ea16(state, bus, ea)?;
                alu::and16(state, v, imm);
            }
        }
        2 => {
            if is_byte {
                let v = alu::not8(read_ea8(state, bus, ea)?);
                write_ea8(state, bus, ea, v)?;
            } else {
                let v = alu::not16(read_ea16(state, bus, ea)?);
                write_ea16(state, bus, ea, v)?;
            }
        }
        3 => {
            if is_byte {
                let v = read_ea8(state, bus, ea)?;
                let r = alu::neg8(state, v);
                write_ea8(state, bus, ea, r)?;
            } else {
                let v = read_ea16(state, bus, ea)?;
                let r = alu::neg16(state, v);
                write_ea16(state, bus, ea, r)?;
            }
        }
        4 => {
            if is_byte {
                let v = read_ea8(state, bus, ea)?;
                let al = state.read_gpr8(0);
                let r = alu::mul8(state, al, v);
                state.write_gpr16(gpr::AX, r);
            } else {
                let v = read_ea16(state, bus, ea)?;
                let ax = state.read_gpr16(gpr::AX);
                let r = alu::mul16(state, ax, v);
                state.write_gpr16(gpr::AX, r as u16);
                state.write_gpr16(gpr::DX, (r >> 16) as u16);
            }
        }
        5 => {
            if is_byte {
                let v = read_ea8(state, bus, ea)? as i8;
                let al = state.read_gpr8(0) as i8;
                let r = alu::imul8(state, al, v);
                state.write_gpr16(gpr::AX, r as u16);
            } else {
                let v = read_ea16(state, bus, ea)? as i16;
                let ax = state.read_gpr16(gpr::AX) as i16;
                let r = alu::imul16(state, ax, v);
                state.write_gpr16(gpr::AX, r as u16);
                state.write_gpr16(gpr::DX, (r >> 16) as u16);
            }
        }
        6 => {
            if is_byte {
                let v = read_ea8(state, bus, ea)?;
                if v == 0 {
                    return Err(Exception::DivideError);
                }
                let ax = state.read_gpr16(gpr::AX);
                let q = ax / v as u16;
                let r = ax % v as u16;
                if q > 0xFF {
                    return Err(Exception::DivideError);
                }
                state.write_gpr8(0, q as u8);
                state.write_gpr8(4, r as u8);
            } else {
                let v = read_ea16(state, bus, ea)?;
                if v == 0 {
                    return Err(Exception::DivideError);
                }
                let dx = state.read_gpr16(gpr::DX) as u32;
                let ax = state.read_gpr16(gpr::AX) as u32;
                let dividend = (dx << 16) | ax;
                let q = dividend / v as u32;
                let r = dividend % v as u32;
                if q > 0xFFFF {
                    return Err(Exception::DivideError);
                }
                state.write_gpr16(gpr::AX, q as u16);
                state.write_gpr16(gpr::DX, r as u16);
            }
        }
        7 => {
            if is_byte {
                let v = read_ea8(state, bus, ea)? as i8;
                if v == 0 {
                    return Err(Exception::DivideError);
                }
                let ax = state.read_gpr16(gpr::AX) as i16;
                let q = ax / v as i16;
                let r = ax % v as i16;
                if q > i8::MAX as i16 || q < i8::MIN as i16 {
                    return Err(Exception::DivideError);
                }
                state.write_gpr8(0, q as u8);
                state.write_gpr8(4, r as u8);
            } else {
                let v = read_ea16(state, bus, ea)? as i16;
                if v == 0 {
                    return Err(Exception::DivideError);
                }
                let dx = state.read_gpr16(gpr::DX) as i32;
                let ax = state.read_gpr16(gpr::AX) as i32;
                let dividend = (dx << 16) | (ax & 0xFFFF);
                let q = dividend / v as i32;
                let r = dividend % v as i32;
                if q > i16::MAX as i32 || q < i16::MIN as i32 {
                    return Err(Exception::DivideError);
                }
                state.write_gpr16(gpr::AX, q as u16);
                state.write_gpr16(gpr::DX, r as u16);
            }
        }
        _ => unreachable!(),
    }
    Ok(StepExit::Continue)
}

fn exec_group5(
    state: &mut CpuState,
    bus: &mut impl CpuBus,
    prefixes: &Prefixes,
    opcode: u8,
) -> Result<StepExit, Exception> {
    let is_byte = opcode == 0xFE;
    let mut f = Fetcher::new(state, bus);
    let modrm = read_modrm(&mut f)?;
    let ea = decode_ea(&mut f, prefixes, modrm)?;
    match modrm.reg {
        0 => {
            if is_byte {
                let v = read_ea8(state, bus, ea)?;
                let r = alu::inc8(state, v);
                write_ea8(state, bus, ea, r)?;
            } else {
                let v = read_ea16(state, bus, ea)?;
                let r = alu::inc16(state, v);
                write_ea16(state, bus, ea, r)?;
            }
            Ok(StepExit::Continue)
        }
        1 => {
            if is_byte {
                let v = read_ea8(state, bus, ea)?;
                let r = alu::dec8(state, v);
                write_ea8(state, bus, ea, r)?;
            } else {
                let v = read_ea16(state, bus, ea)?;
                let r = alu::dec16(state, v);
                write_ea16(state, bus, ea, r)?;
            }
            Ok(StepExit::Continue)
        }
        2 => {
            let target = read_ea16(state, bus, ea)?;
            push16(state, bus, state.ip)?;
            state.ip = target;
            Ok(StepExit::Branch)
        }
        3 => {
            if let Ea::Mem { seg, offset } = ea {
                let new_ip = bus.read_u16(seg.base.wrapping_add(offset as u32))?;
                let new_cs = bus.read_u16(seg.base.wrapping_add(offset as u32 + 2))?;
                push16(state, bus, state.segments.cs.selector)?;
                push16(state, bus, state.ip)?;
                state.ip = new_ip;
                state.segments.cs =
                    segment::load_segment(state, bus, Role::Code, new_cs, state.cpl())?;
                Ok(StepExit::Branch)
            } else {
                Err(Exception::InvalidOpcode)
            }
        }
        4 => {
            let target = read_ea16(state, bus, ea)?;
            state.ip = target;
            Ok(StepExit::Branch)
        }
        5 => {
            if let Ea::Mem { seg, offset } = ea {
                let new_ip = bus.read_u16(seg.base.wrapping_add(offset as u32))?;
                let new_cs = bus.read_u16(seg.base.wrapping_add(offset as u32 + 2))?;
                state.ip = new_ip;
                state.segments.cs =
                    segment::load_segment(state, bus, Role::Code, new_cs, state.cpl())?;
                Ok(StepExit::Branch)
            } else {
                Err(Exception::InvalidOpcode)
            }
        }
        6 => {
            let v = read_ea16(state, bus, ea)?;
            push16(state, bus, v)?;
            Ok(StepExit::Continue)
        }
        _ => Err(Exception::InvalidOpcode),
    }
}

fn exec_io_imm(state: &mut CpuState, bus: &mut impl CpuBus, opcode: u8) -> Result<(), Exception> {
    if state.protected() && state.cpl() != 0 {
        return Err(Exception::GeneralProtection);
    }
    let mut f = Fetcher::new(state, bus);
    let port = f.u8()? as u16;
    match opcode {
        0xE4 => {
            let v = bus.in8(port);
            state.write_gpr8(0, v);
        }
        0xE5 => {
            let v = bus.in16(port);
            state.write_gpr16(gpr::AX, v);
        }
        0xE6 => bus.out8(port, state.read_gpr8(0)),
        0xE7 => bus.out16(port, state.read_gpr16(gpr::AX)),
        _ => unreachable!(),
    }
    Ok(())
}

fn exec_io_dx(state: &mut CpuState, bus: &mut impl CpuBus, opcode: u8) -> Result<(), Exception> {
    if state.protected() && state.cpl() != 0 {
        return Err(Exception::GeneralProtection);
    }
    let port = state.read_gpr16(gpr::DX);
    match opcode {
        0xEC => {
            let v = bus.in8(port);
            state.write_gpr8(0, v);
        }
        0xED => {
            let v = bus.in16(port);
            state.write_gpr16(gpr::AX, v);
        }
        0xEE => bus.out8(port, state.read_gpr8(0)),
        0xEF => bus.out16(port, state.read_gpr16(gpr::AX)),
        _ => unreachable!(),
    }
    Ok(())
}

fn exec_bound(state: &mut CpuState, bus: &mut impl CpuBus, prefixes: &Prefixes) -> Result<(), Exception> {
    let mut f = Fetcher::new(state, bus);
    let modrm = read_modrm(&mut f)?;
    let ea = decode_ea(&mut f, prefixes, modrm)?;
    let index = state.read_gpr16(modrm.reg as usize) as i16;
    let Ea::Mem { seg, offset } = ea else {
        return Err(Exception::InvalidOpcode);
    };
    // The reference implementation fetches both bounds words through
    // `linear >> 4, linear & 15` reinterpreted as a fresh segment:offset
    // pair rather than the linear address directly — a bug-shaped
    // expression, kept verbatim rather than simplified to `linear` even
    // though it reconstructs the same address for every in-range 20-bit
    // real-mode linear address.
    let linear = seg.base.wrapping_add(offset as u32) & 0xFFFFF;
    let bugged_seg = (linear >> 4) as u16;
    let bugged_off = (linear & 0xF) as u16;
    let addr = (bugged_seg as u32 * 16).wrapping_add(bugged_off as u32);
    let lower = bus.read_u16(addr)? as i16;
    let upper = bus.read_u16(addr.wrapping_add(2))? as i16;
    if index < lower || index > upper {
        return Err(Exception::BoundRange);
    }
    Ok(())
}

fn exec_arpl(state: &mut CpuState, bus: &mut impl CpuBus) -> Result<(), Exception> {
    if !state.protected() {
        return Err(Exception::InvalidOpcode);
    }
    let prefixes = Prefixes::default();
    let mut f = Fetcher::new(state, bus);
    let modrm = read_modrm(&mut f)?;
    let ea = decode_ea(&mut f, &prefixes, modrm)?;
    let dst = read_ea16(state, bus, ea)?;
    let src = state.read_gpr16(modrm.reg as usize);
    let dst_rpl = dst & 0b11;
    let src_rpl = src & 0b11;
    if dst_rpl < src_rpl {
        let new = (dst & !0b11) | src_rpl;
        write_ea16(state, bus, ea, new)?;
        state.set_flag(FLAG_ZF, true);
    } else {
        state.set_flag(FLAG_ZF, false);
    }
    Ok(())
}

fn exec_imul_imm(
    state: &mut CpuState,
    bus: &mut impl CpuBus,
    prefixes: &Prefixes,
    byte_imm: bool,
) -> Result<(), Exception> {
    let mut f = Fetcher::new(state, bus);
    let modrm = read_modrm(&mut f)?;
    let ea = decode_ea(&mut f, prefixes, modrm)?;
    let mut f = Fetcher::new(state, bus);
    let imm: i16 = if byte_imm {
        f.i8()? as i16
    } else {
        f.u16()? as i16
    };
    let v = read_ea16(state, bus, ea)? as i16;
    // Documented quirk: `IMUL r16, r/m16, imm` sets CF/OF based on the
    // truncated product overflowing 16 bits — the same rule as the
    // two-operand form — rather than re-deriving it from the immediate's
    // own width.
    let r = alu::imul16(state, v, imm);
    state.write_gpr16(modrm.reg as usize, r as u16);
    Ok(())
}

fn exec_enter(state: &mut CpuState, bus: &mut impl CpuBus) -> Result<(), Exception> {
    let mut f = Fetcher::new(state, bus);
    let size = f.u16()?;
    let nesting = f.u8()?;
    let bp = state.read_gpr16(gpr::BP);
    push16(state, bus, bp)?;
    let frame_ptr = state.read_gpr16(gpr::SP);
    if nesting > 0 {
        let mut bp_frame = bp;
        for _ in 1..nesting {
            bp_frame = bp_frame.wrapping_sub(2);
            let v = bus
                .read_u16(state.segments.ss.base.wrapping_add(bp_frame as u32))
                .unwrap_or(0);
            push16(state, bus, v)?;
        }
        push16(state, bus, frame_ptr)?;
    }
    state.write_gpr16(gpr::BP, frame_ptr);
    let sp = frame_ptr.wrapping_sub(size);
    state.write_gpr16(gpr::SP, sp);
    Ok(())
}

// --- REP-prefixed string instructions ---------------------------------

fn string_segments(
    state: &CpuState,
    prefixes: &Prefixes,
) -> (SegmentReg, SegmentReg) {
    let src_seg = prefixes.segment(state, SegOverride::Ds);
    let dst_seg = state.segments.es;
    (src_seg, dst_seg)
}

fn step_index(state: &CpuState, reg: usize, size: u16) -> u16 {
    let v = state.read_gpr16(reg);
    if state.flag(FLAG_DF) {
        v.wrapping_sub(size)
    } else {
        v.wrapping_add(size)
    }
}

/// Runs one iteration of a REP-eligible string op via `body`, then applies
/// the rewind-on-interruptible-repeat model: if the prefix calls for
/// another iteration, IP is rewound to the start of this instruction so a
/// pending interrupt can be taken between iterations and the whole `REP
/// ...` re-decodes next `step`; otherwise IP stays past the instruction.
fn run_string_op(
    state: &mut CpuState,
    rep: Option<Rep>,
    instr_start_ip: u16,
    is_compare: bool,
    mut body: impl FnMut(&mut CpuState) -> Result<(), Exception>,
) -> Result<StepExit, Exception> {
    match rep {
        None => {
            body(state)?;
            Ok(StepExit::Continue)
        }
        Some(rep) => {
            let cx = state.read_gpr16(gpr::CX);
            if cx == 0 {
                return Ok(StepExit::Continue);
            }
            body(state)?;
            let cx = cx.wrapping_sub(1);
            state.write_gpr16(gpr::CX, cx);
            let keep_going = if is_compare {
                let zf = state.flag(FLAG_ZF);
                cx != 0 && (rep == Rep::RepE) == zf
            } else {
                cx != 0
            };
            if keep_going {
                state.ip = instr_start_ip;
                Ok(StepExit::Continue)
            } else {
                Ok(StepExit::Continue)
            }
        }
    }
}

fn exec_string_movs(
    state: &mut CpuState,
    bus: &mut impl CpuBus,
    prefixes: &Prefixes,
    opcode: u8,
    instr_start_ip: u16,
) -> Result<StepExit, Exception> {
    let is_byte = opcode == 0xA4;
    let (src_seg, dst_seg) = string_segments(state, prefixes);
    let size = if is_byte { 1 } else { 2 };
    run_string_op(state, prefixes.rep, instr_start_ip, false, |state| {
        let si = state.read_gpr16(gpr::SI);
        let di = state.read_gpr16(gpr::DI);
        if is_byte {
            let v = bus.read_u8(src_seg.base.wrapping_add(si as u32))?;
            bus.write_u8(dst_seg.base.wrapping_add(di as u32), v)?;
        } else {
            let v = bus.read_u16(src_seg.base.wrapping_add(si as u32))?;
            bus.write_u16(dst_seg.base.wrapping_add(di as u32), v)?;
        }
        state.write_gpr16(gpr::SI, step_index(state, gpr::SI, size));
        state.write_gpr16(gpr::DI, step_index(state, gpr::DI, size));
        Ok(())
    })
}

fn exec_string_stos(
    state: &mut CpuState,
    bus: &mut impl CpuBus,
    prefixes: &Prefixes,
    opcode: u8,
    instr_start_ip: u16,
) -> Result<StepExit, Exception> {
    let is_byte = opcode == 0xAA;
    let dst_seg = state.segments.es;
    let size = if is_byte { 1 } else { 2 };
    run_string_op(state, prefixes.rep, instr_start_ip, false, |state| {
        let di = state.read_gpr16(gpr::DI);
        if is_byte {
            bus.write_u8(dst_seg.base.wrapping_add(di as u32), state.read_gpr8(0))?;
        } else {
            bus.write_u16(
                dst_seg.base.wrapping_add(di as u32),
                state.read_gpr16(gpr::AX),
            )?;
        }
        state.write_gpr16(gpr::DI, step_index(state, gpr::DI, size));
        Ok(())
    })
}

fn exec_string_lods(
    state: &mut CpuState,
    bus: &mut impl CpuBus,
    prefixes: &Prefixes,
    opcode: u8,
    instr_start_ip: u16,
) -> Result<StepExit, Exception> {
    let is_byte = opcode == 0xAC;
    let (src_seg, _) = string_segments(state, prefixes);
    let size = if is_byte { 1 } else { 2 };
    run_string_op(state, prefixes.rep, instr_start_ip, false, |state| {
        let si = state.read_gpr16(gpr::SI);
        if is_byte {
            let v = bus.read_u8(src_seg.base.wrapping_add(si as u32))?;
            state.write_gpr8(0, v);
        } else {
            let v = bus.read_u16(src_seg.base.wrapping_add(si as u32))?;
            state.write_gpr16(gpr::AX, v);
        }
        state.write_gpr16(gpr::SI, step_index(state, gpr::SI, size));
        Ok(())
    })
}

fn exec_string_cmps(
    state: &mut CpuState,
    bus: &mut impl CpuBus,
    prefixes: &Prefixes,
    opcode: u8,
    instr_start_ip: u16,
) -> Result<StepExit, Exception> {
    let is_byte = opcode == 0xA6;
    let (src_seg, dst_seg) = string_segments(state, prefixes);
    let size = if is_byte { 1 } else { 2 };
    run_string_op(state, prefixes.rep, instr_start_ip, true, |state| {
        let si = state.read_gpr16(gpr::SI);
        let di = state.read_gpr16(gpr::DI);
        if is_byte {
            let a = bus.read_u8(src_seg.base.wrapping_add(si as u32))?;
            let b = bus.read_u8(dst_seg.base.wrapping_add(di as u32))?;
            alu::sub8(state, a, b, false);
        } else {
            let a = bus.read_u16(src_seg.base.wrapping_add(si as u32))?;
            let b = bus.read_u16(dst_seg.base.wrapping_add(di as u32))?;
            alu::sub16(state, a, b, false);
        }
        state.write_gpr16(gpr::SI, step_index(state, gpr::SI, size));
        state.write_gpr16(gpr::DI, step_index(state, gpr::DI, size));
        Ok(())
    })
}

fn exec_string_scas(
    state: &mut CpuState,
    bus: &mut impl CpuBus,
    prefixes: &Prefixes,
    opcode: u8,
    instr_start_ip: u16,
) -> Result<StepExit, Exception> {
    let is_byte = opcode == 0xAE;
    let dst_seg = state.segments.es;
    let size = if is_byte { 1 } else { 2 };
    run_string_op(state, prefixes.rep, instr_start_ip, true, |state| {
        let di = state.read_gpr16(gpr::DI);
        if is_byte {
            let a = state.read_gpr8(0);
            let b = bus.read_u8(dst_seg.base.wrapping_add(di as u32))?;
            alu::sub8(state, a, b, false);
        } else {
            let a = state.read_gpr16(gpr::AX);
            let b = bus.read_u16(dst_seg.base.wrapping_add(di as u32))?;
            alu::sub16(state, a, b, false);
        }
        state.write_gpr16(gpr::DI, step_index(state, gpr::DI, size));
        Ok(())
    })
}

fn exec_string_ins_outs(
    state: &mut CpuState,
    bus: &mut impl CpuBus,
    prefixes: &Prefixes,
    opcode: u8,
    instr_start_ip: u16,
) -> Result<StepExit, Exception> {
    if state.protected() && state.cpl() != 0 {
        return Err(Exception::GeneralProtection);
    }
    let is_byte = opcode == 0x6C || opcode == 0x6E;
    let is_in = opcode == 0x6C || opcode == 0x6D;
    let size = if is_byte { 1 } else { 2 };
    let (src_seg, dst_seg) = string_segments(state, prefixes);
    run_string_op(state, prefixes.rep, instr_start_ip, false, |state| {
        let port = state.read_gpr16(gpr::DX);
        if is_in {
            let di = state.read_gpr16(gpr::DI);
            if is_byte {
                let v = bus.in8(port);
                bus.write_u8(dst_seg.base.wrapping_add(di as u32), v)?;
            } else {
                let v = bus.in16(port);
                bus.write_u16(dst_seg.base.wrapping_add(di as u32), v)?;
            }
            state.write_gpr16(gpr::DI, step_index(state, gpr::DI, size));
        } else {
            let si = state.read_gpr16(gpr::SI);
            if is_byte {
                let v = bus.read_u8(src_seg.base.wrapping_add(si as u32))?;
                bus.out8(port, v);
            } else {
                let v = bus.read_u16(src_seg.base.wrapping_add(si as u32))?;
                bus.out16(port, v);
            }
            state.write_gpr16(gpr::SI, step_index(state, gpr::SI, size));
        }
        Ok(())
    })
}

// --- Two-byte (0F) opcodes: descriptor-table ops, LOADALL/STOREALL ----

fn exec_two_byte(
    state: &mut CpuState,
    bus: &mut impl CpuBus,
    prefixes: &Prefixes,
) -> Result<StepExit, Exception> {
    let mut f = Fetcher::new(state, bus);
    let opcode2 = f.u8()?;
    match opcode2 {
        0x00 => exec_grp6(state, bus, prefixes),
        0x01 => exec_grp7(state, bus, prefixes),
        0x04 => {
            exec_storeall(state, bus)?;
            Ok(StepExit::Continue)
        }
        0x05 => {
            exec_loadall(state, bus)?;
            Ok(StepExit::Continue)
        }
        0x0B => Err(Exception::InvalidOpcode),
        _ => Err(Exception::InvalidOpcode),
    }
}

fn exec_grp6(
    state: &mut CpuState,
    bus: &mut impl CpuBus,
    prefixes: &Prefixes,
) -> Result<StepExit, Exception> {
    if state.protected() && state.cpl() != 0 {
        return Err(Exception::GeneralProtection);
    }
    let mut f = Fetcher::new(state, bus);
    let modrm = read_modrm(&mut f)?;
    let ea = decode_ea(&mut f, prefixes, modrm)?;
    match modrm.reg {
        0 => {
            let sel = read_ea16(state, bus, ea)?;
            segment::load_ldtr(state, bus, sel)?;
        }
        1 => {
            let sel = read_ea16(state, bus, ea)?;
            segment::load_tr(state, bus, sel)?;
        }
        2 => write_ea16(state, bus, ea, state.tables.ldtr.selector)?,
        3 => write_ea16(state, bus, ea, state.tables.tr.selector)?,
        _ => return Err(Exception::InvalidOpcode),
    }
    Ok(StepExit::Continue)
}

fn exec_grp7(
    state: &mut CpuState,
    bus: &mut impl CpuBus,
    prefixes: &Prefixes,
) -> Result<StepExit, Exception> {
    let mut f = Fetcher::new(state, bus);
    let modrm = read_modrm(&mut f)?;
    let ea = decode_ea(&mut f, prefixes, modrm)?;
    let privileged = matches!(modrm.reg, 0 | 1 | 2 | 3 | 6);
    if privileged && state.protected() && state.cpl() != 0 {
        return Err(Exception::GeneralProtection);
    }
    match modrm.reg {
        0 | 1 => {
            let addr = match ea {
                Ea::Mem { seg, offset } => seg.base.wrapping_add(offset as u32),
                Ea::Reg(_) => return Err(Exception::InvalidOpcode),
            };
            let table = segment::read_pseudo_descriptor(bus, addr)?;
            if modrm.reg == 0 {
                state.tables.gdtr = table;
            } else {
                state.tables.idtr = table;
            }
        }
        2 | 3 => {
            let addr = match ea {
                Ea::Mem { seg, offset } => seg.base.wrapping_add(offset as u32),
                Ea::Reg(_) => return Err(Exception::InvalidOpcode),
            };
            let table = if modrm.reg == 2 {
                state.tables.gdtr
            } else {
                state.tables.idtr
            };
            segment::write_pseudo_descriptor(bus, addr, table)?;
        }
        4 => write_ea16(state, bus, ea, state.control.msw)?,
        6 => {
            let value = read_ea16(state, bus, ea)?;
            // LMSW can only ever set PE, never clear it; the other bits
            // are simply replaced.
            let was_protected = state.protected();
            let pe_was_set = state.control.msw & MSW_PE != 0;
            state.control.msw = value;
            if pe_was_set {
                state.control.msw |= MSW_PE;
            }
            if state.control.msw & MSW_PE != 0 {
                state.mode = CpuMode::Protected;
            }
            if !was_protected && state.protected() {
                // The 286 doesn't reload CS/DS/ES/SS through the descriptor
                // path on this transition; it just primes each cache from
                // the selector already sitting in the register, as if it
                // were still a real-mode shifted address.
                for seg in [
                    &mut state.segments.cs,
                    &mut state.segments.ds,
                    &mut state.segments.es,
                    &mut state.segments.ss,
                ] {
                    seg.base = (seg.selector as u32) << 4;
                    seg.limit = 0xFFFF;
                    seg.access = 0x93;
                }
            }
        }
        _ => return Err(Exception::InvalidOpcode),
    }
    Ok(StepExit::Continue)
}

/// `LOADALL` (0F 05): the 80286's undocumented bulk-load of every register
/// — including the raw descriptor caches — from a fixed 102-byte table at
/// physical address 0x800, bypassing normal descriptor validation
/// entirely. MSW is restored last and is not re-validated: if the frame
/// doesn't set PE the CPU silently drops back to real mode regardless of
/// what was true before the load.
fn exec_loadall(state: &mut CpuState, bus: &mut impl CpuBus) -> Result<(), Exception> {
    const BASE: u32 = 0x800;

    read_cache_into(bus, BASE + 0x1A, &mut state.segments.es)?;
    read_cache_into(bus, BASE + 0x20, &mut state.segments.cs)?;
    read_cache_into(bus, BASE + 0x26, &mut state.segments.ss)?;
    read_cache_into(bus, BASE + 0x2C, &mut state.segments.ds)?;

    state.write_gpr16(gpr::DI, bus.read_u16(BASE + 0x32)?);
    state.write_gpr16(gpr::SI, bus.read_u16(BASE + 0x34)?);
    state.write_gpr16(gpr::BP, bus.read_u16(BASE + 0x36)?);
    state.write_gpr16(gpr::SP, bus.read_u16(BASE + 0x38)?);
    state.write_gpr16(gpr::BX, bus.read_u16(BASE + 0x3A)?);
    state.write_gpr16(gpr::DX, bus.read_u16(BASE + 0x3C)?);
    state.write_gpr16(gpr::CX, bus.read_u16(BASE + 0x3E)?);
    state.write_gpr16(gpr::AX, bus.read_u16(BASE + 0x40)?);

    state.flags = bus.read_u16(BASE + 0x42)?;
    state.ip = bus.read_u16(BASE + 0x44)?;
    state.tables.ldtr.selector = bus.read_u16(BASE + 0x46)?;

    state.segments.ds.selector = bus.read_u16(BASE + 0x48)?;
    state.segments.ss.selector = bus.read_u16(BASE + 0x4A)?;
    state.segments.cs.selector = bus.read_u16(BASE + 0x4C)?;
    state.segments.es.selector = bus.read_u16(BASE + 0x4E)?;

    state.tables.tr.selector = bus.read_u16(BASE + 0x54)?;

    state.tables.gdtr.limit = bus.read_u16(BASE + 0x56)?;
    state.tables.gdtr.base = read_24bit_base(bus, BASE + 0x58)?;
    state.tables.idtr.limit = bus.read_u16(BASE + 0x5C)?;
    state.tables.idtr.base = read_24bit_base(bus, BASE + 0x5E)?;

    // MSW is restored last and is not re-validated against PE: if the
    // frame doesn't set it the CPU silently drops back to real mode
    // regardless of what was true before the load.
    let msw = bus.read_u16(BASE + 0x66)?;
    state.control.msw = msw;
    state.mode = if msw & MSW_PE != 0 {
        CpuMode::Protected
    } else {
        CpuMode::Real
    };
    Ok(())
}

fn read_24bit_base(bus: &mut impl CpuBus, addr: u32) -> Result<u32, Exception> {
    let lo = bus.read_u8(addr)? as u32;
    let mid = bus.read_u8(addr + 1)? as u32;
    let hi = bus.read_u8(addr + 2)? as u32;
    Ok(lo | (mid << 8) | (hi << 16))
}

fn write_24bit_base(bus: &mut impl CpuBus, addr: u32, base: u32) -> Result<(), Exception> {
    bus.write_u8(addr, (base & 0xFF) as u8)?;
    bus.write_u8(addr + 1, ((base >> 8) & 0xFF) as u8)?;
    bus.write_u8(addr + 2, ((base >> 16) & 0xFF) as u8)
}

/// A `LOADALL`/`STOREALL` segment cache entry: a one-byte access rights
/// byte, a 24-bit base, and a 16-bit limit, in that address order.
fn read_cache_into(
    bus: &mut impl CpuBus,
    addr: u32,
    seg: &mut SegmentReg,
) -> Result<(), Exception> {
    seg.access = bus.read_u8(addr)?;
    seg.base = read_24bit_base(bus, addr + 1)?;
    seg.limit = bus.read_u16(addr + 4)?;
    Ok(())
}

fn write_cache_from(bus: &mut impl CpuBus, addr: u32, seg: &SegmentReg) -> Result<(), Exception> {
    bus.write_u8(addr, seg.access)?;
    write_24bit_base(bus, addr + 1, seg.base)?;
    bus.write_u16(addr + 4, seg.limit)
}

/// `STOREALL` (0F 04): the inverse of `LOADALL`, writing the same
/// frame back out so a debugger or BIOS routine can inspect the live
/// descriptor caches.
fn exec_storeall(state: &mut CpuState, bus: &mut impl CpuBus) -> Result<(), Exception> {
    const BASE: u32 = 0x800;

    write_cache_from(bus, BASE + 0x1A, &state.segments.es)?;
    write_cache_from(bus, BASE + 0x20, &state.segments.cs)?;
    write_cache_from(bus, BASE + 0x26, &state.segments.ss)?;
    write_cache_from(bus, BASE + 0x2C, &state.segments.ds)?;

    bus.write_u16(BASE + 0x32, state.read_gpr16(gpr::DI))?;
    bus.write_u16(BASE + 0x34, state.read_gpr16(gpr::SI))?;
    bus.write_u16(BASE + 0x36, state.read_gpr16(gpr::BP))?;
    bus.write_u16(BASE + 0x38, state.read_gpr16(gpr::SP))?;
    bus.write_u16(BASE + 0x3A, state.read_gpr16(gpr::BX))?;
    bus.write_u16(BASE + 0x3C, state.read_gpr16(gpr::DX))?;
    bus.write_u16(BASE + 0x3E, state.read_gpr16(gpr::CX))?;
    bus.write_u16(BASE + 0x40, state.read_gpr16(gpr::AX))?;

    bus.write_u16(BASE + 0x42, state.flags)?;
    bus.write_u16(BASE + 0x44, state.ip)?;
    bus.write_u16(BASE + 0x46, state.tables.ldtr.selector)?;

    bus.write_u16(BASE + 0x48, state.segments.ds.selector)?;
    bus.write_u16(BASE + 0x4A, state.segments.ss.selector)?;
    bus.write_u16(BASE + 0x4C, state.segments.cs.selector)?;
    bus.write_u16(BASE + 0x4E, state.segments.es.selector)?;

    bus.write_u16(BASE + 0x54, state.tables.tr.selector)?;

    bus.write_u16(BASE + 0x56, state.tables.gdtr.limit)?;
    write_24bit_base(bus, BASE + 0x58, state.tables.gdtr.base)?;
    bus.write_u16(BASE + 0x5C, state.tables.idtr.limit)?;
    write_24bit_base(bus, BASE + 0x5E, state.tables.idtr.base)?;

    bus.write_u16(BASE + 0x66, state.control.msw)?;
    Ok(())
}

// --- x87 ESC dispatch ---------------------------------------------------

fn exec_esc(
    state: &mut CpuState,
    fpu: &mut Fpu,
    bus: &mut impl CpuBus,
    prefixes: &Prefixes,
    opcode: u8,
) -> Result<(), Exception> {
    if state.control.msw & MSW_TS != 0 {
        return Err(Exception::DeviceNotAvailable);
    }
    let _ = state.control.msw & MSW_EM; // EM alone does not gate dispatch in this design; see DESIGN.md.
    let mut f = Fetcher::new(state, bus);
    let modrm = read_modrm(&mut f)?;
    let ea = decode_ea(&mut f, prefixes, modrm)?;
    let is_reg_form = matches!(ea, Ea::Reg(_));

    match (opcode, modrm.reg, is_reg_form) {
        (0xD9, 0, _) if !is_reg_form => {
            let value = fpu_load_operand(state, fpu, bus, ea, opcode)?;
            fpu.push(value);
        }
        (0xD9, 2, _) if !is_reg_form => {
            let v = fpu.st(0);
            fpu_store_operand(state, bus, ea, opcode, v, 0)?;
        }
        (0xD9, 3, _) if !is_reg_form => {
            let v = fpu.pop();
            fpu_store_operand(state, bus, ea, opcode, v, 0)?;
        }
        (0xD9, 5, _) if !is_reg_form => {
            if let Ea::Mem { seg, offset } = ea {
                let cw = bus.read_u16(seg.base.wrapping_add(offset as u32))?;
                fpu.set_control_word(cw);
            }
        }
        (0xD9, 7, _) if !is_reg_form => {
            if let Ea::Mem { seg, offset } = ea {
                bus.write_u16(seg.base.wrapping_add(offset as u32), fpu.control_word())?;
            }
        }
        (0xD9, 0, true) => fpu.push(fpu.st(ea_index(ea))),
        (0xD9, 1, true) => fpu.fxch(ea_index(ea)),
        (0xD9, 4, true) if is_reg_form => exec_fpu_d9_e(fpu, modrm.rm),
        (0xD9, 5, true) => exec_fpu_constant(fpu, modrm.rm),
        (0xD9, 6, true) => exec_fpu_d9_f_low(fpu, modrm.rm),
        (0xD9, 7, true) => exec_fpu_d9_f_high(fpu, modrm.rm),
        (0xDB, 4, true) if modrm.rm == 3 => fpu.finit(),
        (0xDB, 4, true) if modrm.rm == 2 => fpu.fclex(),
        (0xDD, 0, _) if !is_reg_form => {
            let value = fpu_load_operand(state, fpu, bus, ea, opcode)?;
            fpu.push(value);
        }
        (0xDD, 2, _) if !is_reg_form => {
            let v = fpu.st(0);
            fpu_store_operand(state, bus, ea, opcode, v, 0)?;
        }
        (0xDD, 3, _) if !is_reg_form => {
            let v = fpu.pop();
            fpu_store_operand(state, bus, ea, opcode, v, 0)?;
        }
        (0xDD, 7, _) if !is_reg_form => {
            if let Ea::Mem { seg, offset } = ea {
                bus.write_u16(seg.base.wrapping_add(offset as u32), fpu.status_word_for_ax())?;
            }
        }
        (0xDB, 0, _) if !is_reg_form => {
            let value = fpu_load_operand(state, fpu, bus, ea, opcode)?;
            fpu.push(value);
        }
        (0xDB, 2, _) if !is_reg_form => {
            let v = fpu.st(0);
            fpu_store_integer_operand(bus, ea, opcode, v)?;
        }
        (0xDB, 3, _) if !is_reg_form => {
            let v = fpu.pop();
            fpu_store_integer_operand(bus, ea, opcode, v)?;
        }
        (0xDF, 0, _) if !is_reg_form => {
            let value = fpu_load_operand(state, fpu, bus, ea, opcode)?;
            fpu.push(value);
        }
        (0xDF, 2, _) if !is_reg_form => {
            let v = fpu.st(0);
            fpu_store_integer_operand(bus, ea, opcode, v)?;
        }
        (0xDF, 3, _) if !is_reg_form => {
            let v = fpu.pop();
            fpu_store_integer_operand(bus, ea, opcode, v)?;
        }
        (0xDF, 4, true) if modrm.rm == 0 => {
            state.write_gpr16(gpr::AX, fpu.status_word_for_ax());
        }
        (0xD8 | 0xDC, reg, _) => {
            let op = match reg {
                0 => FpuArithOp::Add,
                1 => FpuArithOp::Mul,
                4 => FpuArithOp::Sub,
                5 => FpuArithOp::SubR,
                6 => FpuArithOp::Div,
                7 => FpuArithOp::DivR,
                _ => return Err(Exception::InvalidOpcode),
            };
            let rhs = if is_reg_form {
                fpu.st(ea_index(ea))
            } else {
                fpu_load_operand(state, fpu, bus, ea, opcode)?
            };
            let lhs = fpu.st(0);
            let result = fpu.arith(op, lhs, rhs);
            fpu.store(0, result);
        }
        (0xDE, reg, true) => {
            let op = match reg {
                0 => FpuArithOp::Add,
                1 => FpuArithOp::Mul,
                4 => FpuArithOp::Sub,
                5 => FpuArithOp::SubR,
                6 => FpuArithOp::Div,
                7 => FpuArithOp::DivR,
                _ => return Err(Exception::InvalidOpcode),
            };
            let rhs = fpu.st(0);
            let lhs = fpu.st(ea_index(ea));
            let result = fpu.arith(op, lhs, rhs);
            fpu.pop();
            fpu.store(0, result);
        }
        _ => {} // Unhandled ESC encodings are accepted as no-ops rather than faulting.
    }
    Ok(())
}

fn ea_index(ea: Ea) -> u8 {
    match ea {
        Ea::Reg(r) => r,
        Ea::Mem { .. } => 0,
    }
}

fn exec_fpu_d9_e(fpu: &mut Fpu, rm: u8) {
    match rm {
        0 => fpu.fchs(0),
        1 => fpu.fabs(0),
        4 => {
            fpu.ftst(0);
        }
        5 => {
            fpu.fxam(0);
        }
        _ => {}
    }
}

fn exec_fpu_constant(fpu: &mut Fpu, rm: u8) {
    match rm {
        0 => fpu.fld1(),
        1 => fpu.fldl2t(),
        2 => fpu.fldl2e(),
        3 => fpu.fldpi(),
        4 => fpu.fldlg2(),
        5 => fpu.fldln2(),
        6 => fpu.fldz(),
        _ => {}
    }
}

fn exec_fpu_d9_f_low(fpu: &mut Fpu, rm: u8) {
    match rm {
        0 => fpu.f2xm1(),
        1 => fpu.fyl2x(),
        2 => fpu.fptan(),
        3 => fpu.fpatan(),
        4 => fpu.fxtract(),
        5 => fpu.fprem1(),
        6 => fpu.fdecstp(),
        7 => fpu.fincstp(),
        _ => {}
    }
}

fn exec_fpu_d9_f_high(fpu: &mut Fpu, rm: u8) {
    match rm {
        0 => fpu.fprem(),
        1 => fpu.fyl2xp1(),
        2 => fpu.fsqrt(0),
        3 => fpu.fsincos(),
        4 => fpu.frndint(0),
        5 => fpu.fscale(),
        6 => fpu.fsin(0),
        7 => fpu.fcos(0),
        _ => {}
    }
}

fn fpu_load_operand(
    state: &mut CpuState,
    _fpu: &Fpu,
    bus: &mut impl CpuBus,
    ea: Ea,
    opcode: u8,
) -> Result<f64, Exception> {
    let Ea::Mem { seg, offset } = ea else {
        return Ok(0.0);
    };
    let addr = seg.base.wrapping_add(offset as u32);
    let _ = state;
    Ok(match opcode {
        0xD9 => f32::from_bits(bus.read_u32(addr)?) as f64,
        0xDD => f64::from_bits(
            (bus.read_u32(addr)? as u64) | ((bus.read_u32(addr + 4)? as u64) << 32),
        ),
        0xDB => bus.read_u32(addr)? as i32 as f64,
        0xDF => bus.read_u16(addr)? as i16 as f64,
        _ => 0.0,
    })
}

/// Stores ST(0) as a truncated-to-nearest integer for the `DB`/`DF`
/// memory forms (`FIST`/`FISTP`). Doesn't honor the control word's
/// rounding mode; always rounds to nearest.
fn fpu_store_integer_operand(
    bus: &mut impl CpuBus,
    ea: Ea,
    opcode: u8,
    value: f64,
) -> Result<(), Exception> {
    let Ea::Mem { seg, offset } = ea else {
        return Ok(());
    };
    let addr = seg.base.wrapping_add(offset as u32);
    let rounded = value.round();
    match opcode {
        0xDB => bus.write_u32(addr, rounded as i32 as u32),
        0xDF => bus.write_u16(addr, rounded as i16 as u16),
        _ => Ok(()),
    }
}

fn fpu_store_operand(
    state: &mut CpuState,
    bus: &mut impl CpuBus,
    ea: Ea,
    opcode: u8,
    value: f64,
    _unused: u8,
) -> Result<(), Exception> {
    let Ea::Mem { seg, offset } = ea else {
        return Ok(());
    };
    let addr = seg.base.wrapping_add(offset as u32);
    let _ = state;
    match opcode {
        0xD9 => bus.write_u32(addr, (value as f32).to_bits()),
        0xDD => {
            let bits = value.to_bits();
            bus.write_u32(addr, bits as u32)?;
            bus.write_u32(addr + 4, (bits >> 32) as u32)
        }
        _ => Ok(()),
    }
}
