//! Instruction-stream fetching, prefix handling, and the 16-bit ModRM
//! effective-address table.

use crate::bus::CpuBus;
use crate::exception::Exception;
use crate::state::{gpr, CpuState, SegmentReg};

/// Reads the instruction stream from CS:IP one byte at a time, advancing IP
/// as it goes so decode and fetch never fall out of sync.
pub struct Fetcher<'a, B: CpuBus> {
    pub state: &'a mut CpuState,
    pub bus: &'a mut B,
}

impl<'a, B: CpuBus> Fetcher<'a, B> {
    pub fn new(state: &'a mut CpuState, bus: &'a mut B) -> Self {
        Self { state, bus }
    }

    pub fn u8(&mut self) -> Result<u8, Exception> {
        let addr = self.state.segments.cs.base.wrapping_add(self.state.ip as u32);
        let byte = self.bus.read_u8(addr)?;
        self.state.ip = self.state.ip.wrapping_add(1);
        Ok(byte)
    }

    pub fn u16(&mut self) -> Result<u16, Exception> {
        let lo = self.u8()?;
        let hi = self.u8()?;
        Ok(u16::from_le_bytes([lo, hi]))
    }

    pub fn i8(&mut self) -> Result<i8, Exception> {
        Ok(self.u8()? as i8)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Prefixes {
    pub segment_override: Option<SegOverride>,
    pub rep: Option<Rep>,
    pub lock: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SegOverride {
    Es,
    Cs,
    Ss,
    Ds,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rep {
    /// `REPE`/`REPZ` (0xF3) — also the unconditional repeat for
    /// non-comparison string ops.
    RepE,
    /// `REPNE`/`REPNZ` (0xF2).
    RepNe,
}

/// Consumes prefix bytes (segment override, REP/REPNE, LOCK) and returns
/// the first non-prefix opcode byte along with what was seen. More than 10
/// prefix bytes in a row faults with a general-protection fault rather
/// than an invalid-opcode one.
pub fn read_prefixes<B: CpuBus>(f: &mut Fetcher<B>) -> Result<(Prefixes, u8), Exception> {
    let mut prefixes = Prefixes::default();
    for _ in 0..10 {
        let byte = f.u8()?;
        match byte {
            0x26 => prefixes.segment_override = Some(SegOverride::Es),
            0x2E => prefixes.segment_override = Some(SegOverride::Cs),
            0x36 => prefixes.segment_override = Some(SegOverride::Ss),
            0x3E => prefixes.segment_override = Some(SegOverride::Ds),
            0xF0 => prefixes.lock = true,
            0xF2 => prefixes.rep = Some(Rep::RepNe),
            0xF3 => prefixes.rep = Some(Rep::RepE),
            _ => return Ok((prefixes, byte)),
        }
    }
    Err(Exception::GeneralProtection)
}

impl Prefixes {
    pub fn segment(&self, state: &CpuState, default: SegOverride) -> SegmentReg {
        match self.segment_override.unwrap_or(default) {
            SegOverride::Es => state.segments.es,
            SegOverride::Cs => state.segments.cs,
            SegOverride::Ss => state.segments.ss,
            SegOverride::Ds => state.segments.ds,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ModRm {
    pub md: u8,
    pub reg: u8,
    pub rm: u8,
}

pub fn read_modrm<B: CpuBus>(f: &mut Fetcher<B>) -> Result<ModRm, Exception> {
    let byte = f.u8()?;
    Ok(ModRm {
        md: byte >> 6,
        reg: (byte >> 3) & 0b111,
        rm: byte & 0b111,
    })
}

/// Where a decoded ModRM operand lives: a register, or a memory location
/// given as a segment (already resolved against any override prefix) plus
/// a 16-bit offset.
#[derive(Clone, Copy, Debug)]
pub enum Ea {
    Reg(u8),
    Mem { seg: SegmentReg, offset: u16 },
}

/// Decodes the `rm`/`mod` fields of a ModRM byte the 80286 uses the 8086's
/// 16-bit addressing table for: `[BX+SI]`, `[BX+DI]`, `[BP+SI]`, `[BP+DI]`,
/// `[SI]`, `[DI]`, `disp16` (mod=00, rm=110), or `[BX]`, each optionally
/// plus disp8/disp16. Unlike the textbook 8086 rule, BP-relative modes
/// don't get an implicit default segment of SS here; the default stays DS
/// unless a segment-override prefix says otherwise.
pub fn decode_ea<B: CpuBus>(
    f: &mut Fetcher<B>,
    prefixes: &Prefixes,
    modrm: ModRm,
) -> Result<Ea, Exception> {
    if modrm.md == 0b11 {
        return Ok(Ea::Reg(modrm.rm));
    }

    let base_regs: u16 = match modrm.rm {
        0b000 => f
            .state
            .read_gpr16(gpr::BX)
            .wrapping_add(f.state.read_gpr16(gpr::SI)),
        0b001 => f
            .state
            .read_gpr16(gpr::BX)
            .wrapping_add(f.state.read_gpr16(gpr::DI)),
        0b010 => f
            .state
            .read_gpr16(gpr::BP)
            .wrapping_add(f.state.read_gpr16(gpr::SI)),
        0b011 => f
            .state
            .read_gpr16(gpr::BP)
            .wrapping_add(f.state.read_gpr16(gpr::DI)),
        0b100 => f.state.read_gpr16(gpr::SI),
        0b101 => f.state.read_gpr16(gpr::DI),
        0b110 if modrm.md == 0b00 => 0, // disp16 only, filled in below
        0b110 => f.state.read_gpr16(gpr::BP),
        0b111 => f.state.read_gpr16(gpr::BX),
        _ => unreachable!(),
    };

    let offset = match (modrm.md, modrm.rm) {
        (0b00, 0b110) => f.u16()?,
        (0b00, _) => base_regs,
        (0b01, _) => base_regs.wrapping_add(f.i8()? as i16 as u16),
        (0b10, _) => base_regs.wrapping_add(f.u16()?),
        _ => unreachable!(),
    };

    let seg = prefixes.segment(f.state, SegOverride::Ds);
    Ok(Ea::Mem { seg, offset })
}
