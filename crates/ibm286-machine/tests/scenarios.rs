//! End-to-end scenarios exercising the wired-together machine rather than
//! any single crate in isolation.

use ibm286_cpu::state::{gpr, FLAG_IF};
use ibm286_cpu::CpuBus;
use ibm286_machine::Machine;

fn new_machine() -> Machine {
    Machine::new(0x10_0000)
}

#[test]
fn s1_reset_vector() {
    let machine = new_machine();
    assert_eq!(machine.cpu.state.segments.cs.selector, 0xF000);
    assert_eq!(machine.cpu.state.ip, 0xFFF0);
    assert_eq!(machine.cpu.state.control.msw, 0xFFF0);
    assert_eq!(machine.cpu.state.tables.idtr.limit, 0x03FF);
    assert!(!machine.a20_enabled());
}

#[test]
fn s2_lmsw_enters_protected_mode_and_primes_segment_caches() {
    let mut machine = new_machine();
    machine.cpu.state.segments.cs.selector = 0x1000;
    machine.cpu.state.segments.cs.base = 0x10000;
    machine.cpu.state.segments.ds.selector = 0x2000;
    machine.cpu.state.segments.es.selector = 0x3000;
    machine.cpu.state.segments.ss.selector = 0x4000;
    machine.cpu.state.ip = 0;

    // LMSW with a memory operand, mod=00 rm=110 (disp16 only): 0F 01 /6.
    machine
        .bus
        .memory
        .write_bytes(0x10000, &[0x0F, 0x01, 0x36, 0x00, 0x02]);
    machine.bus.memory.write_u16(0x0200, 0x0001);

    machine.step().unwrap();

    assert!(machine.cpu.state.protected());
    for (selector, cache) in [
        (0x1000, &machine.cpu.state.segments.cs),
        (0x2000, &machine.cpu.state.segments.ds),
        (0x3000, &machine.cpu.state.segments.es),
        (0x4000, &machine.cpu.state.segments.ss),
    ] {
        assert_eq!(cache.base, (selector as u32) << 4);
        assert_eq!(cache.limit, 0xFFFF);
        assert_eq!(cache.access, 0x93);
    }
}

#[test]
fn s3_keyboard_irq_delivers_scancode_and_clears_output_full() {
    let mut machine = new_machine();
    // Command byte 0x45 (the power-on default) already has IRQ1 enabled.
    machine.inject_scancode(0x1E);
    assert_eq!(machine.bus.in8(0x60), 0x1E);
    // Status register (port 0x64) bit 0 is output-buffer-full; it should
    // have cleared after the read above drained the byte.
    assert_eq!(machine.bus.in8(0x64) & 0x01, 0);
}

#[test]
fn s4_cmos_checksum_reflects_new_sum() {
    let mut machine = new_machine();
    machine.bus.out8(0x70, 0x17);
    machine.bus.out8(0x71, 0x11);
    machine.bus.out8(0x70, 0x18);
    machine.bus.out8(0x71, 0x00);

    let sum: u16 = (0x10u8..=0x2D).map(|i| machine.cmos().raw(i) as u16).sum();
    assert_eq!(machine.cmos().raw(0x2E), (sum >> 8) as u8);
    assert_eq!(machine.cmos().raw(0x2F), (sum & 0xFF) as u8);
}

#[test]
fn s5_divide_by_zero_raises_int0_at_the_div_instructions_own_address() {
    let mut machine = new_machine();
    machine.cpu.state.segments.cs.selector = 0x1000;
    machine.cpu.state.segments.cs.base = 0x10000;
    machine.cpu.state.ip = 0;
    machine.cpu.state.segments.ss.base = 0x2_0000;
    machine.cpu.state.write_gpr16(gpr::SP, 0xFFFE);

    // IVT vector 0 -> handler at 0x3333:0x2222.
    machine.bus.memory.write_u16(0, 0x2222);
    machine.bus.memory.write_u16(2, 0x3333);

    // MOV AX,0xFF; MOV BL,0; DIV BL.
    machine
        .bus
        .memory
        .write_bytes(0x10000, &[0xB8, 0xFF, 0x00, 0xB3, 0x00, 0xF6, 0xF3]);

    machine.step().unwrap(); // MOV AX,0xFF
    machine.step().unwrap(); // MOV BL,0
    let div_ip = machine.cpu.state.ip;
    machine.step().unwrap(); // DIV BL -> #DE

    assert_eq!(machine.cpu.state.segments.cs.selector, 0x3333);
    assert_eq!(machine.cpu.state.ip, 0x2222);

    // The frame INT0 pushed onto the stack points back at the DIV opcode,
    // not past it.
    let sp = machine.cpu.state.read_gpr16(gpr::SP);
    let ss_base = machine.cpu.state.segments.ss.base;
    let pushed_ip = machine.bus.memory.read_u16(ss_base + sp as u32);
    let pushed_cs = machine.bus.memory.read_u16(ss_base + sp as u32 + 2);
    assert_eq!(pushed_ip, div_ip);
    assert_eq!(pushed_cs, 0x1000);
}

#[test]
fn s6_seven_flds_of_an_empty_st0_set_sf_without_an_all_ones_tag_word() {
    let mut machine = new_machine();
    machine.cpu.fpu.finit();
    for _ in 0..7 {
        let value = machine.cpu.fpu.st(0);
        machine.cpu.fpu.push(value);
    }
    let sw = machine.cpu.fpu.status_word();
    assert_ne!(sw & (1 << 6), 0, "SF must be set after stack-overflow push");
    assert_ne!(machine.cpu.fpu.tag_word(), 0xFFFF);
}

#[test]
fn pic_cascade_wakes_a_halted_cpu_via_irq1() {
    let mut machine = new_machine();
    machine.cpu.state.segments.cs.selector = 0;
    machine.cpu.state.segments.cs.base = 0;
    machine.cpu.state.ip = 0;
    machine.cpu.state.segments.ss.base = 0x2_0000;
    machine.cpu.state.write_gpr16(gpr::SP, 0xFFFE);
    machine.cpu.state.set_flag(FLAG_IF, true);

    // IVT vector 0x09 (PIC base 0x08 + IRQ1) -> handler at 0x4000:0x0000.
    machine.bus.memory.write_u16(0x09 * 4, 0x0000);
    machine.bus.memory.write_u16(0x09 * 4 + 2, 0x4000);

    machine.bus.ports.write8(0x20, 0x11);
    machine.bus.ports.write8(0x21, 0x08);
    machine.bus.ports.write8(0x21, 0x04);
    machine.bus.ports.write8(0x21, 0x01);
    machine.bus.ports.write8(0x21, 0x00);

    machine.bus.memory.write_bytes(0, &[0xF4]); // HLT
    machine.step().unwrap();
    assert!(machine.cpu.state.halted);

    machine.inject_scancode(0x1E);
    machine.step().unwrap();

    assert!(!machine.cpu.state.halted);
    assert_eq!(machine.cpu.state.segments.cs.selector, 0x4000);
    assert_eq!(machine.cpu.state.ip, 0x0000);
}
