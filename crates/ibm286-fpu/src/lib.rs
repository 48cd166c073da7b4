//! x87-style floating point unit: an 8-deep register stack with a rotating
//! top-of-stack, addressed relative to the current top (component F).

mod stack;
mod status;

pub use stack::Tag;

use status::{CW_RESET, SW_RESET, TW_RESET};

/// Stack over/underflow, and the transcendental domain checks, are the only
/// two exception classes this unit tracks; everything else is recorded in
/// the status word but never escalated, matching the 80287's masked-by-
/// default exception model with no unmasked-trap delivery in scope.
const SW_IE: u16 = 1 << 0;
const SW_DE: u16 = 1 << 1;
const SW_ZE: u16 = 1 << 2;
const SW_OE: u16 = 1 << 3;
const SW_UE: u16 = 1 << 4;
const SW_PE: u16 = 1 << 5;
const SW_SF: u16 = 1 << 6;
const SW_C0: u16 = 1 << 8;
const SW_C1: u16 = 1 << 9;
const SW_C2: u16 = 1 << 10;
const SW_TOP_SHIFT: u16 = 11;
const SW_TOP_MASK: u16 = 0b111 << SW_TOP_SHIFT;
const SW_C3: u16 = 1 << 14;

const NEG_NAN: f64 = f64::NAN;

/// One of the six dyadic arithmetic operations shared by the `ST(0)⊙ST(i)`,
/// `ST(i)⊙ST(0)`, and `ST(i)⊙ST(0)` (with pop) opcode forms.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    /// Reverse subtract: `b - a`.
    SubR,
    Mul,
    Div,
    /// Reverse divide: `b / a`.
    DivR,
}

/// Result of a comparison, carried back to the caller so it can steer a
/// conditional jump built on top of C0/C2/C3 without re-decoding the status
/// word itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ordering3 {
    Less,
    Equal,
    Greater,
    Unordered,
}

pub struct Fpu {
    stack: stack::Stack,
    cw: u16,
    sw: u16,
    last_ip: u32,
    last_cs: u16,
    last_opcode: u16,
    last_dp: u32,
    last_ds: u16,
}

impl Default for Fpu {
    fn default() -> Self {
        Self::new()
    }
}

impl Fpu {
    pub fn new() -> Self {
        let mut fpu = Self {
            stack: stack::Stack::new(),
            cw: 0,
            sw: 0,
            last_ip: 0,
            last_cs: 0,
            last_opcode: 0,
            last_dp: 0,
            last_ds: 0,
        };
        fpu.finit();
        fpu
    }

    /// `FINIT`/`FNINIT`: control word 0x037F, status word 0, tag word all
    /// empty.
    pub fn finit(&mut self) {
        self.cw = CW_RESET;
        self.sw = SW_RESET;
        self.stack = stack::Stack::new();
        self.stack.set_tag_word(TW_RESET);
        self.last_ip = 0;
        self.last_cs = 0;
        self.last_opcode = 0;
        self.last_dp = 0;
        self.last_ds = 0;
    }

    /// `FCLEX`/`FNCLEX`: clears the exception flags and the busy bit,
    /// leaving the condition codes and top-of-stack pointer untouched.
    pub fn fclex(&mut self) {
        self.sw &= !(SW_IE | SW_DE | SW_ZE | SW_OE | SW_UE | SW_PE | SW_SF | 0x8000);
    }

    pub fn control_word(&self) -> u16 {
        self.cw
    }

    pub fn set_control_word(&mut self, cw: u16) {
        self.cw = cw;
    }

    pub fn status_word(&self) -> u16 {
        self.sw
    }

    pub fn set_status_word(&mut self, sw: u16) {
        self.sw = sw;
    }

    pub fn tag_word(&self) -> u16 {
        self.stack.tag_word()
    }

    pub fn set_tag_word(&mut self, tw: u16) {
        self.stack.set_tag_word(tw);
    }

    pub fn top(&self) -> u8 {
        ((self.sw & SW_TOP_MASK) >> SW_TOP_SHIFT) as u8
    }

    fn set_top(&mut self, top: u8) {
        self.sw = (self.sw & !SW_TOP_MASK) | ((top as u16 & 0b111) << SW_TOP_SHIFT);
    }

    fn set_c1(&mut self, value: bool) {
        if value {
            self.sw |= SW_C1;
        } else {
            self.sw &= !SW_C1;
        }
    }

    fn raise(&mut self, flags: u16) {
        self.sw |= flags;
    }

    pub fn last_instruction_pointer(&self) -> (u16, u32) {
        (self.last_cs, self.last_ip)
    }

    pub fn set_last_instruction_pointer(&mut self, cs: u16, ip: u32, opcode: u16) {
        self.last_cs = cs;
        self.last_ip = ip;
        self.last_opcode = opcode;
    }

    pub fn last_data_pointer(&self) -> (u16, u32) {
        (self.last_ds, self.last_dp)
    }

    pub fn set_last_data_pointer(&mut self, ds: u16, addr: u32) {
        self.last_ds = ds;
        self.last_dp = addr;
    }

    /// Reads logical register `ST(i)` without altering the stack. Reading an
    /// empty slot is itself a stack-underflow condition: it raises IE|SF,
    /// clears C1, and yields the real indefinite.
    pub fn st(&mut self, i: u8) -> f64 {
        let phys = self.stack.physical(self.top(), i);
        if self.stack.tag(phys) == Tag::Empty {
            self.raise(SW_IE | SW_SF);
            self.set_c1(false);
            return NEG_NAN;
        }
        self.stack.value(phys)
    }

    /// Peeks `ST(i)` without raising any exception, for diagnostics such as
    /// `FXAM` that must operate on empty registers too.
    pub fn peek(&self, i: u8) -> Option<f64> {
        let phys = self.stack.physical(self.top(), i);
        if self.stack.tag(phys) == Tag::Empty {
            None
        } else {
            Some(self.stack.value(phys))
        }
    }

    /// Overwrites `ST(i)` in place without moving the stack pointer, used by
    /// most arithmetic and transcendental forms to store their result.
    pub fn store(&mut self, i: u8, value: f64) {
        let phys = self.stack.physical(self.top(), i);
        self.stack.set_value(phys, value);
    }

    /// Pushes `value` onto the stack. On overflow (the target slot is not
    /// tagged empty) this sets IE|C1|SF and stores the real indefinite
    /// instead, leaving the previous occupant of that slot untouched in
    /// memory but visually replaced by the indefinite, matching the masked
    /// overflow response of a real 80287.
    pub fn push(&mut self, value: f64) {
        let new_top = self.top().wrapping_sub(1) & 7;
        let was_empty = self.stack.tag(new_top) == Tag::Empty;
        self.set_top(new_top);
        if was_empty {
            self.stack.set_value(new_top, value);
        } else {
            self.raise(SW_IE | SW_SF);
            self.set_c1(true);
            self.stack.set_value(new_top, NEG_NAN);
        }
    }

    /// Pops the top of the stack. On underflow (the slot is already empty)
    /// this sets IE|SF, clears C1, and yields the real indefinite without
    /// moving the stack pointer further than the one slot it already
    /// nominally advanced.
    pub fn pop(&mut self) -> f64 {
        let top = self.top();
        if self.stack.tag(top) == Tag::Empty {
            self.raise(SW_IE | SW_SF);
            self.set_c1(false);
            self.set_top((top + 1) & 7);
            return NEG_NAN;
        }
        let value = self.stack.value(top);
        self.stack.set_empty(top);
        self.set_top((top + 1) & 7);
        value
    }

    pub fn fdecstp(&mut self) {
        self.set_top(self.top().wrapping_sub(1) & 7);
    }

    pub fn fincstp(&mut self) {
        self.set_top((self.top() + 1) & 7);
    }

    pub fn fxch(&mut self, i: u8) {
        let a = self.st(0);
        let b = self.st(i);
        self.store(0, b);
        self.store(i, a);
    }

    /// Applies a dyadic arithmetic op, setting ZE on a masked divide by
    /// zero and IE on any operation that yields NaN from non-NaN operands.
    pub fn arith(&mut self, op: ArithOp, a: f64, b: f64) -> f64 {
        let was_nan = a.is_nan() || b.is_nan();
        if matches!(op, ArithOp::Div | ArithOp::DivR) {
            let divisor = if matches!(op, ArithOp::Div) { b } else { a };
            if divisor == 0.0 {
                self.raise(SW_ZE);
            }
        }
        let result = match op {
            ArithOp::Add => a + b,
            ArithOp::Sub => a - b,
            ArithOp::SubR => b - a,
            ArithOp::Mul => a * b,
            ArithOp::Div => a / b,
            ArithOp::DivR => b / a,
        };
        if result.is_nan() && !was_nan {
            self.raise(SW_IE);
        }
        result
    }

    pub fn fabs(&mut self, i: u8) {
        let v = self.st(i).abs();
        self.store(i, v);
    }

    pub fn fchs(&mut self, i: u8) {
        let v = -self.st(i);
        self.store(i, v);
    }

    pub fn fsqrt(&mut self, i: u8) {
        let v = self.st(i);
        if v < 0.0 {
            self.raise(SW_IE);
        }
        self.store(i, v.sqrt());
    }

    pub fn frndint(&mut self, i: u8) {
        let v = self.st(i).round_ties_even();
        self.store(i, v);
    }

    /// Compares `a` against `b` and sets C0/C3 (and clears C2) per the
    /// standard unordered/less/equal/greater table; an unordered compare
    /// also raises IE.
    pub fn compare(&mut self, a: f64, b: f64) -> Ordering3 {
        self.sw &= !(SW_C0 | SW_C2 | SW_C3);
        if a.is_nan() || b.is_nan() {
            self.raise(SW_C0 | SW_C2 | SW_C3 | SW_IE);
            return Ordering3::Unordered;
        }
        if a < b {
            self.raise(SW_C0);
            Ordering3::Less
        } else if a == b {
            self.raise(SW_C3);
            Ordering3::Equal
        } else {
            Ordering3::Greater
        }
    }

    pub fn ftst(&mut self, i: u8) -> Ordering3 {
        let a = self.st(i);
        self.compare(a, 0.0)
    }

    /// `FXAM`: classifies `ST(0)` (sign in C1, class in C0/C2/C3) without
    /// consuming it or raising a stack fault when it is empty.
    pub fn fxam(&mut self, i: u8) -> (bool, bool, bool, bool) {
        self.sw &= !(SW_C0 | SW_C1 | SW_C2 | SW_C3);
        match self.peek(i) {
            None => {
                self.raise(SW_C0 | SW_C3);
                (false, true, false, true)
            }
            Some(v) => {
                let negative = v.is_sign_negative();
                if negative {
                    self.raise(SW_C1);
                }
                let (c0, c2, c3) = if v.is_nan() {
                    (true, false, false)
                } else if v.is_infinite() {
                    (true, true, false)
                } else if v == 0.0 {
                    (false, false, true)
                } else {
                    (false, true, false)
                };
                if c0 {
                    self.raise(SW_C0);
                }
                if c2 {
                    self.raise(SW_C2);
                }
                if c3 {
                    self.raise(SW_C3);
                }
                (negative, c0, c2, c3)
            }
        }
    }

    pub fn fld1(&mut self) {
        self.push(1.0);
    }

    pub fn fldl2t(&mut self) {
        self.push(std::f64::consts::LOG2_10);
    }

    pub fn fldl2e(&mut self) {
        self.push(std::f64::consts::LOG2_E);
    }

    pub fn fldpi(&mut self) {
        self.push(std::f64::consts::PI);
    }

    pub fn fldlg2(&mut self) {
        self.push(std::f64::consts::LOG10_2);
    }

    pub fn fldln2(&mut self) {
        self.push(std::f64::consts::LN_2);
    }

    pub fn fldz(&mut self) {
        self.push(0.0);
    }

    /// `F2XM1`: `2^x - 1`. Defined over `[0, 0.5]`; outside that domain the
    /// hardware result is undefined, so out-of-range inputs raise IE and
    /// yield the real indefinite rather than guess at extended behavior.
    pub fn f2xm1(&mut self) {
        let x = self.st(0);
        if !(0.0..=0.5).contains(&x) {
            self.raise(SW_IE);
            self.store(0, NEG_NAN);
            return;
        }
        self.store(0, 2f64.powf(x) - 1.0);
    }

    pub fn fyl2x(&mut self) {
        let x = self.st(0);
        let y = self.st(1);
        if x <= 0.0 {
            self.raise(SW_IE);
        }
        let result = y * x.log2();
        self.pop();
        self.store(0, result);
    }

    /// `FYL2XP1`: `y * log2(x+1)`. Defined for `|x| < 1 - sqrt(2)/2`.
    pub fn fyl2xp1(&mut self) {
        let x = self.st(0);
        let y = self.st(1);
        const BOUND: f64 = 1.0 - std::f64::consts::FRAC_1_SQRT_2;
        if x.abs() >= BOUND {
            self.raise(SW_IE);
            self.pop();
            self.store(0, NEG_NAN);
            return;
        }
        let result = y * (x + 1.0).log2();
        self.pop();
        self.store(0, result);
    }

    /// `FPTAN`: pushes 1.0 then `tan(ST(0))` in its place, defined for
    /// `|x| < pi/4`; out of range sets C2 ("reduction incomplete") and
    /// leaves the stack untouched, matching the real hardware's partial
    /// argument-reduction failure mode rather than silently renormalizing.
    pub fn fptan(&mut self) {
        let x = self.st(0);
        if !x.is_finite() || x.abs() >= std::f64::consts::FRAC_PI_4 {
            self.raise(SW_C2);
            return;
        }
        self.sw &= !SW_C2;
        self.store(0, x.tan());
        self.push(1.0);
    }

    pub fn fpatan(&mut self) {
        let x = self.st(0);
        let y = self.st(1);
        let result = y.atan2(x);
        self.pop();
        self.store(0, result);
    }

    /// `FSIN`/`FCOS`/`FSINCOS`: argument reduction is exact for any finite
    /// double, so only a non-finite operand sets C2.
    pub fn fsin(&mut self, i: u8) {
        let x = self.st(i);
        if !x.is_finite() {
            self.raise(SW_C2);
            return;
        }
        self.sw &= !SW_C2;
        self.store(i, x.sin());
    }

    pub fn fcos(&mut self, i: u8) {
        let x = self.st(i);
        if !x.is_finite() {
            self.raise(SW_C2);
            return;
        }
        self.sw &= !SW_C2;
        self.store(i, x.cos());
    }

    pub fn fsincos(&mut self) {
        let x = self.st(0);
        if !x.is_finite() {
            self.raise(SW_C2);
            return;
        }
        self.sw &= !SW_C2;
        self.store(0, x.sin());
        self.push(x.cos());
    }

    pub fn fscale(&mut self) {
        let x = self.st(0);
        let y = self.st(1);
        self.store(0, x * 2f64.powi(y.trunc() as i32));
    }

    pub fn fprem(&mut self) {
        let x = self.st(0);
        let y = self.st(1);
        let q = (x / y).trunc();
        let r = x - y * q;
        self.set_c1((q as i64) & 1 != 0);
        self.sw &= !(SW_C2 | SW_C0 | SW_C3);
        self.store(0, r);
    }

    pub fn fprem1(&mut self) {
        let x = self.st(0);
        let y = self.st(1);
        let q = (x / y).round_ties_even();
        let r = x - y * q;
        self.set_c1((q as i64) & 1 != 0);
        self.sw &= !(SW_C2 | SW_C0 | SW_C3);
        self.store(0, r);
    }

    pub fn fxtract(&mut self) {
        let x = self.st(0);
        if x == 0.0 {
            self.store(0, 0.0);
            self.push(f64::NEG_INFINITY);
            return;
        }
        let exponent = x.abs().log2().floor();
        let significand = x / 2f64.powi(exponent as i32);
        self.store(0, exponent);
        self.push(significand);
    }

    /// `FSTSW AX`: the status word as it would be written to AX.
    pub fn status_word_for_ax(&self) -> u16 {
        self.sw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finit_resets_control_status_and_tag_words() {
        let mut fpu = Fpu::new();
        fpu.push(1.0);
        fpu.set_control_word(0);
        fpu.finit();
        assert_eq!(fpu.control_word(), 0x037F);
        assert_eq!(fpu.status_word(), 0);
        assert_eq!(fpu.tag_word(), 0xFFFF);
        assert_eq!(fpu.top(), 0);
    }

    #[test]
    fn eight_pushes_then_eight_pops_is_the_identity() {
        let mut fpu = Fpu::new();
        let values = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0];
        for v in values {
            fpu.push(v);
        }
        let mut popped = Vec::new();
        for _ in 0..8 {
            popped.push(fpu.pop());
        }
        popped.reverse();
        assert_eq!(popped, values);
        assert_eq!(fpu.status_word() & (SW_IE | SW_SF), 0);
    }

    #[test]
    fn ninth_push_overflows_and_yields_indefinite() {
        let mut fpu = Fpu::new();
        for i in 0..8 {
            fpu.push(i as f64);
        }
        fpu.push(99.0);
        assert!(fpu.st(0).is_nan());
        assert_ne!(fpu.status_word() & SW_IE, 0);
        assert_ne!(fpu.status_word() & SW_C1, 0);
        assert_ne!(fpu.status_word() & SW_SF, 0);
    }

    #[test]
    fn pop_of_empty_stack_underflows_and_yields_indefinite() {
        let mut fpu = Fpu::new();
        let result = fpu.pop();
        assert!(result.is_nan());
        assert_ne!(fpu.status_word() & SW_IE, 0);
        assert_eq!(fpu.status_word() & SW_C1, 0);
        assert_ne!(fpu.status_word() & SW_SF, 0);
    }

    #[test]
    fn compare_sets_condition_codes_per_ordering() {
        let mut fpu = Fpu::new();
        assert_eq!(fpu.compare(1.0, 2.0), Ordering3::Less);
        assert_ne!(fpu.status_word() & SW_C0, 0);
        assert_eq!(fpu.compare(2.0, 2.0), Ordering3::Equal);
        assert_ne!(fpu.status_word() & SW_C3, 0);
        assert_eq!(fpu.compare(3.0, 2.0), Ordering3::Greater);
        assert_eq!(fpu.status_word() & (SW_C0 | SW_C3), 0);
        assert_eq!(fpu.compare(f64::NAN, 2.0), Ordering3::Unordered);
        assert_ne!(fpu.status_word() & SW_IE, 0);
    }

    #[test]
    fn f2xm1_out_of_domain_raises_invalid_and_yields_indefinite() {
        let mut fpu = Fpu::new();
        fpu.push(3.0);
        fpu.f2xm1();
        assert!(fpu.st(0).is_nan());
        assert_ne!(fpu.status_word() & SW_IE, 0);
    }

    #[test]
    fn f2xm1_in_domain_matches_known_value() {
        let mut fpu = Fpu::new();
        fpu.push(0.5);
        fpu.f2xm1();
        let result = fpu.st(0);
        assert!((result - (2f64.sqrt() - 1.0)).abs() < 1e-12);
    }

    #[test]
    fn fptan_out_of_domain_sets_c2_without_touching_the_stack() {
        let mut fpu = Fpu::new();
        fpu.push(10.0);
        fpu.fptan();
        assert_ne!(fpu.status_word() & SW_C2, 0);
        assert_eq!(fpu.top(), 7);
    }

    #[test]
    fn divide_by_zero_sets_zero_divide_flag() {
        let mut fpu = Fpu::new();
        let result = fpu.arith(ArithOp::Div, 1.0, 0.0);
        assert!(result.is_infinite());
        assert_ne!(fpu.status_word() & SW_ZE, 0);
    }

    #[test]
    fn fxam_reports_empty_register_without_stack_fault() {
        let mut fpu = Fpu::new();
        let (_, c0, _, c3) = fpu.fxam(0);
        assert!(c0 && c3);
        assert_eq!(fpu.status_word() & SW_SF, 0);
    }
}
