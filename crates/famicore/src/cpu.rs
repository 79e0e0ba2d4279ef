//! CPU module - the Ricoh 2A03, a 6502 without decimal mode
//!
//! The interpreter works in whole instructions: consult the interrupt line,
//! fetch, decode through the opcode table, evaluate the addressing mode,
//! execute, account cycles. Unofficial opcodes are treated as fatal: the
//! CPU latches a crash flag and refuses to step further.

use std::fmt;

use crate::snapshot::{SnapshotError, SnapshotReader, SnapshotWriter};

/// NMI service routine pointer
pub const NMI_VECTOR: u16 = 0xFFFA;
/// Reset entry pointer
pub const RESET_VECTOR: u16 = 0xFFFC;
/// IRQ/BRK service routine pointer
pub const IRQ_VECTOR: u16 = 0xFFFE;

/// Memory the CPU executes against; implemented by the system bus and by
/// flat test memories.
pub trait CpuBus {
    /// Read a byte from the given address
    fn read(&mut self, address: u16) -> u8;
    /// Write a byte to the given address
    fn write(&mut self, address: u16, value: u8);

    /// Little-endian two-byte read with normal carry into the high byte.
    fn read16(&mut self, address: u16) -> u16 {
        let lo = self.read(address) as u16;
        let hi = self.read(address.wrapping_add(1)) as u16;
        lo | (hi << 8)
    }

    /// Whether a sprite DMA was triggered since the last call. The default
    /// suits memories with no DMA engine.
    fn take_dma_trigger(&mut self) -> bool {
        false
    }
}

/// Interrupt sources in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    Maskable,
    NonMaskable,
    Reset,
}

/// One latched interrupt request. Once armed, further maskable requests are
/// dropped until the CPU services the line; reset and NMI overwrite
/// whatever is pending.
#[derive(Debug, Clone, Default)]
pub struct InterruptLine {
    requested: Option<Interrupt>,
}

impl InterruptLine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&mut self, kind: Interrupt) {
        if self.requested.is_some() && kind == Interrupt::Maskable {
            return;
        }
        self.requested = Some(kind);
    }

    pub fn pending(&self) -> Option<Interrupt> {
        self.requested
    }

    pub fn clear(&mut self) {
        self.requested = None;
    }

    fn take(&mut self) -> Option<Interrupt> {
        self.requested.take()
    }
}

/// 2A03 register file
#[derive(Debug, Clone, Copy)]
pub struct Registers {
    pub a: u8,
    pub x: u8,
    pub y: u8,
    pub sp: u8,
    pub pc: u16,
}

impl Default for Registers {
    fn default() -> Self {
        Self {
            a: 0,
            x: 0,
            y: 0,
            sp: 0xFD, // after the three implicit pushes of a hardware reset
            pc: 0,
        }
    }
}

/// Packed processor status. The unused bit reads as 1 to every external
/// observer; the decimal bit is carried but has no arithmetic effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusFlags(u8);

impl StatusFlags {
    pub const CARRY: u8 = 0b0000_0001;
    pub const ZERO: u8 = 0b0000_0010;
    pub const INTERRUPT: u8 = 0b0000_0100;
    pub const DECIMAL: u8 = 0b0000_1000;
    pub const BREAK: u8 = 0b0001_0000;
    pub const UNUSED: u8 = 0b0010_0000;
    pub const OVERFLOW: u8 = 0b0100_0000;
    pub const NEGATIVE: u8 = 0b1000_0000;

    /// Exact unpack; only the unused bit is forced.
    pub fn unpack(value: u8) -> Self {
        Self(value | Self::UNUSED)
    }

    /// Packed byte as pushed to the stack or snapshotted.
    pub fn pack(&self) -> u8 {
        self.0 | Self::UNUSED
    }

    /// Status adopted from a stack pull: the break bit is not a real flag
    /// and is discarded.
    fn from_pull(value: u8) -> Self {
        Self((value | Self::UNUSED) & !Self::BREAK)
    }

    pub fn carry(&self) -> bool {
        self.0 & Self::CARRY != 0
    }

    pub fn zero(&self) -> bool {
        self.0 & Self::ZERO != 0
    }

    pub fn interrupt(&self) -> bool {
        self.0 & Self::INTERRUPT != 0
    }

    pub fn decimal(&self) -> bool {
        self.0 & Self::DECIMAL != 0
    }

    pub fn overflow(&self) -> bool {
        self.0 & Self::OVERFLOW != 0
    }

    pub fn negative(&self) -> bool {
        self.0 & Self::NEGATIVE != 0
    }

    fn set(&mut self, bit: u8, value: bool) {
        if value {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
        self.0 |= Self::UNUSED;
    }

    pub fn set_carry(&mut self, value: bool) {
        self.set(Self::CARRY, value);
    }

    pub fn set_zero(&mut self, value: bool) {
        self.set(Self::ZERO, value);
    }

    pub fn set_interrupt(&mut self, value: bool) {
        self.set(Self::INTERRUPT, value);
    }

    pub fn set_decimal(&mut self, value: bool) {
        self.set(Self::DECIMAL, value);
    }

    pub fn set_overflow(&mut self, value: bool) {
        self.set(Self::OVERFLOW, value);
    }

    pub fn set_negative(&mut self, value: bool) {
        self.set(Self::NEGATIVE, value);
    }
}

impl fmt::Display for StatusFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "C:{} Z:{} I:{} D:{} V:{} N:{}",
            self.carry() as u8,
            self.zero() as u8,
            self.interrupt() as u8,
            self.decimal() as u8,
            self.overflow() as u8,
            self.negative() as u8,
        )
    }
}

/// Operations, one per mnemonic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Adc, And, Asl, Bcc, Bcs, Beq, Bit, Bmi, Bne, Bpl, Brk, Bvc, Bvs, Clc,
    Cld, Cli, Clv, Cmp, Cpx, Cpy, Dec, Dex, Dey, Eor, Inc, Inx, Iny, Jmp,
    Jsr, Lda, Ldx, Ldy, Lsr, Nop, Ora, Pha, Php, Pla, Plp, Rol, Ror, Rti,
    Rts, Sbc, Sec, Sed, Sei, Sta, Stx, Sty, Tax, Tay, Tsx, Txa, Txs, Tya,
}

/// The thirteen addressing modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    ZeroPage,
    Relative,
    Implied,
    Absolute,
    Accumulator,
    Immediate,
    ZeroPageX,
    ZeroPageY,
    AbsoluteX,
    AbsoluteY,
    IndirectX,
    IndirectY,
    Indirect,
}

/// One row of the opcode table.
#[derive(Debug, Clone, Copy)]
pub struct Instruction {
    pub op: Op,
    pub mode: Mode,
    pub size: u8,
    pub cycles: u8,
}

const fn instr(op: Op, mode: Mode, size: u8, cycles: u8) -> Instruction {
    Instruction {
        op,
        mode,
        size,
        cycles,
    }
}

/// Decode an opcode byte. `None` is an unofficial opcode, which this core
/// treats as fatal.
pub fn decode(byte: u8) -> Option<Instruction> {
    use Mode::*;
    use Op::*;
    Some(match byte {
        0x69 => instr(Adc, Immediate, 2, 2),
        0x65 => instr(Adc, ZeroPage, 2, 3),
        0x75 => instr(Adc, ZeroPageX, 2, 4),
        0x6D => instr(Adc, Absolute, 3, 4),
        0x7D => instr(Adc, AbsoluteX, 3, 4),
        0x79 => instr(Adc, AbsoluteY, 3, 4),
        0x61 => instr(Adc, IndirectX, 2, 6),
        0x71 => instr(Adc, IndirectY, 2, 5),
        0x29 => instr(And, Immediate, 2, 2),
        0x25 => instr(And, ZeroPage, 2, 3),
        0x35 => instr(And, ZeroPageX, 2, 4),
        0x2D => instr(And, Absolute, 3, 4),
        0x3D => instr(And, AbsoluteX, 3, 4),
        0x39 => instr(And, AbsoluteY, 3, 4),
        0x21 => instr(And, IndirectX, 2, 6),
        0x31 => instr(And, IndirectY, 2, 5),
        0x0A => instr(Asl, Accumulator, 1, 2),
        0x06 => instr(Asl, ZeroPage, 2, 5),
        0x16 => instr(Asl, ZeroPageX, 2, 6),
        0x0E => instr(Asl, Absolute, 3, 6),
        0x1E => instr(Asl, AbsoluteX, 3, 7),
        0x90 => instr(Bcc, Relative, 2, 2),
        0xB0 => instr(Bcs, Relative, 2, 2),
        0xF0 => instr(Beq, Relative, 2, 2),
        0x24 => instr(Bit, ZeroPage, 2, 3),
        0x2C => instr(Bit, Absolute, 3, 4),
        0x30 => instr(Bmi, Relative, 2, 2),
        0xD0 => instr(Bne, Relative, 2, 2),
        0x10 => instr(Bpl, Relative, 2, 2),
        0x00 => instr(Brk, Implied, 1, 7),
        0x50 => instr(Bvc, Relative, 2, 2),
        0x70 => instr(Bvs, Relative, 2, 2),
        0x18 => instr(Clc, Implied, 1, 2),
        0xD8 => instr(Cld, Implied, 1, 2),
        0x58 => instr(Cli, Implied, 1, 2),
        0xB8 => instr(Clv, Implied, 1, 2),
        0xC9 => instr(Cmp, Immediate, 2, 2),
        0xC5 => instr(Cmp, ZeroPage, 2, 3),
        0xD5 => instr(Cmp, ZeroPageX, 2, 4),
        0xCD => instr(Cmp, Absolute, 3, 4),
        0xDD => instr(Cmp, AbsoluteX, 3, 4),
        0xD9 => instr(Cmp, AbsoluteY, 3, 4),
        0xC1 => instr(Cmp, IndirectX, 2, 6),
        0xD1 => instr(Cmp, IndirectY, 2, 5),
        0xE0 => instr(Cpx, Immediate, 2, 2),
        0xE4 => instr(Cpx, ZeroPage, 2, 3),
        0xEC => instr(Cpx, Absolute, 3, 4),
        0xC0 => instr(Cpy, Immediate, 2, 2),
        0xC4 => instr(Cpy, ZeroPage, 2, 3),
        0xCC => instr(Cpy, Absolute, 3, 4),
        0xC6 => instr(Dec, ZeroPage, 2, 5),
        0xD6 => instr(Dec, ZeroPageX, 2, 6),
        0xCE => instr(Dec, Absolute, 3, 6),
        0xDE => instr(Dec, AbsoluteX, 3, 7),
        0xCA => instr(Dex, Implied, 1, 2),
        0x88 => instr(Dey, Implied, 1, 2),
        0x49 => instr(Eor, Immediate, 2, 2),
        0x45 => instr(Eor, ZeroPage, 2, 3),
        0x55 => instr(Eor, ZeroPageX, 2, 4),
        0x4D => instr(Eor, Absolute, 3, 4),
        0x5D => instr(Eor, AbsoluteX, 3, 4),
        0x59 => instr(Eor, AbsoluteY, 3, 4),
        0x41 => instr(Eor, IndirectX, 2, 6),
        0x51 => instr(Eor, IndirectY, 2, 5),
        0xE6 => instr(Inc, ZeroPage, 2, 5),
        0xF6 => instr(Inc, ZeroPageX, 2, 6),
        0xEE => instr(Inc, Absolute, 3, 6),
        0xFE => instr(Inc, AbsoluteX, 3, 7),
        0xE8 => instr(Inx, Implied, 1, 2),
        0xC8 => instr(Iny, Implied, 1, 2),
        0x4C => instr(Jmp, Absolute, 3, 3),
        0x6C => instr(Jmp, Indirect, 3, 5),
        0x20 => instr(Jsr, Absolute, 3, 6),
        0xA9 => instr(Lda, Immediate, 2, 2),
        0xA5 => instr(Lda, ZeroPage, 2, 3),
        0xB5 => instr(Lda, ZeroPageX, 2, 4),
        0xAD => instr(Lda, Absolute, 3, 4),
        0xBD => instr(Lda, AbsoluteX, 3, 4),
        0xB9 => instr(Lda, AbsoluteY, 3, 4),
        0xA1 => instr(Lda, IndirectX, 2, 6),
        0xB1 => instr(Lda, IndirectY, 2, 5),
        0xA2 => instr(Ldx, Immediate, 2, 2),
        0xA6 => instr(Ldx, ZeroPage, 2, 3),
        0xB6 => instr(Ldx, ZeroPageY, 2, 4),
        0xAE => instr(Ldx, Absolute, 3, 4),
        0xBE => instr(Ldx, AbsoluteY, 3, 4),
        0xA0 => instr(Ldy, Immediate, 2, 2),
        0xA4 => instr(Ldy, ZeroPage, 2, 3),
        0xB4 => instr(Ldy, ZeroPageX, 2, 4),
        0xAC => instr(Ldy, Absolute, 3, 4),
        0xBC => instr(Ldy, AbsoluteX, 3, 4),
        0x4A => instr(Lsr, Accumulator, 1, 2),
        0x46 => instr(Lsr, ZeroPage, 2, 5),
        0x56 => instr(Lsr, ZeroPageX, 2, 6),
        0x4E => instr(Lsr, Absolute, 3, 6),
        0x5E => instr(Lsr, AbsoluteX, 3, 7),
        0xEA => instr(Nop, Implied, 1, 2),
        0x09 => instr(Ora, Immediate, 2, 2),
        0x05 => instr(Ora, ZeroPage, 2, 3),
        0x15 => instr(Ora, ZeroPageX, 2, 4),
        0x0D => instr(Ora, Absolute, 3, 4),
        0x1D => instr(Ora, AbsoluteX, 3, 4),
        0x19 => instr(Ora, AbsoluteY, 3, 4),
        0x01 => instr(Ora, IndirectX, 2, 6),
        0x11 => instr(Ora, IndirectY, 2, 5),
        0x48 => instr(Pha, Implied, 1, 3),
        0x08 => instr(Php, Implied, 1, 3),
        0x68 => instr(Pla, Implied, 1, 4),
        0x28 => instr(Plp, Implied, 1, 4),
        0x2A => instr(Rol, Accumulator, 1, 2),
        0x26 => instr(Rol, ZeroPage, 2, 5),
        0x36 => instr(Rol, ZeroPageX, 2, 6),
        0x2E => instr(Rol, Absolute, 3, 6),
        0x3E => instr(Rol, AbsoluteX, 3, 7),
        0x6A => instr(Ror, Accumulator, 1, 2),
        0x66 => instr(Ror, ZeroPage, 2, 5),
        0x76 => instr(Ror, ZeroPageX, 2, 6),
        0x6E => instr(Ror, Absolute, 3, 6),
        0x7E => instr(Ror, AbsoluteX, 3, 7),
        0x40 => instr(Rti, Implied, 1, 6),
        0x60 => instr(Rts, Implied, 1, 6),
        0xE9 => instr(Sbc, Immediate, 2, 2),
        0xE5 => instr(Sbc, ZeroPage, 2, 3),
        0xF5 => instr(Sbc, ZeroPageX, 2, 4),
        0xED => instr(Sbc, Absolute, 3, 4),
        0xFD => instr(Sbc, AbsoluteX, 3, 4),
        0xF9 => instr(Sbc, AbsoluteY, 3, 4),
        0xE1 => instr(Sbc, IndirectX, 2, 6),
        0xF1 => instr(Sbc, IndirectY, 2, 5),
        0x38 => instr(Sec, Implied, 1, 2),
        0xF8 => instr(Sed, Implied, 1, 2),
        0x78 => instr(Sei, Implied, 1, 2),
        0x85 => instr(Sta, ZeroPage, 2, 3),
        0x95 => instr(Sta, ZeroPageX, 2, 4),
        0x8D => instr(Sta, Absolute, 3, 4),
        0x9D => instr(Sta, AbsoluteX, 3, 5),
        0x99 => instr(Sta, AbsoluteY, 3, 5),
        0x81 => instr(Sta, IndirectX, 2, 6),
        0x91 => instr(Sta, IndirectY, 2, 6),
        0x86 => instr(Stx, ZeroPage, 2, 3),
        0x96 => instr(Stx, ZeroPageY, 2, 4),
        0x8E => instr(Stx, Absolute, 3, 4),
        0x84 => instr(Sty, ZeroPage, 2, 3),
        0x94 => instr(Sty, ZeroPageX, 2, 4),
        0x8C => instr(Sty, Absolute, 3, 4),
        0xAA => instr(Tax, Implied, 1, 2),
        0xA8 => instr(Tay, Implied, 1, 2),
        0xBA => instr(Tsx, Implied, 1, 2),
        0x8A => instr(Txa, Implied, 1, 2),
        0x9A => instr(Txs, Implied, 1, 2),
        0x98 => instr(Tya, Implied, 1, 2),
        _ => return None,
    })
}

/// Opcodes whose indexed forms pay the page-cross cycle. Stores and
/// read-modify-writes always take the worst case instead.
fn page_penalty_applies(op: Op) -> bool {
    matches!(
        op,
        Op::Adc
            | Op::And
            | Op::Cmp
            | Op::Eor
            | Op::Lda
            | Op::Ldx
            | Op::Ldy
            | Op::Ora
            | Op::Sbc
    )
}

/// Where an instruction's operand lives.
#[derive(Debug, Clone, Copy)]
enum Operand {
    None,
    Accumulator,
    Address(u16),
}

/// The 2A03 interpreter.
#[derive(Debug, Clone)]
pub struct Cpu {
    regs: Registers,
    status: StatusFlags,
    irq: InterruptLine,
    /// Stall cycles charged to the next step (DMA)
    pending_halt: u32,
    crashed: bool,
    total_cycles: u64,
}

impl Cpu {
    pub fn new() -> Self {
        Self {
            regs: Registers::default(),
            status: StatusFlags::unpack(0x24),
            irq: InterruptLine::new(),
            pending_halt: 0,
            crashed: false,
            total_cycles: 0,
        }
    }

    /// Power-on / reset: registers cleared, SP at $FD, interrupts disabled,
    /// PC loaded from the reset vector.
    pub fn reset(&mut self, bus: &mut impl CpuBus) {
        self.regs = Registers::default();
        self.status = StatusFlags::unpack(0x24);
        self.irq.clear();
        self.pending_halt = 0;
        self.crashed = false;
        self.regs.pc = bus.read16(RESET_VECTOR);
    }

    pub fn registers(&self) -> &Registers {
        &self.regs
    }

    pub fn status(&self) -> StatusFlags {
        self.status
    }

    pub fn crashed(&self) -> bool {
        self.crashed
    }

    pub fn total_cycles(&self) -> u64 {
        self.total_cycles
    }

    /// Record a pending interrupt, subject to the line's arbitration.
    pub fn request_interrupt(&mut self, kind: Interrupt) {
        self.irq.request(kind);
    }

    /// The interrupt line itself, handed to devices that raise IRQs.
    pub fn irq_line_mut(&mut self) -> &mut InterruptLine {
        &mut self.irq
    }

    /// Stall the CPU for external bus activity (sprite DMA).
    pub fn halt(&mut self, cycles: u32) {
        self.pending_halt += cycles;
    }

    /// Execute one instruction, or service a pending interrupt in its
    /// place. Returns the elapsed CPU cycles; 0 once the crash flag is set.
    pub fn step(&mut self, bus: &mut impl CpuBus) -> u32 {
        if self.crashed {
            return 0;
        }
        let mut cycles = std::mem::take(&mut self.pending_halt);

        if let Some(kind) = self.take_serviceable_interrupt() {
            cycles += self.service_interrupt(bus, kind);
            self.total_cycles += cycles as u64;
            return cycles;
        }

        let opaddr = self.regs.pc;
        let byte = bus.read(opaddr);
        let Some(ins) = decode(byte) else {
            self.crashed = true;
            log::warn!("game crashed, invalid opcode ${byte:02X} at ${opaddr:04X}");
            return 0;
        };

        let (operand, page_crossed) = self.operand(bus, ins.mode, opaddr);
        self.regs.pc = opaddr.wrapping_add(ins.size as u16);

        cycles += ins.cycles as u32;
        if page_crossed && page_penalty_applies(ins.op) {
            cycles += 1;
        }
        cycles += self.execute(bus, ins, operand, page_crossed);

        self.total_cycles += cycles as u64;
        if bus.take_dma_trigger() {
            // 513 stall cycles from an even cycle, 514 from an odd one.
            self.pending_halt += 513 + (self.total_cycles & 1) as u32;
        }
        cycles
    }

    /// Pull the pending request off the line. A maskable request found while
    /// the disable flag is set is consumed without being serviced.
    fn take_serviceable_interrupt(&mut self) -> Option<Interrupt> {
        let kind = self.irq.take()?;
        if kind == Interrupt::Maskable && self.status.interrupt() {
            return None;
        }
        Some(kind)
    }

    fn service_interrupt(&mut self, bus: &mut impl CpuBus, kind: Interrupt) -> u32 {
        match kind {
            Interrupt::Reset => {
                self.regs.pc = bus.read16(RESET_VECTOR);
                self.status.set_interrupt(true);
            }
            Interrupt::NonMaskable | Interrupt::Maskable => {
                let pc = self.regs.pc;
                self.push(bus, (pc >> 8) as u8);
                self.push(bus, pc as u8);
                // Hardware interrupts push with the break bit clear.
                self.push(bus, self.status.pack() & !StatusFlags::BREAK);
                self.status.set_interrupt(true);
                let vector = if kind == Interrupt::NonMaskable {
                    NMI_VECTOR
                } else {
                    IRQ_VECTOR
                };
                self.regs.pc = bus.read16(vector);
            }
        }
        7
    }

    // ------------------------------------------------------------------
    // Addressing

    /// Resolve the operand location and whether an indexed mode crossed a
    /// page boundary.
    fn operand(&mut self, bus: &mut impl CpuBus, mode: Mode, opaddr: u16) -> (Operand, bool) {
        let arg = opaddr.wrapping_add(1);
        match mode {
            Mode::Implied => (Operand::None, false),
            Mode::Accumulator => (Operand::Accumulator, false),
            Mode::Immediate => (Operand::Address(arg), false),
            Mode::ZeroPage => (Operand::Address(bus.read(arg) as u16), false),
            Mode::ZeroPageX => {
                let addr = bus.read(arg).wrapping_add(self.regs.x) as u16;
                (Operand::Address(addr), false)
            }
            Mode::ZeroPageY => {
                let addr = bus.read(arg).wrapping_add(self.regs.y) as u16;
                (Operand::Address(addr), false)
            }
            Mode::Absolute => (Operand::Address(bus.read16(arg)), false),
            Mode::AbsoluteX => {
                let base = bus.read16(arg);
                let addr = base.wrapping_add(self.regs.x as u16);
                (Operand::Address(addr), page_crossed(base, addr))
            }
            Mode::AbsoluteY => {
                let base = bus.read16(arg);
                let addr = base.wrapping_add(self.regs.y as u16);
                (Operand::Address(addr), page_crossed(base, addr))
            }
            Mode::IndirectX => {
                let ptr = bus.read(arg).wrapping_add(self.regs.x);
                (Operand::Address(self.zp_read16(bus, ptr)), false)
            }
            Mode::IndirectY => {
                let ptr = bus.read(arg);
                let base = self.zp_read16(bus, ptr);
                let addr = base.wrapping_add(self.regs.y as u16);
                (Operand::Address(addr), page_crossed(base, addr))
            }
            Mode::Indirect => {
                let ptr = bus.read16(arg);
                // 6502 quirk: the pointer's high byte is fetched from within
                // the same page, regardless of what region it lives in.
                let lo = bus.read(ptr) as u16;
                let hi = bus.read((ptr & 0xFF00) | (ptr.wrapping_add(1) & 0x00FF)) as u16;
                (Operand::Address(lo | (hi << 8)), false)
            }
            Mode::Relative => {
                let offset = bus.read(arg) as i8;
                let next = opaddr.wrapping_add(2);
                let target = next.wrapping_add(offset as u16);
                (Operand::Address(target), page_crossed(next, target))
            }
        }
    }

    /// Two-byte pointer read that wraps within the zero page.
    fn zp_read16(&self, bus: &mut impl CpuBus, ptr: u8) -> u16 {
        let lo = bus.read(ptr as u16) as u16;
        let hi = bus.read(ptr.wrapping_add(1) as u16) as u16;
        lo | (hi << 8)
    }

    // ------------------------------------------------------------------
    // Execution

    fn read_operand(&self, bus: &mut impl CpuBus, operand: Operand) -> u8 {
        match operand {
            Operand::Accumulator => self.regs.a,
            Operand::Address(addr) => bus.read(addr),
            Operand::None => 0,
        }
    }

    fn write_operand(&mut self, bus: &mut impl CpuBus, operand: Operand, value: u8) {
        match operand {
            Operand::Accumulator => self.regs.a = value,
            Operand::Address(addr) => bus.write(addr, value),
            Operand::None => {}
        }
    }

    /// Perform the operation. Returns extra cycles beyond the table value
    /// (taken branches only).
    fn execute(
        &mut self,
        bus: &mut impl CpuBus,
        ins: Instruction,
        operand: Operand,
        page_crossed: bool,
    ) -> u32 {
        match ins.op {
            Op::Adc => {
                let m = self.read_operand(bus, operand);
                self.adc(m);
            }
            Op::Sbc => {
                let m = self.read_operand(bus, operand);
                self.adc(m ^ 0xFF);
            }
            Op::And => {
                self.regs.a &= self.read_operand(bus, operand);
                self.set_zn(self.regs.a);
            }
            Op::Ora => {
                self.regs.a |= self.read_operand(bus, operand);
                self.set_zn(self.regs.a);
            }
            Op::Eor => {
                self.regs.a ^= self.read_operand(bus, operand);
                self.set_zn(self.regs.a);
            }
            Op::Asl => {
                let v = self.read_operand(bus, operand);
                let r = v << 1;
                self.status.set_carry(v & 0x80 != 0);
                self.write_operand(bus, operand, r);
                self.set_zn(r);
            }
            Op::Lsr => {
                let v = self.read_operand(bus, operand);
                let r = v >> 1;
                self.status.set_carry(v & 0x01 != 0);
                self.write_operand(bus, operand, r);
                self.set_zn(r);
            }
            Op::Rol => {
                let v = self.read_operand(bus, operand);
                let r = (v << 1) | self.status.carry() as u8;
                self.status.set_carry(v & 0x80 != 0);
                self.write_operand(bus, operand, r);
                self.set_zn(r);
            }
            Op::Ror => {
                let v = self.read_operand(bus, operand);
                let r = (v >> 1) | ((self.status.carry() as u8) << 7);
                self.status.set_carry(v & 0x01 != 0);
                self.write_operand(bus, operand, r);
                self.set_zn(r);
            }
            Op::Bit => {
                let m = self.read_operand(bus, operand);
                self.status.set_zero(self.regs.a & m == 0);
                self.status.set_negative(m & 0x80 != 0);
                self.status.set_overflow(m & 0x40 != 0);
            }
            Op::Cmp => {
                let m = self.read_operand(bus, operand);
                self.compare(self.regs.a, m);
            }
            Op::Cpx => {
                let m = self.read_operand(bus, operand);
                self.compare(self.regs.x, m);
            }
            Op::Cpy => {
                let m = self.read_operand(bus, operand);
                self.compare(self.regs.y, m);
            }
            Op::Inc => {
                let r = self.read_operand(bus, operand).wrapping_add(1);
                self.write_operand(bus, operand, r);
                self.set_zn(r);
            }
            Op::Dec => {
                let r = self.read_operand(bus, operand).wrapping_sub(1);
                self.write_operand(bus, operand, r);
                self.set_zn(r);
            }
            Op::Inx => {
                self.regs.x = self.regs.x.wrapping_add(1);
                self.set_zn(self.regs.x);
            }
            Op::Iny => {
                self.regs.y = self.regs.y.wrapping_add(1);
                self.set_zn(self.regs.y);
            }
            Op::Dex => {
                self.regs.x = self.regs.x.wrapping_sub(1);
                self.set_zn(self.regs.x);
            }
            Op::Dey => {
                self.regs.y = self.regs.y.wrapping_sub(1);
                self.set_zn(self.regs.y);
            }
            Op::Lda => {
                self.regs.a = self.read_operand(bus, operand);
                self.set_zn(self.regs.a);
            }
            Op::Ldx => {
                self.regs.x = self.read_operand(bus, operand);
                self.set_zn(self.regs.x);
            }
            Op::Ldy => {
                self.regs.y = self.read_operand(bus, operand);
                self.set_zn(self.regs.y);
            }
            Op::Sta => self.write_operand(bus, operand, self.regs.a),
            Op::Stx => self.write_operand(bus, operand, self.regs.x),
            Op::Sty => self.write_operand(bus, operand, self.regs.y),
            Op::Tax => {
                self.regs.x = self.regs.a;
                self.set_zn(self.regs.x);
            }
            Op::Tay => {
                self.regs.y = self.regs.a;
                self.set_zn(self.regs.y);
            }
            Op::Txa => {
                self.regs.a = self.regs.x;
                self.set_zn(self.regs.a);
            }
            Op::Tya => {
                self.regs.a = self.regs.y;
                self.set_zn(self.regs.a);
            }
            Op::Tsx => {
                self.regs.x = self.regs.sp;
                self.set_zn(self.regs.x);
            }
            Op::Txs => self.regs.sp = self.regs.x,
            Op::Clc => self.status.set_carry(false),
            Op::Sec => self.status.set_carry(true),
            Op::Cli => self.status.set_interrupt(false),
            Op::Sei => self.status.set_interrupt(true),
            Op::Clv => self.status.set_overflow(false),
            Op::Cld => self.status.set_decimal(false),
            Op::Sed => self.status.set_decimal(true),
            Op::Nop => {}
            Op::Bcc => return self.branch(!self.status.carry(), operand, page_crossed),
            Op::Bcs => return self.branch(self.status.carry(), operand, page_crossed),
            Op::Bne => return self.branch(!self.status.zero(), operand, page_crossed),
            Op::Beq => return self.branch(self.status.zero(), operand, page_crossed),
            Op::Bpl => return self.branch(!self.status.negative(), operand, page_crossed),
            Op::Bmi => return self.branch(self.status.negative(), operand, page_crossed),
            Op::Bvc => return self.branch(!self.status.overflow(), operand, page_crossed),
            Op::Bvs => return self.branch(self.status.overflow(), operand, page_crossed),
            Op::Jmp => {
                if let Operand::Address(addr) = operand {
                    self.regs.pc = addr;
                }
            }
            Op::Jsr => {
                if let Operand::Address(addr) = operand {
                    // Return address is the last byte of this instruction.
                    let ret = self.regs.pc.wrapping_sub(1);
                    self.push(bus, (ret >> 8) as u8);
                    self.push(bus, ret as u8);
                    self.regs.pc = addr;
                }
            }
            Op::Rts => {
                let lo = self.pull(bus) as u16;
                let hi = self.pull(bus) as u16;
                self.regs.pc = (lo | (hi << 8)).wrapping_add(1);
            }
            Op::Rti => {
                let p = self.pull(bus);
                self.status = StatusFlags::from_pull(p);
                let lo = self.pull(bus) as u16;
                let hi = self.pull(bus) as u16;
                self.regs.pc = lo | (hi << 8);
            }
            Op::Brk => {
                // BRK leaves room for a signature byte: the pushed return
                // address is the opcode address plus two.
                let ret = self.regs.pc.wrapping_add(1);
                self.push(bus, (ret >> 8) as u8);
                self.push(bus, ret as u8);
                self.push(bus, self.status.pack() | StatusFlags::BREAK);
                self.status.set_interrupt(true);
                self.regs.pc = bus.read16(IRQ_VECTOR);
            }
            Op::Pha => self.push(bus, self.regs.a),
            Op::Php => self.push(bus, self.status.pack() | StatusFlags::BREAK),
            Op::Pla => {
                self.regs.a = self.pull(bus);
                self.set_zn(self.regs.a);
            }
            Op::Plp => {
                let p = self.pull(bus);
                self.status = StatusFlags::from_pull(p);
            }
        }
        0
    }

    fn adc(&mut self, m: u8) {
        let a = self.regs.a;
        let t = a as u16 + m as u16 + self.status.carry() as u16;
        self.status.set_carry(t > 0xFF);
        self.status
            .set_overflow((a ^ m) & 0x80 == 0 && (a as u16 ^ t) & 0x80 != 0);
        self.regs.a = t as u8;
        self.set_zn(self.regs.a);
    }

    fn compare(&mut self, reg: u8, m: u8) {
        self.status.set_carry(reg >= m);
        self.set_zn(reg.wrapping_sub(m));
    }

    fn branch(&mut self, taken: bool, operand: Operand, page_crossed: bool) -> u32 {
        if !taken {
            return 0;
        }
        if let Operand::Address(target) = operand {
            self.regs.pc = target;
        }
        1 + page_crossed as u32
    }

    fn set_zn(&mut self, value: u8) {
        self.status.set_zero(value == 0);
        self.status.set_negative(value & 0x80 != 0);
    }

    // ------------------------------------------------------------------
    // Stack. SP wraps in the low byte only; the page-1 base is fixed.

    fn push(&mut self, bus: &mut impl CpuBus, value: u8) {
        bus.write(0x0100 | self.regs.sp as u16, value);
        self.regs.sp = self.regs.sp.wrapping_sub(1);
    }

    fn pull(&mut self, bus: &mut impl CpuBus) -> u8 {
        self.regs.sp = self.regs.sp.wrapping_add(1);
        bus.read(0x0100 | self.regs.sp as u16)
    }

    // ------------------------------------------------------------------
    // Snapshots

    pub fn save_state(&self, w: &mut SnapshotWriter) {
        w.put_u8(1);
        w.put_u32(self.status.pack() as u32);
        w.put_u32(self.regs.a as u32);
        w.put_u32(self.regs.pc as u32);
        w.put_u32(self.regs.sp as u32);
        w.put_u32(self.regs.x as u32);
        w.put_u32(self.regs.y as u32);
        w.put_u32(self.pending_halt);
    }

    pub fn load_state(&mut self, r: &mut SnapshotReader) -> Result<(), SnapshotError> {
        let version = r.get_u8()?;
        if version != 1 {
            return Err(SnapshotError::UnsupportedVersion(version));
        }
        self.status = StatusFlags::unpack(r.get_u32()? as u8);
        self.regs.a = r.get_u32()? as u8;
        self.regs.pc = r.get_u32()? as u16;
        self.regs.sp = r.get_u32()? as u8;
        self.regs.x = r.get_u32()? as u8;
        self.regs.y = r.get_u32()? as u8;
        self.pending_halt = r.get_u32()?;
        Ok(())
    }
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}

fn page_crossed(a: u16, b: u16) -> bool {
    a & 0xFF00 != b & 0xFF00
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 64 KiB of flat memory, no peripherals.
    struct FlatBus {
        mem: Vec<u8>,
    }

    impl FlatBus {
        fn new() -> Self {
            Self {
                mem: vec![0; 0x10000],
            }
        }
    }

    impl CpuBus for FlatBus {
        fn read(&mut self, address: u16) -> u8 {
            self.mem[address as usize]
        }

        fn write(&mut self, address: u16, value: u8) {
            self.mem[address as usize] = value;
        }
    }

    /// CPU reset to $C000 with the program loaded there.
    fn setup(program: &[u8]) -> (Cpu, FlatBus) {
        let mut bus = FlatBus::new();
        bus.mem[0xC000..0xC000 + program.len()].copy_from_slice(program);
        bus.mem[RESET_VECTOR as usize] = 0x00;
        bus.mem[RESET_VECTOR as usize + 1] = 0xC0;
        let mut cpu = Cpu::new();
        cpu.reset(&mut bus);
        (cpu, bus)
    }

    #[test]
    fn reset_state_is_documented() {
        let (cpu, _) = setup(&[]);
        assert_eq!(cpu.registers().pc, 0xC000);
        assert_eq!(cpu.registers().sp, 0xFD);
        assert_eq!(cpu.registers().a, 0);
        assert_eq!(cpu.status().pack(), 0x24);
    }

    #[test]
    fn flag_pack_roundtrip_all_values() {
        for value in 0..=255u8 {
            let expected = value | StatusFlags::UNUSED;
            assert_eq!(StatusFlags::unpack(value).pack(), expected);
            assert_eq!(StatusFlags::unpack(expected).pack(), expected);
        }
    }

    #[test]
    fn lda_immediate() {
        let (mut cpu, mut bus) = setup(&[0xA9, 0x42]);
        let cycles = cpu.step(&mut bus);
        assert_eq!(cycles, 2);
        assert_eq!(cpu.registers().a, 0x42);
        assert_eq!(cpu.registers().pc, 0xC002);
        assert!(!cpu.status().zero());
        assert!(!cpu.status().negative());
    }

    #[test]
    fn lda_sets_zero_and_negative() {
        let (mut cpu, mut bus) = setup(&[0xA9, 0x00, 0xA9, 0x80]);
        cpu.step(&mut bus);
        assert!(cpu.status().zero());
        cpu.step(&mut bus);
        assert!(cpu.status().negative());
        assert!(!cpu.status().zero());
    }

    #[test]
    fn adc_overflow_case() {
        // A = $50 + $50 -> signed overflow, negative, no carry.
        let (mut cpu, mut bus) = setup(&[0xA9, 0x50, 0x69, 0x50]);
        cpu.step(&mut bus);
        cpu.step(&mut bus);
        assert_eq!(cpu.registers().a, 0xA0);
        assert!(!cpu.status().carry());
        assert!(cpu.status().overflow());
        assert!(cpu.status().negative());
        assert!(!cpu.status().zero());
    }

    #[test]
    fn adc_carry_chain() {
        // $FF + $01 = $00 carry out, then $00 + $00 + C = $01.
        let (mut cpu, mut bus) = setup(&[0xA9, 0xFF, 0x69, 0x01, 0x69, 0x00]);
        cpu.step(&mut bus);
        cpu.step(&mut bus);
        assert_eq!(cpu.registers().a, 0x00);
        assert!(cpu.status().carry());
        assert!(cpu.status().zero());
        cpu.step(&mut bus);
        assert_eq!(cpu.registers().a, 0x01);
        assert!(!cpu.status().carry());
    }

    #[test]
    fn sbc_equals_adc_of_complement() {
        // SEC; LDA #$10; SBC #$08 -> $08, carry (no borrow).
        let (mut cpu, mut bus) = setup(&[0x38, 0xA9, 0x10, 0xE9, 0x08]);
        for _ in 0..3 {
            cpu.step(&mut bus);
        }
        assert_eq!(cpu.registers().a, 0x08);
        assert!(cpu.status().carry());
        assert!(!cpu.status().overflow());
    }

    #[test]
    fn cmp_sets_carry_on_greater_or_equal() {
        let (mut cpu, mut bus) = setup(&[0xA9, 0x40, 0xC9, 0x40, 0xC9, 0x41]);
        cpu.step(&mut bus);
        cpu.step(&mut bus);
        assert!(cpu.status().carry());
        assert!(cpu.status().zero());
        cpu.step(&mut bus);
        assert!(!cpu.status().carry());
        assert!(cpu.status().negative()); // $40 - $41 = $FF
    }

    #[test]
    fn stack_push_pull_restores_sp() {
        let (mut cpu, mut bus) = setup(&[0xA9, 0xAB, 0x48, 0xA9, 0x00, 0x68]);
        let sp0 = cpu.registers().sp;
        for _ in 0..4 {
            cpu.step(&mut bus);
        }
        assert_eq!(cpu.registers().a, 0xAB);
        assert_eq!(cpu.registers().sp, sp0);
    }

    #[test]
    fn stack_wraps_within_page_one() {
        // TXS with X=0: push lands at $0100, SP wraps to $FF.
        let (mut cpu, mut bus) = setup(&[0xA2, 0x00, 0x9A, 0xA9, 0xAB, 0x48]);
        for _ in 0..4 {
            cpu.step(&mut bus);
        }
        assert_eq!(bus.mem[0x0100], 0xAB);
        assert_eq!(cpu.registers().sp, 0xFF);
    }

    #[test]
    fn branch_cycles_same_page_and_crossing() {
        // BNE +16 within the page: 2 base + 1 taken.
        let (mut cpu, mut bus) = setup(&[0xA9, 0x01, 0xD0, 0x10]);
        cpu.step(&mut bus);
        assert_eq!(cpu.step(&mut bus), 3);
        assert_eq!(cpu.registers().pc, 0xC014);

        // Branch crossing into the previous page: 2 base + 1 taken + 1 cross.
        let (mut cpu, mut bus) = setup(&[0xA9, 0x01, 0xD0, 0xFA]);
        cpu.step(&mut bus);
        assert_eq!(cpu.step(&mut bus), 4);
        assert_eq!(cpu.registers().pc, 0xBFFE);

        // Not taken: base cycles only, fall through.
        let (mut cpu, mut bus) = setup(&[0xA9, 0x00, 0xD0, 0x10]);
        cpu.step(&mut bus);
        assert_eq!(cpu.step(&mut bus), 2);
        assert_eq!(cpu.registers().pc, 0xC004);
    }

    #[test]
    fn page_cross_penalty_applies_to_reads_only() {
        // LDA $C0FF,X with X=1 crosses into $C100: 4 + 1.
        let (mut cpu, mut bus) = setup(&[0xA2, 0x01, 0xBD, 0xFF, 0xC0]);
        cpu.step(&mut bus);
        assert_eq!(cpu.step(&mut bus), 5);

        // Same access without the crossing: 4.
        let (mut cpu, mut bus) = setup(&[0xA2, 0x01, 0xBD, 0x00, 0xC1]);
        cpu.step(&mut bus);
        assert_eq!(cpu.step(&mut bus), 4);

        // STA $C0FF,X always pays the worst case, crossing or not.
        let (mut cpu, mut bus) = setup(&[0xA2, 0x01, 0x9D, 0x00, 0x01]);
        cpu.step(&mut bus);
        assert_eq!(cpu.step(&mut bus), 5);
    }

    #[test]
    fn indirect_jmp_page_wrap_bug() {
        // Pointer at $02FF: low byte from $02FF, high byte from $0200.
        let (mut cpu, mut bus) = setup(&[0x6C, 0xFF, 0x02]);
        bus.mem[0x02FF] = 0x34;
        bus.mem[0x0300] = 0xFF; // would be used by a correct fetch
        bus.mem[0x0200] = 0x12;
        assert_eq!(cpu.step(&mut bus), 5);
        assert_eq!(cpu.registers().pc, 0x1234);
    }

    #[test]
    fn indexed_indirect_wraps_in_zero_page() {
        // LDA ($FE,X) with X=3: pointer read from $01/$02.
        let (mut cpu, mut bus) = setup(&[0xA2, 0x03, 0xA1, 0xFE]);
        bus.mem[0x0001] = 0x20;
        bus.mem[0x0002] = 0x00;
        bus.mem[0x0020] = 0x99;
        cpu.step(&mut bus);
        cpu.step(&mut bus);
        assert_eq!(cpu.registers().a, 0x99);
    }

    #[test]
    fn indirect_indexed_reads_through_y() {
        // LDA ($10),Y with Y=4 and pointer $0030 -> $0034.
        let (mut cpu, mut bus) = setup(&[0xA0, 0x04, 0xB1, 0x10]);
        bus.mem[0x0010] = 0x30;
        bus.mem[0x0011] = 0x00;
        bus.mem[0x0034] = 0x77;
        cpu.step(&mut bus);
        assert_eq!(cpu.step(&mut bus), 5);
        assert_eq!(cpu.registers().a, 0x77);
    }

    #[test]
    fn jsr_pushes_last_byte_of_instruction_and_rts_returns_past_it() {
        let (mut cpu, mut bus) = setup(&[0x20, 0x10, 0xC1]);
        bus.mem[0xC110] = 0x60; // RTS
        assert_eq!(cpu.step(&mut bus), 6);
        assert_eq!(cpu.registers().pc, 0xC110);
        // Pushed return address is $C002, the JSR's last byte.
        assert_eq!(bus.mem[0x01FD], 0xC0);
        assert_eq!(bus.mem[0x01FC], 0x02);
        assert_eq!(cpu.step(&mut bus), 6);
        assert_eq!(cpu.registers().pc, 0xC003);
    }

    #[test]
    fn brk_pushes_pc_plus_two_with_break_set() {
        let (mut cpu, mut bus) = setup(&[0x00]);
        bus.mem[IRQ_VECTOR as usize] = 0x00;
        bus.mem[IRQ_VECTOR as usize + 1] = 0x80;
        assert_eq!(cpu.step(&mut bus), 7);
        assert_eq!(cpu.registers().pc, 0x8000);
        assert!(cpu.status().interrupt());
        assert_eq!(bus.mem[0x01FD], 0xC0);
        assert_eq!(bus.mem[0x01FC], 0x02); // opcode address + 2
        assert_ne!(bus.mem[0x01FB] & StatusFlags::BREAK, 0);
        assert_ne!(bus.mem[0x01FB] & StatusFlags::UNUSED, 0);
    }

    #[test]
    fn rti_restores_status_and_pc_unadjusted() {
        let (mut cpu, mut bus) = setup(&[0x58, 0x00, 0xEA]);
        bus.mem[IRQ_VECTOR as usize] = 0x00;
        bus.mem[IRQ_VECTOR as usize + 1] = 0x80;
        bus.mem[0x8000] = 0x40; // RTI
        cpu.step(&mut bus); // CLI
        cpu.step(&mut bus); // BRK pushes $C003 and status with I clear
        assert!(cpu.status().interrupt());
        cpu.step(&mut bus); // RTI
        assert_eq!(cpu.registers().pc, 0xC003);
        assert!(!cpu.status().interrupt()); // I was clear when BRK pushed
    }

    #[test]
    fn php_plp_keeps_flags_with_unused_forced() {
        let (mut cpu, mut bus) = setup(&[0x38, 0xF8, 0x08, 0x18, 0xD8, 0x28]);
        for _ in 0..6 {
            cpu.step(&mut bus);
        }
        assert!(cpu.status().carry());
        assert!(cpu.status().decimal());
        assert_eq!(cpu.status().pack() & StatusFlags::UNUSED, StatusFlags::UNUSED);
    }

    #[test]
    fn rol_and_ror_rotate_through_carry() {
        let (mut cpu, mut bus) = setup(&[0x38, 0xA9, 0x80, 0x2A]);
        for _ in 0..3 {
            cpu.step(&mut bus);
        }
        assert_eq!(cpu.registers().a, 0x01); // old carry entered bit 0
        assert!(cpu.status().carry()); // bit 7 left into carry

        let (mut cpu, mut bus) = setup(&[0x38, 0xA9, 0x01, 0x6A]);
        for _ in 0..3 {
            cpu.step(&mut bus);
        }
        assert_eq!(cpu.registers().a, 0x80);
        assert!(cpu.status().carry());
    }

    #[test]
    fn rmw_on_memory_touches_the_operand_address() {
        let (mut cpu, mut bus) = setup(&[0xE6, 0x20, 0x06, 0x20]);
        bus.mem[0x0020] = 0x7F;
        assert_eq!(cpu.step(&mut bus), 5); // INC zp
        assert_eq!(bus.mem[0x0020], 0x80);
        assert!(cpu.status().negative());
        assert_eq!(cpu.step(&mut bus), 5); // ASL zp
        assert_eq!(bus.mem[0x0020], 0x00);
        assert!(cpu.status().carry());
        assert!(cpu.status().zero());
    }

    #[test]
    fn illegal_opcode_latches_crash() {
        let (mut cpu, mut bus) = setup(&[0x02]);
        assert_eq!(cpu.step(&mut bus), 0);
        assert!(cpu.crashed());
        assert_eq!(cpu.step(&mut bus), 0);
        assert_eq!(cpu.registers().pc, 0xC000);
    }

    #[test]
    fn nmi_service_takes_seven_cycles_and_vectors() {
        let (mut cpu, mut bus) = setup(&[0xEA]);
        bus.mem[NMI_VECTOR as usize] = 0x00;
        bus.mem[NMI_VECTOR as usize + 1] = 0x90;
        cpu.request_interrupt(Interrupt::NonMaskable);
        assert_eq!(cpu.step(&mut bus), 7);
        assert_eq!(cpu.registers().pc, 0x9000);
        assert!(cpu.status().interrupt());
        // Hardware interrupts push with the break bit clear.
        assert_eq!(bus.mem[0x01FB] & StatusFlags::BREAK, 0);
    }

    #[test]
    fn masked_irq_is_consumed_not_serviced() {
        let (mut cpu, mut bus) = setup(&[0xEA, 0xEA]);
        // I is set after reset.
        cpu.request_interrupt(Interrupt::Maskable);
        assert_eq!(cpu.step(&mut bus), 2); // the NOP ran instead
        assert_eq!(cpu.registers().pc, 0xC001);
        assert!(cpu.irq_line_mut().pending().is_none());
    }

    #[test]
    fn irq_serviced_once_interrupts_enabled() {
        let (mut cpu, mut bus) = setup(&[0x58, 0xEA]);
        bus.mem[IRQ_VECTOR as usize] = 0x00;
        bus.mem[IRQ_VECTOR as usize + 1] = 0x85;
        cpu.step(&mut bus); // CLI
        cpu.request_interrupt(Interrupt::Maskable);
        assert_eq!(cpu.step(&mut bus), 7);
        assert_eq!(cpu.registers().pc, 0x8500);
    }

    #[test]
    fn interrupt_line_arbitration() {
        let mut line = InterruptLine::new();
        line.request(Interrupt::Maskable);
        line.request(Interrupt::Maskable); // dropped
        assert_eq!(line.pending(), Some(Interrupt::Maskable));
        line.request(Interrupt::NonMaskable); // overwrites
        assert_eq!(line.pending(), Some(Interrupt::NonMaskable));
        line.request(Interrupt::Maskable); // dropped against pending NMI
        assert_eq!(line.pending(), Some(Interrupt::NonMaskable));
        line.request(Interrupt::Reset);
        assert_eq!(line.pending(), Some(Interrupt::Reset));
    }

    #[test]
    fn reset_interrupt_reloads_the_vector() {
        let (mut cpu, mut bus) = setup(&[0xEA]);
        cpu.request_interrupt(Interrupt::Reset);
        assert_eq!(cpu.step(&mut bus), 7);
        assert_eq!(cpu.registers().pc, 0xC000);
        assert!(cpu.status().interrupt());
    }

    #[test]
    fn halt_cycles_charge_the_next_step() {
        let (mut cpu, mut bus) = setup(&[0xEA, 0xEA]);
        cpu.halt(513);
        assert_eq!(cpu.step(&mut bus), 515); // NOP + stall
        assert_eq!(cpu.step(&mut bus), 2);
    }

    #[test]
    fn every_official_opcode_decodes() {
        let official = [
            0x69, 0x65, 0x75, 0x6D, 0x7D, 0x79, 0x61, 0x71, 0x29, 0x25, 0x35, 0x2D, 0x3D, 0x39,
            0x21, 0x31, 0x0A, 0x06, 0x16, 0x0E, 0x1E, 0x90, 0xB0, 0xF0, 0x24, 0x2C, 0x30, 0xD0,
            0x10, 0x00, 0x50, 0x70, 0x18, 0xD8, 0x58, 0xB8, 0xC9, 0xC5, 0xD5, 0xCD, 0xDD, 0xD9,
            0xC1, 0xD1, 0xE0, 0xE4, 0xEC, 0xC0, 0xC4, 0xCC, 0xC6, 0xD6, 0xCE, 0xDE, 0xCA, 0x88,
            0x49, 0x45, 0x55, 0x4D, 0x5D, 0x59, 0x41, 0x51, 0xE6, 0xF6, 0xEE, 0xFE, 0xE8, 0xC8,
            0x4C, 0x6C, 0x20, 0xA9, 0xA5, 0xB5, 0xAD, 0xBD, 0xB9, 0xA1, 0xB1, 0xA2, 0xA6, 0xB6,
            0xAE, 0xBE, 0xA0, 0xA4, 0xB4, 0xAC, 0xBC, 0x4A, 0x46, 0x56, 0x4E, 0x5E, 0xEA, 0x09,
            0x05, 0x15, 0x0D, 0x1D, 0x19, 0x01, 0x11, 0x48, 0x08, 0x68, 0x28, 0x2A, 0x26, 0x36,
            0x2E, 0x3E, 0x6A, 0x66, 0x76, 0x6E, 0x7E, 0x40, 0x60, 0xE9, 0xE5, 0xF5, 0xED, 0xFD,
            0xF9, 0xE1, 0xF1, 0x38, 0xF8, 0x78, 0x85, 0x95, 0x8D, 0x9D, 0x99, 0x81, 0x91, 0x86,
            0x96, 0x8E, 0x84, 0x94, 0x8C, 0xAA, 0xA8, 0xBA, 0x8A, 0x9A, 0x98,
        ];
        assert_eq!(official.len(), 151);
        for byte in official {
            assert!(decode(byte).is_some(), "opcode ${byte:02X} missing");
        }
        assert!(decode(0x02).is_none());
        assert!(decode(0xFF).is_none());
    }

    #[test]
    fn snapshot_record_layout() {
        let (mut cpu, mut bus) = setup(&[0xA9, 0x7E]);
        cpu.step(&mut bus);
        cpu.halt(100);
        let mut w = SnapshotWriter::new();
        cpu.save_state(&mut w);
        let buf = w.into_bytes();
        assert_eq!(buf.len(), 1 + 7 * 4);
        assert_eq!(buf[0], 1);

        let mut restored = Cpu::new();
        let mut r = SnapshotReader::new(&buf);
        restored.load_state(&mut r).unwrap();
        assert_eq!(restored.registers().a, 0x7E);
        assert_eq!(restored.registers().pc, 0xC002);
        assert_eq!(restored.status().pack(), cpu.status().pack());
    }
}
