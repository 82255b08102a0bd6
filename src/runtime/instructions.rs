use std::collections::HashMap;
use std::sync::OnceLock;

use parse_display::Display;
use thiserror::Error;
use tracing::debug;

use super::registers::StatusRegister;
use super::Cpu;

/// CPU chip variant.
///
/// Every defined opcode behaves identically on both chips; the distinction
/// is kept for the decoder and for external tooling that cares which table
/// it is talking about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[display(style = "UPPERCASE")]
pub enum Architecture {
    /// NMOS variant
    Nmos,

    /// CMOS variant
    Cmos,
}

#[derive(Error, Debug)]
#[error("could not parse architecture")]
pub struct ArchitectureParseError;

impl std::str::FromStr for Architecture {
    type Err = ArchitectureParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "nmos" => Ok(Architecture::Nmos),
            "cmos" => Ok(Architecture::Cmos),
            _ => Err(ArchitectureParseError),
        }
    }
}

/// Memory addressing mode of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[display(style = "UPPERCASE")]
pub enum Mode {
    /// Immediate, one operand byte
    Imm,

    /// Implied, no operand
    Imp,

    /// Absolute, two-byte big-endian address operand
    Abs,
}

/// What an opcode does once decoded.
///
/// Selector-encoded operations (register or Q line in the low three bits of
/// the opcode) share one variant across their eight slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Nop,
    Halt,
    Call,
    Ret,
    Lbr,
    Lbrc,
    Lbrz,
    Lbrq,
    Setq,
    Resetq,
    Spsr,
    Cpsr,
    Adr,
    Adi,
    Adm,
    Sub,
    Subi,
    Subm,
    And,
    Ani,
    Or,
    Ori,
    Xor,
    Xri,
    Inc,
    Dec,
    Shl,
    Shlc,
    Shr,
    Shrc,
    Cmp,
    Ex,
    Ldi,
    Ldm,
    Sti,
    Push,
    Pop,
    Unused,
}

/// Descriptor for a single opcode slot.
///
/// Immutable once the table is built. `length` counts the opcode byte
/// itself, so the operand is `length - 1` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    /// All-caps mnemonic, `"???"` for unused slots
    pub name: &'static str,

    /// Addressing mode
    pub mode: Mode,

    /// The opcode byte this descriptor occupies
    pub opcode: u8,

    /// Total encoded size in bytes
    pub length: u8,

    /// Cycle cost charged per execution
    pub cycles: u8,

    op: Op,
}

impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (${:02x})", self.name, self.opcode)
    }
}

/// Register selector from the low three bits of an opcode.
const fn register_selector(opcode: u8) -> usize {
    (opcode & 0b0000_0111) as usize
}

/// Q line selector from the low three bits of an opcode.
const fn line_selector(opcode: u8) -> u8 {
    opcode & 0b0000_0111
}

/// X and Y register selectors from a dual-register operand byte.
///
/// X sits in bits 6-4, Y in bits 2-0. Bits 7 and 3 are ignored.
const fn operand_registers(v: u8) -> (usize, usize) {
    (((v >> 4) & 0b111) as usize, (v & 0b111) as usize)
}

/// Big-endian address from a two-byte operand.
fn operand_address(operand: &[u8]) -> u16 {
    u16::from_be_bytes([operand[0], operand[1]])
}

impl Instruction {
    /// Execute the instruction against `cpu`.
    ///
    /// `operand` holds the `length - 1` bytes that followed the opcode; the
    /// program counter has already advanced past the whole encoding, so any
    /// write to it here decides where the next fetch happens.
    #[tracing::instrument(skip(cpu))]
    pub(crate) fn execute(&self, cpu: &mut Cpu, operand: &[u8]) {
        match self.op {
            Op::Nop | Op::Unused => {}

            Op::Halt => {
                // Pin the program counter to the HALT itself so further
                // steps keep re-executing it.
                cpu.reg.pc = cpu.last_pc;
            }

            Op::Call => {
                let ret = cpu.reg.pc;
                let addr = operand_address(operand);
                debug!("Calling ${:04x}, return address ${:04x}", addr, ret);
                cpu.push_address(ret);
                cpu.reg.pc = addr;
            }

            Op::Ret => {
                let addr = cpu.pop_address();
                debug!("Returning to ${:04x}", addr);
                cpu.reg.pc = addr;
            }

            Op::Lbr => {
                cpu.reg.pc = operand_address(operand);
            }

            Op::Lbrc => {
                if cpu.reg.sr.contains(StatusRegister::CARRY) {
                    let addr = operand_address(operand);
                    debug!("Jumping to ${:04x}", addr);
                    cpu.reg.pc = addr;
                }
            }

            Op::Lbrz => {
                if cpu.reg.sr.contains(StatusRegister::ZERO) {
                    let addr = operand_address(operand);
                    debug!("Jumping to ${:04x}", addr);
                    cpu.reg.pc = addr;
                }
            }

            Op::Lbrq => {
                if cpu.reg.q_line(line_selector(self.opcode)) {
                    let addr = operand_address(operand);
                    debug!("Jumping to ${:04x}", addr);
                    cpu.reg.pc = addr;
                }
            }

            Op::Setq => cpu.reg.set_q_line(line_selector(self.opcode), true),

            Op::Resetq => cpu.reg.set_q_line(line_selector(self.opcode), false),

            Op::Spsr => {
                cpu.reg
                    .sr
                    .insert(StatusRegister::from_bits_truncate(operand[0]));
            }

            Op::Cpsr => {
                cpu.reg
                    .sr
                    .remove(StatusRegister::from_bits_truncate(operand[0]));
            }

            Op::Adr => {
                let (x, y) = operand_registers(operand[0]);
                let v = cpu.reg.r[x].wrapping_add(cpu.reg.r[y]);
                cpu.reg.r[x] = v;
                cpu.reg.update_nz(v);
            }

            Op::Adi => {
                let r = register_selector(self.opcode);
                let v = cpu.reg.r[r].wrapping_add(operand[0]);
                cpu.reg.r[r] = v;
                cpu.reg.update_nz(v);
            }

            Op::Adm => {
                let r = register_selector(self.opcode);
                let m = cpu.mem.load_byte(operand_address(operand));
                let v = cpu.reg.r[r].wrapping_add(m);
                cpu.reg.r[r] = v;
                cpu.reg.update_nz(v);
            }

            Op::Sub => {
                let (x, y) = operand_registers(operand[0]);
                let v = cpu.reg.sub_with_flags(cpu.reg.r[x], cpu.reg.r[y]);
                cpu.reg.r[x] = v;
            }

            Op::Subi => {
                let r = register_selector(self.opcode);
                let v = cpu.reg.sub_with_flags(cpu.reg.r[r], operand[0]);
                cpu.reg.r[r] = v;
            }

            Op::Subm => {
                let r = register_selector(self.opcode);
                let m = cpu.mem.load_byte(operand_address(operand));
                let v = cpu.reg.sub_with_flags(cpu.reg.r[r], m);
                cpu.reg.r[r] = v;
            }

            Op::And => {
                let (x, y) = operand_registers(operand[0]);
                let v = cpu.reg.r[x] & cpu.reg.r[y];
                cpu.reg.r[x] = v;
                cpu.reg.update_nz(v);
            }

            Op::Ani => {
                let r = register_selector(self.opcode);
                let v = cpu.reg.r[r] & operand[0];
                cpu.reg.r[r] = v;
                cpu.reg.update_nz(v);
            }

            Op::Or => {
                let (x, y) = operand_registers(operand[0]);
                let v = cpu.reg.r[x] | cpu.reg.r[y];
                cpu.reg.r[x] = v;
                cpu.reg.update_nz(v);
            }

            Op::Ori => {
                let r = register_selector(self.opcode);
                let v = cpu.reg.r[r] | operand[0];
                cpu.reg.r[r] = v;
                cpu.reg.update_nz(v);
            }

            Op::Xor => {
                let (x, y) = operand_registers(operand[0]);
                let v = cpu.reg.r[x] ^ cpu.reg.r[y];
                cpu.reg.r[x] = v;
                cpu.reg.update_nz(v);
            }

            Op::Xri => {
                let r = register_selector(self.opcode);
                let v = cpu.reg.r[r] ^ operand[0];
                cpu.reg.r[r] = v;
                cpu.reg.update_nz(v);
            }

            Op::Inc => {
                let r = register_selector(self.opcode);
                let v = cpu.reg.r[r].wrapping_add(1);
                cpu.reg.r[r] = v;
                cpu.reg.update_nz(v);
            }

            Op::Dec => {
                let r = register_selector(self.opcode);
                let v = cpu.reg.r[r].wrapping_sub(1);
                cpu.reg.r[r] = v;
                cpu.reg.update_nz(v);
            }

            Op::Shl => {
                let r = register_selector(self.opcode);
                let old = cpu.reg.r[r];
                cpu.reg.sr.set(StatusRegister::CARRY, old & 0x80 != 0);
                let v = old << 1;
                cpu.reg.r[r] = v;
                cpu.reg.update_nz(v);
            }

            Op::Shlc => {
                // Shifts the old Carry in but leaves Carry itself alone.
                let r = register_selector(self.opcode);
                let carry = u8::from(cpu.reg.sr.contains(StatusRegister::CARRY));
                let v = (cpu.reg.r[r] << 1) | carry;
                cpu.reg.r[r] = v;
                cpu.reg.update_nz(v);
            }

            Op::Shr => {
                let r = register_selector(self.opcode);
                let old = cpu.reg.r[r];
                cpu.reg.sr.set(StatusRegister::CARRY, old & 1 != 0);
                let v = old >> 1;
                cpu.reg.r[r] = v;
                cpu.reg.update_nz(v);
            }

            Op::Shrc => {
                let r = register_selector(self.opcode);
                let carry = if cpu.reg.sr.contains(StatusRegister::CARRY) {
                    0x80
                } else {
                    0
                };
                let v = (cpu.reg.r[r] >> 1) | carry;
                cpu.reg.r[r] = v;
                cpu.reg.update_nz(v);
            }

            Op::Cmp => {
                let (x, y) = operand_registers(operand[0]);
                cpu.reg
                    .sr
                    .set(StatusRegister::CARRY, cpu.reg.r[x] == cpu.reg.r[y]);
            }

            Op::Ex => {
                let (x, y) = operand_registers(operand[0]);
                cpu.reg.r.swap(x, y);
            }

            Op::Ldi => {
                let r = register_selector(self.opcode);
                cpu.reg.r[r] = operand[0];
            }

            Op::Ldm => {
                let r = register_selector(self.opcode);
                cpu.reg.r[r] = cpu.mem.load_byte(operand_address(operand));
            }

            Op::Sti => {
                let r = register_selector(self.opcode);
                cpu.store_byte(operand_address(operand), cpu.reg.r[r]);
            }

            Op::Push => {
                let r = register_selector(self.opcode);
                cpu.push(cpu.reg.r[r]);
            }

            Op::Pop => {
                let r = register_selector(self.opcode);
                let v = cpu.pop();
                cpu.reg.r[r] = v;
                cpu.reg.update_nz(v);
            }
        }
    }
}

/// Errors raised while building an instruction set.
///
/// Both are programming errors in the opcode table and abort construction.
#[derive(Error, Debug)]
pub enum DefinitionError {
    #[error("opcode ${0:02x} defined twice")]
    DuplicateOpcode(u8),

    #[error("opcode ${0:02x} left without a descriptor")]
    MissingOpcode(u8),
}

struct OpcodeDef {
    op: Op,
    name: &'static str,
    mode: Mode,
    opcode: u8,
    length: u8,
    cycles: u8,
}

/// Every defined opcode.
///
/// Cycle costs follow the documented model: one cycle per encoded byte,
/// plus one per ALU operation, plus one per data memory access.
fn defined_opcodes() -> Vec<OpcodeDef> {
    let mut defs = Vec::with_capacity(200);

    // Fixed-slot instructions.
    for &(op, name, mode, opcode, length, cycles) in &[
        (Op::Nop, "NOP", Mode::Imp, 0x00, 1, 1),
        (Op::Halt, "HALT", Mode::Imp, 0x01, 1, 1),
        (Op::Call, "CALL", Mode::Abs, 0x02, 3, 5),
        (Op::Ret, "RET", Mode::Imp, 0x03, 1, 3),
        (Op::Lbrc, "LBRC", Mode::Abs, 0x04, 3, 3),
        (Op::Lbrz, "LBRZ", Mode::Abs, 0x05, 3, 3),
        (Op::Lbr, "LBR", Mode::Abs, 0x18, 3, 3),
        (Op::Xor, "XOR", Mode::Imm, 0x19, 2, 3),
        (Op::Spsr, "SPSR", Mode::Imm, 0x1a, 2, 2),
        (Op::Cpsr, "CPSR", Mode::Imm, 0x1b, 2, 2),
        (Op::Adr, "ADR", Mode::Imm, 0x80, 2, 3),
        (Op::Sub, "SUB", Mode::Imm, 0x82, 2, 3),
        (Op::Ex, "EX", Mode::Imm, 0x84, 2, 3),
        (Op::Cmp, "CMP", Mode::Imm, 0x85, 2, 3),
        (Op::And, "AND", Mode::Imm, 0x86, 2, 3),
        (Op::Or, "OR", Mode::Imm, 0x87, 2, 3),
    ] {
        defs.push(OpcodeDef {
            op,
            name,
            mode,
            opcode,
            length,
            cycles,
        });
    }

    // Selector-encoded instructions: eight consecutive slots each, the
    // register or Q line number in the low three bits of the opcode.
    for &(op, name, mode, base, length, cycles) in &[
        (Op::Lbrq, "LBRQ", Mode::Abs, 0x08, 3, 3),
        (Op::Resetq, "RESETQ", Mode::Imp, 0x10, 1, 1),
        (Op::Shlc, "SHLC", Mode::Imp, 0x20, 1, 2),
        (Op::Inc, "INC", Mode::Imp, 0x28, 1, 2),
        (Op::Dec, "DEC", Mode::Imp, 0x30, 1, 2),
        (Op::Setq, "SETQ", Mode::Imp, 0x38, 1, 1),
        (Op::Push, "PUSH", Mode::Imp, 0x40, 1, 2),
        (Op::Pop, "POP", Mode::Imp, 0x48, 1, 2),
        (Op::Ani, "ANI", Mode::Imm, 0x50, 2, 3),
        (Op::Ori, "ORI", Mode::Imm, 0x58, 2, 3),
        (Op::Xri, "XRI", Mode::Imm, 0x60, 2, 3),
        (Op::Shr, "SHR", Mode::Imp, 0x68, 1, 2),
        (Op::Shrc, "SHRC", Mode::Imp, 0x70, 1, 2),
        (Op::Shl, "SHL", Mode::Imp, 0x78, 1, 2),
        (Op::Adi, "ADI", Mode::Imm, 0x88, 2, 3),
        (Op::Adm, "ADM", Mode::Abs, 0x90, 3, 5),
        (Op::Subi, "SUBI", Mode::Imm, 0xb8, 2, 3),
        (Op::Subm, "SUBM", Mode::Abs, 0xc0, 3, 5),
        (Op::Ldi, "LDI", Mode::Imm, 0xe0, 2, 2),
        (Op::Sti, "STI", Mode::Abs, 0xe8, 3, 4),
        (Op::Ldm, "LDM", Mode::Abs, 0xf0, 3, 4),
    ] {
        for sel in 0u8..8 {
            defs.push(OpcodeDef {
                op,
                name,
                mode,
                opcode: base + sel,
                length,
                cycles,
            });
        }
    }

    defs
}

/// Name shown for opcodes with no defined instruction.
const UNUSED_NAME: &str = "???";

/// The set of all 256 opcode slots for one architecture.
///
/// Built once, then immutable; any number of CPUs may share it.
pub struct InstructionSet {
    arch: Architecture,
    instructions: Vec<Instruction>,
    variants: HashMap<&'static str, Vec<u8>>,
}

impl InstructionSet {
    /// Build the table for an architecture.
    ///
    /// Defined opcodes land in their slots first; every remaining slot gets
    /// an unused descriptor that charges one cycle and advances one byte.
    /// A duplicate or (after filling) empty slot aborts construction.
    pub fn new(arch: Architecture) -> Result<Self, DefinitionError> {
        let mut slots: [Option<Instruction>; 256] = [None; 256];
        let mut variants: HashMap<&'static str, Vec<u8>> = HashMap::new();

        for def in defined_opcodes() {
            let slot = &mut slots[usize::from(def.opcode)];
            if slot.is_some() {
                return Err(DefinitionError::DuplicateOpcode(def.opcode));
            }
            *slot = Some(Instruction {
                name: def.name,
                mode: def.mode,
                opcode: def.opcode,
                length: def.length,
                cycles: def.cycles,
                op: def.op,
            });
            variants.entry(def.name).or_default().push(def.opcode);
        }

        for (opcode, slot) in slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(Instruction {
                    name: UNUSED_NAME,
                    mode: Mode::Imp,
                    opcode: opcode as u8,
                    length: 1,
                    cycles: 1,
                    op: Op::Unused,
                });
            }
        }

        let instructions = slots
            .into_iter()
            .enumerate()
            .map(|(opcode, slot)| slot.ok_or(DefinitionError::MissingOpcode(opcode as u8)))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            arch,
            instructions,
            variants,
        })
    }

    /// The architecture this table was built for.
    pub fn arch(&self) -> Architecture {
        self.arch
    }

    /// The descriptor occupying `opcode`.
    pub fn lookup(&self, opcode: u8) -> &Instruction {
        &self.instructions[usize::from(opcode)]
    }

    /// All descriptors sharing a mnemonic, case-insensitively.
    ///
    /// Selector-encoded instructions return their eight variants; unknown
    /// mnemonics (and the unused-slot marker) return nothing.
    pub fn get_instructions(&self, name: &str) -> Vec<&Instruction> {
        let name = name.to_uppercase();
        self.variants
            .get(name.as_str())
            .map(|opcodes| opcodes.iter().map(|&op| self.lookup(op)).collect())
            .unwrap_or_default()
    }
}

static NMOS_SET: OnceLock<InstructionSet> = OnceLock::new();
static CMOS_SET: OnceLock<InstructionSet> = OnceLock::new();

/// Shared instruction set for an architecture, built on first request and
/// retained for the life of the process.
pub fn instruction_set(arch: Architecture) -> &'static InstructionSet {
    let slot = match arch {
        Architecture::Nmos => &NMOS_SET,
        Architecture::Cmos => &CMOS_SET,
    };
    slot.get_or_init(|| InstructionSet::new(arch).expect("opcode table is complete"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_slot_is_populated() {
        let set = InstructionSet::new(Architecture::Nmos).unwrap();
        for opcode in 0..=255u8 {
            let inst = set.lookup(opcode);
            assert_eq!(inst.opcode, opcode);
            assert!((1..=3).contains(&inst.length), "{inst}");
            assert!(inst.cycles >= 1, "{inst}");
        }
    }

    #[test]
    fn defined_opcodes_are_unique() {
        let defs = defined_opcodes();
        let mut seen = [false; 256];
        for def in &defs {
            assert!(!seen[usize::from(def.opcode)], "${:02x}", def.opcode);
            seen[usize::from(def.opcode)] = true;
        }
    }

    #[test]
    fn selector_groups_cover_all_eight_registers() {
        let set = instruction_set(Architecture::Nmos);
        for (name, base) in [("LDI", 0xe0u8), ("STI", 0xe8), ("PUSH", 0x40), ("POP", 0x48)] {
            for sel in 0..8u8 {
                let inst = set.lookup(base + sel);
                assert_eq!(inst.name, name);
                assert_eq!(inst.opcode & 0b111, sel);
            }
        }
    }

    #[test]
    fn unused_slots_are_timed_noops() {
        let set = instruction_set(Architecture::Nmos);
        for opcode in [0x06u8, 0x07, 0x1c, 0x1d, 0x1e, 0x81, 0x83, 0x9f, 0xd4, 0xff] {
            let inst = set.lookup(opcode);
            assert_eq!(inst.name, "???");
            assert_eq!(inst.mode, Mode::Imp);
            assert_eq!(inst.length, 1);
            assert_eq!(inst.cycles, 1);
        }
    }

    #[test]
    fn mnemonic_lookup_is_case_insensitive() {
        let set = instruction_set(Architecture::Nmos);
        assert_eq!(set.get_instructions("LDI").len(), 8);
        assert_eq!(set.get_instructions("ldi").len(), 8);
        assert_eq!(set.get_instructions("Setq").len(), 8);
        assert_eq!(set.get_instructions("adr").len(), 1);
        assert!(set.get_instructions("LDA").is_empty());
        assert!(set.get_instructions("???").is_empty());
    }

    #[test]
    fn architectures_share_the_instruction_table() {
        let nmos = instruction_set(Architecture::Nmos);
        let cmos = instruction_set(Architecture::Cmos);
        assert_eq!(nmos.arch(), Architecture::Nmos);
        assert_eq!(cmos.arch(), Architecture::Cmos);
        for opcode in 0..=255u8 {
            assert_eq!(nmos.lookup(opcode), cmos.lookup(opcode));
        }
    }

    #[test]
    fn architecture_parses_from_common_spellings() {
        assert_eq!("nmos".parse::<Architecture>().unwrap(), Architecture::Nmos);
        assert_eq!("CMOS".parse::<Architecture>().unwrap(), Architecture::Cmos);
        assert!("z80".parse::<Architecture>().is_err());
    }

    #[test]
    fn dual_register_operand_ignores_bits_seven_and_three() {
        assert_eq!(operand_registers(0x01), (0, 1));
        assert_eq!(operand_registers(0x75), (7, 5));
        assert_eq!(operand_registers(0b1111_1111), (7, 7));
        assert_eq!(operand_registers(0b1000_1000), (0, 0));
    }
}
