use std::cell::RefCell;
use std::fmt::Write as _;
use std::rc::Rc;

use tracing::info;

use crate::constants as C;

mod instructions;
mod memory;
mod registers;

pub use self::instructions::{
    instruction_set, Architecture, ArchitectureParseError, DefinitionError, Instruction,
    InstructionSet, Mode,
};
pub use self::memory::Memory;
pub use self::registers::{Registers, StatusRegister};

/// Receives notifications as the CPU runs.
///
/// A debugger attaches one of these to watch execution: `on_store` fires
/// before each byte written through the execution path lands in memory,
/// `on_pc_update` fires at the end of each step with the updated program
/// counter.
pub trait Observer {
    /// A byte is about to be stored at `addr`.
    fn on_store(&mut self, addr: u16, value: u8);

    /// A step finished; `pc` is where the next fetch will happen.
    fn on_pc_update(&mut self, pc: u16);
}

/// The CPU1 execution engine.
///
/// Owns its registers and memory and shares an immutable instruction set
/// with every other CPU of the same architecture. Stepping is synchronous
/// and deterministic: identical starting state always yields identical
/// final state.
pub struct Cpu {
    /// Architecture variant being emulated
    pub arch: Architecture,

    /// Architectural registers
    pub reg: Registers,

    /// Attached memory
    pub mem: Memory,

    /// Total executed cycles
    pub cycles: u64,

    /// Address the current instruction was fetched from
    pub last_pc: u16,

    inst_set: &'static InstructionSet,
    observer: Option<Rc<RefCell<dyn Observer>>>,
}

impl std::fmt::Debug for Cpu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Cpu {{ arch: {:?}, registers: {:?}, cycles: {}, memory: [...] }}",
            self.arch, self.reg, self.cycles
        )
    }
}

impl Cpu {
    /// Create a CPU bound to `mem`, registers zeroed and SP at the top of
    /// the stack page.
    pub fn new(arch: Architecture, mem: Memory) -> Self {
        Self {
            arch,
            reg: Registers::new(),
            mem,
            cycles: 0,
            last_pc: 0,
            inst_set: instruction_set(arch),
            observer: None,
        }
    }

    /// Point the program counter at `addr`.
    pub fn set_pc(&mut self, addr: u16) {
        self.reg.pc = addr;
    }

    /// Copy an assembled program into memory at `origin` and point the
    /// program counter at it.
    pub fn load_program(&mut self, origin: u16, program: &[u8]) {
        self.mem.store_bytes(origin, program);
        self.reg.pc = origin;
    }

    /// The instruction set this CPU dispatches through.
    pub fn instruction_set(&self) -> &'static InstructionSet {
        self.inst_set
    }

    /// Descriptor of the instruction encoded at `addr`.
    pub fn instruction_at(&self, addr: u16) -> &'static Instruction {
        self.inst_set.lookup(self.mem.load_byte(addr))
    }

    /// Address of the instruction following the one at `addr`.
    pub fn next_addr(&self, addr: u16) -> u16 {
        addr.wrapping_add(u16::from(self.instruction_at(addr).length))
    }

    /// Attach an observer. The CPU keeps a shared handle only; the caller
    /// stays the owner.
    pub fn attach_observer(&mut self, observer: Rc<RefCell<dyn Observer>>) {
        self.observer = Some(observer);
    }

    /// Detach the current observer, if any.
    pub fn detach_observer(&mut self) {
        self.observer = None;
    }

    /// Execute the instruction at the program counter.
    ///
    /// Unused opcodes execute as timed no-ops. The operand is fetched and
    /// the program counter advanced past the whole encoding before the
    /// handler runs, so a branch target written by the handler is the final
    /// program counter.
    #[tracing::instrument(skip(self), level = "debug")]
    pub fn step(&mut self) {
        let opcode = self.mem.load_byte(self.reg.pc);
        let inst = self.inst_set.lookup(opcode);

        let mut buf = [0u8; 2];
        let operand = &mut buf[..usize::from(inst.length) - 1];
        self.mem.load_bytes(self.reg.pc.wrapping_add(1), operand);

        self.last_pc = self.reg.pc;
        self.reg.pc = self.reg.pc.wrapping_add(u16::from(inst.length));

        info!(cost = inst.cycles, "Executing instruction \"{}\"", inst);
        inst.execute(self, operand);

        self.cycles += u64::from(inst.cycles);

        if let Some(observer) = &self.observer {
            observer.borrow_mut().on_pc_update(self.reg.pc);
        }
    }

    /// Load the program counter from the reset vector.
    pub fn reset(&mut self) {
        self.reg.pc = self.mem.load_address(C::RESET_VECTOR);
    }

    /// Store a byte, letting the attached observer see it first.
    pub(crate) fn store_byte(&mut self, addr: u16, value: u8) {
        if let Some(observer) = &self.observer {
            observer.borrow_mut().on_store(addr, value);
        }
        self.mem.store_byte(addr, value);
    }

    /// Push a byte onto the stack. SP wraps within the stack page.
    pub(crate) fn push(&mut self, value: u8) {
        self.store_byte(C::STACK_PAGE | u16::from(self.reg.sp), value);
        self.reg.sp = self.reg.sp.wrapping_sub(1);
    }

    /// Pop a byte off the stack.
    pub(crate) fn pop(&mut self) -> u8 {
        self.reg.sp = self.reg.sp.wrapping_add(1);
        self.mem.load_byte(C::STACK_PAGE | u16::from(self.reg.sp))
    }

    /// Push a 16-bit address, high byte first.
    pub(crate) fn push_address(&mut self, addr: u16) {
        let [hi, lo] = addr.to_be_bytes();
        self.push(hi);
        self.push(lo);
    }

    /// Pop a 16-bit address, low byte first.
    pub(crate) fn pop_address(&mut self) -> u16 {
        let lo = self.pop();
        let hi = self.pop();
        u16::from_be_bytes([hi, lo])
    }

    /// Formatted view of the live stack cells, deepest last.
    pub fn stack_dump(&self) -> String {
        let mut out = String::new();
        for offset in (u16::from(self.reg.sp) + 1)..=0xff {
            let addr = C::STACK_PAGE | offset;
            let _ = writeln!(out, "${:04x}: ${:02x}", addr, self.mem.load_byte(addr));
        }
        out
    }
}
