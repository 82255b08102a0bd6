pub mod constants;
pub mod runtime;

pub use self::runtime::{
    instruction_set, Architecture, Cpu, Instruction, InstructionSet, Memory, Mode, Observer,
    Registers, StatusRegister,
};
