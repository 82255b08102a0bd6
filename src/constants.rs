/// Total size of the addressable memory, in bytes
pub const MEMORY_SIZE: usize = 0x1_0000;

/// Memory page holding the stack
pub const STACK_PAGE: u16 = 0x0100;

/// Power-on value of the stack pointer, the top of the stack page
pub const STACK_TOP: u8 = 0xff;

/// Address the reset vector is stored at, as a big-endian word
pub const RESET_VECTOR: u16 = 0xfffc;

/// Conventional place for programs to begin
pub const PROGRAM_START: u16 = 0x0200;
