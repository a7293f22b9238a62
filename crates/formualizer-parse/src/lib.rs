pub mod opcode;
pub mod token;

pub use opcode::*;
pub use token::*;
