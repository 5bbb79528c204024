//! Core lifting engine

pub mod blocks;
pub mod exceptions;
pub mod lifter;
pub mod stack;
pub mod tac;

pub use blocks::BlockTable;
pub use exceptions::ExceptionIndex;
pub use lifter::{LiftedMethod, Lifter};
pub use stack::OperandStack;
