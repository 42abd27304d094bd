pub mod case;
pub mod chain;
