pub mod reversal;

pub use reversal::ReversalSaga;
