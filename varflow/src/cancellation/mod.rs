//! Operator-initiated cancellation.

mod token;

pub use token::CancellationToken;
