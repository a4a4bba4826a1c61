pub mod transaction;

pub use transaction::{IsolationLevel, Transaction};
