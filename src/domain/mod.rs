mod account;
mod balance;
mod ledger;
mod transaction;

pub use account::*;
pub use balance::*;
pub use ledger::*;
pub use transaction::*;
