// Application layer - use cases and orchestration over the ledger storage.

mod bulk;
mod coordinator;
mod directory;
mod error;
mod query;
mod service;

pub use bulk::*;
pub use coordinator::*;
pub use directory::*;
pub use error::*;
pub use query::*;
pub use service::*;
