pub mod amount;
pub mod chain;
pub mod config;
pub mod ledger;
pub mod memo;
pub mod model;
pub mod reconciler;
pub mod service;
pub mod store;

pub use amount::Nanoton;
pub use ledger::Ledger;
pub use model::{Cursor, Transfer, TransferId, UserId};
pub use reconciler::Reconciler;
pub use service::CommandService;
