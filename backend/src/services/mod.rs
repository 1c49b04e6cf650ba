pub mod cards;
pub mod messaging;

pub use cards::{CardCreate, CardService, CardUpdate};
pub use messaging::{DispatchError, DispatchReceipt, MessageDispatcher};
