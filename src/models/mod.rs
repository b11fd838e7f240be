pub mod payment;
pub mod response;
pub mod transaction;
pub mod whitelist;

pub use payment::*;
pub use response::*;
pub use transaction::*;
pub use whitelist::*;
