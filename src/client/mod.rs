pub mod payment;

pub use payment::{AccessState, PaywallClient};
