//! Wire message set and the commitment/settlement layout of the payment
//! protocol.

pub mod contract;
pub mod error;
pub mod messages;
