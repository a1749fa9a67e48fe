pub mod api;
pub use api::{RibRx, RibRxChannel, Message};

pub mod resolver;
pub use resolver::{LookupState, NextHopResolver};

pub mod inst;
pub use inst::{serve, Rib};
