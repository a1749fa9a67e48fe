pub mod osdep;

pub mod mrouter;
pub use mrouter::{Family, KernelCaps, MfeaMrouter, Mifset};

pub mod vif;
pub use vif::MfeaVif;

pub mod dataflow;
pub use dataflow::MfeaDft;

pub mod iftree;
pub use iftree::{IfTree, IfTreeEvent};

pub mod inst;
pub use inst::{serve, Message, MfeaNode, ProtocolSignal};
