pub mod route;

pub mod table;

pub mod peer;
pub use peer::{Event, Peer, State};

pub mod timer;

pub mod handler;

pub mod inst;
pub use inst::{serve, Bgp, Message};

pub mod debug;
pub use debug::DebugRegistry;

pub mod show;

pub use bgp_wire::BGP_PORT;
