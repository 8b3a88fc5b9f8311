//! Camsync central aggregator: fans triggers out to every camera node and
//! gathers their stills, live feeds and acknowledgements.

pub mod acks;
pub mod aggregator;
pub mod feed;
pub mod nodes;
pub mod server;
