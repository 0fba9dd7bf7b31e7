extern crate self as conduit;

pub use conduit_net as net;
pub use conduit_rt as rt;
pub use conduit_support as support;
pub use tracing;
