mod codec;
mod communicator;
mod config;
mod container;
mod dispatcher;
mod error;
mod ids;
mod message;
mod message_info;
mod priority;
mod session;
#[cfg(test)]
mod testkit;
mod timeout;

pub use codec::Codec;
pub use config::{Config, ConfigBuilder, DEFAULT_QUANTUM};
#[cfg(feature = "tls")]
pub use config::TlsConfig;
pub use dispatcher::Dispatcher;
pub use error::{Error, HandlerError, HandlerResult};
pub use ids::{ConnId, MsgId};
pub use message::Message;
pub use message_info::{MessageInfo, MessageRegistry};
pub use priority::Priority;
pub use session::{Arrived, ConnHandle, ConnOps, Session};
