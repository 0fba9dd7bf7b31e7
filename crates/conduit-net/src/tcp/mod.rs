mod listener;
mod stream;

pub use listener::{TcpListener, connect_nonblocking};
pub use stream::{ConnState, TcpStream};
