pub mod tcp;

#[cfg(feature = "tls")]
pub mod tls;
