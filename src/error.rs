use thiserror::Error;

/// Errors surfaced across the transport and membership layers.
///
/// Handler-internal faults are logged and swallowed per the propagation
/// policy of the membership engine; this type exists for the few call
/// sites (`join`, `Codec::decode`, `ConnManager::disconnect`) that must
/// report failure to their caller.
#[derive(Debug, Error)]
pub enum Error {
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  #[error("decode error: {0}")]
  Decode(String),

  #[error("unknown message tag: {0}")]
  UnknownTag(u8),

  #[error("connection not found")]
  ConnectionNotFound,

  #[error("peer {0} not known in the passive view")]
  UnknownPeer(String),
}
