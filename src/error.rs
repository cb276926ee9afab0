use thiserror::Error;

// Setup-time failures only; past construction everything is either
// backpressure or a contract violation (an abort).
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to open {path}: {source}")]
    Open {
        path: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("tap interface name too long: {0:?}")]
    IfaceName(String),

    #[error("TUNSETIFF failed: {0}")]
    TapSetup(#[source] std::io::Error),

    #[error("vhost {op} failed: {source}")]
    Vhost {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("eventfd setup failed: {0}")]
    EventFd(#[source] std::io::Error),

    #[error("invalid ring size {0}: must be a power of two no larger than 0x8000")]
    RingSize(u16),
}

pub type Result<T> = std::result::Result<T, Error>;
