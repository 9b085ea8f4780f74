use crate::rpc::RpcError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- generic errors --------------------------------------------
    #[error("debugger is not connected")]
    NotConnected,
    #[error("debugger already connected")]
    AlreadyConnected,
    #[error(transparent)]
    IO(#[from] std::io::Error),

    // --------------------------------- soft-debug channel errors ---------------------------------
    #[error("soft-debug channel: {0}")]
    Wire(String),
    #[error("connection closed by target")]
    ConnectionClosed,
    #[error("malformed wire payload: {0}")]
    Payload(#[from] serde_json::Error),

    // --------------------------------- debugger entity not found ---------------------------------
    #[error("thread {0} not found")]
    ThreadNotFound(i64),
    #[error("frame number {0} not found")]
    FrameNotFound(usize),
    #[error("breakpoint {0} not found")]
    BreakpointNotFound(u64),
    #[error("unknown value reference {0}")]
    ValueNotFound(u64),
}

impl Error {
    /// Return a hint to the session - continue debugging after error or tear the session down.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::NotConnected => false,
            Error::AlreadyConnected => false,
            Error::Wire(_) => false,
            Error::Payload(_) => false,
            Error::ThreadNotFound(_) => false,
            Error::FrameNotFound(_) => false,
            Error::BreakpointNotFound(_) => false,
            Error::ValueNotFound(_) => false,

            // currently fatal errors
            Error::IO(_) => true,
            Error::ConnectionClosed => true,
        }
    }
}

impl From<RpcError> for Error {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Closed => Error::ConnectionClosed,
            RpcError::Remote(message) => Error::Wire(message),
            RpcError::Io(err) => Error::IO(err),
            RpcError::Json(err) => Error::Payload(err),
        }
    }
}

/// Transforms `Result` into `Option` and logs an error if it occurs.
#[macro_export]
macro_rules! weak_error {
    ($res: expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                log::warn!(target: "debugger", "{:#}", e);
                None
            }
        }
    };
    ($res: expr, $msg: tt) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                log::warn!(target: "debugger", concat!($msg, " {:#}"), e);
                None
            }
        }
    };
}
