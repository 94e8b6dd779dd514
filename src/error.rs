use thiserror::Error;

use crate::sys::RawHandle;

#[derive(Error, Debug)]
pub enum Error {
    #[error("read past the end of the parcel buffer")]
    UnexpectedEof,
    #[error("parcel field is not valid UTF-8")]
    InvalidString,
    #[error("destination endpoint is unreachable: {0:#x}")]
    DeadBinder(RawHandle),
    #[error("reply channel broke before a reply arrived")]
    DeadReply,
    #[error("synchronous transaction while another is outstanding")]
    NestedTransaction,
    #[error("binder is closed")]
    Closed,
    #[error("service object {0} not found in this process")]
    ObjectNotFound(i32),
    #[error("service object {0} was already destroyed")]
    ObjectGone(i32),
    #[error("operation requires the {0:?} role")]
    InvalidRole(crate::channel::Role),
    #[error("unexpected code {0:#x}")]
    UnknownCode(i32),
}

pub type Result<T> = std::result::Result<T, Error>;
