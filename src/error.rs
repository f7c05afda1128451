use failure::{Backtrace, Context, Fail};
use std::fmt;

#[derive(Debug)]
pub struct Error {
    inner: Context<ErrorKind>,
}

/// What went wrong, and at which stage of the pipeline.
#[derive(Clone, Debug, PartialEq, Eq, Fail)]
pub enum ErrorKind {
    #[fail(display = "{}", _0)]
    Parse(String),
    #[fail(display = "{}", _0)]
    Codegen(String),
    #[fail(display = "backend: {}", _0)]
    Backend(String),
    #[fail(display = "runtime: {}", _0)]
    Runtime(String),
}

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        self.inner.get_context()
    }

    pub(crate) fn parse(msg: impl Into<String>) -> Error {
        Error::from(ErrorKind::Parse(msg.into()))
    }

    pub(crate) fn codegen(msg: impl Into<String>) -> Error {
        Error::from(ErrorKind::Codegen(msg.into()))
    }

    pub(crate) fn backend(msg: impl Into<String>) -> Error {
        Error::from(ErrorKind::Backend(msg.into()))
    }

    pub(crate) fn runtime(msg: impl Into<String>) -> Error {
        Error::from(ErrorKind::Runtime(msg.into()))
    }
}

impl Fail for Error {
    fn cause(&self) -> Option<&dyn Fail> {
        self.inner.cause()
    }

    fn backtrace(&self) -> Option<&Backtrace> {
        self.inner.backtrace()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.inner, f)
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Error {
        Error {
            inner: Context::new(kind),
        }
    }
}

impl From<Context<ErrorKind>> for Error {
    fn from(inner: Context<ErrorKind>) -> Error {
        Error { inner }
    }
}
