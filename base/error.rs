// This file is part of avrec, a synchronized audio/video recorder.
// SPDX-License-Identifier: GPL-3.0-or-later

use std::fmt;

/// Classification of recorder errors.
///
/// The classification drives recovery policy (retry, drop, or unwind); the
/// message carries the specifics.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Configuration rejected at startup.
    InvalidConfig,

    /// A device or file could not be opened or started.
    Unavailable,

    /// A device briefly has nothing to deliver; retry after a short sleep.
    Transient,

    /// A device failed in a way that ends its stream.
    Fault,

    /// A queue was closed under the caller.
    Closed,

    /// A bounded queue is at capacity.
    Full,

    /// The requested capability is not compiled into this build.
    Unsupported,

    /// An invariant the recorder relies on did not hold.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ErrorKind::InvalidConfig => "invalid configuration",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Transient => "transient",
            ErrorKind::Fault => "device fault",
            ErrorKind::Closed => "closed",
            ErrorKind::Full => "full",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::Internal => "internal",
        })
    }
}

/// Error type for recorder operations: a classification, a message, and an
/// optional underlying cause.
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {msg}")]
pub struct Error {
    kind: ErrorKind,
    msg: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    pub fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Error {
            kind,
            msg: msg.into(),
            source: None,
        }
    }

    pub fn with_source(
        kind: ErrorKind,
        msg: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Error {
            kind,
            msg: msg.into(),
            source: Some(source.into()),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Formats this error and all its causes into one line, for logging.
    pub fn chain(&self) -> String {
        use std::error::Error as _;
        let mut msg = self.to_string();
        let mut cause = self.source();
        while let Some(c) = cause {
            msg.push_str(": ");
            msg.push_str(&c.to_string());
            cause = c.source();
        }
        msg
    }
}

/// Constructs an [`Error`]; the first argument is an [`ErrorKind`] variant.
///
/// Example: `err!(Unavailable, "can't open {}", path)`.
#[macro_export]
macro_rules! err {
    ($kind:ident, $($arg:tt)+) => {
        $crate::Error::new($crate::ErrorKind::$kind, format!($($arg)+))
    };
}

/// Returns early with an [`Error`]; the first argument is an [`ErrorKind`]
/// variant.
#[macro_export]
macro_rules! bail {
    ($kind:ident, $($arg:tt)+) => {
        return Err($crate::err!($kind, $($arg)+).into())
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_and_msg() {
        let e = Error::new(ErrorKind::Unavailable, "no such device");
        assert_eq!(e.to_string(), "unavailable: no such device");
        assert_eq!(e.kind(), ErrorKind::Unavailable);
    }

    #[test]
    fn chain_includes_source() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let e = Error::with_source(ErrorKind::Unavailable, "open /dev/video0", io);
        assert_eq!(e.chain(), "unavailable: open /dev/video0: gone");
    }

    #[test]
    fn macros() {
        fn inner() -> Result<(), Error> {
            bail!(InvalidConfig, "bad fps {}", -1);
        }
        let e = inner().unwrap_err();
        assert_eq!(e.kind(), ErrorKind::InvalidConfig);
        assert_eq!(e.to_string(), "invalid configuration: bad fps -1");
    }
}
