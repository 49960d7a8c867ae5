//! RESP frame types.
//!
//! The [`Frame`] enum represents a single parsed RESP value. Blob strings
//! use `Bytes` for reference-counted storage that avoids copies when
//! moving data through the pipeline.

use bytes::Bytes;

/// A single RESP protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Simple string reply, e.g. `+OK\r\n`.
    Simple(String),

    /// Error reply, e.g. `-ERR unknown command\r\n`.
    Error(String),

    /// 64-bit signed integer, e.g. `:42\r\n`.
    Integer(i64),

    /// Bulk (binary-safe) string, e.g. `$5\r\nhello\r\n`.
    Bulk(Bytes),

    /// Ordered array of frames, e.g. `*2\r\n+hello\r\n+world\r\n`.
    Array(Vec<Frame>),

    /// Nil, serialized as the null bulk string `$-1\r\n`.
    Null,
}

impl Frame {
    /// Returns `true` if this frame is nil.
    pub fn is_null(&self) -> bool {
        matches!(self, Frame::Null)
    }

    /// Builds a bulk frame from anything string-like.
    pub fn bulk(data: impl Into<Bytes>) -> Frame {
        Frame::Bulk(data.into())
    }

    /// The conventional `+OK` reply.
    pub fn ok() -> Frame {
        Frame::Simple("OK".into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_equality() {
        assert_eq!(Frame::Simple("OK".into()), Frame::Simple("OK".into()));
        assert_ne!(Frame::Simple("OK".into()), Frame::Simple("ERR".into()));
        assert_eq!(Frame::Integer(42), Frame::Integer(42));
        assert_eq!(Frame::Null, Frame::Null);
    }

    #[test]
    fn is_null() {
        assert!(Frame::Null.is_null());
        assert!(!Frame::ok().is_null());
        assert!(!Frame::Integer(0).is_null());
    }

    #[test]
    fn bulk_helper() {
        assert_eq!(
            Frame::bulk("hello"),
            Frame::Bulk(Bytes::from_static(b"hello"))
        );
    }
}
