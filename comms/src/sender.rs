//! The implementation of the sending end of the framing protocol.

use std::io;

use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::{LEN_TYPE_SIZE, LenType};

/// The sending end handle of the communication.
pub struct RpcSender<W>
where
    W: AsyncWrite + Unpin,
{
    tx: W,
    buf: Vec<u8>,
}

impl<W: AsyncWrite + Unpin> RpcSender<W> {
    /// Creates a new `RpcSender` instance.
    ///
    /// # Arguments
    /// * `tx` - The underlying writer.
    pub(super) fn new(tx: W) -> Self {
        Self {
            tx,
            buf: Vec::new(),
        }
    }

    /// Sends `msg` through the inner writer as a single length-prefixed frame.
    ///
    /// # Arguments
    /// * `msg` - A serializable object.
    ///
    /// # Returns
    /// A result object that returns `io::Error` on failure.
    pub async fn send<T: Serialize>(&mut self, msg: &T) -> io::Result<()> {
        let Self { buf, tx } = self;

        buf.clear();
        buf.resize(LEN_TYPE_SIZE, 0);
        serde_json::to_writer(&mut *buf, msg)?;

        let len = (buf.len() - LEN_TYPE_SIZE) as LenType;
        buf[..LEN_TYPE_SIZE].copy_from_slice(&len.to_be_bytes());

        tx.write_all(buf).await?;
        tx.flush().await
    }
}
