use std::io;

use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{LEN_TYPE_SIZE, LenType, MAX_FRAME_LEN};

/// The receiving end handle of the communication.
pub struct RpcReceiver<R: AsyncRead + Unpin> {
    rx: R,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> RpcReceiver<R> {
    /// Creates a new `RpcReceiver` instance.
    ///
    /// # Arguments
    /// * `rx` - The underlying reader.
    pub(super) fn new(rx: R) -> Self {
        Self {
            rx,
            buf: Vec::new(),
        }
    }

    /// Waits to receive a new message from the inner reader.
    ///
    /// # Returns
    /// A result object that returns `T` on success or `io::Error` on failure.
    pub async fn recv<T: DeserializeOwned>(&mut self) -> io::Result<T> {
        let mut size_buf = [0; LEN_TYPE_SIZE];
        self.rx.read_exact(&mut size_buf).await?;
        let len = LenType::from_be_bytes(size_buf) as usize;

        if len > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {len} bytes exceeds the {MAX_FRAME_LEN} bytes limit"),
            ));
        }

        self.buf.resize(len, 0);
        self.rx.read_exact(&mut self.buf).await?;

        let msg = serde_json::from_slice(&self.buf)?;
        Ok(msg)
    }
}
