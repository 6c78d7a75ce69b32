pub mod msg;
mod receiver;
mod sender;
pub mod specs;

use tokio::io::{AsyncRead, AsyncWrite};

pub use receiver::RpcReceiver;
pub use sender::RpcSender;

type LenType = u64;
const LEN_TYPE_SIZE: usize = size_of::<LenType>();

/// Upper bound for a single frame, a whole trainer shard travels in one frame.
const MAX_FRAME_LEN: usize = 1 << 30;

/// Creates both `RpcReceiver` and `RpcSender` network channel parts.
///
/// Given a writer and reader creates and returns both ends of the communication.
///
/// # Arguments
/// * `rx` - An async readable.
/// * `tx` - An async writable.
///
/// # Returns
/// A communication stream in the form of a receiver and sender.
pub fn channel<R, W>(rx: R, tx: W) -> (RpcReceiver<R>, RpcSender<W>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    (RpcReceiver::new(rx), RpcSender::new(tx))
}
