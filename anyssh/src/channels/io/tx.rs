use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use futures::FutureExt;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc::error::SendError;
use tokio::sync::mpsc::{self, OwnedPermit};

use super::super::{ChannelEvent, ChannelMsg, ChannelShared};
use crate::{io_error, Error};

type OwnedPermitFuture =
    Pin<Box<dyn Send + Future<Output = Result<(OwnedPermit<ChannelMsg>, ChannelMsg), SendError<()>>>>>;

/// Largest payload put into a single data message.
const MAX_CHUNK: usize = 32768;

/// Writing half of the channel's stdin.
///
/// `shutdown` sends EOF. Writes after EOF, or once the channel is
/// closing, fail with [`Error::ChannelClosed`].
pub struct ChannelWriter {
    shared: Arc<ChannelShared>,
    sender: mpsc::Sender<ChannelMsg>,
    send_fut: Option<OwnedPermitFuture>,
}

impl std::fmt::Debug for ChannelWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelWriter")
            .field("channel", &self.shared.id)
            .finish()
    }
}

impl ChannelWriter {
    pub(crate) fn new(shared: Arc<ChannelShared>, sender: mpsc::Sender<ChannelMsg>) -> Self {
        Self {
            shared,
            sender,
            send_fut: None,
        }
    }

    fn activate(&mut self, msg: ChannelMsg) -> &mut OwnedPermitFuture {
        use futures::TryFutureExt;
        self.send_fut.insert(Box::pin(
            self.sender.clone().reserve_owned().map_ok(move |p| (p, msg)),
        ))
    }

    fn handle_write_result(
        &mut self,
        r: Result<(OwnedPermit<ChannelMsg>, ChannelMsg), SendError<()>>,
    ) -> Result<usize, io::Error> {
        self.send_fut = None;
        match r {
            Ok((permit, msg)) => {
                let sent = match &msg {
                    ChannelMsg::Data { data } => Some(data.clone()),
                    _ => None,
                };
                permit.send(msg);
                Ok(match sent {
                    Some(data) => {
                        let len = data.len();
                        self.shared.fire(ChannelEvent::DataSent { data });
                        len
                    }
                    None => 0,
                })
            }
            Err(SendError(())) => Err(io_error(io::ErrorKind::BrokenPipe, Error::ChannelClosed)),
        }
    }
}

impl AsyncWrite for ChannelWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        if buf.is_empty() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "cannot send empty buffer",
            )));
        }
        let send_fut = if let Some(x) = self.send_fut.as_mut() {
            x
        } else {
            if !self.shared.is_writable() {
                return Poll::Ready(Err(io_error(
                    io::ErrorKind::BrokenPipe,
                    Error::ChannelClosed,
                )));
            }
            let writable = buf.len().min(MAX_CHUNK);
            #[allow(clippy::indexing_slicing)] // clamped to `buf.len()`
            let data = Bytes::copy_from_slice(&buf[..writable]);
            self.activate(ChannelMsg::Data { data })
        };
        let r = ready!(send_fut.as_mut().poll_unpin(cx));
        Poll::Ready(self.handle_write_result(r))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), io::Error>> {
        if self.send_fut.is_none() && self.shared.local_eof() {
            return Poll::Ready(Ok(()));
        }
        let send_fut = if let Some(x) = self.send_fut.as_mut() {
            x
        } else {
            self.activate(ChannelMsg::Eof)
        };
        let r = ready!(send_fut.as_mut().poll_unpin(cx));
        let is_eof = matches!(r, Ok((_, ChannelMsg::Eof)));
        self.handle_write_result(r)?;
        if is_eof {
            self.shared.sent_eof();
            Poll::Ready(Ok(()))
        } else {
            // A pending data write completed first; EOF goes next.
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}
