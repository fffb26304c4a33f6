use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use tokio::io::AsyncRead;
use tokio::sync::mpsc::UnboundedReceiver;

use super::super::{ChannelEvent, ChannelShared, StreamKind};
use crate::{io_error, Error};

/// Reading half of one of the channel's incoming streams (stdout or
/// stderr).
///
/// Returns end-of-file once the peer has sent EOF and the queued bytes
/// are drained. If the channel is closed locally before that, reads
/// fail with [`Error::ChannelClosed`].
pub struct ChannelReader {
    shared: Arc<ChannelShared>,
    stream: StreamKind,
    receiver: UnboundedReceiver<Bytes>,
    buffer: Option<Bytes>,
}

impl std::fmt::Debug for ChannelReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelReader")
            .field("channel", &self.shared.id)
            .field("stream", &self.stream)
            .finish()
    }
}

impl ChannelReader {
    pub(crate) fn new(
        shared: Arc<ChannelShared>,
        stream: StreamKind,
        receiver: UnboundedReceiver<Bytes>,
    ) -> Self {
        Self {
            shared,
            stream,
            receiver,
            buffer: None,
        }
    }

    pub fn stream(&self) -> StreamKind {
        self.stream
    }

    fn end(&self) -> io::Result<()> {
        if self.shared.remote_eof() {
            Ok(())
        } else {
            Err(io_error(io::ErrorKind::BrokenPipe, Error::ChannelClosed))
        }
    }
}

impl AsyncRead for ChannelReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut data = match self.buffer.take() {
            Some(data) => data,
            None => match ready!(self.receiver.poll_recv(cx)) {
                Some(data) => data,
                None => return Poll::Ready(self.end()),
            },
        };

        let readable = buf.remaining().min(data.len());
        let chunk = data.split_to(readable);
        buf.put_slice(&chunk);
        if !data.is_empty() {
            self.buffer = Some(data);
        }
        if !chunk.is_empty() {
            let stream = self.stream;
            self.shared.fire(ChannelEvent::DataReceived {
                stream,
                data: chunk,
            });
        }
        Poll::Ready(Ok(()))
    }
}
