//! `AsyncRead`/`AsyncWrite` views of a channel, firing
//! [`ChannelEvent`](super::ChannelEvent)s as bytes go through.

mod rx;
pub use rx::ChannelReader;

mod tx;
pub use tx::ChannelWriter;
