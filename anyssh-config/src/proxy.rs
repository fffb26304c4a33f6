use std::io;
use std::pin::Pin;
use std::process::Stdio;
use std::task::{Context, Poll};

use log::debug;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

/// The byte stream a backend runs the SSH protocol over: a TCP socket,
/// or the stdio of a `ProxyCommand` child process.
#[derive(Debug)]
pub enum Stream {
    Tcp(TcpStream),
    Proxy(ProxyProcess),
}

/// A `ProxyCommand` child. Writes go to its stdin, reads come from its
/// stdout, stderr is inherited. The process is killed on drop.
pub struct ProxyProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: ChildStdout,
}

impl std::fmt::Debug for ProxyProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyProcess")
            .field("pid", &self.child.id())
            .field("stdin_open", &self.stdin.is_some())
            .finish()
    }
}

impl ProxyProcess {
    fn spawn(cmd: &str, args: &[&str]) -> io::Result<Self> {
        let mut child = Command::new(cmd)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "proxy command has no stdio",
            ));
        };
        debug!("proxy command {cmd:?} started as {:?}", child.id());
        Ok(ProxyProcess {
            child,
            stdin: Some(stdin),
            stdout,
        })
    }

    /// Process id, while the child is running.
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }
}

impl Stream {
    /// Connect a direct TCP stream, with Nagle's algorithm off.
    pub async fn tcp_connect<A: ToSocketAddrs>(addr: A) -> Result<Stream, io::Error> {
        let socket = TcpStream::connect(addr).await?;
        socket.set_nodelay(true)?;
        Ok(Stream::Tcp(socket))
    }

    /// Run `cmd` with `args` and talk to it over its stdio.
    pub async fn proxy_command(cmd: &str, args: &[&str]) -> Result<Stream, io::Error> {
        ProxyProcess::spawn(cmd, args).map(Stream::Proxy)
    }
}

impl AsyncRead for ProxyProcess {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdout).poll_read(cx, buf)
    }
}

impl AsyncWrite for ProxyProcess {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.stdin.as_mut() {
            Some(stdin) => Pin::new(stdin).poll_write(cx, buf),
            None => Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.stdin.as_mut() {
            Some(stdin) => Pin::new(stdin).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    /// Closes the child's stdin, which is how a proxy learns the session
    /// is over.
    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if let Some(stdin) = self.stdin.as_mut() {
            futures::ready!(Pin::new(stdin).poll_shutdown(cx))?;
        }
        self.stdin = None;
        Poll::Ready(Ok(()))
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(t) => Pin::new(t).poll_read(cx, buf),
            Stream::Proxy(p) => Pin::new(p).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Stream::Tcp(t) => Pin::new(t).poll_write(cx, buf),
            Stream::Proxy(p) => Pin::new(p).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(t) => Pin::new(t).poll_flush(cx),
            Stream::Proxy(p) => Pin::new(p).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(t) => Pin::new(t).poll_shutdown(cx),
            Stream::Proxy(p) => Pin::new(p).poll_shutdown(cx),
        }
    }
}
