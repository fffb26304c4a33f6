#![allow(clippy::unwrap_used, clippy::panic, clippy::indexing_slicing)]

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc::Receiver;

use super::*;

struct Peer {
    tx: UnboundedSender<ChannelMsg>,
    rx: Receiver<ChannelMsg>,
    _table: ChannelTable,
}

fn channel(kind: ChannelKind) -> (Channel, Peer) {
    let _ = env_logger::try_init();
    let (tx, incoming) = mpsc::unbounded_channel();
    let (outgoing, rx) = mpsc::channel(16);
    let table: ChannelTable = Default::default();
    let channel = Channel::new(
        BackendChannel {
            id: ChannelId(1),
            incoming,
            outgoing,
        },
        kind,
        &table,
    );
    (
        channel,
        Peer {
            tx,
            rx,
            _table: table,
        },
    )
}

fn command() -> ChannelKind {
    ChannelKind::Command {
        command: "true".to_string(),
    }
}

fn forwarding() -> ChannelKind {
    ChannelKind::Forwarding {
        host: "localhost".to_string(),
        port: 80,
        originator_address: "127.0.0.1".to_string(),
        originator_port: 4000,
    }
}

/// Open an exec channel, acknowledging its request.
async fn open_command(channel: &Channel, peer: &mut Peer) {
    let c = channel.clone();
    let opening = tokio::spawn(async move { c.open().await });
    assert!(matches!(peer.rx.recv().await, Some(ChannelMsg::Exec { .. })));
    peer.tx.send(ChannelMsg::Success).unwrap();
    opening.await.unwrap().unwrap();
}

/// Answer the channel's close with our own, like a well-behaved server.
fn confirm_close(mut peer: Peer) -> tokio::task::JoinHandle<Vec<ChannelMsg>> {
    tokio::spawn(async move {
        let mut seen = Vec::new();
        while let Some(msg) = peer.rx.recv().await {
            let close = msg == ChannelMsg::Close;
            seen.push(msg);
            if close {
                let _ = peer.tx.send(ChannelMsg::Close);
                break;
            }
        }
        seen
    })
}

fn record(channel: &Channel) -> Arc<Mutex<Vec<ChannelEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let e = events.clone();
    channel.add_listener(Arc::new(move |_: ChannelId, event: &ChannelEvent| {
        e.lock().push(event.clone())
    }));
    events
}

fn lifecycle(events: &Mutex<Vec<ChannelEvent>>) -> Vec<ChannelEvent> {
    events
        .lock()
        .iter()
        .filter(|e| {
            matches!(
                e,
                ChannelEvent::Opened | ChannelEvent::Closing | ChannelEvent::Closed
            )
        })
        .cloned()
        .collect()
}

async fn until<F: Fn() -> bool>(condition: F) {
    for _ in 0..300 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn setup_requests_in_order() {
    let (channel, mut peer) = channel(ChannelKind::Shell {
        pty: Some(PtyRequest::default()),
    });
    channel.set_env("LANG", "C.UTF-8").unwrap();
    let events = record(&channel);

    let c = channel.clone();
    let opening = tokio::spawn(async move { c.open().await });
    assert!(matches!(
        peer.rx.recv().await,
        Some(ChannelMsg::SetEnv { want_reply: false, ref variable_name, .. }) if variable_name == "LANG"
    ));
    assert!(matches!(
        peer.rx.recv().await,
        Some(ChannelMsg::RequestPty { col_width: 80, row_height: 24, .. })
    ));
    peer.tx.send(ChannelMsg::Success).unwrap();
    assert!(matches!(
        peer.rx.recv().await,
        Some(ChannelMsg::RequestShell { want_reply: true })
    ));
    peer.tx.send(ChannelMsg::Success).unwrap();
    opening.await.unwrap().unwrap();

    assert_eq!(channel.state(), ChannelState::Open);
    assert_eq!(lifecycle(&events), vec![ChannelEvent::Opened]);
    assert!(matches!(
        channel.set_env("TERM", "dumb"),
        Err(Error::IllegalState { .. })
    ));
    assert!(matches!(channel.open().await, Err(Error::IllegalState { .. })));
}

#[tokio::test]
async fn refused_request_fails_the_channel() {
    let (channel, mut peer) = channel(command());
    let c = channel.clone();
    let opening = tokio::spawn(async move { c.open().await });
    assert!(matches!(peer.rx.recv().await, Some(ChannelMsg::Exec { .. })));
    peer.tx.send(ChannelMsg::Failure).unwrap();

    assert!(matches!(
        opening.await.unwrap(),
        Err(Error::ChannelRequestFailed("exec"))
    ));
    assert_eq!(channel.state(), ChannelState::Failed);
    assert_eq!(peer.rx.recv().await, Some(ChannelMsg::Close));
    assert!(peer._table.lock().is_empty());
    assert_eq!(channel.wait_exit_status().await, None);
}

#[tokio::test]
async fn data_before_the_reply_is_kept() {
    let (channel, mut peer) = channel(command());
    let c = channel.clone();
    let opening = tokio::spawn(async move { c.open().await });
    assert!(matches!(peer.rx.recv().await, Some(ChannelMsg::Exec { .. })));
    peer.tx
        .send(ChannelMsg::Data {
            data: Bytes::from_static(b"early "),
        })
        .unwrap();
    peer.tx.send(ChannelMsg::Success).unwrap();
    peer.tx
        .send(ChannelMsg::Data {
            data: Bytes::from_static(b"late"),
        })
        .unwrap();
    peer.tx.send(ChannelMsg::Eof).unwrap();
    opening.await.unwrap().unwrap();

    let mut out = String::new();
    channel
        .take_stdout()
        .unwrap()
        .read_to_string(&mut out)
        .await
        .unwrap();
    assert_eq!(out, "early late");
}

#[tokio::test]
async fn concurrent_close_fires_closed_once() {
    let (channel, mut peer) = channel(command());
    open_command(&channel, &mut peer).await;
    let events = record(&channel);
    let server = confirm_close(peer);

    let (a, b) = (channel.clone(), channel.clone());
    let (ra, rb) = tokio::join!(a.close(), b.close());
    ra.unwrap();
    rb.unwrap();
    channel.close().await.unwrap();

    assert_eq!(
        lifecycle(&events),
        vec![ChannelEvent::Closing, ChannelEvent::Closed]
    );
    assert_eq!(channel.state(), ChannelState::Closed);
    let seen = server.await.unwrap();
    assert_eq!(seen, vec![ChannelMsg::Eof, ChannelMsg::Close]);
}

#[tokio::test]
async fn both_eofs_close_the_channel() {
    let (channel, mut peer) = channel(forwarding());
    let events = record(&channel);
    channel.open().await.unwrap();

    channel.eof().await.unwrap();
    assert_eq!(peer.rx.recv().await, Some(ChannelMsg::Eof));
    peer.tx.send(ChannelMsg::Eof).unwrap();
    assert_eq!(peer.rx.recv().await, Some(ChannelMsg::Close));
    peer.tx.send(ChannelMsg::Close).unwrap();

    until(|| channel.is_closed()).await;
    assert_eq!(
        lifecycle(&events),
        vec![
            ChannelEvent::Opened,
            ChannelEvent::Closing,
            ChannelEvent::Closed
        ]
    );
    let ends: Vec<_> = events
        .lock()
        .iter()
        .filter_map(|e| match e {
            ChannelEvent::EndOfStream { stream } => Some(*stream),
            _ => None,
        })
        .collect();
    // No extended stream on tunnels.
    assert_eq!(ends, vec![StreamKind::Stdin, StreamKind::Stdout]);
}

#[tokio::test]
async fn peer_close_closes_the_channel() {
    let (channel, mut peer) = channel(command());
    open_command(&channel, &mut peer).await;
    let events = record(&channel);
    peer.tx.send(ChannelMsg::Close).unwrap();

    until(|| channel.is_closed()).await;
    assert_eq!(channel.wait_exit_status().await, None);
    assert_eq!(
        lifecycle(&events),
        vec![ChannelEvent::Closing, ChannelEvent::Closed]
    );
    assert!(matches!(
        channel.signal(Sig::TERM).await,
        Err(Error::ChannelClosed)
    ));
}

#[tokio::test]
async fn exit_status_first_report_wins() {
    let (channel, mut peer) = channel(command());
    assert_eq!(channel.exit_status(), None);
    open_command(&channel, &mut peer).await;
    peer.tx
        .send(ChannelMsg::ExitStatus { exit_status: 0 })
        .unwrap();
    assert_eq!(channel.wait_exit_status().await, Some(0));
    peer.tx
        .send(ChannelMsg::ExitStatus { exit_status: 5 })
        .unwrap();
    peer.tx
        .send(ChannelMsg::ExitSignal {
            signal_name: Sig::KILL,
            core_dumped: false,
            error_message: String::new(),
            lang_tag: String::new(),
        })
        .unwrap();
    until(|| channel.exit_signal().is_some()).await;
    for _ in 0..3 {
        assert_eq!(channel.exit_status(), Some(0));
    }
    assert_eq!(channel.exit_signal().unwrap().signal_name, Sig::KILL);
    let server = confirm_close(peer);
    channel.close().await.unwrap();
    assert_eq!(channel.exit_status(), Some(0));
    server.await.unwrap();
}

#[tokio::test]
async fn operations_check_the_state() {
    let (channel, mut peer) = channel(command());
    assert!(matches!(
        channel.signal(Sig::INT).await,
        Err(Error::IllegalState { .. })
    ));
    assert!(matches!(
        channel.window_change(100, 40, 0, 0).await,
        Err(Error::IllegalState { .. })
    ));
    let _stdout = channel.take_stdout().unwrap();
    assert!(matches!(
        channel.take_stdout(),
        Err(Error::IllegalState { .. })
    ));
    let _stdin = channel.take_stdin().unwrap();
    assert!(matches!(
        channel.take_stdin(),
        Err(Error::IllegalState { .. })
    ));

    open_command(&channel, &mut peer).await;
    channel.window_change(100, 40, 0, 0).await.unwrap();
    assert_eq!(
        peer.rx.recv().await,
        Some(ChannelMsg::WindowChange {
            col_width: 100,
            row_height: 40,
            pix_width: 0,
            pix_height: 0
        })
    );
}

#[tokio::test]
async fn writes_keep_their_order() {
    let (channel, mut peer) = channel(forwarding());
    channel.open().await.unwrap();
    let events = record(&channel);
    let mut stdin = channel.take_stdin().unwrap();
    for chunk in [&b"one"[..], b"two", b"three"] {
        stdin.write_all(chunk).await.unwrap();
    }
    stdin.shutdown().await.unwrap();

    let mut received = Vec::new();
    while let Some(msg) = peer.rx.recv().await {
        match msg {
            ChannelMsg::Data { data } => received.push(data),
            ChannelMsg::Eof => break,
            other => panic!("unexpected {other:?}"),
        }
    }
    let sent: Vec<Bytes> = events
        .lock()
        .iter()
        .filter_map(|e| match e {
            ChannelEvent::DataSent { data } => Some(data.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(sent, received);
    assert_eq!(sent.concat(), b"onetwothree".to_vec());

    // EOF went out: further writes are refused.
    assert!(stdin.write_all(b"four").await.is_err());
}

#[tokio::test]
async fn large_writes_are_chunked() {
    let (channel, mut peer) = channel(forwarding());
    channel.open().await.unwrap();
    let mut stdin = channel.take_stdin().unwrap();
    let payload = vec![7u8; 100_000];
    let writer = tokio::spawn(async move {
        stdin.write_all(&payload).await.unwrap();
        stdin.shutdown().await.unwrap();
    });
    let mut total = 0;
    while let Some(ChannelMsg::Data { data }) = peer.rx.recv().await {
        assert!(data.len() <= 32768);
        total += data.len();
    }
    writer.await.unwrap();
    assert_eq!(total, 100_000);
}

#[tokio::test]
async fn received_data_in_arrival_order() {
    let (channel, mut peer) = channel(command());
    let events = record(&channel);
    open_command(&channel, &mut peer).await;
    for word in ["a", "b", "c"] {
        peer.tx
            .send(ChannelMsg::Data {
                data: Bytes::from(word),
            })
            .unwrap();
    }
    peer.tx.send(ChannelMsg::Eof).unwrap();
    let mut out = Vec::new();
    channel
        .take_stdout()
        .unwrap()
        .read_to_end(&mut out)
        .await
        .unwrap();
    assert_eq!(out, b"abc");
    let received: Vec<Bytes> = events
        .lock()
        .iter()
        .filter_map(|e| match e {
            ChannelEvent::DataReceived {
                stream: StreamKind::Stdout,
                data,
            } => Some(data.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(received.concat(), b"abc".to_vec());
}

#[tokio::test]
async fn write_after_close_fails() {
    let (channel, mut peer) = channel(command());
    open_command(&channel, &mut peer).await;
    let mut stdin = channel.take_stdin().unwrap();
    let server = confirm_close(peer);
    channel.close().await.unwrap();
    server.await.unwrap();
    let err = stdin.write_all(b"late").await.unwrap_err();
    assert!(err
        .get_ref()
        .and_then(|e| e.downcast_ref::<Error>())
        .is_some_and(|e| matches!(e, Error::ChannelClosed)));
}

#[tokio::test]
async fn stderr_has_its_own_queue() {
    let (channel, mut peer) = channel(command());
    open_command(&channel, &mut peer).await;
    peer.tx
        .send(ChannelMsg::ExtendedData {
            data: Bytes::from_static(b"oops"),
            ext: 1,
        })
        .unwrap();
    peer.tx
        .send(ChannelMsg::ExtendedData {
            data: Bytes::from_static(b"ignored"),
            ext: 2,
        })
        .unwrap();
    peer.tx
        .send(ChannelMsg::Data {
            data: Bytes::from_static(b"fine"),
        })
        .unwrap();
    peer.tx.send(ChannelMsg::Eof).unwrap();

    // Stdout is readable without anyone consuming stderr.
    let mut out = Vec::new();
    channel
        .take_stdout()
        .unwrap()
        .read_to_end(&mut out)
        .await
        .unwrap();
    assert_eq!(out, b"fine");
    let mut err = Vec::new();
    channel
        .take_stderr()
        .unwrap()
        .read_to_end(&mut err)
        .await
        .unwrap();
    assert_eq!(err, b"oops");
}

#[tokio::test]
async fn extended_handler_detach_returns_the_queue() {
    let (channel, mut peer) = channel(command());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = seen.clone();
    channel
        .set_extended_handler(Some(Arc::new(move |data: &[u8]| {
            s.lock().extend_from_slice(data)
        })))
        .await
        .unwrap();
    assert!(matches!(
        channel.take_stderr(),
        Err(Error::IllegalState { .. })
    ));
    open_command(&channel, &mut peer).await;

    peer.tx
        .send(ChannelMsg::ExtendedData {
            data: Bytes::from_static(b"first"),
            ext: 1,
        })
        .unwrap();
    until(|| seen.lock().len() == 5).await;

    channel.set_extended_handler(None).await.unwrap();
    peer.tx
        .send(ChannelMsg::ExtendedData {
            data: Bytes::from_static(b"second"),
            ext: 1,
        })
        .unwrap();
    peer.tx.send(ChannelMsg::Eof).unwrap();

    let mut rest = Vec::new();
    channel
        .take_stderr()
        .unwrap()
        .read_to_end(&mut rest)
        .await
        .unwrap();
    assert_eq!(rest, b"second");
    assert_eq!(*seen.lock(), b"first".to_vec());
}

#[tokio::test]
async fn join_runs_every_direction() {
    let (channel, mut peer) = channel(command());
    open_command(&channel, &mut peer).await;
    let server = tokio::spawn(async move {
        while let Some(msg) = peer.rx.recv().await {
            match msg {
                ChannelMsg::Data { data } => {
                    let upper = Bytes::from(data.to_ascii_uppercase());
                    peer.tx.send(ChannelMsg::Data { data: upper }).unwrap();
                    peer.tx
                        .send(ChannelMsg::ExtendedData {
                            data: Bytes::from_static(b"!"),
                            ext: 1,
                        })
                        .unwrap();
                }
                ChannelMsg::Eof => {
                    peer.tx.send(ChannelMsg::Eof).unwrap();
                    peer.tx
                        .send(ChannelMsg::ExitStatus { exit_status: 3 })
                        .unwrap();
                    peer.tx.send(ChannelMsg::Close).unwrap();
                }
                ChannelMsg::Close => break,
                _ => {}
            }
        }
    });

    let (out_w, mut out_r) = tokio::io::duplex(1024);
    let (err_w, mut err_r) = tokio::io::duplex(1024);
    let status = channel.join(&b"hello"[..], out_w, err_w).await.unwrap();
    assert_eq!(status, Some(3));
    assert!(channel.is_closed());

    let mut out = Vec::new();
    out_r.read_to_end(&mut out).await.unwrap();
    assert_eq!(out, b"HELLO");
    let mut err = Vec::new();
    err_r.read_to_end(&mut err).await.unwrap();
    assert_eq!(err, b"!");
    server.await.unwrap();
}

#[tokio::test]
async fn close_during_open_stays_closed() {
    let (channel, mut peer) = channel(command());
    let events = record(&channel);
    let c = channel.clone();
    let opening = tokio::spawn(async move { c.open().await });
    assert!(matches!(peer.rx.recv().await, Some(ChannelMsg::Exec { .. })));

    channel.close().await.unwrap();
    assert_eq!(channel.state(), ChannelState::Closed);
    // The pending setup request gives up without waiting for the peer.
    let opened = tokio::time::timeout(Duration::from_secs(1), opening)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(opened, Err(Error::ChannelClosed)));

    // The open is over, so nobody reads this reply anymore.
    let _ = peer.tx.send(ChannelMsg::Close);
    assert_eq!(peer.rx.recv().await, Some(ChannelMsg::Close));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(peer.rx.try_recv().is_err());
    assert_eq!(channel.state(), ChannelState::Closed);
    assert_eq!(
        lifecycle(&events),
        vec![ChannelEvent::Closing, ChannelEvent::Closed]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn close_right_after_open_keeps_event_order() {
    let (channel, mut peer) = channel(command());
    let events = record(&channel);
    // A slow listener widens the window between the state change and
    // the `Opened` delivery.
    channel.add_listener(Arc::new(|_: ChannelId, event: &ChannelEvent| {
        if *event == ChannelEvent::Opened {
            std::thread::sleep(Duration::from_millis(100));
        }
    }));
    let c = channel.clone();
    let opening = tokio::spawn(async move { c.open().await });
    assert!(matches!(peer.rx.recv().await, Some(ChannelMsg::Exec { .. })));

    let c = channel.clone();
    let closing = tokio::spawn(async move {
        while c.state() == ChannelState::Opening {
            tokio::task::yield_now().await;
        }
        c.close().await
    });
    peer.tx.send(ChannelMsg::Success).unwrap();
    let server = confirm_close(peer);

    opening.await.unwrap().unwrap();
    closing.await.unwrap().unwrap();
    server.await.unwrap();
    assert_eq!(
        lifecycle(&events),
        vec![
            ChannelEvent::Opened,
            ChannelEvent::Closing,
            ChannelEvent::Closed
        ]
    );
}

/// A local input that fails on the first read.
struct BrokenInput;

impl tokio::io::AsyncRead for BrokenInput {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
        _buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Err(std::io::Error::other("terminal gone")))
    }
}

#[tokio::test]
async fn join_survives_a_failed_input() {
    let (channel, mut peer) = channel(command());
    open_command(&channel, &mut peer).await;
    let server = tokio::spawn(async move {
        while let Some(msg) = peer.rx.recv().await {
            match msg {
                ChannelMsg::Eof => {
                    peer.tx.send(ChannelMsg::Eof).unwrap();
                    peer.tx
                        .send(ChannelMsg::ExitStatus { exit_status: 1 })
                        .unwrap();
                    peer.tx.send(ChannelMsg::Close).unwrap();
                }
                ChannelMsg::Close => break,
                _ => {}
            }
        }
    });

    let status = channel
        .join(BrokenInput, tokio::io::sink(), tokio::io::sink())
        .await
        .unwrap();
    assert_eq!(status, Some(1));
    assert!(channel.is_closed());
    server.await.unwrap();
}
