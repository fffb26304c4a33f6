use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use anyssh_util::runtime::{spawn, JoinHandle};
use bytes::Bytes;
use log::{debug, error, warn};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

use super::{Channel, ChannelEvent, ChannelShared, StreamKind};
use crate::Error;

/// Consumer of the extended (stderr) stream, fed by a dedicated task.
pub trait ExtendedDataHandler: Send + Sync {
    fn on_data(&self, data: &[u8]);

    /// The peer sent EOF.
    fn on_end(&self) {}
}

impl<F> ExtendedDataHandler for F
where
    F: Fn(&[u8]) + Send + Sync,
{
    fn on_data(&self, data: &[u8]) {
        self(data)
    }
}

pub(crate) struct ExtendedPump {
    token: CancellationToken,
    handle: JoinHandle<UnboundedReceiver<Bytes>>,
}

fn start(
    shared: Arc<ChannelShared>,
    mut rx: UnboundedReceiver<Bytes>,
    handler: Arc<dyn ExtendedDataHandler>,
) -> ExtendedPump {
    let token = shared.token.child_token();
    let stop = token.clone();
    let handle = spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                chunk = rx.recv() => match chunk {
                    Some(data) => {
                        shared.fire(ChannelEvent::DataReceived {
                            stream: StreamKind::Stderr,
                            data: data.clone(),
                        });
                        if catch_unwind(AssertUnwindSafe(|| handler.on_data(&data))).is_err() {
                            error!("channel {}: extended data handler panicked", shared.id);
                        }
                    }
                    None => {
                        if catch_unwind(AssertUnwindSafe(|| handler.on_end())).is_err() {
                            error!("channel {}: extended data handler panicked", shared.id);
                        }
                        break;
                    }
                },
            }
        }
        // Whatever was not delivered stays in the queue.
        rx
    });
    ExtendedPump { token, handle }
}

impl Channel {
    /// Route the extended stream to `handler`, or, with `None`, stop
    /// routing it. Bytes not yet delivered when the handler is removed
    /// remain readable through [`Channel::take_stderr`].
    ///
    /// Does not block the primary stream: both have their own queue.
    pub async fn set_extended_handler(
        &self,
        handler: Option<Arc<dyn ExtendedDataHandler>>,
    ) -> Result<(), Error> {
        let shared = self.shared();
        let previous = shared.extended.lock().take();
        if let Some(pump) = previous {
            debug!("channel {}: detaching extended data handler", shared.id);
            pump.token.cancel();
            match pump.handle.await {
                Ok(rx) => *shared.stderr.lock() = Some(rx),
                Err(e) => warn!("channel {}: extended pump failed: {e}", shared.id),
            }
        }
        if let Some(handler) = handler {
            let rx = shared.stderr.lock().take();
            let Some(rx) = rx else {
                return Err(Error::IllegalState {
                    operation: "set_extended_handler",
                    state: "stderr already taken".to_string(),
                });
            };
            *shared.extended.lock() = Some(start(shared.clone(), rx, handler));
        }
        Ok(())
    }
}
