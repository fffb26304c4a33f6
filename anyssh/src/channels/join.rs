use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use super::Channel;
use crate::Error;

impl Channel {
    /// Connect the channel to local streams, e.g. a terminal.
    ///
    /// Each direction runs in its own task and only ends its own
    /// direction: local EOF on `input` sends EOF to the peer, remote EOF
    /// ends `output` and `error`. Once the peer is done, the channel is
    /// closed and its exit status returned.
    pub async fn join<I, O, E>(&self, input: I, output: O, error: E) -> Result<Option<u32>, Error>
    where
        I: AsyncRead + Unpin + Send + 'static,
        O: AsyncWrite + Unpin + Send + 'static,
        E: AsyncWrite + Unpin + Send + 'static,
    {
        let mut stdin = self.take_stdin()?;
        let mut stdout = self.take_stdout()?;
        let mut stderr = self.take_stderr()?;
        let id = self.id();

        let input_task = anyssh_util::runtime::spawn(async move {
            let mut input = input;
            let copied = tokio::io::copy(&mut input, &mut stdin).await;
            if let Err(e) = stdin.shutdown().await {
                debug!("channel {id}: could not send EOF: {e}");
            }
            copied
        });
        let output_task = anyssh_util::runtime::spawn(async move {
            let mut output = output;
            let copied = tokio::io::copy(&mut stdout, &mut output).await;
            output.flush().await?;
            copied
        });
        let error_task = anyssh_util::runtime::spawn(async move {
            let mut error = error;
            let copied = tokio::io::copy(&mut stderr, &mut error).await;
            error.flush().await?;
            copied
        });

        let output_result = output_task.await;
        let error_result = error_task.await;
        let input_result = if input_task.is_finished() {
            Some(input_task.await)
        } else {
            // Still waiting on local input, which nobody will read now.
            input_task.abort();
            None
        };
        let close_result = self.close().await;

        let results = [
            ("stdin", input_result),
            ("stdout", Some(output_result)),
            ("stderr", Some(error_result)),
        ];
        for (name, result) in results {
            let Some(result) = result else {
                debug!("channel {id}: {name} abandoned");
                continue;
            };
            match result {
                Ok(Ok(n)) => debug!("channel {id}: {name} done after {n} bytes"),
                Ok(Err(e)) => warn!("channel {id}: {name} copy failed: {e}"),
                Err(e) => warn!("channel {id}: {name} task failed: {e}"),
            }
        }
        close_result?;
        Ok(self.exit_status())
    }
}
