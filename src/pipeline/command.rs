//! Command listener
//!
//! Runs on its own single-worker runtime next to the render loop. Any
//! instruction on the control input, or end of input, means "stop
//! gracefully": the listener sets the controller's `finished` flag and
//! exits. The main task releases it through the controller's cancellation
//! token when it stops for any other reason.

use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{exit, LifecycleController};

/// Longest instruction read from the control input
const MAX_COMMAND_LEN: usize = 15;

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("failed to start command listener: {0}")]
    Start(#[from] std::io::Error),
}

impl CommandError {
    pub fn exit_code(&self) -> i32 {
        exit::COMMAND_LISTENER_FAILED
    }
}

pub struct CommandChannel {
    runtime: Option<Runtime>,
    handle: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl CommandChannel {
    /// Start listening on `input`
    pub fn start<R>(input: R, controller: Arc<LifecycleController>) -> Result<Self, CommandError>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("command")
            .enable_all()
            .build()?;

        let cancel = controller.listener_token();
        let handle = runtime.spawn(listen(input, controller, cancel.clone()));
        debug!("Command listener started");

        Ok(Self {
            runtime: Some(runtime),
            handle: Some(handle),
            cancel,
        })
    }

    /// True until the listener task has returned
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Release a blocked listener and wait for it to return
    pub fn interrupt(&mut self) {
        self.cancel.cancel();

        if let Some(runtime) = self.runtime.take() {
            if let Some(handle) = self.handle.take() {
                if let Err(e) = runtime.block_on(handle) {
                    warn!("Command listener ended abnormally: {}", e);
                }
            }
            // A blocking stdin read may still hold a worker; do not wait for it
            runtime.shutdown_background();
            debug!("Command listener stopped");
        }
    }
}

impl Drop for CommandChannel {
    fn drop(&mut self) {
        self.interrupt();
    }
}

async fn listen<R>(mut input: R, controller: Arc<LifecycleController>, cancel: CancellationToken)
where
    R: AsyncRead + Unpin,
{
    let mut command = [0u8; MAX_COMMAND_LEN];

    tokio::select! {
        _ = cancel.cancelled() => {
            debug!("Command listener interrupted");
        }
        read = input.read(&mut command) => match read {
            Ok(0) => info!("Control input closed"),
            Ok(n) => info!(
                "Received command {:?}",
                String::from_utf8_lossy(&command[..n]).trim()
            ),
            Err(e) => warn!("Failed to read control input: {}", e),
        },
    }

    controller.mark_finished();
}
