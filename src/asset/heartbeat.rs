use crate::asset::AssetManager;
use core::time::Duration;
use std::{
    io,
    sync::{
        Arc,
        mpsc::{self, RecvTimeoutError},
    },
    thread::{self, JoinHandle},
};
use tracing::{debug, trace};

/// Background task periodically checking every asset of a set of managers.
///
/// Started and stopped explicitly; dropping the heartbeat stops it and joins
/// its thread.
#[derive(Debug)]
pub struct Heartbeat {
    stop: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Heartbeat {
    /// Spawns the heartbeat thread.
    ///
    /// # Errors
    /// If the OS refuses to spawn the thread.
    pub fn start(managers: Vec<Arc<AssetManager>>, interval: Duration) -> io::Result<Self> {
        let (stop, signal) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name("asset-heartbeat".into())
            .spawn(move || {
                debug!(?interval, managers = managers.len(), "heartbeat started");
                loop {
                    match signal.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            for manager in &managers {
                                let checked = manager.check_on_assets();
                                trace!(manager = %manager.name(), checked, "heartbeat tick");
                            }
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("heartbeat stopped");
            })?;
        Ok(Self {
            stop: Some(stop),
            handle: Some(handle),
        })
    }

    /// Stops the heartbeat and waits for its thread to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            // The thread may already have exited; nothing to signal then.
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("heartbeat thread panicked");
            }
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.shutdown();
    }
}
