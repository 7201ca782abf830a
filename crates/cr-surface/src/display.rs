//! Display clock - the platform presenter.
//!
//! Runs on its own thread, independent of both the host and the sandbox.
//! Every refresh tick it presents the latest submission of each live
//! surface into its linked view, then publishes the tick count.

use crate::surface::{SurfaceError, SurfaceShared};
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, trace};

type SurfaceList = Arc<Mutex<Vec<Weak<SurfaceShared>>>>;

/// Platform display with a fixed refresh interval.
pub struct Display {
    surfaces: SurfaceList,
    ticks: watch::Receiver<u64>,
    refresh: Duration,
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Display {
    /// Start the presenter thread.
    pub fn start(refresh: Duration) -> Result<Self, SurfaceError> {
        let surfaces: SurfaceList = Arc::new(Mutex::new(Vec::new()));
        let (tick_tx, ticks) = watch::channel(0u64);
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let list = surfaces.clone();
        let thread = thread::Builder::new()
            .name("display".to_string())
            .spawn(move || {
                debug!("Display started ({:?} refresh)", refresh);
                loop {
                    match stop_rx.recv_timeout(refresh) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                    let presented = present_all(&list);
                    tick_tx.send_modify(|tick| *tick += 1);
                    trace!("Display tick ({} surfaces presented)", presented);
                }
                debug!("Display stopped");
            })
            .map_err(|e| SurfaceError::Spawn(e.to_string()))?;

        info!("Display running at {:?} per frame", refresh);
        Ok(Self {
            surfaces,
            ticks,
            refresh,
            stop: Some(stop_tx),
            thread: Some(thread),
        })
    }

    pub fn refresh_interval(&self) -> Duration {
        self.refresh
    }

    /// Number of ticks since start.
    pub fn frame_count(&self) -> u64 {
        *self.ticks.borrow()
    }

    /// Resolve on the next refresh tick, returning its count.
    pub async fn next_frame(&self) -> Result<u64, SurfaceError> {
        let mut ticks = self.ticks.clone();
        ticks.borrow_and_update();
        ticks.changed().await.map_err(|_| SurfaceError::DisplayStopped)?;
        let tick = *ticks.borrow();
        Ok(tick)
    }

    pub(crate) fn register(&self, surface: &Arc<SurfaceShared>) {
        let mut list = self.surfaces.lock().unwrap_or_else(|p| p.into_inner());
        list.push(Arc::downgrade(surface));
        debug!("Display tracking {}", surface.id());
    }
}

impl Drop for Display {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn present_all(list: &SurfaceList) -> usize {
    let mut list = list.lock().unwrap_or_else(|p| p.into_inner());
    list.retain(|weak| weak.strong_count() > 0);
    list.iter()
        .filter_map(Weak::upgrade)
        .filter(|surface| surface.present())
        .count()
}
