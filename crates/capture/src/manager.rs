//! Camera manager: owns the worker set and their surfaces.
//!
//! One manager instance corresponds to one generation of discovered
//! devices. Re-initialization replaces the whole generation; per-camera
//! recovery goes through [`Manager::restart_camera_by_index`]. Startup is
//! staggered so decoder children do not contend for USB bandwidth while
//! negotiating their streams.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use camgrid_core::surface::FrameSurface;
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::device::{CameraDevice, discover_devices};
use crate::worker::CaptureWorker;
use crate::{CaptureError, CaptureSettings};

const STAGGER_DELAY: Duration = Duration::from_millis(500);

/// Errors from manager operations.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    /// `start` or a restart was attempted before `initialize` (or after a
    /// concurrent `stop`).
    #[error("camera manager not initialized")]
    NotInitialized,
    /// No worker at the given slot index.
    #[error("no camera at index {0}")]
    NoSuchCamera(usize),
    /// A worker operation failed.
    #[error(transparent)]
    Worker(#[from] CaptureError),
}

#[derive(Default)]
struct Collections {
    cameras: Vec<CameraDevice>,
    workers: Vec<CaptureWorker>,
    surfaces: HashMap<String, Arc<FrameSurface>>,
}

/// Owner of the camera set: devices, workers, and latest-frame surfaces.
pub struct Manager {
    collections: RwLock<Collections>,
    running: AtomicBool,
    settings: CaptureSettings,
    slot_count: usize,
}

impl Manager {
    /// Create an empty manager with the shared capture settings.
    pub fn new(settings: CaptureSettings, slot_count: usize) -> Self {
        Self {
            collections: RwLock::new(Collections::default()),
            running: AtomicBool::new(false),
            settings,
            slot_count,
        }
    }

    /// Discover devices and build one surface and one worker per device.
    ///
    /// Any previous generation of workers is stopped first. An empty
    /// discovery result is a valid steady state; hot-plug detection may
    /// populate the set later.
    pub fn initialize(&self) {
        info!("stopping existing workers before discovery");
        self.stop();

        let cameras = discover_devices(&self.settings, self.slot_count);

        let mut workers = Vec::with_capacity(cameras.len());
        let mut surfaces = HashMap::with_capacity(cameras.len());
        for camera in &cameras {
            debug!(camera = %camera.id, "creating capture worker");
            let surface = Arc::new(FrameSurface::new());
            surfaces.insert(camera.id.clone(), Arc::clone(&surface));
            workers.push(CaptureWorker::new(camera.clone(), surface, self.settings));
        }

        let mut collections = self.collections.write();
        collections.cameras = cameras;
        collections.workers = workers;
        collections.surfaces = surfaces;
        drop(collections);

        self.running.store(true, Ordering::Release);
        info!("manager initialized");
    }

    /// Start all workers, staggered 500 ms apart to reduce simultaneous USB
    /// bandwidth demand during decoder start-up.
    ///
    /// The collection lock is never held across the stagger sleep, so
    /// readers can obtain surfaces while startup proceeds. If the manager
    /// is stopped concurrently the remaining starts are abandoned.
    pub fn start(&self) -> Result<(), ManagerError> {
        if !self.running.load(Ordering::Acquire) {
            return Err(ManagerError::NotInitialized);
        }

        let total = self.collections.read().workers.len();
        for index in 0..total {
            if index > 0 {
                debug!("waiting {STAGGER_DELAY:?} before starting camera {}", index + 1);
                thread::sleep(STAGGER_DELAY);
            }

            let collections = self.collections.read();
            if !self.running.load(Ordering::Acquire) {
                return Err(ManagerError::NotInitialized);
            }
            let Some(worker) = collections.workers.get(index).cloned() else {
                break;
            };
            drop(collections);

            worker.start()?;
            info!("started camera {}/{}", index + 1, total);
        }
        Ok(())
    }

    /// Stop all workers and clear the collections. Idempotent.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);

        // Take the collections out under the lock, stop outside it: worker
        // stops can block for up to two seconds each.
        let workers = {
            let mut collections = self.collections.write();
            collections.cameras.clear();
            collections.surfaces.clear();
            std::mem::take(&mut collections.workers)
        };
        for worker in &workers {
            worker.stop();
        }
        if !workers.is_empty() {
            info!("stopped {} capture worker(s)", workers.len());
        }
    }

    /// Snapshot of the discovered devices.
    pub fn cameras(&self) -> Vec<CameraDevice> {
        self.collections.read().cameras.clone()
    }

    /// The latest-frame surface for a camera id, if present.
    pub fn frame_surface(&self, camera_id: &str) -> Option<Arc<FrameSurface>> {
        self.collections.read().surfaces.get(camera_id).cloned()
    }

    /// Fan a new target FPS out to every worker.
    pub fn set_fps(&self, fps: u32) {
        for worker in self.collections.read().workers.iter() {
            worker.set_fps(fps);
        }
    }

    /// Restart the worker at `index`.
    ///
    /// The worker handle is cloned out under the read lock before the
    /// blocking restart, so other slots are never held up.
    pub fn restart_camera_by_index(&self, index: usize) -> Result<(), ManagerError> {
        if !self.running.load(Ordering::Acquire) {
            return Err(ManagerError::NotInitialized);
        }
        let worker = self
            .collections
            .read()
            .workers
            .get(index)
            .cloned()
            .ok_or(ManagerError::NoSuchCamera(index))?;
        info!(camera = %worker.device().id, "restarting capture worker");
        worker.restart()?;
        Ok(())
    }

    /// Whether `initialize` has completed and `stop` has not been called.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Number of camera slots this manager may fill.
    pub fn slot_count(&self) -> usize {
        self.slot_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> Manager {
        Manager::new(CaptureSettings::default(), 3)
    }

    #[test]
    fn start_before_initialize_is_rejected() {
        let m = manager();
        assert!(matches!(m.start(), Err(ManagerError::NotInitialized)));
    }

    #[test]
    fn restart_on_empty_manager_is_rejected() {
        let m = manager();
        assert!(matches!(
            m.restart_camera_by_index(0),
            Err(ManagerError::NotInitialized)
        ));
    }

    #[test]
    fn unknown_surface_is_none() {
        let m = manager();
        assert!(m.frame_surface("video99").is_none());
    }

    #[test]
    fn stop_is_idempotent() {
        let m = manager();
        m.stop();
        m.stop();
        assert!(!m.is_running());
        assert!(m.cameras().is_empty());
    }
}
