use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tracing::{debug, info, warn};

use crate::engine::NativeEngine;
use crate::model::devices::{DeviceCapabilities, DeviceScan, ScanResult};

type ScanFuture = Shared<BoxFuture<'static, Result<DeviceScan, String>>>;

struct InFlight {
    id: u64,
    epoch: u64,
    future: ScanFuture,
}

#[derive(Default)]
struct CacheState {
    cached: Option<DeviceScan>,
    in_flight: Option<InFlight>,
    /// Bumped by `invalidate`. A probe started under an older epoch may
    /// still answer its callers but never fills the cache.
    epoch: u64,
    next_flight: u64,
}

/// Caches the engine's device scan. Reads never block; refreshes are
/// single-flight.
pub struct DeviceCapabilityCache {
    engine: Arc<dyn NativeEngine>,
    state: Mutex<CacheState>,
}

impl DeviceCapabilityCache {
    pub fn new(engine: Arc<dyn NativeEngine>) -> Self {
        Self {
            engine,
            state: Mutex::new(CacheState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The cached scan, or a no-data hint if there is none.
    pub fn scan(&self) -> ScanResult {
        match &self.state().cached {
            Some(scan) => ScanResult::cached(scan.clone()),
            None => ScanResult::hint(),
        }
    }

    pub fn cached_capabilities(&self) -> Option<DeviceCapabilities> {
        self.state()
            .cached
            .as_ref()
            .map(|scan| scan.capabilities.clone())
    }

    pub fn is_scanning(&self) -> bool {
        self.state().in_flight.is_some()
    }

    /// Start a probe, or join the one already running, and wait for it.
    pub async fn scan_async(&self) -> ScanResult {
        let (id, epoch, future) = {
            let mut state = self.state();
            let joined = state
                .in_flight
                .as_ref()
                .map(|f| (f.id, f.epoch, f.future.clone()));
            match joined {
                Some(flight) => {
                    debug!("Joining in-flight device scan {}", flight.0);
                    flight
                }
                None => {
                    state.next_flight += 1;
                    let id = state.next_flight;
                    let epoch = state.epoch;
                    let future = probe(self.engine.clone());
                    state.in_flight = Some(InFlight {
                        id,
                        epoch,
                        future: future.clone(),
                    });
                    info!("Starting device scan {}", id);
                    (id, epoch, future)
                }
            }
        };

        let outcome = future.await;

        let mut state = self.state();
        if state.in_flight.as_ref().is_some_and(|f| f.id == id) {
            state.in_flight = None;
        }
        match outcome {
            Ok(scan) => {
                if state.epoch == epoch {
                    state.cached = Some(scan.clone());
                } else {
                    debug!("Device scan {} finished after invalidation, not caching", id);
                }
                ScanResult::fresh(scan)
            }
            Err(e) => ScanResult::failed(e),
        }
    }

    pub fn invalidate(&self) {
        let mut state = self.state();
        state.epoch += 1;
        state.cached = None;
        state.in_flight = None;
        info!("Device capability cache cleared");
    }
}

fn probe(engine: Arc<dyn NativeEngine>) -> ScanFuture {
    async move {
        match AssertUnwindSafe(engine.scan_devices()).catch_unwind().await {
            Ok(Ok(scan)) => Ok(scan),
            Ok(Err(e)) => {
                warn!("Device scan failed: {}", e);
                Err(e.to_string())
            }
            Err(_) => {
                warn!("Device scan panicked");
                Err("device scan panicked".to_string())
            }
        }
    }
    .boxed()
    .shared()
}
