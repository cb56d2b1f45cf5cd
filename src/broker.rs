//! Buffer broker: pool sizing plus the lock/unlock lifecycle tying
//! opaque external buffer handles to device buffer indices.
//!
//! Zero-copy safety lives here: a buffer is either device-owned (locked)
//! or consumer-owned, never both. Exactly one outstanding lock per handle
//! and per device index at a time.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, error, warn};

use crate::error::{CameraError, Result};
use crate::traits::{BufferAllocator, VideoDevice};
use crate::types::{BufferHandle, DeviceRegion, StreamFormat};

#[derive(Clone)]
struct LockedSlot {
    handle: BufferHandle,
}

struct PoolState {
    slots: Vec<Option<LockedSlot>>,
}

/// Manages the device buffer pool and the in-use marking of external
/// buffer handles.
pub struct BufferBroker<D> {
    device: Arc<D>,
    allocator: Arc<dyn BufferAllocator>,
    state: Mutex<PoolState>,
}

impl<D: VideoDevice> BufferBroker<D> {
    /// Create a broker over a device and an external allocator.
    pub fn new(device: Arc<D>, allocator: Arc<dyn BufferAllocator>) -> Self {
        Self {
            device,
            allocator,
            state: Mutex::new(PoolState { slots: Vec::new() }),
        }
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Size a buffer pool for the given format and switch the device into
    /// user-pointer buffer mode. The device may clamp the requested
    /// count; what it grants is the pool size.
    ///
    /// Replacing a pool is destructive: the device releases any buffers
    /// it was holding, so every outstanding lock is force-released. A
    /// device-side failure is reported over an unlock failure; an unlock
    /// failure after a successful device call is still surfaced.
    pub fn request_pool(&self, format: &StreamFormat) -> Result<u32> {
        debug!("requesting buffer pool for {format}");
        let device_result = self.device.request_buffers(1);
        let unlock_result = self.unlock_all();
        let granted = device_result?;
        unlock_result?;

        if granted < 1 {
            error!("device claims it cannot handle any buffers");
            return Err(CameraError::InsufficientBuffers);
        }

        let mut state = self.state();
        state.slots = vec![None; granted as usize];
        Ok(granted)
    }

    /// Lock an external buffer for device write access and assign it a
    /// device buffer index.
    pub fn lock(&self, format: &StreamFormat, handle: &BufferHandle) -> Result<(u32, DeviceRegion)> {
        if handle.fourcc != format.fourcc
            || handle.width != format.width
            || handle.height != format.height
        {
            return Err(CameraError::BufferIncompatible(
                "buffer geometry does not match the negotiated format",
            ));
        }
        if handle.bytes_per_line != 0 && handle.bytes_per_line < format.bytes_per_line {
            return Err(CameraError::BufferIncompatible(
                "buffer stride is smaller than the device stride",
            ));
        }

        let mut state = self.state();
        if state
            .slots
            .iter()
            .flatten()
            .any(|slot| slot.handle.id == handle.id)
        {
            return Err(CameraError::BufferBusy(handle.id));
        }
        let index = state
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(CameraError::InsufficientBuffers)?;

        let region = self.allocator.lock(handle, format.bytes_per_line)?;
        if let Some(slot) = state.slots.get_mut(index) {
            *slot = Some(LockedSlot {
                handle: handle.clone(),
            });
        }

        #[allow(clippy::cast_possible_truncation)]
        let index = index as u32;
        Ok((index, region))
    }

    /// Release the in-use marking of one device buffer index. Calling
    /// this when nothing is locked is a no-op, not an error, to keep
    /// cleanup paths simple.
    pub fn unlock(&self, index: u32) -> Result<()> {
        let slot = {
            let mut state = self.state();
            match state.slots.get_mut(index as usize) {
                Some(slot) => slot.take(),
                None => None,
            }
        };
        match slot {
            Some(locked) => self.allocator.unlock(&locked.handle),
            None => Ok(()),
        }
    }

    /// Force-release every outstanding lock. A buffer must never stay
    /// locked across a streaming-state reset. Reports the first allocator
    /// failure after attempting every release.
    pub fn unlock_all(&self) -> Result<()> {
        let taken: Vec<LockedSlot> = {
            let mut state = self.state();
            state.slots.iter_mut().filter_map(Option::take).collect()
        };

        let mut first_error = None;
        for locked in taken {
            if let Err(err) = self.allocator.unlock(&locked.handle) {
                warn!("failed to unlock buffer {}: {err}", locked.handle.id);
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Number of buffers currently locked for device access.
    #[must_use]
    pub fn locked_count(&self) -> usize {
        self.state().slots.iter().flatten().count()
    }
}
