//! Network-visible ("public") buffers used by a gather.
//!
//! The root registers its full result buffer with the transport; every other
//! rank allocates a working buffer large enough for the biggest single-round
//! receive. Registration and release always use the same call family and the
//! same size.

use std::collections::HashMap;

use serde::Serialize;
use tracing::{debug, trace};

use super::geometry::GatherGeometry;
use super::topology::TreeShape;
use crate::error::{GatherError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PublicHandle(pub u64);

/// Memory-registration side of the transport.
pub trait PublicMemory {
    /// Registers caller-provided memory as network addressable.
    fn make_public_buffer(&mut self, data: Vec<u8>) -> Result<PublicHandle>;
    /// Allocates fresh network-addressable memory.
    fn allocate_public_buffer(&mut self, size: u64) -> Result<PublicHandle>;
    /// Undoes `make_public_buffer`, handing the memory back to its owner.
    fn unmake_public_buffer(&mut self, handle: PublicHandle, size: u64) -> Result<Vec<u8>>;
    /// Undoes `allocate_public_buffer`.
    fn free_public_buffer(&mut self, handle: PublicHandle, size: u64) -> Result<()>;

    fn bytes(&self, handle: PublicHandle) -> Option<&[u8]>;
    fn bytes_mut(&mut self, handle: PublicHandle) -> Option<&mut [u8]>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Made,
    Allocated,
}

#[derive(Debug)]
struct Region {
    data: Vec<u8>,
    origin: Origin,
}

/// Call counters, mostly for tests and the CLI summary.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RegistryCounters {
    pub made: u64,
    pub allocated: u64,
    pub unmade: u64,
    pub freed: u64,
}

/// In-simulation registry of public memory, optionally bounded.
#[derive(Debug, Default)]
pub struct PublicMemoryRegistry {
    regions: HashMap<PublicHandle, Region>,
    next_handle: u64,
    capacity_bytes: Option<u64>,
    registered_bytes: u64,
    pub counters: RegistryCounters,
}

impl PublicMemoryRegistry {
    pub fn with_capacity_bytes(capacity_bytes: u64) -> Self {
        Self {
            capacity_bytes: Some(capacity_bytes),
            ..Self::default()
        }
    }

    pub fn registered_bytes(&self) -> u64 {
        self.registered_bytes
    }

    pub fn live_regions(&self) -> usize {
        self.regions.len()
    }

    fn reserve(&mut self, size: u64) -> Result<()> {
        if let Some(cap) = self.capacity_bytes {
            let available = cap.saturating_sub(self.registered_bytes);
            if size > available {
                return Err(GatherError::OutOfPublicMemory {
                    requested: size,
                    available,
                });
            }
        }
        self.registered_bytes = self.registered_bytes.saturating_add(size);
        Ok(())
    }

    fn insert(&mut self, data: Vec<u8>, origin: Origin) -> PublicHandle {
        let handle = PublicHandle(self.next_handle);
        self.next_handle = self.next_handle.wrapping_add(1);
        trace!(?handle, bytes = data.len(), ?origin, "registered public region");
        self.regions.insert(handle, Region { data, origin });
        handle
    }

    fn remove(&mut self, handle: PublicHandle, size: u64, origin: Origin) -> Result<Vec<u8>> {
        let region = self
            .regions
            .get(&handle)
            .ok_or(GatherError::UnknownBuffer(handle))?;
        if region.origin != origin {
            return Err(GatherError::Internal(format!(
                "public buffer {handle:?} released through the wrong call ({:?} vs {:?})",
                origin, region.origin
            )));
        }
        let expected = region.data.len() as u64;
        if expected != size {
            return Err(GatherError::SizeMismatch {
                handle,
                expected,
                actual: size,
            });
        }
        self.registered_bytes = self.registered_bytes.saturating_sub(size);
        let region = self
            .regions
            .remove(&handle)
            .ok_or(GatherError::UnknownBuffer(handle))?;
        Ok(region.data)
    }
}

impl PublicMemory for PublicMemoryRegistry {
    fn make_public_buffer(&mut self, data: Vec<u8>) -> Result<PublicHandle> {
        self.reserve(data.len() as u64)?;
        self.counters.made += 1;
        Ok(self.insert(data, Origin::Made))
    }

    fn allocate_public_buffer(&mut self, size: u64) -> Result<PublicHandle> {
        let len = usize::try_from(size).map_err(|_| GatherError::OutOfPublicMemory {
            requested: size,
            available: usize::MAX as u64,
        })?;
        self.reserve(size)?;
        self.counters.allocated += 1;
        Ok(self.insert(vec![0; len], Origin::Allocated))
    }

    fn unmake_public_buffer(&mut self, handle: PublicHandle, size: u64) -> Result<Vec<u8>> {
        let data = self.remove(handle, size, Origin::Made)?;
        self.counters.unmade += 1;
        Ok(data)
    }

    fn free_public_buffer(&mut self, handle: PublicHandle, size: u64) -> Result<()> {
        self.remove(handle, size, Origin::Allocated)?;
        self.counters.freed += 1;
        Ok(())
    }

    fn bytes(&self, handle: PublicHandle) -> Option<&[u8]> {
        self.regions.get(&handle).map(|r| r.data.as_slice())
    }

    fn bytes_mut(&mut self, handle: PublicHandle) -> Option<&mut [u8]> {
        self.regions.get_mut(&handle).map(|r| r.data.as_mut_slice())
    }
}

/// Which buffer rules apply to a rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferRole {
    /// Holds the gathered result; receive and send target for every round.
    Root,
    /// Working buffer sized for the largest single-round receive.
    Participant,
}

impl BufferRole {
    pub fn of(rank: usize, geometry: &GatherGeometry) -> Self {
        if rank == geometry.root {
            Self::Root
        } else {
            Self::Participant
        }
    }

    /// Bytes registered for this role. `acquire` and `release` both go
    /// through here.
    pub fn buffer_bytes(self, geometry: &GatherGeometry, shape: &TreeShape) -> u64 {
        match self {
            Self::Root => geometry.result_bytes() as u64,
            Self::Participant => shape
                .midpoint
                .saturating_mul(geometry.contribution_bytes()) as u64,
        }
    }
}

/// A registered buffer owned by one rank's gather instance.
#[derive(Debug, PartialEq, Eq)]
pub struct GatherBuffer {
    pub role: BufferRole,
    pub handle: PublicHandle,
    pub size: u64,
}

/// Registers the rank's buffer and copies its contribution into the head.
///
/// A rank without local data acquires nothing and runs timing-only.
pub fn acquire<M: PublicMemory + ?Sized>(
    mem: &mut M,
    role: BufferRole,
    geometry: &GatherGeometry,
    shape: &TreeShape,
    local: Option<&[u8]>,
) -> Result<Option<GatherBuffer>> {
    let Some(local) = local else {
        debug!(?role, "no local contribution, skipping buffer registration");
        return Ok(None);
    };
    let contribution = geometry.contribution_bytes();
    if local.len() != contribution {
        return Err(GatherError::InvalidConfig(format!(
            "local contribution is {} bytes, expected {contribution}",
            local.len()
        )));
    }

    let size = role.buffer_bytes(geometry, shape);
    let handle = match role {
        BufferRole::Root => {
            let len = usize::try_from(size)
                .map_err(|_| GatherError::InvalidConfig(format!("result of {size} bytes")))?;
            mem.make_public_buffer(vec![0; len])?
        }
        BufferRole::Participant => mem.allocate_public_buffer(size)?,
    };
    let buffer = GatherBuffer { role, handle, size };

    let copied = match mem.bytes_mut(handle) {
        Some(dst) if dst.len() >= contribution => {
            dst[..contribution].copy_from_slice(local);
            true
        }
        _ => false,
    };
    if !copied {
        // roll back the registration before reporting
        release(mem, Some(buffer), geometry, shape)?;
        return Err(GatherError::Internal(format!(
            "public buffer {handle:?} cannot hold {contribution} bytes"
        )));
    }
    debug!(?role, ?handle, size, "acquired gather buffer");
    Ok(Some(buffer))
}

/// Unregisters the buffer. The root gets its result memory back.
pub fn release<M: PublicMemory + ?Sized>(
    mem: &mut M,
    buffer: Option<GatherBuffer>,
    geometry: &GatherGeometry,
    shape: &TreeShape,
) -> Result<Option<Vec<u8>>> {
    let Some(buffer) = buffer else {
        return Ok(None);
    };
    let size = buffer.role.buffer_bytes(geometry, shape);
    debug_assert_eq!(size, buffer.size);
    debug!(role = ?buffer.role, handle = ?buffer.handle, size, "releasing gather buffer");
    match buffer.role {
        BufferRole::Root => mem.unmake_public_buffer(buffer.handle, size).map(Some),
        BufferRole::Participant => mem.free_public_buffer(buffer.handle, size).map(|()| None),
    }
}
