//! Sample storage that can live in host memory, pinned memory or device memory.
//!
//! An [`AcceleratorBuffer`] tracks which memory domain (CPU or GPU) currently
//! holds valid data. Writers declare the domain they wrote from with
//! [`AcceleratorBuffer::mark_modified_from_cpu`] /
//! [`AcceleratorBuffer::mark_modified_from_gpu`]; readers call
//! [`AcceleratorBuffer::prepare_for_cpu_access`] /
//! [`AcceleratorBuffer::prepare_for_gpu_access`] first. Transfers are deferred
//! until a stale domain is prepared, so scratch buffers that only a GPU kernel
//! touches never round-trip through host memory.
//!
//! There is no compute device in this crate; the device side is a separate
//! allocation identified by a [`DeviceHandle`] and kernels operate on
//! [`AcceleratorBuffer::device_slice_mut`].

use std::fmt;
use std::ops::{Index, IndexMut};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_DEVICE_HANDLE: AtomicU64 = AtomicU64::new(1);

/// How often a domain is expected to touch a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessHint {
    Never,
    Unlikely,
    Likely,
}

/// Storage layout chosen from the pair of access hints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryMode {
    /// GPU never reads: plain heap memory, GPU access aliases it.
    HostOnly,
    /// Rare CPU access: one pinned allocation both sides reference (zero-copy).
    Pinned,
    /// Separate host and device allocations with deferred copies between them.
    Mirrored,
}

impl MemoryMode {
    fn for_hints(cpu: AccessHint, gpu: AccessHint) -> Self {
        match (cpu, gpu) {
            (_, AccessHint::Never) => MemoryMode::HostOnly,
            (AccessHint::Unlikely, _) => MemoryMode::Pinned,
            _ => MemoryMode::Mirrored,
        }
    }
}

/// Opaque identifier of a device-side allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle(u64);

impl DeviceHandle {
    fn next() -> Self {
        Self(NEXT_DEVICE_HANDLE.fetch_add(1, Ordering::Relaxed))
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Number of whole-buffer copies performed in each direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub to_device: u64,
    pub to_host: u64,
}

#[derive(Debug)]
struct DeviceAllocation<T> {
    handle: DeviceHandle,
    data: Vec<T>,
}

/// A typed array with explicit CPU/GPU ownership tracking.
///
/// Element access through `Index`/`as_slice` is only defined after
/// [`prepare_for_cpu_access`](Self::prepare_for_cpu_access); debug builds
/// assert on it.
pub struct AcceleratorBuffer<T> {
    host: Vec<T>,
    device: Option<DeviceAllocation<T>>,
    cpu_hint: AccessHint,
    gpu_hint: AccessHint,
    mode: MemoryMode,
    cpu_valid: bool,
    gpu_valid: bool,
    stats: TransferStats,
}

impl<T: Copy + Default> AcceleratorBuffer<T> {
    /// Empty buffer that expects frequent access from both sides.
    pub fn new() -> Self {
        Self::with_hints(AccessHint::Likely, AccessHint::Likely)
    }

    pub fn with_hints(cpu_hint: AccessHint, gpu_hint: AccessHint) -> Self {
        let mode = MemoryMode::for_hints(cpu_hint, gpu_hint);
        let device = (mode == MemoryMode::Mirrored).then(|| DeviceAllocation {
            handle: DeviceHandle::next(),
            data: Vec::new(),
        });
        Self {
            host: Vec::new(),
            device,
            cpu_hint,
            gpu_hint,
            mode,
            cpu_valid: true,
            gpu_valid: true,
            stats: TransferStats::default(),
        }
    }

    /// Buffer holding `values`, valid on the CPU.
    pub fn from_vec(values: Vec<T>) -> Self {
        let mut buf = Self::new();
        buf.resize(values.len());
        buf.host.copy_from_slice(&values);
        buf.mark_modified_from_cpu();
        buf
    }

    pub fn len(&self) -> usize {
        self.host.len()
    }

    pub fn is_empty(&self) -> bool {
        self.host.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.host.capacity()
    }

    pub fn mode(&self) -> MemoryMode {
        self.mode
    }

    pub fn cpu_hint(&self) -> AccessHint {
        self.cpu_hint
    }

    pub fn gpu_hint(&self) -> AccessHint {
        self.gpu_hint
    }

    pub fn is_cpu_valid(&self) -> bool {
        self.cpu_valid
    }

    pub fn is_gpu_valid(&self) -> bool {
        self.gpu_valid
    }

    pub fn device_handle(&self) -> Option<DeviceHandle> {
        self.device.as_ref().map(|d| d.handle)
    }

    pub fn transfer_stats(&self) -> TransferStats {
        self.stats
    }

    /// Set the logical size. Existing elements keep their values and
    /// validity in every domain; new elements are default-initialized.
    pub fn resize(&mut self, len: usize) {
        self.host.resize(len, T::default());
        if let Some(dev) = self.device.as_mut() {
            dev.data.resize(len, T::default());
        }
    }

    pub fn reserve(&mut self, additional: usize) {
        self.host.reserve(additional);
        if let Some(dev) = self.device.as_mut() {
            dev.data.reserve(additional);
        }
    }

    pub fn shrink_to_fit(&mut self) {
        self.host.shrink_to_fit();
        if let Some(dev) = self.device.as_mut() {
            dev.data.shrink_to_fit();
        }
    }

    /// Append one element to every domain that is currently valid.
    pub fn push_back(&mut self, value: T) {
        let host_value = if self.cpu_valid { value } else { T::default() };
        self.host.push(host_value);
        if let Some(dev) = self.device.as_mut() {
            let dev_value = if self.gpu_valid { value } else { T::default() };
            dev.data.push(dev_value);
        }
    }

    pub fn clear(&mut self) {
        self.host.clear();
        if let Some(dev) = self.device.as_mut() {
            dev.data.clear();
        }
        self.cpu_valid = true;
        self.gpu_valid = true;
    }

    /// Make the host copy current. Copies device to host at most once per
    /// GPU-side modification; a no-op when the host copy is already valid.
    pub fn prepare_for_cpu_access(&mut self) {
        if self.cpu_valid {
            return;
        }
        if let Some(dev) = self.device.as_ref() {
            self.host.copy_from_slice(&dev.data);
            self.stats.to_host += 1;
        }
        self.cpu_valid = true;
    }

    /// Make the device copy current. Symmetric to
    /// [`prepare_for_cpu_access`](Self::prepare_for_cpu_access).
    pub fn prepare_for_gpu_access(&mut self) {
        if self.gpu_valid {
            return;
        }
        if let Some(dev) = self.device.as_mut() {
            dev.data.copy_from_slice(&self.host);
            self.stats.to_device += 1;
        }
        self.gpu_valid = true;
    }

    /// Allow host writes without pulling stale device data first. Only for
    /// writers that overwrite every element; follow with
    /// [`mark_modified_from_cpu`](Self::mark_modified_from_cpu).
    pub fn prepare_for_cpu_overwrite(&mut self) {
        self.cpu_valid = true;
    }

    /// Device counterpart of [`prepare_for_cpu_overwrite`](Self::prepare_for_cpu_overwrite).
    pub fn prepare_for_gpu_overwrite(&mut self) {
        self.gpu_valid = true;
    }

    /// The CPU just wrote the buffer; the device copy (if any) is stale.
    pub fn mark_modified_from_cpu(&mut self) {
        self.cpu_valid = true;
        if self.device.is_some() {
            self.gpu_valid = false;
        }
    }

    /// A GPU kernel just wrote the buffer; the host copy (if separate) is stale.
    pub fn mark_modified_from_gpu(&mut self) {
        self.gpu_valid = true;
        if self.device.is_some() {
            self.cpu_valid = false;
        }
    }

    pub fn set_cpu_access_hint(&mut self, hint: AccessHint) {
        self.cpu_hint = hint;
        self.replan();
    }

    pub fn set_gpu_access_hint(&mut self, hint: AccessHint) {
        self.gpu_hint = hint;
        self.replan();
    }

    fn replan(&mut self) {
        let mode = MemoryMode::for_hints(self.cpu_hint, self.gpu_hint);
        if mode == self.mode {
            return;
        }
        match (self.device.is_some(), mode == MemoryMode::Mirrored) {
            (false, true) => {
                // Device copy gets filled on the next GPU preparation.
                self.device = Some(DeviceAllocation {
                    handle: DeviceHandle::next(),
                    data: vec![T::default(); self.host.len()],
                });
                self.cpu_valid = true;
                self.gpu_valid = false;
            }
            (true, false) => self.release_device_memory(),
            _ => {}
        }
        self.mode = mode;
    }

    /// Pull data back to the host and drop the device allocation.
    /// GPU access then aliases host memory until a hint asks for a mirror.
    pub fn release_device_memory(&mut self) {
        self.prepare_for_cpu_access();
        self.device = None;
        self.gpu_valid = true;
        if self.mode == MemoryMode::Mirrored {
            self.mode = if self.gpu_hint == AccessHint::Never {
                MemoryMode::HostOnly
            } else {
                MemoryMode::Pinned
            };
        }
    }

    /// Replace the contents with a copy of `other`, taken from whichever
    /// domain of `other` is valid.
    pub fn copy_from(&mut self, other: &AcceleratorBuffer<T>) {
        self.resize(other.len());
        if other.cpu_valid {
            self.host.copy_from_slice(&other.host);
            self.mark_modified_from_cpu();
        } else {
            let src = other.device_data();
            match self.device.as_mut() {
                Some(dev) => {
                    dev.data.copy_from_slice(src);
                    self.mark_modified_from_gpu();
                }
                None => {
                    self.host.copy_from_slice(src);
                    self.mark_modified_from_cpu();
                }
            }
        }
    }

    /// Host view. Call [`prepare_for_cpu_access`](Self::prepare_for_cpu_access) first.
    pub fn as_slice(&self) -> &[T] {
        debug_assert!(self.cpu_valid, "CPU read of a buffer whose host copy is stale");
        &self.host
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        debug_assert!(self.cpu_valid, "CPU write to a buffer whose host copy is stale");
        &mut self.host
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.as_slice().iter()
    }

    /// Device view. Call [`prepare_for_gpu_access`](Self::prepare_for_gpu_access) first.
    pub fn device_slice(&self) -> &[T] {
        debug_assert!(self.gpu_valid, "GPU read of a buffer whose device copy is stale");
        self.device_data()
    }

    pub fn device_slice_mut(&mut self) -> &mut [T] {
        debug_assert!(self.gpu_valid, "GPU write to a buffer whose device copy is stale");
        match self.device.as_mut() {
            Some(dev) => &mut dev.data,
            None => &mut self.host,
        }
    }

    fn device_data(&self) -> &[T] {
        match self.device.as_ref() {
            Some(dev) => &dev.data,
            None => &self.host,
        }
    }
}

impl<T: Copy + Default> Default for AcceleratorBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Copy + Default> Clone for AcceleratorBuffer<T> {
    fn clone(&self) -> Self {
        let mut copy = Self::with_hints(self.cpu_hint, self.gpu_hint);
        copy.copy_from(self);
        copy
    }
}

impl<T: Copy + Default> Index<usize> for AcceleratorBuffer<T> {
    type Output = T;

    fn index(&self, index: usize) -> &T {
        &self.as_slice()[index]
    }
}

impl<T: Copy + Default> IndexMut<usize> for AcceleratorBuffer<T> {
    fn index_mut(&mut self, index: usize) -> &mut T {
        &mut self.as_mut_slice()[index]
    }
}

impl<T: Copy + Default> FromIterator<T> for AcceleratorBuffer<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self::from_vec(iter.into_iter().collect())
    }
}

impl<T> fmt::Debug for AcceleratorBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcceleratorBuffer")
            .field("len", &self.host.len())
            .field("mode", &self.mode)
            .field("cpu_valid", &self.cpu_valid)
            .field("gpu_valid", &self.gpu_valid)
            .field("device", &self.device.as_ref().map(|d| d.handle))
            .finish()
    }
}
