use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::NonNull;

use flux_rs::error::{BackendError, BackendResult};
use flux_rs::matrix::{DType, Matrix, MatrixTraits};

const ALIGN: usize = 64;

/// Zero-initialised host allocation addressed by generated kernels through
/// its raw address.
pub struct HostBuffer {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: The allocation is uniquely owned; concurrent access is ordered by
// queue events, the same contract a device allocation has.
unsafe impl Send for HostBuffer {}
// SAFETY: See above.
unsafe impl Sync for HostBuffer {}

impl fmt::Debug for HostBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostBuffer")
            .field("addr", &self.addr())
            .field("len", &self.len)
            .finish()
    }
}

impl HostBuffer {
    pub fn zeroed(len: usize) -> BackendResult<Self> {
        let layout = Layout::from_size_align(len.max(1), ALIGN)
            .map_err(|err| BackendError::execution(err.to_string()))?;
        // SAFETY: Layout has non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw)
            .ok_or_else(|| BackendError::execution(format!("host allocation of {len} bytes failed")))?;
        Ok(Self { ptr, len })
    }

    pub fn from_bytes(bytes: &[u8]) -> BackendResult<Self> {
        let buffer = Self::zeroed(bytes.len())?;
        buffer.write(0, bytes);
        Ok(buffer)
    }

    /// Encodes `values` as `dtype` elements.
    pub fn from_values(dtype: DType, values: &[f64]) -> BackendResult<Self> {
        Self::from_bytes(&dtype.encode(values))
    }

    pub fn from_i32(values: &[i32]) -> BackendResult<Self> {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_ne_bytes()).collect();
        Self::from_bytes(&bytes)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn addr(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    /// Describes this allocation as a matrix. Panics if it is too small.
    pub fn matrix(&self, traits: MatrixTraits) -> Matrix {
        assert!(
            traits.nbytes() <= self.len,
            "{traits:?} needs {} bytes, buffer holds {}",
            traits.nbytes(),
            self.len
        );
        Matrix::new(self.addr(), traits)
    }

    pub fn read(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.len];
        // SAFETY: Both ranges are `len` bytes and do not overlap.
        unsafe { std::ptr::copy_nonoverlapping(self.ptr.as_ptr(), out.as_mut_ptr(), self.len) };
        out
    }

    pub fn read_values(&self, dtype: DType) -> Vec<f64> {
        dtype.decode(&self.read())
    }

    pub fn write(&self, offset: usize, bytes: &[u8]) {
        assert!(
            offset + bytes.len() <= self.len,
            "write of {} bytes at {offset} overflows a {}-byte buffer",
            bytes.len(),
            self.len
        );
        // SAFETY: Bounds checked above; source is a distinct host slice.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.as_ptr().add(offset), bytes.len())
        };
    }
}

impl Drop for HostBuffer {
    fn drop(&mut self) {
        if let Ok(layout) = Layout::from_size_align(self.len.max(1), ALIGN) {
            // SAFETY: Allocated in `zeroed` with this exact layout.
            unsafe { alloc::dealloc(self.ptr.as_ptr(), layout) };
        }
    }
}

/// Copies `nbytes` between two raw host addresses.
///
/// # Safety
/// Both addresses must be valid for `nbytes` and must not overlap.
pub(crate) unsafe fn copy_raw(dst: u64, src: u64, nbytes: usize) {
    if nbytes != 0 {
        std::ptr::copy_nonoverlapping(src as *const u8, dst as *mut u8, nbytes);
    }
}

/// Reads `nbytes` from a raw host address.
///
/// # Safety
/// `addr` must be valid for `nbytes`.
pub(crate) unsafe fn read_raw(addr: u64, nbytes: usize) -> Vec<u8> {
    let mut out = vec![0u8; nbytes];
    if nbytes != 0 {
        std::ptr::copy_nonoverlapping(addr as *const u8, out.as_mut_ptr(), nbytes);
    }
    out
}
