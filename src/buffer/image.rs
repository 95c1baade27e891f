//! Image buffers and the per-shape pool set backing pipe-internal buffers.

use super::pool::{BufferAllocator, BufferPool, SmartBuffer};
use crate::config::PoolSettings;
use crate::error::{PipeError, Result};
use crate::sync::lock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Width and height in pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageSize {
    pub w: u32,
    pub h: u32,
}

impl ImageSize {
    pub const fn new(w: u32, h: u32) -> Self {
        Self { w, h }
    }

    pub const fn is_empty(&self) -> bool {
        self.w == 0 || self.h == 0
    }

    pub const fn area(&self) -> u64 {
        self.w as u64 * self.h as u64
    }
}

impl fmt::Display for ImageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.w, self.h)
    }
}

/// Pixel layouts the pipe allocates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImageFormat {
    Bayer10,
    Yuy2,
    Nv12,
    Nv21,
    Yv12,
    Jpeg,
    /// Opaque bytes (face results, LCS statistics)
    Blob,
}

impl ImageFormat {
    pub const fn bits_per_pixel(self) -> u32 {
        match self {
            ImageFormat::Bayer10 => 10,
            ImageFormat::Yuy2 => 16,
            ImageFormat::Nv12 | ImageFormat::Nv21 | ImageFormat::Yv12 => 12,
            ImageFormat::Jpeg | ImageFormat::Blob => 8,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            ImageFormat::Bayer10 => "bayer10",
            ImageFormat::Yuy2 => "yuy2",
            ImageFormat::Nv12 => "nv12",
            ImageFormat::Nv21 => "nv21",
            ImageFormat::Yv12 => "yv12",
            ImageFormat::Jpeg => "jpeg",
            ImageFormat::Blob => "blob",
        }
    }
}

/// Shape of an image buffer; pools are keyed by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageSpec {
    pub size: ImageSize,
    pub format: ImageFormat,
}

impl ImageSpec {
    pub const fn new(size: ImageSize, format: ImageFormat) -> Self {
        Self { size, format }
    }

    pub fn byte_len(&self) -> usize {
        let bits = self.size.area() * self.format.bits_per_pixel() as u64;
        bits.div_ceil(8) as usize
    }
}

impl fmt::Display for ImageSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.size, self.format.name())
    }
}

/// A heap image. Plane layout is not modelled, only the byte budget.
pub struct ImageBuffer {
    serial: u64,
    spec: ImageSpec,
    data: Mutex<Vec<u8>>,
}

impl ImageBuffer {
    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn spec(&self) -> ImageSpec {
        self.spec
    }

    pub fn data(&self) -> MutexGuard<'_, Vec<u8>> {
        lock(&self.data)
    }

    /// Copy `src` into the front of the buffer, truncating to fit.
    pub fn write(&self, src: &[u8]) -> usize {
        let mut data = self.data();
        let n = src.len().min(data.len());
        data[..n].copy_from_slice(&src[..n]);
        n
    }

    pub fn fill(&self, value: u8) {
        self.data().fill(value);
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.data().clone()
    }
}

impl fmt::Debug for ImageBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageBuffer")
            .field("serial", &self.serial)
            .field("spec", &self.spec)
            .finish()
    }
}

/// Allocates zeroed [`ImageBuffer`]s of one spec.
pub struct ImageAllocator {
    spec: ImageSpec,
    serial: Arc<AtomicU64>,
}

impl ImageAllocator {
    pub fn new(spec: ImageSpec) -> Self {
        Self {
            spec,
            serial: Arc::new(AtomicU64::new(0)),
        }
    }

    fn with_serial(spec: ImageSpec, serial: Arc<AtomicU64>) -> Self {
        Self { spec, serial }
    }

    pub fn spec(&self) -> ImageSpec {
        self.spec
    }
}

impl BufferAllocator for ImageAllocator {
    type Buffer = ImageBuffer;

    fn allocate(&self) -> Result<ImageBuffer> {
        if self.spec.size.is_empty() {
            return Err(PipeError::Allocation(format!("empty image size for {}", self.spec)));
        }
        Ok(ImageBuffer {
            serial: self.serial.fetch_add(1, Ordering::Relaxed),
            spec: self.spec,
            data: Mutex::new(vec![0; self.spec.byte_len()]),
        })
    }
}

pub type ImagePool = BufferPool<ImageAllocator>;

/// Shared handle to a pooled image.
pub type ImageHandle = SmartBuffer<ImageAllocator>;

/// Source of buffers a request creates on first acquire.
#[cfg_attr(test, mockall::automock)]
pub trait BufferProvider: Send + Sync {
    fn acquire(&self, spec: ImageSpec) -> Result<ImageHandle>;
}

/// Lazily created pools, one per [`ImageSpec`], sharing one policy.
pub struct ImagePoolSet {
    settings: PoolSettings,
    serial: Arc<AtomicU64>,
    pools: Mutex<HashMap<ImageSpec, ImagePool>>,
}

impl ImagePoolSet {
    pub fn new(settings: PoolSettings) -> Self {
        Self {
            settings,
            serial: Arc::new(AtomicU64::new(0)),
            pools: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Pool for `spec`, created and preallocated on first use.
    pub fn pool(&self, spec: ImageSpec) -> Result<ImagePool> {
        let mut pools = lock(&self.pools);
        if let Some(pool) = pools.get(&spec) {
            return Ok(pool.clone());
        }
        let pool = BufferPool::new(
            format!("image:{spec}"),
            ImageAllocator::with_serial(spec, self.serial.clone()),
        );
        pool.set_auto_allocate(self.settings.auto_allocate.max(self.settings.preallocate));
        pool.set_auto_free(self.settings.auto_free);
        pool.allocate(self.settings.preallocate)?;
        tracing::debug!(%spec, "Image pool created");
        pools.insert(spec, pool.clone());
        Ok(pool)
    }

    pub fn pool_count(&self) -> usize {
        lock(&self.pools).len()
    }

    /// Snapshot of (spec, idle, total) per pool.
    pub fn usage(&self) -> Vec<(ImageSpec, usize, usize)> {
        lock(&self.pools)
            .iter()
            .map(|(spec, pool)| (*spec, pool.available_size(), pool.pool_size()))
            .collect()
    }
}

impl BufferProvider for ImagePoolSet {
    fn acquire(&self, spec: ImageSpec) -> Result<ImageHandle> {
        self.pool(spec)?.request()
    }
}

/// One-off image outside any shared pool, for caller-supplied buffers.
pub fn standalone_image(spec: ImageSpec) -> Result<ImageHandle> {
    let pool = BufferPool::new(format!("standalone:{spec}"), ImageAllocator::new(spec));
    pool.set_auto_allocate(1);
    pool.request()
}
