//! Pooled buffers.
//!
//! [`pool`] is the generic blocking pool and its reference-counted handle;
//! [`image`] instantiates it for heap images and groups pools by shape.

pub mod image;
pub mod pool;

pub use image::{
    standalone_image, BufferProvider, ImageAllocator, ImageBuffer, ImageFormat, ImageHandle,
    ImagePool, ImagePoolSet, ImageSize, ImageSpec,
};
pub use pool::{BufferAllocator, BufferPool, PooledBuffer, SmartBuffer};
