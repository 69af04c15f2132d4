//! Shared, externally owned values that passes read fresh every frame.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use bytemuck::Pod;

use crate::layout::{GpuLayout, GpuType};

/// A boolean shared between the caller and the pass graph.
#[derive(Debug, Clone, Default)]
pub struct Flag(Arc<AtomicBool>);

impl Flag {
    pub fn new(value: bool) -> Self {
        Self(Arc::new(AtomicBool::new(value)))
    }

    pub fn get(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn set(&self, value: bool) {
        self.0.store(value, Ordering::Release);
    }
}

/// A repeat count shared between the caller and the pass graph.
#[derive(Debug, Clone)]
pub struct Counter(Arc<AtomicU32>);

impl Default for Counter {
    fn default() -> Self {
        Self::new(1)
    }
}

impl Counter {
    pub fn new(value: u32) -> Self {
        Self(Arc::new(AtomicU32::new(value)))
    }

    pub fn get(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    pub fn set(&self, value: u32) {
        self.0.store(value, Ordering::Release);
    }
}

/// A host value whose bytes are uploaded as a uniform block.
pub trait BytesSource: Send + Sync {
    fn gpu_type(&self) -> GpuType;
    fn bytes(&self) -> Vec<u8>;
}

/// A plain-old-data value shared with the pass graph and re-uploaded each
/// frame it is bound.
#[derive(Debug, Default)]
pub struct Uniform<T>(Arc<RwLock<T>>);

impl<T> Clone for Uniform<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T: Copy> Uniform<T> {
    pub fn new(value: T) -> Self {
        Self(Arc::new(RwLock::new(value)))
    }

    pub fn get(&self) -> T {
        *self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set(&self, value: T) {
        *self.0.write().unwrap_or_else(PoisonError::into_inner) = value;
    }

    pub fn update(&self, f: impl FnOnce(&mut T)) {
        f(&mut self.0.write().unwrap_or_else(PoisonError::into_inner));
    }
}

impl<T: GpuLayout + Pod + Send + Sync> BytesSource for Uniform<T> {
    fn gpu_type(&self) -> GpuType {
        T::gpu_type()
    }

    fn bytes(&self) -> Vec<u8> {
        bytemuck::bytes_of(&self.get()).to_vec()
    }
}
