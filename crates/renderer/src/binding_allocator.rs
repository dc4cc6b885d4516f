//! Growable binding-table allocation.
//!
//! [`BindingTableAllocator`] hands out binding tables from a list of
//! fixed-capacity pools. Pools with spare room sit on a `ready` stack; a pool
//! that reports exhaustion moves to `full`. When no pool is ready a new one
//! is created at the current target capacity, and the target grows by half
//! for the next creation, up to a hard ceiling.
//!
//! Tables are never freed one by one. [`BindingTableAllocator::reclaim_all`]
//! resets every pool at once, which is only sound once the device is known
//! to be done with every table handed out since the previous reclaim.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use vkpipe_rhi::vk;
//! use vkpipe_rhi::PoolSizeRatio;
//! use vkpipe_rhi::null::{NullDevice, NullLayout};
//! use vkpipe_renderer::BindingTableAllocator;
//!
//! # fn main() -> vkpipe_rhi::RhiResult<()> {
//! let device = Arc::new(NullDevice::new());
//! let ratios = [PoolSizeRatio::new(vk::DescriptorType::UNIFORM_BUFFER, 1.0)];
//! let mut tables = BindingTableAllocator::new(device, 10, 100, &ratios)?;
//!
//! let layout = NullLayout::single(vk::DescriptorType::UNIFORM_BUFFER);
//! let _table = tables.allocate(&layout)?;
//! tables.reclaim_all()?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use tracing::debug;

use vkpipe_core::config::BindingConfig;
use vkpipe_core::{BindingKind, RatioConfig};
use vkpipe_rhi::vk;
use vkpipe_rhi::{GpuBackend, PoolSizeRatio, RhiError, RhiResult};

/// Pool sizing shared by every per-slot allocator.
#[derive(Clone, Debug, PartialEq)]
pub struct BindingPoolSettings {
    pub initial_tables: u32,
    pub max_tables: u32,
    pub ratios: Vec<PoolSizeRatio>,
}

impl BindingPoolSettings {
    pub fn from_config(config: &BindingConfig) -> Self {
        Self {
            initial_tables: config.initial_tables,
            max_tables: config.max_tables,
            ratios: pool_ratios(&config.ratios),
        }
    }
}

impl Default for BindingPoolSettings {
    fn default() -> Self {
        Self::from_config(&BindingConfig::default())
    }
}

/// Descriptor type of a configured binding category.
pub fn descriptor_type(kind: BindingKind) -> vk::DescriptorType {
    match kind {
        BindingKind::Sampler => vk::DescriptorType::SAMPLER,
        BindingKind::CombinedImageSampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        BindingKind::SampledImage => vk::DescriptorType::SAMPLED_IMAGE,
        BindingKind::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
        BindingKind::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
        BindingKind::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
        BindingKind::UniformBufferDynamic => vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
        BindingKind::StorageBufferDynamic => vk::DescriptorType::STORAGE_BUFFER_DYNAMIC,
    }
}

pub fn pool_ratios(ratios: &[RatioConfig]) -> Vec<PoolSizeRatio> {
    ratios
        .iter()
        .map(|r| PoolSizeRatio::new(descriptor_type(r.kind), r.ratio))
        .collect()
}

/// Next target capacity: `min(floor(1.5 * capacity), max_capacity)`.
#[inline]
pub fn grow_capacity(capacity: u32, max_capacity: u32) -> u32 {
    capacity.saturating_add(capacity / 2).min(max_capacity)
}

/// Binding-table allocator over a growing list of pools.
pub struct BindingTableAllocator<B: GpuBackend> {
    backend: Arc<B>,
    ratios: Vec<PoolSizeRatio>,
    ready: Vec<B::BindingPool>,
    full: Vec<B::BindingPool>,
    next_capacity: u32,
    max_capacity: u32,
    /// Capacity of every pool created so far, in creation order.
    capacities: Vec<u32>,
}

impl<B: GpuBackend> BindingTableAllocator<B> {
    /// Create the allocator with one ready pool of `initial_capacity` tables.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::ContractViolation`] for a zero capacity or an empty
    /// ratio list, or the backend error if the first pool cannot be created.
    pub fn new(
        backend: Arc<B>,
        initial_capacity: u32,
        max_capacity: u32,
        ratios: &[PoolSizeRatio],
    ) -> RhiResult<Self> {
        if initial_capacity == 0 || max_capacity == 0 {
            return Err(RhiError::ContractViolation(
                "binding pools need a capacity of at least one table".to_string(),
            ));
        }
        if ratios.is_empty() {
            return Err(RhiError::ContractViolation(
                "binding pools need at least one descriptor ratio".to_string(),
            ));
        }

        let initial_capacity = initial_capacity.min(max_capacity);
        let mut allocator = Self {
            backend,
            ratios: ratios.to_vec(),
            ready: Vec::new(),
            full: Vec::new(),
            next_capacity: initial_capacity,
            max_capacity,
            capacities: Vec::new(),
        };
        let pool = allocator.create_pool()?;
        allocator.ready.push(pool);

        debug!(
            "Binding table allocator created: {} tables, ceiling {}",
            initial_capacity, max_capacity
        );

        Ok(allocator)
    }

    /// Allocate one table shaped by `layout`.
    ///
    /// Exhaustion of the current pool is handled here: the pool is retired to
    /// the full list and the allocation is retried once on another ready
    /// pool, creating one if necessary.
    ///
    /// # Errors
    ///
    /// A layout that does not fit even an empty pool is a
    /// [`RhiError::ContractViolation`]. Any other backend error is returned
    /// unchanged.
    pub fn allocate(&mut self, layout: &B::BindingLayout) -> RhiResult<B::BindingTable> {
        let mut pool = self.take_ready_pool()?;

        match self.backend.allocate_binding_table(&mut pool, layout) {
            Ok(table) => {
                self.ready.push(pool);
                return Ok(table);
            }
            Err(e) if e.is_pool_exhaustion() => {
                self.full.push(pool);
            }
            Err(e) => {
                self.ready.push(pool);
                return Err(e);
            }
        }

        let mut pool = self.take_ready_pool()?;
        let result = self.backend.allocate_binding_table(&mut pool, layout);
        self.ready.push(pool);

        match result {
            Ok(table) => Ok(table),
            Err(e) if e.is_pool_exhaustion() => Err(RhiError::ContractViolation(format!(
                "binding layout does not fit an empty pool ({e})"
            ))),
            Err(e) => Err(e),
        }
    }

    /// Reset every pool and return all of them to the ready list.
    ///
    /// Every table allocated since the last reclaim becomes invalid.
    pub fn reclaim_all(&mut self) -> RhiResult<()> {
        for pool in self.ready.iter_mut().chain(self.full.iter_mut()) {
            self.backend.reset_binding_pool(pool)?;
        }
        self.ready.append(&mut self.full);
        Ok(())
    }

    /// Release every pool's device storage.
    ///
    /// The allocator is left empty; a later [`allocate`](Self::allocate)
    /// creates a fresh pool at the current target capacity.
    pub fn destroy_all(&mut self) {
        let count = self.ready.len() + self.full.len();
        self.ready.clear();
        self.full.clear();
        if count > 0 {
            debug!("Destroyed {} binding pools", count);
        }
    }

    /// Capacity the next created pool will have.
    #[inline]
    pub fn next_capacity(&self) -> u32 {
        self.next_capacity
    }

    #[inline]
    pub fn max_capacity(&self) -> u32 {
        self.max_capacity
    }

    /// Number of live pools.
    #[inline]
    pub fn pool_count(&self) -> usize {
        self.ready.len() + self.full.len()
    }

    #[inline]
    pub fn full_pool_count(&self) -> usize {
        self.full.len()
    }

    /// Pools created after the initial one.
    #[inline]
    pub fn growth_events(&self) -> usize {
        self.capacities.len().saturating_sub(1)
    }

    /// Capacity of every pool created so far, oldest first.
    #[inline]
    pub fn capacities(&self) -> &[u32] {
        &self.capacities
    }

    #[inline]
    pub fn ratios(&self) -> &[PoolSizeRatio] {
        &self.ratios
    }

    fn take_ready_pool(&mut self) -> RhiResult<B::BindingPool> {
        match self.ready.pop() {
            Some(pool) => Ok(pool),
            None => self.create_pool(),
        }
    }

    fn create_pool(&mut self) -> RhiResult<B::BindingPool> {
        let capacity = self.next_capacity;
        let pool = self.backend.create_binding_pool(capacity, &self.ratios)?;
        self.capacities.push(capacity);
        self.next_capacity = grow_capacity(capacity, self.max_capacity);

        if self.capacities.len() > 1 {
            debug!(
                "Binding pool grown: {} tables, next {}",
                capacity, self.next_capacity
            );
        }

        Ok(pool)
    }
}

impl<B: GpuBackend> std::fmt::Debug for BindingTableAllocator<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BindingTableAllocator")
            .field("ready", &self.ready.len())
            .field("full", &self.full.len())
            .field("next_capacity", &self.next_capacity)
            .field("max_capacity", &self.max_capacity)
            .finish()
    }
}
