// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! An in-process [`DmaService`] for tests and diagnostics.
//!
//! [`EmulatedService`] models a driver that owns a physical address space:
//! it hands out page frames, tracks every pin in a registry, maps chunked
//! transactions, shares contiguous buffers by global handle and emulates
//! non-coherent caches. Device-side access goes through
//! [`EmulatedService::device_read`] and [`EmulatedService::device_write`]
//! using physical addresses taken from page descriptors.

mod frames;

use crate::DmaError;
use crate::device::DmaDevice;
use crate::device::InterruptParameters;
use crate::memory::HeapMemory;
use crate::memory::MappedDmaTarget;
use crate::memory::MemoryBlock;
use crate::service::Attached;
use crate::service::ChunkProgress;
use crate::service::ContiguousRequest;
use crate::service::DmaService;
use crate::service::Pinned;
use crate::service::ReservedRequest;
use crate::service::ScatterGatherRequest;
use crate::service::TransactionBacking;
use crate::service::TransactionRequest;
use frames::FrameAllocator;
use frames::FrameRange;
use parking_lot::Mutex;
use parking_lot::MutexGuard;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::atomic::AtomicU8;
use wdc_defs::BufferToken;
use wdc_defs::CardHandle;
use wdc_defs::DmaOptions;
use wdc_defs::GlobalHandle;
use wdc_defs::PAGE_SIZE;
use wdc_defs::PhysicalSegment;
use wdc_defs::WdStatus;

/// Configuration of an [`EmulatedService`].
#[derive(Debug, Clone)]
pub struct EmulatedConfig {
    /// Page size of the emulated system.
    pub page_size: usize,
    /// Physical address of the first page of emulated RAM.
    pub base_address: u64,
    /// Number of pages of emulated RAM.
    pub page_count: u64,
    /// Hand out scatter/gather frames top-down so that logically adjacent
    /// pages are not physically adjacent.
    pub scatter_pages: bool,
    /// Treat every buffer as cache coherent.
    pub coherent: bool,
}

impl Default for EmulatedConfig {
    fn default() -> Self {
        Self {
            page_size: PAGE_SIZE,
            base_address: 0x1000_0000,
            page_count: 0x4000,
            scatter_pages: true,
            coherent: false,
        }
    }
}

/// The calls of [`DmaService`], for fault injection and call counting.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ServiceCall {
    /// [`DmaService::pin_contiguous`]
    PinContiguous,
    /// [`DmaService::pin_scatter_gather`]
    PinScatterGather,
    /// [`DmaService::pin_reserved`]
    PinReserved,
    /// [`DmaService::attach_existing`]
    AttachExisting,
    /// [`DmaService::unpin`]
    Unpin,
    /// [`DmaService::begin_transaction`]
    BeginTransaction,
    /// [`DmaService::begin_transaction_chunk`]
    BeginTransactionChunk,
    /// [`DmaService::poll_chunk_complete`]
    PollChunkComplete,
    /// [`DmaService::release_transaction`]
    ReleaseTransaction,
    /// [`DmaService::end_transaction`]
    EndTransaction,
    /// [`DmaService::flush_for_cpu`]
    FlushForCpu,
    /// [`DmaService::flush_for_device`]
    FlushForDevice,
}

/// An emulated privileged DMA service.
pub struct EmulatedService {
    config: EmulatedConfig,
    state: Mutex<State>,
}

struct State {
    frames: FrameAllocator,
    next_token: u32,
    next_region: u32,
    pins: BTreeMap<BufferToken, Pin>,
    regions: BTreeMap<u32, Region>,
    reserved: Vec<ReservedRange>,
    faults: HashMap<ServiceCall, WdStatus>,
    calls: HashMap<ServiceCall, usize>,
}

struct ReservedRange {
    base: u64,
    memory: MemoryBlock,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum RegionKind {
    Contiguous,
    ScatterGather,
    Reserved,
}

/// Memory pinned by one or more tokens.
struct Region {
    kind: RegionKind,
    options: DmaOptions,
    memory: MemoryBlock,
    len: usize,
    // Offset of logical byte zero within the first frame.
    first_page_offset: usize,
    // One frame number per spanned page.
    frames: Vec<u64>,
    allocations: Vec<FrameRange>,
    refs: usize,
    // What the device sees, when caches are not coherent.
    device_view: Option<Vec<u8>>,
}

struct Pin {
    region: u32,
    transaction: Option<Progress>,
}

struct Progress {
    total: usize,
    max_transfer: usize,
    transferred: usize,
    in_flight: Option<usize>,
    released: bool,
}

impl State {
    fn insert_region(&mut self, region: Region) -> u32 {
        let id = self.next_region;
        self.next_region += 1;
        self.regions.insert(id, region);
        id
    }

    fn insert_pin(&mut self, region: u32, transaction: Option<Progress>) -> BufferToken {
        let token = BufferToken(self.next_token);
        self.next_token += 1;
        self.pins.insert(
            token,
            Pin {
                region,
                transaction,
            },
        );
        token
    }

    fn free_region(&mut self, region: Region) {
        for range in region.allocations {
            self.frames.free(range);
        }
    }

    fn drop_ref(&mut self, id: u32) {
        let Some(region) = self.regions.get_mut(&id) else {
            return;
        };
        region.refs -= 1;
        if region.refs == 0 {
            if let Some(region) = self.regions.remove(&id) {
                self.free_region(region);
            }
        }
    }

    fn transaction(&mut self, token: BufferToken) -> Result<(&mut Progress, &Region), WdStatus> {
        let pin = self.pins.get_mut(&token).ok_or(WdStatus::INVALID_HANDLE)?;
        let progress = pin.transaction.as_mut().ok_or(WdStatus::INVALID_HANDLE)?;
        let region = self
            .regions
            .get(&pin.region)
            .ok_or(WdStatus::INVALID_HANDLE)?;
        Ok((progress, region))
    }

    fn region_of(&mut self, token: BufferToken) -> Result<&mut Region, WdStatus> {
        let pin = self.pins.get(&token).ok_or(WdStatus::INVALID_HANDLE)?;
        self.regions
            .get_mut(&pin.region)
            .ok_or(WdStatus::INVALID_HANDLE)
    }

    /// Finds the region and logical offset mapped at a physical address.
    fn translate(&self, physical_address: u64, page_size: usize) -> Option<(u32, usize)> {
        let pfn = physical_address / page_size as u64;
        let in_page = (physical_address % page_size as u64) as usize;
        self.regions.iter().find_map(|(&id, region)| {
            let index = region.frames.iter().position(|&frame| frame == pfn)?;
            let offset = (index * page_size + in_page).checked_sub(region.first_page_offset)?;
            (offset < region.len).then_some((id, offset))
        })
    }
}

fn address_limit(options: DmaOptions) -> u64 {
    if options.kbuf_below_16m() {
        16 << 20
    } else if options.kbuf_alloc_specify_address_width() {
        match options.address_width() {
            width @ 1..64 => 1 << width,
            _ => u64::MAX,
        }
    } else if options.allow_64bit_address() {
        u64::MAX
    } else {
        1 << 32
    }
}

impl EmulatedService {
    /// Creates a service with an empty registry.
    pub fn new(config: EmulatedConfig) -> Result<Self, DmaError> {
        if !config.page_size.is_power_of_two() {
            return Err(DmaError::InvalidParameter(
                "page size must be a power of two",
            ));
        }
        let base_pfn = config.base_address / config.page_size as u64;
        Ok(Self {
            state: Mutex::new(State {
                frames: FrameAllocator::new(base_pfn, config.page_count),
                next_token: 1,
                next_region: 1,
                pins: BTreeMap::new(),
                regions: BTreeMap::new(),
                reserved: Vec::new(),
                faults: HashMap::new(),
                calls: HashMap::new(),
            }),
            config,
        })
    }

    /// The page size of the emulated system.
    pub fn page_size(&self) -> usize {
        self.config.page_size
    }

    /// Makes the next `call` fail with `status` without side effects.
    pub fn fail_next(&self, call: ServiceCall, status: WdStatus) {
        self.state.lock().faults.insert(call, status);
    }

    /// The number of times `call` has been made, including failures.
    pub fn call_count(&self, call: ServiceCall) -> usize {
        self.state.lock().calls.get(&call).copied().unwrap_or(0)
    }

    /// The number of live pins, attach references and transactions.
    pub fn outstanding_pins(&self) -> usize {
        self.state.lock().pins.len()
    }

    /// The number of unallocated pages of emulated RAM.
    pub fn free_pages(&self) -> u64 {
        self.state.lock().frames.free_frames()
    }

    /// Registers `len` bytes of reserved physical memory at `base`. It must
    /// not overlap emulated RAM or another reserved range.
    pub fn add_reserved_range(&self, base: u64, len: usize) -> Result<(), WdStatus> {
        let end = base
            .checked_add(len as u64)
            .ok_or(WdStatus::INVALID_PARAMETER)?;
        let ram_end =
            self.config.base_address + self.config.page_count * self.config.page_size as u64;
        let overlaps = |start: u64, stop: u64| base < stop && start < end;

        let mut state = self.state.lock();
        if len == 0
            || overlaps(self.config.base_address, ram_end)
            || state
                .reserved
                .iter()
                .any(|r| overlaps(r.base, r.base + r.memory.len() as u64))
        {
            return Err(WdStatus::INVALID_PARAMETER);
        }
        state.reserved.push(ReservedRange {
            base,
            memory: MemoryBlock::new(HeapMemory::new(len)),
        });
        Ok(())
    }

    /// Reads memory the way the device would, by physical address.
    pub fn device_read(&self, physical_address: u64, data: &mut [u8]) -> Result<(), WdStatus> {
        let state = self.state.lock();
        let mut done = 0;
        while done < data.len() {
            let (id, offset) = state
                .translate(physical_address + done as u64, self.config.page_size)
                .ok_or(WdStatus::INVALID_PARAMETER)?;
            let region = &state.regions[&id];
            let n = self.piece_len(
                physical_address + done as u64,
                data.len() - done,
                region,
                offset,
            );
            let dest = &mut data[done..][..n];
            match &region.device_view {
                Some(view) => dest.copy_from_slice(&view[offset..][..n]),
                None => region.memory.read_at(offset, dest),
            }
            done += n;
        }
        Ok(())
    }

    /// Writes memory the way the device would, by physical address.
    pub fn device_write(&self, physical_address: u64, data: &[u8]) -> Result<(), WdStatus> {
        let mut state = self.state.lock();
        let mut done = 0;
        while done < data.len() {
            let (id, offset) = state
                .translate(physical_address + done as u64, self.config.page_size)
                .ok_or(WdStatus::INVALID_PARAMETER)?;
            let region = state
                .regions
                .get_mut(&id)
                .ok_or(WdStatus::INVALID_PARAMETER)?;
            let n = self.piece_len(
                physical_address + done as u64,
                data.len() - done,
                region,
                offset,
            );
            let src = &data[done..][..n];
            match &mut region.device_view {
                Some(view) => view[offset..][..n].copy_from_slice(src),
                None => region.memory.write_at(offset, src),
            }
            done += n;
        }
        Ok(())
    }

    fn piece_len(
        &self,
        physical_address: u64,
        remaining: usize,
        region: &Region,
        offset: usize,
    ) -> usize {
        let page = self.config.page_size;
        let in_page = (physical_address % page as u64) as usize;
        (page - in_page).min(remaining).min(region.len - offset)
    }

    /// Locks the state, counting the call and consuming an injected fault.
    fn enter(&self, call: ServiceCall) -> Result<MutexGuard<'_, State>, WdStatus> {
        let mut state = self.state.lock();
        *state.calls.entry(call).or_default() += 1;
        if let Some(status) = state.faults.remove(&call) {
            tracing::debug!(?call, %status, "injected fault");
            return Err(status);
        }
        Ok(state)
    }

    /// Snapshots the memory into a device view unless the region is coherent.
    fn attach_device_view(&self, mut region: Region) -> Region {
        let coherent = self.config.coherent
            || (region.kind != RegionKind::ScatterGather && !region.options.allow_cache());
        if !coherent {
            let mut view = vec![0; region.len];
            region.memory.read_at(0, &mut view);
            region.device_view = Some(view);
        }
        region
    }

    fn allocate_contiguous(
        &self,
        state: &mut State,
        options: DmaOptions,
        byte_count: usize,
        alignment: usize,
    ) -> Result<Region, WdStatus> {
        if byte_count == 0 || byte_count > u32::MAX as usize {
            return Err(WdStatus::INVALID_PARAMETER);
        }
        let page = self.config.page_size as u64;
        let pages = (byte_count as u64).div_ceil(page);
        let align = (alignment as u64).div_ceil(page);
        let range = state
            .frames
            .alloc(pages, align)
            .ok_or(WdStatus::INSUFFICIENT_RESOURCES)?;
        if range.end() * page > address_limit(options) {
            state.frames.free(range);
            return Err(WdStatus::INSUFFICIENT_RESOURCES);
        }
        Ok(self.attach_device_view(Region {
            kind: RegionKind::Contiguous,
            options,
            memory: MemoryBlock::new(HeapMemory::new(byte_count)),
            len: byte_count,
            first_page_offset: 0,
            frames: (range.start..range.end()).collect(),
            allocations: vec![range],
            refs: 1,
            device_view: None,
        }))
    }

    fn map_user(
        &self,
        state: &mut State,
        options: DmaOptions,
        memory: &MemoryBlock,
        byte_count: usize,
    ) -> Result<Region, WdStatus> {
        if byte_count == 0 || memory.len() < byte_count || options.kernel_buffer_alloc() {
            return Err(WdStatus::INVALID_PARAMETER);
        }
        let page = self.config.page_size;
        let first_page_offset = (memory.virtual_address() % page as u64) as usize;
        let pages = (first_page_offset + byte_count).div_ceil(page) as u64;

        let mut allocations = Vec::new();
        if self.config.scatter_pages {
            for _ in 0..pages {
                let Some(range) = state.frames.alloc_top(1) else {
                    for range in allocations {
                        state.frames.free(range);
                    }
                    return Err(WdStatus::INSUFFICIENT_RESOURCES);
                };
                allocations.push(range);
            }
        } else {
            let range = state
                .frames
                .alloc(pages, 1)
                .ok_or(WdStatus::INSUFFICIENT_RESOURCES)?;
            allocations.push(range);
        }

        let frames = allocations.iter().flat_map(|r| r.start..r.end()).collect();
        Ok(self.attach_device_view(Region {
            kind: RegionKind::ScatterGather,
            options,
            memory: memory.clone(),
            len: byte_count,
            first_page_offset,
            frames,
            allocations,
            refs: 1,
            device_view: None,
        }))
    }

    /// Writes the descriptors for `len` bytes at logical offset `start`.
    fn describe(
        &self,
        region: &Region,
        start: usize,
        len: usize,
        segment_capacity: usize,
        segments: &mut Vec<PhysicalSegment>,
    ) -> Result<(), WdStatus> {
        let page = self.config.page_size;
        let merge = region.kind != RegionKind::ScatterGather
            || !region.options.disable_merge_adjacent_pages();
        segments.clear();

        let end = start + len;
        let mut offset = start;
        while offset < end {
            let abs = region.first_page_offset + offset;
            let in_page = abs % page;
            let n = (page - in_page).min(end - offset);
            let physical_address = region.frames[abs / page] * page as u64 + in_page as u64;
            match segments.last_mut() {
                Some(last)
                    if merge
                        && last.end() == physical_address
                        && last.byte_count as usize + n <= u32::MAX as usize =>
                {
                    last.byte_count += n as u32;
                }
                _ => {
                    if segments.len() >= segment_capacity {
                        segments.clear();
                        return Err(WdStatus::INSUFFICIENT_RESOURCES);
                    }
                    segments.push(PhysicalSegment::new(physical_address, n as u32));
                }
            }
            offset += n;
        }
        Ok(())
    }

    /// Describes a new region and registers it under a new token.
    fn register(
        &self,
        state: &mut State,
        region: Region,
        segment_capacity: usize,
        segments: &mut Vec<PhysicalSegment>,
    ) -> Result<(u32, BufferToken), WdStatus> {
        if let Err(status) = self.describe(&region, 0, region.len, segment_capacity, segments) {
            state.free_region(region);
            return Err(status);
        }
        let id = state.insert_region(region);
        let token = state.insert_pin(id, None);
        Ok((id, token))
    }
}

impl DmaService for EmulatedService {
    fn pin_contiguous(
        &self,
        request: &ContiguousRequest,
        segments: &mut Vec<PhysicalSegment>,
    ) -> Result<Pinned, WdStatus> {
        let mut state = self.enter(ServiceCall::PinContiguous)?;
        let region = self.allocate_contiguous(&mut state, request.options, request.byte_count, 0)?;
        let memory = region.memory.clone();
        let (id, token) = self.register(&mut state, region, 1, segments)?;
        Ok(Pinned {
            token,
            memory: Some(memory),
            global_handle: GlobalHandle(id),
        })
    }

    fn pin_scatter_gather(
        &self,
        request: &ScatterGatherRequest<'_>,
        segments: &mut Vec<PhysicalSegment>,
    ) -> Result<Pinned, WdStatus> {
        let mut state = self.enter(ServiceCall::PinScatterGather)?;
        if request.segment_capacity > request.inline_capacity && !request.options.large_buffer() {
            return Err(WdStatus::INVALID_PARAMETER);
        }
        let region = self.map_user(
            &mut state,
            request.options,
            request.memory,
            request.byte_count,
        )?;
        let (_, token) = self.register(&mut state, region, request.segment_capacity, segments)?;
        Ok(Pinned {
            token,
            memory: None,
            global_handle: GlobalHandle::NONE,
        })
    }

    fn pin_reserved(
        &self,
        request: &ReservedRequest,
        segments: &mut Vec<PhysicalSegment>,
    ) -> Result<Pinned, WdStatus> {
        let mut state = self.enter(ServiceCall::PinReserved)?;
        let start = request.physical_address;
        let end = start
            .checked_add(request.byte_count as u64)
            .ok_or(WdStatus::INVALID_PARAMETER)?;
        let memory = state
            .reserved
            .iter()
            .find(|r| r.base <= start && end <= r.base + r.memory.len() as u64)
            .map(|r| r.memory.subblock((start - r.base) as usize, request.byte_count))
            .ok_or(WdStatus::INVALID_PARAMETER)?;

        let page = self.config.page_size as u64;
        let first_page_offset = (start % page) as usize;
        let frames = (start / page..end.div_ceil(page)).collect();
        let region = self.attach_device_view(Region {
            kind: RegionKind::Reserved,
            options: request.options,
            memory: memory.clone(),
            len: request.byte_count,
            first_page_offset,
            frames,
            allocations: Vec::new(),
            refs: 1,
            device_view: None,
        });
        let (_, token) = self.register(&mut state, region, 1, segments)?;
        Ok(Pinned {
            token,
            memory: Some(memory),
            global_handle: GlobalHandle::NONE,
        })
    }

    fn attach_existing(
        &self,
        handle: GlobalHandle,
        segments: &mut Vec<PhysicalSegment>,
    ) -> Result<Attached, WdStatus> {
        let mut state = self.enter(ServiceCall::AttachExisting)?;
        let region = state
            .regions
            .get_mut(&handle.0)
            .filter(|region| region.kind == RegionKind::Contiguous)
            .ok_or(WdStatus::INVALID_HANDLE)?;
        self.describe(region, 0, region.len, 1, segments)?;
        region.refs += 1;
        let memory = region.memory.clone();
        let byte_count = region.len;
        let options = region.options;
        let token = state.insert_pin(handle.0, None);
        Ok(Attached {
            token,
            memory,
            byte_count,
            options,
        })
    }

    fn unpin(&self, token: BufferToken) -> Result<(), WdStatus> {
        let mut state = self.enter(ServiceCall::Unpin)?;
        match state.pins.get(&token) {
            Some(Pin {
                transaction: None, ..
            }) => {}
            _ => return Err(WdStatus::INVALID_HANDLE),
        }
        if let Some(pin) = state.pins.remove(&token) {
            state.drop_ref(pin.region);
        }
        Ok(())
    }

    fn begin_transaction(&self, request: &TransactionRequest<'_>) -> Result<Pinned, WdStatus> {
        let mut state = self.enter(ServiceCall::BeginTransaction)?;
        if !request.options.transaction() {
            return Err(WdStatus::INVALID_PARAMETER);
        }
        let (region, max_transfer) = match request.backing {
            TransactionBacking::Contiguous { alignment } => (
                self.allocate_contiguous(
                    &mut state,
                    request.options,
                    request.byte_count,
                    alignment,
                )?,
                request.byte_count,
            ),
            TransactionBacking::ScatterGather {
                memory,
                max_transfer_size,
                element_size: _,
            } => {
                if max_transfer_size == 0 {
                    return Err(WdStatus::INVALID_PARAMETER);
                }
                (
                    self.map_user(&mut state, request.options, memory, request.byte_count)?,
                    max_transfer_size,
                )
            }
        };

        let memory = (region.kind == RegionKind::Contiguous).then(|| region.memory.clone());
        let id = state.insert_region(region);
        let token = state.insert_pin(
            id,
            Some(Progress {
                total: request.byte_count,
                max_transfer,
                transferred: 0,
                in_flight: None,
                released: false,
            }),
        );
        Ok(Pinned {
            token,
            memory,
            global_handle: GlobalHandle::NONE,
        })
    }

    fn begin_transaction_chunk(
        &self,
        token: BufferToken,
        segments: &mut Vec<PhysicalSegment>,
        segment_capacity: usize,
    ) -> Result<usize, WdStatus> {
        let mut state = self.enter(ServiceCall::BeginTransactionChunk)?;
        let (progress, region) = state.transaction(token)?;
        if progress.in_flight.is_some() {
            return Err(WdStatus::OPERATION_FAILED);
        }
        if progress.released {
            progress.transferred = 0;
            progress.released = false;
        }
        if progress.transferred >= progress.total {
            return Err(WdStatus::OPERATION_ALREADY_DONE);
        }
        let chunk = progress
            .max_transfer
            .min(progress.total - progress.transferred);
        self.describe(region, progress.transferred, chunk, segment_capacity, segments)?;
        progress.in_flight = Some(chunk);
        Ok(progress.transferred)
    }

    fn poll_chunk_complete(
        &self,
        token: BufferToken,
        segments: &mut Vec<PhysicalSegment>,
        segment_capacity: usize,
    ) -> Result<ChunkProgress, WdStatus> {
        let mut state = self.enter(ServiceCall::PollChunkComplete)?;
        let (progress, region) = state.transaction(token)?;
        let chunk = progress.in_flight.ok_or(WdStatus::OPERATION_FAILED)?;
        let transferred = progress.transferred + chunk;
        if transferred == progress.total {
            progress.transferred = transferred;
            progress.in_flight = None;
            return Ok(ChunkProgress::Complete {
                bytes_transferred: transferred,
            });
        }
        // The chunk stays in flight if the next one cannot be described.
        let next = progress.max_transfer.min(progress.total - transferred);
        self.describe(region, transferred, next, segment_capacity, segments)?;
        progress.transferred = transferred;
        progress.in_flight = Some(next);
        Ok(ChunkProgress::More {
            bytes_transferred: transferred,
        })
    }

    fn release_transaction(&self, token: BufferToken) -> Result<(), WdStatus> {
        let mut state = self.enter(ServiceCall::ReleaseTransaction)?;
        let (progress, _) = state.transaction(token)?;
        if progress.released {
            return Err(WdStatus::OPERATION_ALREADY_DONE);
        }
        progress.released = true;
        progress.in_flight = None;
        Ok(())
    }

    fn end_transaction(&self, token: BufferToken) -> Result<(), WdStatus> {
        let mut state = self.enter(ServiceCall::EndTransaction)?;
        state.transaction(token)?;
        if let Some(pin) = state.pins.remove(&token) {
            state.drop_ref(pin.region);
        }
        Ok(())
    }

    fn flush_for_cpu(&self, token: BufferToken) -> Result<(), WdStatus> {
        let mut state = self.enter(ServiceCall::FlushForCpu)?;
        let region = state.region_of(token)?;
        if let Some(view) = &region.device_view {
            region.memory.write_at(0, view);
        }
        Ok(())
    }

    fn flush_for_device(&self, token: BufferToken) -> Result<(), WdStatus> {
        let mut state = self.enter(ServiceCall::FlushForDevice)?;
        let region = state.region_of(token)?;
        if let Some(view) = &mut region.device_view {
            region.memory.read_at(0, view);
        }
        Ok(())
    }
}

/// Zeroed caller memory mapped at a chosen virtual address, so that its
/// offset within the first page is known.
pub struct UserPages {
    data: Box<[AtomicU8]>,
    virtual_address: u64,
}

impl UserPages {
    /// Allocates `len` zeroed bytes that claim to start at `virtual_address`.
    pub fn new(virtual_address: u64, len: usize) -> Self {
        Self {
            data: (0..len).map(|_| AtomicU8::new(0)).collect(),
            virtual_address,
        }
    }
}

impl MappedDmaTarget for UserPages {
    fn as_slice(&self) -> &[AtomicU8] {
        &self.data
    }

    fn virtual_address(&self) -> u64 {
        self.virtual_address
    }
}

/// A device with software interrupt state.
#[derive(Debug)]
pub struct EmulatedDevice {
    card: CardHandle,
    interrupts_enabled: bool,
    enable_failure: Option<WdStatus>,
    enable_calls: usize,
    disable_calls: usize,
    last_interrupt: Option<InterruptParameters>,
}

impl EmulatedDevice {
    /// Creates a device with interrupts disabled.
    pub fn new(card: CardHandle) -> Self {
        Self {
            card,
            interrupts_enabled: false,
            enable_failure: None,
            enable_calls: 0,
            disable_calls: 0,
            last_interrupt: None,
        }
    }

    /// Makes the next interrupt enable fail with `status`.
    pub fn fail_next_enable(&mut self, status: WdStatus) {
        self.enable_failure = Some(status);
    }

    /// The number of interrupt enable attempts.
    pub fn enable_calls(&self) -> usize {
        self.enable_calls
    }

    /// The number of interrupt disable calls.
    pub fn disable_calls(&self) -> usize {
        self.disable_calls
    }

    /// The parameters of the last successful interrupt enable.
    pub fn last_interrupt(&self) -> Option<&InterruptParameters> {
        self.last_interrupt.as_ref()
    }
}

impl DmaDevice for EmulatedDevice {
    fn card_handle(&self) -> CardHandle {
        self.card
    }

    fn interrupts_enabled(&self) -> bool {
        self.interrupts_enabled
    }

    fn enable_interrupts(&mut self, params: &InterruptParameters) -> Result<(), WdStatus> {
        self.enable_calls += 1;
        if let Some(status) = self.enable_failure.take() {
            return Err(status);
        }
        if self.interrupts_enabled {
            return Err(WdStatus::OPERATION_ALREADY_DONE);
        }
        self.interrupts_enabled = true;
        self.last_interrupt = Some(params.clone());
        Ok(())
    }

    fn disable_interrupts(&mut self) -> Result<(), WdStatus> {
        self.disable_calls += 1;
        if !self.interrupts_enabled {
            return Err(WdStatus::OPERATION_ALREADY_DONE);
        }
        self.interrupts_enabled = false;
        Ok(())
    }
}
