//! Trace replay: correctness checks, space utilization and throughput.

use std::{
    collections::BTreeMap,
    time::{Duration, Instant},
};

use memlib::{CreateError, MemLib};
use mm::{ALIGNMENT, Allocator, Config, HeapCheckError, HeapError};
use snafu::{ResultExt as _, Snafu, ensure};

use crate::trace::{Trace, TraceOp};

#[derive(Debug, Clone, Copy)]
pub struct EvalOptions {
    pub config: Config,
    /// Capacity of the simulated region.
    pub heap_limit: usize,
    /// Run the heap consistency checker after every operation.
    pub check_heap: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TraceResult {
    pub name: String,
    pub weight: usize,
    pub ops: usize,
    /// Peak live payload bytes divided by the final heap size.
    pub utilization: f64,
    pub elapsed: Duration,
}

impl TraceResult {
    /// Operations per second over the timed replay.
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 { count_f64(self.ops) / secs } else { 0.0 }
    }
}

#[derive(Debug, Snafu)]
pub enum EvalError {
    #[snafu(display("failed to create heap region, heap_limit={heap_limit}"))]
    Region {
        heap_limit: usize,
        #[snafu(source)]
        source: CreateError,
    },
    #[snafu(display("failed to initialize heap"))]
    Init {
        #[snafu(source)]
        source: HeapError,
    },
    #[snafu(display("op #{index} ({op}): allocation failed"))]
    OutOfMemory { index: usize, op: TraceOp },
    #[snafu(display("op #{index} ({op}): id is already live"))]
    IdInUse { index: usize, op: TraceOp },
    #[snafu(display("op #{index} ({op}): payload is misaligned, address={address:#x}"))]
    Misaligned {
        index: usize,
        op: TraceOp,
        address: usize,
    },
    #[snafu(display("op #{index} ({op}): payload lies outside the heap, address={address:#x}"))]
    OutOfHeap {
        index: usize,
        op: TraceOp,
        address: usize,
    },
    #[snafu(display(
        "op #{index} ({op}): payload overlaps a live payload, address={address:#x}, other={other:#x}"
    ))]
    Overlap {
        index: usize,
        op: TraceOp,
        address: usize,
        other: usize,
    },
    #[snafu(display("op #{index} ({op}): payload was corrupted at offset {offset}"))]
    Corrupted {
        index: usize,
        op: TraceOp,
        offset: usize,
    },
    #[snafu(display("op #{index} ({op}): heap check failed"))]
    HeapCheck {
        index: usize,
        op: TraceOp,
        #[snafu(source)]
        source: HeapCheckError,
    },
}

/// Byte expected at `offset` of the payload owned by `id`.
fn pattern(id: usize, offset: usize) -> u8 {
    id.wrapping_mul(0x9e37_79b9)
        .wrapping_add(offset)
        .to_le_bytes()[0]
}

#[expect(clippy::cast_precision_loss)]
pub fn count_f64(n: usize) -> f64 {
    n as f64
}

#[derive(Debug, Clone, Copy)]
struct Payload {
    ptr: *mut u8,
    size: usize,
}

/// Replays a trace with full validation of every returned payload.
struct Checker {
    allocator: Allocator<MemLib>,
    check_heap: bool,
    live: Vec<Option<Payload>>,
    /// Start address to end address of every live payload.
    ranges: BTreeMap<usize, usize>,
    live_bytes: usize,
    peak_bytes: usize,
}

impl Checker {
    fn new(trace: &Trace, options: &EvalOptions) -> Result<Self, EvalError> {
        let region = MemLib::try_with_capacity(options.heap_limit).context(RegionSnafu {
            heap_limit: options.heap_limit,
        })?;
        let mut allocator = Allocator::with_config(region, options.config);
        allocator.init().context(InitSnafu)?;
        Ok(Self {
            allocator,
            check_heap: options.check_heap,
            live: vec![None; trace.num_ids],
            ranges: BTreeMap::new(),
            live_bytes: 0,
            peak_bytes: 0,
        })
    }

    fn run(&mut self, trace: &Trace) -> Result<(), EvalError> {
        for (index, &op) in trace.ops.iter().enumerate() {
            log::trace!("op #{index}: {op}");
            match op {
                TraceOp::Alloc { id, size } => {
                    ensure!(self.live[id].is_none(), IdInUseSnafu { index, op });
                    let ptr = self.allocator.alloc(size);
                    self.accept(index, op, ptr, size, 0)?;
                }
                TraceOp::Realloc { id, size } => {
                    let old = self.live[id].take();
                    let (old_ptr, old_size) = match old {
                        Some(payload) => {
                            self.verify(index, op, payload)?;
                            self.forget(payload);
                            (payload.ptr, payload.size)
                        }
                        None => (core::ptr::null_mut(), 0),
                    };
                    let ptr = unsafe { self.allocator.realloc(old_ptr, size) };
                    self.accept(index, op, ptr, size, old_size.min(size))?;
                }
                TraceOp::Free { id } => {
                    if let Some(payload) = self.live[id].take() {
                        self.verify(index, op, payload)?;
                        self.forget(payload);
                        unsafe { self.allocator.free(payload.ptr) };
                    }
                }
            }
            if self.check_heap {
                self.allocator
                    .check()
                    .context(HeapCheckSnafu { index, op })?;
            }
        }
        Ok(())
    }

    /// Validates a fresh payload whose first `kept` bytes must hold the
    /// pattern of its id, then fills the rest.
    fn accept(
        &mut self,
        index: usize,
        op: TraceOp,
        ptr: Option<*mut u8>,
        size: usize,
        kept: usize,
    ) -> Result<(), EvalError> {
        if size == 0 {
            // a zero-sized request may return nothing
            if let Some(ptr) = ptr {
                unsafe { self.allocator.free(ptr) };
            }
            return Ok(());
        }
        let Some(ptr) = ptr else {
            return OutOfMemorySnafu { index, op }.fail();
        };
        let address = ptr.addr();
        ensure!(
            address.is_multiple_of(ALIGNMENT),
            MisalignedSnafu { index, op, address }
        );
        ensure!(
            self.allocator.region().contains(ptr, size),
            OutOfHeapSnafu { index, op, address }
        );
        if let Some((&other, &other_end)) = self.ranges.range(..address + size).next_back() {
            ensure!(
                other_end <= address,
                OverlapSnafu {
                    index,
                    op,
                    address,
                    other
                }
            );
        }

        let id = op.id();
        let payload = Payload { ptr, size };
        self.verify_prefix(index, op, payload, kept)?;
        for offset in kept..size {
            unsafe { ptr.add(offset).write(pattern(id, offset)) };
        }

        self.ranges.insert(address, address + size);
        self.live[id] = Some(payload);
        self.live_bytes += size;
        self.peak_bytes = self.peak_bytes.max(self.live_bytes);
        Ok(())
    }

    fn verify(&self, index: usize, op: TraceOp, payload: Payload) -> Result<(), EvalError> {
        self.verify_prefix(index, op, payload, payload.size)
    }

    fn verify_prefix(
        &self,
        index: usize,
        op: TraceOp,
        payload: Payload,
        len: usize,
    ) -> Result<(), EvalError> {
        let id = op.id();
        for offset in 0..len {
            let byte = unsafe { payload.ptr.add(offset).read() };
            ensure!(
                byte == pattern(id, offset),
                CorruptedSnafu { index, op, offset }
            );
        }
        Ok(())
    }

    fn forget(&mut self, payload: Payload) {
        self.ranges.remove(&payload.ptr.addr());
        self.live_bytes -= payload.size;
    }

    fn utilization(&self) -> f64 {
        let heap_size = self.allocator.heap_size();
        if heap_size == 0 {
            return 0.0;
        }
        count_f64(self.peak_bytes) / count_f64(heap_size)
    }
}

/// Replays a trace without any validation and returns the elapsed time.
fn time_replay(trace: &Trace, options: &EvalOptions) -> Result<Duration, EvalError> {
    let region = MemLib::try_with_capacity(options.heap_limit).context(RegionSnafu {
        heap_limit: options.heap_limit,
    })?;
    let mut allocator = Allocator::with_config(region, options.config);
    let mut live = vec![core::ptr::null_mut::<u8>(); trace.num_ids];

    let start = Instant::now();
    allocator.init().context(InitSnafu)?;
    for (index, &op) in trace.ops.iter().enumerate() {
        match op {
            TraceOp::Alloc { id, size } => {
                live[id] = allocator.alloc(size).unwrap_or_default();
                ensure!(size == 0 || !live[id].is_null(), OutOfMemorySnafu { index, op });
            }
            TraceOp::Realloc { id, size } => {
                live[id] = unsafe { allocator.realloc(live[id], size) }.unwrap_or_default();
                ensure!(size == 0 || !live[id].is_null(), OutOfMemorySnafu { index, op });
            }
            TraceOp::Free { id } => {
                unsafe { allocator.free(live[id]) };
                live[id] = core::ptr::null_mut();
            }
        }
    }
    Ok(start.elapsed())
}

/// Runs the correctness pass and the timed pass over one trace.
pub fn eval_trace(trace: &Trace, options: &EvalOptions) -> Result<TraceResult, EvalError> {
    let mut checker = Checker::new(trace, options)?;
    checker.run(trace)?;
    let utilization = checker.utilization();
    drop(checker);

    let elapsed = time_replay(trace, options)?;
    log::debug!(
        "{}: utilization={:.1}%, elapsed={elapsed:?}, suggested_heap_size={}",
        trace.name,
        utilization * 100.0,
        trace.suggested_heap_size
    );

    Ok(TraceResult {
        name: trace.name.clone(),
        weight: trace.weight,
        ops: trace.ops.len(),
        utilization,
        elapsed,
    })
}
