//! Adaptive I/O buffer shared by the file copy loops of one context.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use fsctx_core::EngineConfig;
use parking_lot::Mutex;
use sysinfo::System;

/// Reports how much memory is free for buffers.
pub trait MemoryProbe: Send + Sync + fmt::Debug {
    fn available_memory(&self) -> u64;
}

/// Probe backed by the operating system's memory statistics.
pub struct SystemMemory {
    system: Mutex<System>,
}

impl SystemMemory {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SystemMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SystemMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemMemory").finish_non_exhaustive()
    }
}

impl MemoryProbe for SystemMemory {
    fn available_memory(&self) -> u64 {
        let mut system = self.system.lock();
        system.refresh_memory();
        system.available_memory()
    }
}

/// Probe that always reports the same amount.
#[derive(Debug, Clone, Copy)]
pub struct FixedMemory(pub u64);

impl MemoryProbe for FixedMemory {
    fn available_memory(&self) -> u64 {
        self.0
    }
}

/// Share of available memory a buffer may take at most.
const CEILING_DIVISOR: u64 = 2;

/// Growth is refused when it would take more than this share of what is free.
const GROWTH_DIVISOR: u64 = 3;

/// One buffer, grown and shrunk by what the copy loops ask for.
///
/// Growth goes to at least one and a half times the current size, capped by
/// a ceiling derived from available memory, and is deferred when memory is
/// tight. Shrinking only happens after smaller sizes have been asked for
/// during the whole shrink delay, and then to at most half the size.
/// Nothing is resized while the buffer is lent out; the last suggestion is
/// applied when it comes back.
#[derive(Debug)]
pub struct BufferManager {
    buffer: Vec<u8>,
    size: usize,
    min: usize,
    max: usize,
    shrink_delay: Duration,
    smaller_since: Option<Instant>,
    in_use: bool,
    pending: Option<usize>,
    probe: Arc<dyn MemoryProbe>,
}

impl BufferManager {
    pub fn new(config: &EngineConfig, probe: Arc<dyn MemoryProbe>) -> Self {
        let min = config.min_buffer_size;
        let max = config.max_buffer_size;
        Self {
            buffer: Vec::new(),
            size: config.initial_buffer_size.clamp(min, max),
            min,
            max,
            shrink_delay: config.shrink_delay(),
            smaller_since: None,
            in_use: false,
            pending: None,
            probe,
        }
    }

    /// Current buffer size.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether memory is held for the buffer right now.
    pub fn is_allocated(&self) -> bool {
        self.in_use || !self.buffer.is_empty()
    }

    /// Largest size the buffer may grow to given current free memory.
    pub fn ceiling(&self) -> usize {
        self.ceiling_for(self.probe.available_memory())
    }

    fn ceiling_for(&self, available: u64) -> usize {
        usize::try_from(available / CEILING_DIVISOR)
            .unwrap_or(usize::MAX)
            .clamp(self.min, self.max)
    }

    /// Ask for a buffer of `requested` bytes.
    pub fn suggest_size(&mut self, requested: usize) {
        if self.in_use {
            self.pending = Some(requested);
            return;
        }
        self.apply(requested);
    }

    fn apply(&mut self, requested: usize) {
        if requested > self.size {
            self.smaller_since = None;
            self.grow(requested);
        } else if requested < self.size {
            match self.smaller_since {
                None => self.smaller_since = Some(Instant::now()),
                Some(since) if since.elapsed() >= self.shrink_delay => {
                    let target = requested.max(self.min).min(self.size / 2).max(self.min);
                    self.smaller_since = None;
                    if target < self.size {
                        tracing::debug!(from = self.size, to = target, "Shrinking copy buffer");
                        self.resize(target);
                    }
                }
                Some(_) => {}
            }
        } else {
            self.smaller_since = None;
        }
    }

    fn grow(&mut self, requested: usize) {
        let available = self.probe.available_memory();
        let target = requested
            .max(self.size + self.size / 2)
            .min(self.ceiling_for(available));
        if target <= self.size {
            return;
        }
        let growth = (target - self.size) as u64;
        if growth > available / GROWTH_DIVISOR {
            tracing::debug!(requested, available, "Deferring copy buffer growth");
            return;
        }
        tracing::debug!(from = self.size, to = target, "Growing copy buffer");
        self.resize(target);
    }

    fn resize(&mut self, size: usize) {
        self.size = size;
        if !self.buffer.is_empty() {
            self.buffer = Vec::new();
        }
    }

    /// Lend the buffer out. It must be handed back with [`restore`](Self::restore).
    ///
    /// # Panics
    ///
    /// Panics when the buffer is already lent out.
    pub fn take(&mut self) -> Vec<u8> {
        assert!(!self.in_use, "copy buffer is already in use");
        self.in_use = true;
        let mut buffer = std::mem::take(&mut self.buffer);
        if buffer.len() != self.size {
            buffer = vec![0; self.size];
        }
        buffer
    }

    /// Hand the buffer back and apply any suggestion made meanwhile.
    pub fn restore(&mut self, buffer: Vec<u8>) {
        self.in_use = false;
        if buffer.len() == self.size {
            self.buffer = buffer;
        }
        if let Some(requested) = self.pending.take() {
            self.apply(requested);
        }
    }

    /// Free the memory held for the buffer, for example before a pause.
    pub fn release(&mut self) {
        if !self.in_use && !self.buffer.is_empty() {
            tracing::trace!(size = self.size, "Releasing copy buffer");
            self.buffer = Vec::new();
        }
    }
}
