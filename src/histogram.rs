use crate::topology::MAX_CPU;

/// Widest counter delta any engine classifies, in bits.
pub const TABLE_WIDTH: usize = 64;

/// Slots per row: leading-zero counts `0..TABLE_WIDTH` plus one for a zero delta.
pub const BUCKETS: usize = TABLE_WIDTH + 1;

/// Buckets a counter delta by its leading zero bits within `width` bits.
///
/// Only the low `width` bits of `delta` are considered. A delta that is zero
/// after truncation has no set bit and lands in bucket `width`, one past the
/// largest leading-zero count a non-zero delta can produce.
#[inline(always)]
pub fn classify(delta: u64, width: u32) -> usize {
    debug_assert!(width >= 1 && width as usize <= TABLE_WIDTH);
    let shift = 64 - width;
    let truncated = (delta << shift) >> shift;
    if truncated == 0 {
        width as usize
    } else {
        (truncated.leading_zeros() - shift) as usize
    }
}

/// One CPU's per-bucket counts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    buckets: [u64; BUCKETS],
    backwards: u64,
}

impl Row {
    pub fn new() -> Self {
        Self {
            buckets: [0; BUCKETS],
            backwards: 0,
        }
    }

    #[inline(always)]
    pub fn record(&mut self, bucket: usize) {
        self.buckets[bucket] += 1;
    }

    /// Counts a sample whose second read was below the first.
    #[inline(always)]
    pub fn record_backwards(&mut self) {
        self.backwards += 1;
    }

    pub fn count(&self, bucket: usize) -> u64 {
        self.buckets.get(bucket).copied().unwrap_or(0)
    }

    pub fn backwards(&self) -> u64 {
        self.backwards
    }

    /// Sum over every bucket, including the zero-delta bucket.
    pub fn total(&self) -> u64 {
        self.buckets.iter().sum()
    }
}

impl Default for Row {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-CPU rows for one engine, indexed by CPU id over `0..MAX_CPU`.
///
/// Rows for CPUs outside the active set stay zero and are never reported.
#[derive(Debug)]
pub struct Histogram {
    rows: Vec<Row>,
}

impl Histogram {
    pub fn new() -> Self {
        Self {
            rows: vec![Row::new(); MAX_CPU],
        }
    }

    pub fn row(&self, cpu: usize) -> &Row {
        &self.rows[cpu]
    }

    /// Mutable access to every row, in CPU id order.
    pub(crate) fn rows_mut(&mut self) -> std::slice::IterMut<'_, Row> {
        self.rows.iter_mut()
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}
