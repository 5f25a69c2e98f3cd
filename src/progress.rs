//! Programming progress reporting.

/// Receives the cumulative number of image bytes written after each chunk
pub trait ProgressSink {
    fn update(&mut self, bytes_written: u32);
}

impl<F> ProgressSink for F
where
    F: FnMut(u32),
{
    fn update(&mut self, bytes_written: u32) {
        self(bytes_written)
    }
}

/// Tracks completion and the next percentage decile to report.
///
/// Each of 10%, 20%, .. 100% is yielded exactly once, in order, however the
/// image is split into chunks.
#[derive(Clone, Debug, PartialEq)]
pub struct ProgramProgress {
    bytes_written: u32,
    total_bytes: u32,
    next_threshold: u32,
}

impl ProgramProgress {
    pub const STEP: u32 = 10;

    pub fn new(total_bytes: u32) -> Self {
        Self {
            bytes_written: 0,
            total_bytes,
            next_threshold: Self::STEP,
        }
    }

    pub fn bytes_written(&self) -> u32 {
        self.bytes_written
    }

    pub fn total_bytes(&self) -> u32 {
        self.total_bytes
    }

    pub fn next_threshold(&self) -> u32 {
        self.next_threshold
    }

    /// Whole percent complete, capped at 100
    pub fn percent(&self) -> u32 {
        if self.total_bytes == 0 {
            return 100;
        }
        let p = u64::from(self.bytes_written) * 100 / u64::from(self.total_bytes);
        p.min(100) as u32
    }

    /// Record a new cumulative byte count, returning the deciles it crossed
    pub fn update(&mut self, bytes_written: u32) -> Deciles {
        self.bytes_written = bytes_written;

        let percent = self.percent();
        let first = self.next_threshold;
        while self.next_threshold <= percent {
            self.next_threshold += Self::STEP;
        }

        Deciles {
            next: first,
            end: self.next_threshold,
        }
    }
}

/// Iterator over newly crossed percentage thresholds
#[derive(Clone, Debug)]
pub struct Deciles {
    next: u32,
    end: u32,
}

impl Iterator for Deciles {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if self.next >= self.end {
            return None;
        }
        let v = self.next;
        self.next += ProgramProgress::STEP;
        Some(v)
    }
}
