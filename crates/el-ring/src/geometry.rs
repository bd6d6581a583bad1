use serde::Serialize;

/// Layout of the ring for a given number of expected sources.
///
/// The base region holds `floor(n * 0.8) + 1` slots and doubles as the
/// high-water mark; the extension absorbs bursts with `n + n / 10 + 1` more.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RingGeometry {
    pub base: usize,
    pub extension: usize,
    pub size: usize,
}

impl RingGeometry {
    pub fn for_sources(expected_sources: usize) -> Self {
        let n = expected_sources;
        let base = n * 4 / 5 + 1;
        let extension = n + n / 10 + 1;
        Self {
            base,
            extension,
            size: base + extension,
        }
    }

    /// Boundary of the base region, in ring positions
    pub fn high_water_mark(&self) -> usize {
        self.base
    }

    /// Events the ring can hold; one slot always separates writer from reader
    pub fn capacity(&self) -> usize {
        self.size - 1
    }

    pub fn next(&self, slot: usize) -> usize {
        (slot + 1) % self.size
    }

    /// Distance of `slot` ahead of the read cursor
    pub fn position(&self, slot: usize, read: usize) -> usize {
        (slot + self.size - read) % self.size
    }

    pub fn in_base(&self, slot: usize, read: usize) -> bool {
        self.position(slot, read) <= self.base
    }
}
