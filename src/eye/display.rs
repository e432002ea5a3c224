use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicPtr, Ordering};

use super::{EyeConfig, SensorSelection};

/// Render-ready eye data for one sensor: per-bin robust mean plus min/max
/// envelope, with time on the x axis in ms relative to the trigger. Only
/// bins holding at least one observation are emitted, so all four vectors
/// always have equal length.
#[derive(Debug, Clone, Default)]
pub struct DisplaySnapshot {
    pub x_ms: Vec<i32>,
    pub y_mean: Vec<f32>,
    pub y_min: Vec<f32>,
    pub y_max: Vec<f32>,

    /// Observations in the trigger bin (depth of the eye).
    pub accumulation_count: usize,
    pub window_before_ms: u32,
    pub window_after_ms: u32,
    pub original_sensor_index: usize,
}

impl DisplaySnapshot {
    /// Drop the plot data, keeping the sensor metadata.
    pub fn clear(&mut self) {
        self.x_ms.clear();
        self.y_mean.clear();
        self.y_min.clear();
        self.y_max.clear();
        self.accumulation_count = 0;
    }
}

/// Atomic double buffer publishing one snapshot per tracked sensor.
///
/// Both sides are allocated once and live as long as the buffer. The
/// publisher (the processor) writes the side that is not published, then
/// release-stores the written instance's address into the sensor's
/// published slot and flips sides. Readers acquire-load the slot and read
/// the snapshot in place, without copying.
///
/// The single-publisher discipline makes this sound: a published instance
/// is never written again until it has been unpublished by a later
/// publication, so a reference obtained from `read` stays consistent until
/// at least one more publish cycle completes. Readers that need longer
/// retention clone the snapshot.
pub struct DisplayBuffer {
    sides: [Box<[UnsafeCell<DisplaySnapshot>]>; 2],
    published: Box<[AtomicPtr<DisplaySnapshot>]>,
}

// Safety: the processor is the only writer and only ever writes the
// unpublished side; readers only dereference pointers obtained from the
// acquire-load of `published`.
unsafe impl Send for DisplayBuffer {}
unsafe impl Sync for DisplayBuffer {}

impl DisplayBuffer {
    pub fn new(selection: &SensorSelection, cfg: &EyeConfig) -> Self {
        let make_side = || {
            selection
                .original_indices()
                .iter()
                .map(|&original| {
                    UnsafeCell::new(DisplaySnapshot {
                        window_before_ms: cfg.window_before_ms,
                        window_after_ms: cfg.window_after_ms,
                        original_sensor_index: original,
                        ..Default::default()
                    })
                })
                .collect::<Vec<_>>()
                .into_boxed_slice()
        };

        let sides = [make_side(), make_side()];

        // Side 0 starts published (empty but well-formed snapshots).
        let published = sides[0]
            .iter()
            .map(|cell| AtomicPtr::new(cell.get()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self { sides, published }
    }

    pub fn num_sensors(&self) -> usize {
        self.published.len()
    }

    /// Mutate one sensor's snapshot on the given (unpublished) side.
    ///
    /// Caller contract: `side` must not be the currently published side for
    /// this sensor. Upheld by the processor's side-flipping protocol.
    pub(crate) fn with_write_slot<R>(
        &self,
        side: usize,
        sensor: usize,
        f: impl FnOnce(&mut DisplaySnapshot) -> R,
    ) -> R {
        // Safety: per the contract above the slot is not readable through
        // `published`, so the mutable access cannot alias a reader.
        let snapshot = unsafe { &mut *self.sides[side][sensor].get() };
        f(snapshot)
    }

    /// Publish one sensor's snapshot on `side` with release ordering.
    pub(crate) fn publish(&self, side: usize, sensor: usize) {
        self.published[sensor].store(self.sides[side][sensor].get(), Ordering::Release);
    }

    /// The currently published snapshot for a sensor. Wait-free.
    pub fn read(&self, sensor: usize) -> Option<&DisplaySnapshot> {
        let ptr = self.published.get(sensor)?.load(Ordering::Acquire);
        // Safety: `ptr` always points into one of the permanently-allocated
        // sides, and the publisher will not write that instance until it is
        // unpublished again.
        Some(unsafe { &*ptr })
    }
}
