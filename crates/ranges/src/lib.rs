//! Address-range classification for the transformation engine.
//!
//! Three layers, all keyed by raw addresses:
//! - [`RangeIndex`]: a generic ordered index over non-overlapping
//!   `[start, end)` intervals answering "which interval contains this
//!   address?".
//! - [`VmAreas`]: a one-shot snapshot of `/proc/self/maps` classifying
//!   addresses as heap, stack, library, or other mapped memory. Used for
//!   diagnostics when the engine decides whether old storage can be released.
//! - [`AllocTable`]: the set of heap blocks the runtime itself handed out,
//!   which are the only blocks it will ever free.

mod alloc;
mod index;
mod vmareas;

pub use alloc::AllocTable;
pub use index::{RangeIndex, Span};
pub use vmareas::{AreaKind, VmArea, VmAreas};
