//! On-disk storage primitives backing a [`crate::virtual_map::VirtualMap`]:
//! append-only data files (spec §4.C), the path-indexed view over them
//! (spec §4.D), and the key-indexed half-disk hash map (spec §4.E).

pub mod file;
pub mod hdhm;
pub mod path_index;

pub use file::{FileSet, SealedFile};
pub use hdhm::Hdhm;
pub use path_index::{PathIndex, PauseGate};
