//! Part registry
//!
//! Tables store rows in immutable parts. Inserts add parts; merges and
//! mutations replace them.

pub mod blocks;
pub mod datum;
pub mod error;
pub mod eval;
pub mod info;
pub mod registry;

pub use blocks::BlockAllocator;
pub use datum::Datum;
pub use error::{PartError, PartResult};
pub use eval::{eval, matches, referenced_columns};
pub use info::{part_path, PartInfo, DEFAULT_PARTITION};
pub use registry::{Part, PartRegistry};
