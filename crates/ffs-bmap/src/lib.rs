#![forbid(unsafe_code)]
//! Block mapping: logical block to physical block resolution over direct
//! slots and `K` levels of indirect blocks.
//!
//! - [`decompose`] turns a logical block number into its indirection path.
//! - [`preference`] picks a locality hint for each new block.
//! - [`Materializer`] walks the chain for lookups and, on demand, allocates
//!   and links the missing blocks so that no parent ever points at storage
//!   that was not initialized first.

pub mod decompose;
pub mod indirect;
mod materialize;
pub mod pref;

pub use decompose::{BlockPath, compose, decompose};
pub use indirect::IndirectBlock;
pub use materialize::{BlockHandle, BlockRun, FillPolicy, Materializer, ResolveFlags};
pub use pref::preference;
