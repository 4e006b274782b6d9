//! Descriptor layout derivation and set allocation.
//!
//! [`layout`] turns reflected shader metadata into the dense per-set binding
//! schema a pipeline requires; [`allocator`] turns that schema into concrete
//! descriptor sets with their initial resources written.

pub mod allocator;
pub mod layout;

pub use allocator::{allocate_sets, write_initial_bindings, BindingResource, BindingWrite};
pub use layout::{build_set_layouts, SetLayout, SetLayoutBinding};
