//! Resource binding and data transfer for an instanced-quad Vulkan renderer.
//!
//! This crate sits between compiled shader programs and a retained-mode 2D
//! renderer that draws everything as instanced quads. Given compiled shader
//! stages, it derives the descriptor layout the pipeline requires purely from
//! the shaders' reflected metadata, allocates and wires up the matching
//! descriptor sets, and keeps CPU-authored data (uniform blocks, per-instance
//! arrays, images) synchronized into GPU-visible memory.
//!
//! The crate does not create a window, instance, device or swapchain; that
//! bootstrap layer hands over a ready [`GpuContext`] (device, graphics queue,
//! allocator, descriptor pool, command pool) and receives back pipelines,
//! resource handles and ready-to-submit command buffers.
//!
//! # Architecture
//!
//! - [`shader`] ingests per-stage reflection: descriptor bindings and vertex
//!   input attributes, extracted from SPIR-V.
//! - [`descriptor`] merges the stages' bindings into dense per-set layouts
//!   (detecting conflicts and set-index gaps), then allocates descriptor
//!   sets and writes their initial resources.
//! - [`buffer`] creates buffers under a residency policy derived from usage:
//!   host-preferred buffers are written through their mapping,
//!   device-preferred ones through fenced staging copies.
//! - [`image`] tracks each image's current access layout and transitions it
//!   with barriers computed from a fixed lookup table; pixel uploads always
//!   stage through a transient buffer.
//! - [`pipeline`] assembles the graphics pipeline and owns the derived
//!   resource contract.
//! - [`rendering`] caches one command buffer per target behind a dirty flag
//!   and re-records only when an input changed.
//!
//! Host code is single-threaded and synchronous; every staged transfer
//! blocks on a fence until the GPU is done before its staging memory is
//! freed, so per-resource operations are strictly ordered by call order with
//! no user-side synchronization.
//!
//! All failures are surfaced as [`Error`]. Nothing in this layer retries or
//! recovers: malformed reflection data, failed Vulkan calls and out-of-bounds
//! transfers are all treated as unrecoverable by the layer and propagate to
//! the caller's top-level boundary.

pub mod buffer;
pub mod context;
pub mod descriptor;
pub mod error;
pub mod image;
pub mod pipeline;
pub mod rendering;
pub mod shader;

pub use buffer::{Buffer, Residency};
pub use context::GpuContext;
pub use descriptor::{
    allocate_sets, build_set_layouts, write_initial_bindings, BindingResource, BindingWrite,
    SetLayout, SetLayoutBinding,
};
pub use error::{Error, Result};
pub use image::Image;
pub use pipeline::Pipeline;
pub use rendering::{RenderTarget, Rendering};
pub use shader::{DescriptorKind, ReflectedBinding, ShaderReflection, ShaderStage, VertexInput};
