//! Error types for every fallible operation in the crate.
//!
//! There is no retry or recovery at this layer: every error is reported to
//! the caller, which decides at its own top-level boundary whether to
//! terminate or surface the failure further. Configuration errors come from
//! malformed shader reflection data, resource errors from failed Vulkan or
//! allocator calls, and usage errors from integration bugs that would
//! otherwise reach the driver as undefined behavior.

use ash::vk;
use thiserror::Error;

/// The result type used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// Two stages declare the same (set, binding) slot with incompatible
    /// descriptor kinds or array counts.
    #[error(
        "conflicting declaration for set {set} binding {binding}: \
         {existing} does not match {incoming}"
    )]
    BindingConflict {
        set: u32,
        binding: u32,
        existing: String,
        incoming: String,
    },

    /// Descriptor set indices must be contiguous from 0, because the set
    /// layouts are handed to the pipeline as a dense, index-addressable array.
    #[error("descriptor set indices are not contiguous: set {missing} is never declared but set {max} is")]
    NonContiguousSets { missing: u32, max: u32 },

    /// A pipeline needs at least a vertex and a fragment stage.
    #[error("pipeline requires at least 2 shader stages, got {0}")]
    TooFewStages(usize),

    /// No stage in the supplied set declares itself as the given stage.
    #[error("pipeline is missing a {0} stage")]
    MissingStage(&'static str),

    /// The reflection collaborator reported a descriptor type this layer
    /// does not bind.
    #[error("unsupported descriptor type in shader reflection: {0}")]
    UnsupportedDescriptorType(String),

    /// SPIR-V reflection failed outright.
    #[error("shader reflection failed: {0}")]
    Reflection(String),

    /// A vertex input attribute uses a type with no matching vertex format.
    #[error("unsupported vertex input type at location {location}: {type_desc}")]
    UnsupportedVertexInput { location: u32, type_desc: String },

    /// A raw Vulkan call failed; `call` names the failing entry point.
    #[error("vulkan call `{call}` failed: {result}")]
    Vulkan {
        call: &'static str,
        result: vk::Result,
    },

    /// The device memory allocator refused an allocation or free.
    #[error("gpu memory allocation failed: {0}")]
    Allocation(#[from] gpu_allocator::AllocationError),

    /// An update/copy range falls outside a buffer's fixed size. Buffers
    /// never grow in place; callers create a larger buffer and copy instead.
    #[error("{op}: range at offset {offset} of {len} bytes exceeds buffer size {size}")]
    OutOfBounds {
        op: &'static str,
        offset: u64,
        len: u64,
        size: u64,
    },

    /// A host-preferred buffer's backing memory unexpectedly has no mapping.
    #[error("buffer memory is not host-mapped")]
    NotHostMapped,

    /// The transition table has no entry for this layout pair.
    #[error("unsupported image layout transition: {from:?} -> {to:?}")]
    UnsupportedTransition {
        from: vk::ImageLayout,
        to: vk::ImageLayout,
    },

    /// A rendering was asked to record without being fully wired up.
    #[error("cannot record rendering: {0}")]
    MissingPrerequisite(&'static str),

    /// A descriptor write targets a (set, binding) slot the layout never
    /// declared.
    #[error("descriptor write targets undeclared slot: set {set} binding {binding}")]
    UnknownBinding { set: u32, binding: u32 },

    /// The resource supplied for a descriptor write does not match the kind
    /// the set layout declares for that binding.
    #[error("descriptor write for set {set} binding {binding} expects {expected}, got {supplied}")]
    BindingKindMismatch {
        set: u32,
        binding: u32,
        expected: String,
        supplied: String,
    },

    /// Pixel data decoding failed.
    #[error("image decode failed: {0}")]
    Decode(#[from] png::DecodingError),

    /// The decoded image uses a color type this layer cannot expand to RGBA8.
    #[error("unsupported image color type: {0:?}")]
    UnsupportedColorType(png::ColorType),

    /// Only 8-bit channel data can be uploaded as RGBA8.
    #[error("unsupported image bit depth: {0:?}")]
    UnsupportedBitDepth(png::BitDepth),

    /// The supplied pixel slice does not cover the upload rectangle.
    #[error("image upload needs {expected} bytes of pixel data, got {supplied}")]
    PixelDataSize { expected: u64, supplied: u64 },

    /// The upload rectangle falls outside the image.
    #[error("upload rect {rect_w}x{rect_h} at ({x}, {y}) exceeds image extent {img_w}x{img_h}")]
    RectOutOfBounds {
        x: i32,
        y: i32,
        rect_w: u32,
        rect_h: u32,
        img_w: u32,
        img_h: u32,
    },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn vulkan(call: &'static str, result: vk::Result) -> Self {
        Error::Vulkan { call, result }
    }
}
