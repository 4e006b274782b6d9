//! Builds per-set binding layouts from reflected shader metadata.
//!
//! The builder is the sole producer of a pipeline's resource contract: it
//! merges every stage's reflected bindings into one dense array of
//! [`SetLayout`]s, indexed by set number. A malformed merge would corrupt
//! every downstream descriptor write, so all validation here is fatal and no
//! partial result is ever produced.

use ash::vk;
use foldhash::HashMap;
use smallvec::SmallVec;

use crate::context::GpuContext;
use crate::error::{Error, Result};
use crate::shader::{DescriptorKind, ShaderReflection};

/// One binding slot within a set layout, with accumulated stage visibility.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SetLayoutBinding {
    pub binding: u32,
    pub kind: DescriptorKind,
    pub count: u32,
    /// All stages that declare this binding, OR-ed together.
    pub stages: vk::ShaderStageFlags,
}

/// The ordered binding schema of one descriptor set.
///
/// Binding order is insertion order: the first stage to declare a binding
/// fixes its position, and identical re-declarations by later stages only
/// widen the visibility flags.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SetLayout {
    pub bindings: Vec<SetLayoutBinding>,
}

impl SetLayout {
    /// Looks up a binding by its binding number.
    pub fn binding(&self, binding: u32) -> Option<&SetLayoutBinding> {
        self.bindings.iter().find(|b| b.binding == binding)
    }

    /// Materializes the raw Vulkan layout object for this set.
    pub fn create_raw(&self, ctx: &GpuContext) -> Result<vk::DescriptorSetLayout> {
        let bindings_vk: SmallVec<[vk::DescriptorSetLayoutBinding<'_>; 4]> = self
            .bindings
            .iter()
            .map(|b| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(b.binding)
                    .descriptor_type(b.kind.as_vk())
                    .descriptor_count(b.count)
                    .stage_flags(b.stages)
            })
            .collect();

        let create_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings_vk);
        unsafe { ctx.device.create_descriptor_set_layout(&create_info, None) }
            .map_err(|e| Error::vulkan("vkCreateDescriptorSetLayout", e))
    }
}

/// Merges the reflected bindings of all stages into a dense array of set
/// layouts, one per set index starting at 0.
///
/// Bindings are first collected into a map keyed by set index; contiguity is
/// validated once after all stages have been visited, and only then is the
/// dense array emitted. A binding re-declared by another stage must agree on
/// kind and array count: if it does, the stage flags are merged; if not,
/// two resources would be claiming one slot and the build fails.
///
/// Fatal conditions: fewer than two stages, no vertex stage, no fragment
/// stage, a conflicting re-declaration, or a gap in the used set indices.
pub fn build_set_layouts(stages: &[&ShaderReflection]) -> Result<Vec<SetLayout>> {
    validate_stage_set(stages)?;

    let mut sets: HashMap<u32, Vec<SetLayoutBinding>> = HashMap::default();
    let mut max_set = None;

    for reflection in stages {
        for declared in &reflection.bindings {
            max_set = Some(max_set.map_or(declared.set, |m: u32| m.max(declared.set)));
            let bindings = sets.entry(declared.set).or_default();

            match bindings.iter_mut().find(|b| b.binding == declared.binding) {
                Some(existing) => {
                    if existing.kind != declared.kind || existing.count != declared.count {
                        return Err(Error::BindingConflict {
                            set: declared.set,
                            binding: declared.binding,
                            existing: format!("{} x{}", existing.kind, existing.count),
                            incoming: format!("{} x{}", declared.kind, declared.count),
                        });
                    }
                    // Same slot, same shape: a legitimate multi-stage binding.
                    existing.stages |= reflection.stage;
                }
                None => bindings.push(SetLayoutBinding {
                    binding: declared.binding,
                    kind: declared.kind,
                    count: declared.count,
                    stages: reflection.stage,
                }),
            }
        }
    }

    let Some(max_set) = max_set else {
        return Ok(Vec::new());
    };

    let mut layouts = Vec::with_capacity(max_set as usize + 1);
    for set in 0..=max_set {
        match sets.remove(&set) {
            Some(bindings) => layouts.push(SetLayout { bindings }),
            None => {
                return Err(Error::NonContiguousSets {
                    missing: set,
                    max: max_set,
                })
            }
        }
    }
    Ok(layouts)
}

fn validate_stage_set(stages: &[&ShaderReflection]) -> Result<()> {
    if stages.len() < 2 {
        return Err(Error::TooFewStages(stages.len()));
    }
    if !stages
        .iter()
        .any(|s| s.stage.contains(vk::ShaderStageFlags::VERTEX))
    {
        return Err(Error::MissingStage("vertex"));
    }
    if !stages
        .iter()
        .any(|s| s.stage.contains(vk::ShaderStageFlags::FRAGMENT))
    {
        return Err(Error::MissingStage("fragment"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shader::ReflectedBinding;

    fn stage(
        flags: vk::ShaderStageFlags,
        bindings: &[(u32, u32, DescriptorKind, u32)],
    ) -> ShaderReflection {
        ShaderReflection {
            stage: flags,
            bindings: bindings
                .iter()
                .map(|&(set, binding, kind, count)| ReflectedBinding {
                    set,
                    binding,
                    kind,
                    count,
                })
                .collect(),
            vertex_inputs: Vec::new(),
            vertex_stride: 0,
        }
    }

    #[test]
    fn uniform_and_sampler_across_two_sets() {
        // Vertex and fragment both see set 0 binding 0 (uniform buffer) and
        // set 1 binding 0 (combined image sampler).
        let decls = [
            (0, 0, DescriptorKind::UniformBuffer, 1),
            (1, 0, DescriptorKind::CombinedImageSampler, 1),
        ];
        let vs = stage(vk::ShaderStageFlags::VERTEX, &decls);
        let fs = stage(vk::ShaderStageFlags::FRAGMENT, &decls);

        let layouts = build_set_layouts(&[&vs, &fs]).unwrap();

        assert_eq!(layouts.len(), 2);
        assert_eq!(layouts[0].bindings.len(), 1);
        assert_eq!(layouts[0].bindings[0].kind, DescriptorKind::UniformBuffer);
        assert_eq!(layouts[1].bindings.len(), 1);
        assert_eq!(
            layouts[1].bindings[0].kind,
            DescriptorKind::CombinedImageSampler
        );
    }

    #[test]
    fn identical_redeclaration_merges_stage_flags() {
        let vs = stage(
            vk::ShaderStageFlags::VERTEX,
            &[(0, 0, DescriptorKind::UniformBuffer, 1)],
        );
        let fs = stage(
            vk::ShaderStageFlags::FRAGMENT,
            &[(0, 0, DescriptorKind::UniformBuffer, 1)],
        );

        let layouts = build_set_layouts(&[&vs, &fs]).unwrap();

        assert_eq!(layouts.len(), 1);
        assert_eq!(
            layouts[0].bindings[0].stages,
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
        );
    }

    #[test]
    fn kind_mismatch_is_a_conflict() {
        let vs = stage(
            vk::ShaderStageFlags::VERTEX,
            &[(0, 0, DescriptorKind::UniformBuffer, 1)],
        );
        let fs = stage(
            vk::ShaderStageFlags::FRAGMENT,
            &[(0, 0, DescriptorKind::CombinedImageSampler, 1)],
        );

        let err = build_set_layouts(&[&vs, &fs]).unwrap_err();
        assert!(matches!(
            err,
            Error::BindingConflict { set: 0, binding: 0, .. }
        ));
    }

    #[test]
    fn count_mismatch_is_a_conflict() {
        let vs = stage(
            vk::ShaderStageFlags::VERTEX,
            &[(0, 2, DescriptorKind::SampledImage, 4)],
        );
        let fs = stage(
            vk::ShaderStageFlags::FRAGMENT,
            &[(0, 2, DescriptorKind::SampledImage, 8)],
        );

        let err = build_set_layouts(&[&vs, &fs]).unwrap_err();
        assert!(matches!(
            err,
            Error::BindingConflict { set: 0, binding: 2, .. }
        ));
    }

    #[test]
    fn set_index_gap_is_fatal() {
        let vs = stage(
            vk::ShaderStageFlags::VERTEX,
            &[(0, 0, DescriptorKind::UniformBuffer, 1)],
        );
        let fs = stage(
            vk::ShaderStageFlags::FRAGMENT,
            &[(2, 0, DescriptorKind::CombinedImageSampler, 1)],
        );

        let err = build_set_layouts(&[&vs, &fs]).unwrap_err();
        assert!(matches!(
            err,
            Error::NonContiguousSets { missing: 1, max: 2 }
        ));
    }

    #[test]
    fn single_stage_is_rejected() {
        let vs = stage(vk::ShaderStageFlags::VERTEX, &[]);
        assert!(matches!(
            build_set_layouts(&[&vs]).unwrap_err(),
            Error::TooFewStages(1)
        ));
    }

    #[test]
    fn missing_vertex_stage_is_rejected() {
        let fs = stage(vk::ShaderStageFlags::FRAGMENT, &[]);
        let cs = stage(vk::ShaderStageFlags::COMPUTE, &[]);
        assert!(matches!(
            build_set_layouts(&[&fs, &cs]).unwrap_err(),
            Error::MissingStage("vertex")
        ));
    }

    #[test]
    fn missing_fragment_stage_is_rejected() {
        let vs = stage(vk::ShaderStageFlags::VERTEX, &[]);
        let cs = stage(vk::ShaderStageFlags::COMPUTE, &[]);
        assert!(matches!(
            build_set_layouts(&[&vs, &cs]).unwrap_err(),
            Error::MissingStage("fragment")
        ));
    }

    #[test]
    fn binding_order_is_insertion_order() {
        // Fragment declares binding 5 before the vertex stage is even seen;
        // the vertex stage then adds binding 1 to the same set. Positions
        // follow first declaration, not binding number.
        let vs = stage(
            vk::ShaderStageFlags::VERTEX,
            &[
                (0, 5, DescriptorKind::UniformBuffer, 1),
                (0, 1, DescriptorKind::StorageBuffer, 1),
            ],
        );
        let fs = stage(
            vk::ShaderStageFlags::FRAGMENT,
            &[(0, 5, DescriptorKind::UniformBuffer, 1)],
        );

        let layouts = build_set_layouts(&[&vs, &fs]).unwrap();
        let numbers: Vec<u32> = layouts[0].bindings.iter().map(|b| b.binding).collect();
        assert_eq!(numbers, vec![5, 1]);
    }

    #[test]
    fn no_bindings_yields_no_layouts() {
        let vs = stage(vk::ShaderStageFlags::VERTEX, &[]);
        let fs = stage(vk::ShaderStageFlags::FRAGMENT, &[]);
        assert!(build_set_layouts(&[&vs, &fs]).unwrap().is_empty());
    }
}
