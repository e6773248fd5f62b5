//! Discovery of objects, components, surfaces, modifiers, tags and states.

use std::sync::Arc;

use kiln_ast::{Bits, Op, OpRef, PoolError};
use rustc_hash::{FxHashMap, FxHashSet};
use smol_str::SmolStr;

use crate::{
    error::{MessageKind, Severity},
    lower::Lowering,
    node::{
        GroupKind, NodeComponent, NodeComponentNew, NodeModifier, NodeObject, NodeSurface, NodeSurfaceNew,
        ObjectState,
    },
};

/// When an entity is active: the condition inherited from its object plus
/// the tags it requires or excludes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Activation {
    pub object_condition: Option<OpRef>,
    pub positive_tags: Vec<SmolStr>,
    pub negative_tags: Vec<SmolStr>,
    /// Filled in by the condition solver. `None` means always active.
    pub final_condition: Option<OpRef>,
}

impl Activation {
    fn new(object_condition: Option<OpRef>, positive_tags: &[SmolStr], negative_tags: &[SmolStr]) -> Self {
        Self {
            object_condition,
            positive_tags: positive_tags.to_vec(),
            negative_tags: negative_tags.to_vec(),
            final_condition: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ObjectData {
    pub node: Arc<NodeObject>,
    pub condition: Option<OpRef>,
}

#[derive(Debug, Clone)]
pub struct ComponentData {
    pub node: Arc<NodeComponentNew>,
    pub activation: Activation,
}

#[derive(Debug, Clone)]
pub struct SurfaceData {
    pub node: Arc<NodeSurfaceNew>,
    pub component_id: u32,
    pub lod: usize,
    pub activation: Activation,
}

#[derive(Debug, Clone)]
pub struct ModifierData {
    pub node: Arc<NodeModifier>,
    pub activation: Activation,
}

#[derive(Debug, Clone, Default)]
pub struct TagData {
    pub tag: SmolStr,
    /// Surfaces enabling the tag.
    pub surfaces: Vec<usize>,
    /// Modifiers enabling the tag.
    pub modifiers: Vec<usize>,
    /// Condition of the tag being enabled at all, filled in by the solver.
    pub generic_condition: Option<OpRef>,
}

#[derive(Debug, Clone, Default)]
pub struct FirstPass {
    pub objects: Vec<ObjectData>,
    pub components: Vec<ComponentData>,
    pub surfaces: Vec<SurfaceData>,
    pub modifiers: Vec<ModifierData>,
    pub tags: Vec<TagData>,
    pub states: Vec<ObjectState>,
    tag_index: FxHashMap<SmolStr, usize>,
}

impl FirstPass {
    pub(crate) fn generate(lowering: &Lowering, root: &Arc<NodeObject>, ignore_states: bool) -> Result<Self, PoolError> {
        let mut pass = FirstPass::default();
        pass.visit_object(lowering, root, None)?;

        if ignore_states || pass.states.is_empty() {
            pass.states = vec![ObjectState::default()];
        }
        pass.collect_tags();

        tracing::debug!(
            objects = pass.objects.len(),
            components = pass.components.len(),
            surfaces = pass.surfaces.len(),
            modifiers = pass.modifiers.len(),
            tags = pass.tags.len(),
            states = pass.states.len(),
            "First pass finished"
        );
        Ok(pass)
    }

    pub fn tag_index(&self, tag: &str) -> Option<usize> {
        self.tag_index.get(tag).copied()
    }

    pub fn object_condition(&self, node: &Arc<NodeObject>) -> Option<OpRef> {
        self.objects
            .iter()
            .find(|object| Arc::ptr_eq(&object.node, node))
            .and_then(|object| object.condition)
    }

    pub fn component(&self, node: &Arc<NodeComponentNew>) -> Option<&ComponentData> {
        self.components.iter().find(|component| Arc::ptr_eq(&component.node, node))
    }

    fn visit_object(
        &mut self,
        lowering: &Lowering,
        node: &Arc<NodeObject>,
        condition: Option<OpRef>,
    ) -> Result<(), PoolError> {
        self.objects.push(ObjectData {
            node: Arc::clone(node),
            condition,
        });

        match node.as_ref() {
            NodeObject::New(object) => {
                self.states.extend(object.states.iter().cloned());
                for modifier in &object.modifiers {
                    self.modifiers.push(ModifierData {
                        node: Arc::clone(modifier),
                        activation: Activation::new(condition, &[], &[]),
                    });
                }
                for component in &object.components {
                    self.visit_component(lowering, component, condition, &[], &[])?;
                }
                for child in &object.children {
                    self.visit_object(lowering, child, condition)?;
                }
            }
            NodeObject::Group(group) => {
                let mut used_names = FxHashSet::default();
                for (index, child) in group.children.iter().enumerate() {
                    if !used_names.insert(child.name()) {
                        lowering.log.add(
                            Severity::Warning,
                            MessageKind::DuplicateName,
                            format!("Object group has more than one children with the same name [{}].", child.name()),
                            Some(&group.name),
                        );
                    }

                    let child_condition = match group.kind {
                        GroupKind::AlwaysAll => None,
                        GroupKind::ToggleEach => Some(lowering.intern(Op::BoolParameter {
                            name: SmolStr::new(child.name()),
                            default: false,
                        })?),
                        GroupKind::OneOf => {
                            let value = lowering.intern(Op::ScalarParameter {
                                name: group.name.clone(),
                                default: Bits(0.0),
                            })?;
                            Some(lowering.intern(Op::EqualScalarConst {
                                value,
                                constant: index as i32,
                            })?)
                        }
                    };
                    let condition = lowering.and_optional(condition, child_condition)?;
                    self.visit_object(lowering, child, condition)?;
                }
            }
        }
        Ok(())
    }

    fn visit_component(
        &mut self,
        lowering: &Lowering,
        node: &Arc<NodeComponent>,
        condition: Option<OpRef>,
        positive: &[SmolStr],
        negative: &[SmolStr],
    ) -> Result<(), PoolError> {
        match node.as_ref() {
            NodeComponent::New(component) => {
                self.components.push(ComponentData {
                    node: Arc::clone(component),
                    activation: Activation::new(condition, positive, negative),
                });
                for (lod, lod_node) in component.lods.iter().enumerate() {
                    for surface in &lod_node.surfaces {
                        self.visit_surface(lowering, surface, component.id, lod, condition, &[], &[])?;
                    }
                }
            }
            NodeComponent::Switch { options, .. } => {
                for option in options.iter().flatten() {
                    self.visit_component(lowering, option, condition, positive, negative)?;
                }
            }
            NodeComponent::Variation { default, variations } => {
                let tags = variations.iter().map(|variation| variation.tag.clone()).collect::<Vec<_>>();
                for (index, variation) in variations.iter().enumerate() {
                    if let Some(component) = &variation.component {
                        let (positive, negative) = variation_tags(positive, negative, &tags, index);
                        self.visit_component(lowering, component, condition, &positive, &negative)?;
                    }
                }
                if let Some(default) = default {
                    let negative = [negative, tags.as_slice()].concat();
                    self.visit_component(lowering, default, condition, positive, &negative)?;
                }
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn visit_surface(
        &mut self,
        lowering: &Lowering,
        node: &Arc<NodeSurface>,
        component_id: u32,
        lod: usize,
        condition: Option<OpRef>,
        positive: &[SmolStr],
        negative: &[SmolStr],
    ) -> Result<(), PoolError> {
        match node.as_ref() {
            NodeSurface::New(surface) => {
                let own = surface
                    .condition
                    .as_ref()
                    .map(|condition| lowering.bool(condition))
                    .transpose()?;
                let condition = lowering.and_optional(condition, own)?;
                self.surfaces.push(SurfaceData {
                    node: Arc::clone(surface),
                    component_id,
                    lod,
                    activation: Activation::new(condition, positive, negative),
                });
            }
            NodeSurface::Variation(variation) => {
                let tags = variation
                    .variations
                    .iter()
                    .map(|variation| variation.tag.clone())
                    .collect::<Vec<_>>();
                for (index, branch) in variation.variations.iter().enumerate() {
                    let (positive, negative) = variation_tags(positive, negative, &tags, index);
                    for surface in &branch.surfaces {
                        self.visit_surface(lowering, surface, component_id, lod, condition, &positive, &negative)?;
                    }
                }
                let negative = [negative, tags.as_slice()].concat();
                for surface in &variation.default_surfaces {
                    self.visit_surface(lowering, surface, component_id, lod, condition, positive, &negative)?;
                }
            }
        }
        Ok(())
    }

    /// Indexes every tag that is enabled or referenced anywhere.
    pub(crate) fn collect_tags(&mut self) {
        let mut tags: Vec<TagData> = Vec::new();
        let mut index: FxHashMap<SmolStr, usize> = FxHashMap::default();

        for (surface_index, surface) in self.surfaces.iter().enumerate() {
            for tag in &surface.node.tags {
                let slot = tag_slot(&mut tags, &mut index, tag);
                let producers = &mut tags[slot].surfaces;
                if !producers.contains(&surface_index) {
                    producers.push(surface_index);
                }
            }
        }
        for (modifier_index, modifier) in self.modifiers.iter().enumerate() {
            for tag in &modifier.node.enable_tags {
                let slot = tag_slot(&mut tags, &mut index, tag);
                let producers = &mut tags[slot].modifiers;
                if !producers.contains(&modifier_index) {
                    producers.push(modifier_index);
                }
            }
        }

        let referenced = self
            .surfaces
            .iter()
            .map(|surface| &surface.activation)
            .chain(self.components.iter().map(|component| &component.activation))
            .chain(self.modifiers.iter().map(|modifier| &modifier.activation))
            .flat_map(|activation| activation.positive_tags.iter().chain(&activation.negative_tags))
            .chain(self.modifiers.iter().flat_map(|modifier| &modifier.node.required_tags));
        for tag in referenced {
            tag_slot(&mut tags, &mut index, tag);
        }

        self.tags = tags;
        self.tag_index = index;
    }
}

fn tag_slot(tags: &mut Vec<TagData>, index: &mut FxHashMap<SmolStr, usize>, tag: &SmolStr) -> usize {
    *index.entry(tag.clone()).or_insert_with(|| {
        tags.push(TagData {
            tag: tag.clone(),
            ..TagData::default()
        });
        tags.len() - 1
    })
}

/// Tags of variation branch `index`: its own tag is required and the tags
/// of later branches, which take precedence, are excluded.
fn variation_tags(
    positive: &[SmolStr],
    negative: &[SmolStr],
    tags: &[SmolStr],
    index: usize,
) -> (Vec<SmolStr>, Vec<SmolStr>) {
    let positive = [positive, &tags[index..=index]].concat();
    let negative = [negative, &tags[index + 1..]].concat();
    (positive, negative)
}
