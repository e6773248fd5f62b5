//! Declarative content graph consumed by the code generator.
//!
//! Nodes are shared through [`Arc`] and identified by address, so the same
//! node reached along two paths is generated once.

use std::sync::Arc;

use glam::{Mat4, Vec4};
use kiln_ast::{BlendType, ClipPlane, FaceCullStrategy, ImageFormat, Layout, ResourceId};
use smol_str::SmolStr;

/// Address of a node, used as its identity in generation caches.
pub(crate) fn node_id<T>(node: &Arc<T>) -> usize {
    Arc::as_ptr(node) as *const () as usize
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeBool {
    Constant(bool),
    Parameter { name: SmolStr, default: bool },
    Not(Option<Arc<NodeBool>>),
    And(Option<Arc<NodeBool>>, Option<Arc<NodeBool>>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeScalar {
    Constant(f32),
    Parameter { name: SmolStr, default: f32 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeColor {
    Constant(Vec4),
    Parameter { name: SmolStr, default: Vec4 },
}

/// A mesh resource with one optional layout per UV channel.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeMesh {
    pub resource: ResourceId,
    pub layouts: Vec<Option<Arc<Layout>>>,
}

impl NodeMesh {
    pub fn new(resource: ResourceId) -> Self {
        Self {
            resource,
            layouts: Vec::new(),
        }
    }

    pub fn with_layout(mut self, layout: Layout) -> Self {
        self.layouts.push(Some(Arc::new(layout)));
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeImage {
    Constant {
        resource: ResourceId,
        size: [u16; 2],
        format: ImageFormat,
    },
    Mipmap {
        source: Option<Arc<NodeImage>>,
        levels: u8,
    },
    PixelFormat {
        source: Option<Arc<NodeImage>>,
        format: ImageFormat,
    },
    Swizzle {
        sources: [Option<Arc<NodeImage>>; 4],
        channels: [u8; 4],
        format: ImageFormat,
    },
    Layer {
        base: Option<Arc<NodeImage>>,
        blended: Option<Arc<NodeImage>>,
        mask: Option<Arc<NodeImage>>,
        blend: BlendType,
    },
}

impl NodeImage {
    /// Pixel size of the image, if it can be known without running it.
    pub fn size_hint(&self) -> Option<[u16; 2]> {
        match self {
            NodeImage::Constant { size, .. } => Some(*size),
            NodeImage::Mipmap { source, .. } | NodeImage::PixelFormat { source, .. } => {
                source.as_ref().and_then(|source| source.size_hint())
            }
            NodeImage::Swizzle { sources, .. } => sources.iter().flatten().find_map(|source| source.size_hint()),
            NodeImage::Layer { base, .. } => base.as_ref().and_then(|base| base.size_hint()),
        }
    }
}

/// A texture parameter of a surface.
#[derive(Debug, Clone, PartialEq)]
pub struct SurfaceImage {
    pub name: SmolStr,
    pub image: Option<Arc<NodeImage>>,
    /// UV channel whose layout the image is composed on, if any.
    pub layout_channel: Option<u16>,
    pub texture_size: [u16; 2],
    pub format: ImageFormat,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct NodeSurfaceNew {
    pub name: SmolStr,
    pub id: u32,
    /// Surfaces with the same id in different LODs share their layouts.
    pub shared_surface_id: Option<u32>,
    pub mesh: Option<Arc<NodeMesh>>,
    pub images: Vec<SurfaceImage>,
    pub scalars: Vec<(SmolStr, Arc<NodeScalar>)>,
    pub colors: Vec<(SmolStr, Arc<NodeColor>)>,
    /// Tags enabled while this surface is active.
    pub tags: Vec<SmolStr>,
    /// Extra activation condition, combined with the object's.
    pub condition: Option<Arc<NodeBool>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SurfaceVariation {
    pub tag: SmolStr,
    pub surfaces: Vec<Arc<NodeSurface>>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct NodeSurfaceVariation {
    pub default_surfaces: Vec<Arc<NodeSurface>>,
    pub variations: Vec<SurfaceVariation>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeSurface {
    New(Arc<NodeSurfaceNew>),
    Variation(NodeSurfaceVariation),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct NodeLod {
    pub surfaces: Vec<Arc<NodeSurface>>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct NodeComponentNew {
    pub name: SmolStr,
    pub id: u32,
    pub lods: Vec<Arc<NodeLod>>,
    pub overlay_material: Option<ResourceId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComponentVariation {
    pub tag: SmolStr,
    pub component: Option<Arc<NodeComponent>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeComponent {
    New(Arc<NodeComponentNew>),
    Switch {
        parameter: Option<Arc<NodeScalar>>,
        options: Vec<Option<Arc<NodeComponent>>>,
    },
    Variation {
        default: Option<Arc<NodeComponent>>,
        variations: Vec<ComponentVariation>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MultipleTagPolicy {
    /// The modifier applies if the surface has any of the required tags.
    #[default]
    OnlyOneRequired,
    AllRequired,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SurfaceEditTexture {
    /// Name of the surface image the patch applies to.
    pub name: SmolStr,
    pub patch: Option<Arc<NodeImage>>,
    pub mask: Option<Arc<NodeImage>>,
    pub blend: BlendType,
}

/// Image painted into the layout blocks a mesh extension adds.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtendTexture {
    /// Name of the surface image the blocks are composed into.
    pub name: SmolStr,
    pub image: Arc<NodeImage>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ModifierKind {
    MeshExtend {
        mesh: Option<Arc<NodeMesh>>,
        textures: Vec<ExtendTexture>,
    },
    MeshRemove {
        mask: Option<Arc<NodeMesh>>,
    },
    Morph {
        target: Option<Arc<NodeMesh>>,
        factor: Option<Arc<NodeScalar>>,
    },
    ClipWithMesh {
        clip: Option<Arc<NodeMesh>>,
    },
    ClipWithUvMask {
        mask: Option<Arc<NodeImage>>,
        layout_channel: u8,
    },
    ClipMorphPlane {
        plane: ClipPlane,
    },
    ClipDeform {
        shape: Option<Arc<NodeMesh>>,
        face_cull: FaceCullStrategy,
    },
    TransformInMesh {
        bounding: Option<Arc<NodeMesh>>,
        transform: Mat4,
    },
    SurfaceEdit {
        textures: Vec<SurfaceEditTexture>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeModifier {
    pub name: SmolStr,
    pub kind: ModifierKind,
    pub required_tags: Vec<SmolStr>,
    pub multiple_tag_policy: MultipleTagPolicy,
    /// Only surfaces of this component are modified.
    pub required_component: Option<u32>,
    /// Tags enabled while this modifier is active.
    pub enable_tags: Vec<SmolStr>,
    /// Reserved for edits of the source meshes; such modifiers never touch
    /// generated surfaces.
    pub apply_before_normal_operations: bool,
}

impl NodeModifier {
    pub fn new(name: impl Into<SmolStr>, kind: ModifierKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required_tags: Vec::new(),
            multiple_tag_policy: MultipleTagPolicy::default(),
            required_component: None,
            enable_tags: Vec::new(),
            apply_before_normal_operations: false,
        }
    }

    /// Whether the modifier targets a surface carrying `surface_tags`.
    pub fn applies_to(&self, surface_tags: &[SmolStr]) -> bool {
        match self.multiple_tag_policy {
            MultipleTagPolicy::OnlyOneRequired => self.required_tags.iter().any(|tag| surface_tags.contains(tag)),
            MultipleTagPolicy::AllRequired => self.required_tags.iter().all(|tag| surface_tags.contains(tag)),
        }
    }
}

/// A named variant of an object, generated into its own program entry point.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectState {
    pub name: SmolStr,
    /// Number of leading LODs dropped in this state.
    pub lod_bias: u8,
}

impl Default for ObjectState {
    fn default() -> Self {
        Self {
            name: SmolStr::new_static("Default"),
            lod_bias: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct NodeObjectNew {
    pub name: SmolStr,
    pub components: Vec<Arc<NodeComponent>>,
    pub modifiers: Vec<Arc<NodeModifier>>,
    pub children: Vec<Arc<NodeObject>>,
    pub states: Vec<ObjectState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum GroupKind {
    /// Every child is always present.
    #[default]
    AlwaysAll,
    /// Each child is toggled by a bool parameter named after it.
    ToggleEach,
    /// Exactly one child is selected by a scalar parameter named after the group.
    OneOf,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct NodeObjectGroup {
    pub name: SmolStr,
    pub kind: GroupKind,
    pub children: Vec<Arc<NodeObject>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeObject {
    New(NodeObjectNew),
    Group(NodeObjectGroup),
}

impl NodeObject {
    pub fn name(&self) -> &str {
        match self {
            NodeObject::New(node) => &node.name,
            NodeObject::Group(node) => &node.name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn modifier(policy: MultipleTagPolicy) -> NodeModifier {
        NodeModifier {
            required_tags: vec!["a".into(), "b".into()],
            multiple_tag_policy: policy,
            ..NodeModifier::new("m", ModifierKind::SurfaceEdit { textures: Vec::new() })
        }
    }

    #[rstest]
    #[case(MultipleTagPolicy::OnlyOneRequired, &["a"], true)]
    #[case(MultipleTagPolicy::OnlyOneRequired, &["c"], false)]
    #[case(MultipleTagPolicy::AllRequired, &["a"], false)]
    #[case(MultipleTagPolicy::AllRequired, &["b", "a"], true)]
    fn test_applies_to(#[case] policy: MultipleTagPolicy, #[case] tags: &[&str], #[case] expected: bool) {
        let tags = tags.iter().map(|tag| SmolStr::new(tag)).collect::<Vec<_>>();
        assert_eq!(modifier(policy).applies_to(&tags), expected);
    }

    #[test]
    fn test_size_hint_follows_sources() {
        let constant = Arc::new(NodeImage::Constant {
            resource: ResourceId(1),
            size: [512, 256],
            format: ImageFormat::Rgba8,
        });
        let mipmap = NodeImage::Mipmap {
            source: Some(constant),
            levels: 4,
        };
        assert_eq!(mipmap.size_hint(), Some([512, 256]));
        assert_eq!(
            NodeImage::PixelFormat {
                source: None,
                format: ImageFormat::Bc1
            }
            .size_hint(),
            None
        );
    }

    #[test]
    fn test_node_identity_is_per_allocation() {
        let a = Arc::new(NodeScalar::Constant(1.0));
        let b = Arc::new(NodeScalar::Constant(1.0));
        assert_eq!(node_id(&a), node_id(&a.clone()));
        assert_ne!(node_id(&a), node_id(&b));
    }
}
