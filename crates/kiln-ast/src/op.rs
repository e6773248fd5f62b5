//! Operation node vocabulary of the compiler DAG.
//!
//! Every operation is an [`Op`] value whose children are [`OpRef`] indices
//! into an [`crate::OpPool`]. Ops are immutable once interned; rewriting a
//! node always produces a new op.

use std::{fmt, hash::Hash, sync::Arc};

use bytemuck::Pod;
use glam::{Mat4, Vec3, Vec4};
use smallvec::SmallVec;
use smol_str::SmolStr;

use crate::layout::Layout;

/// Reference to an op interned in an [`crate::OpPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpRef(u32);

impl OpRef {
    #[inline]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    #[inline]
    pub const fn id(self) -> u32 {
        self.0
    }
}

impl fmt::Display for OpRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OpRef({})", self.0)
    }
}

/// Compares and hashes a plain value by its bytes, so floats can take part in
/// structural identity.
#[derive(Clone, Copy, Default)]
pub struct Bits<T>(pub T);

impl<T: Pod> PartialEq for Bits<T> {
    fn eq(&self, other: &Self) -> bool {
        bytemuck::bytes_of(&self.0) == bytemuck::bytes_of(&other.0)
    }
}

impl<T: Pod> Eq for Bits<T> {}

impl<T: Pod> Hash for Bits<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        bytemuck::bytes_of(&self.0).hash(state);
    }
}

impl<T: fmt::Debug> fmt::Debug for Bits<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Handle of an external resource (mesh, image, material) owned by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Bool,
    Scalar,
    Color,
    Mesh,
    Image,
    Layout,
    Instance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FaceCullStrategy {
    #[default]
    AllVerticesCulled,
    OneVertexCulled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BlendType {
    #[default]
    Blend,
    Multiply,
    Screen,
    Overlay,
    Lighten,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ImageFormat {
    #[default]
    None,
    L8,
    Rgb8,
    Rgba8,
    Bc1,
    Bc3,
}

/// Plane and falloff of a morph-plane clip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClipPlane {
    pub origin: Bits<Vec3>,
    pub normal: Bits<Vec3>,
    pub distance: Bits<f32>,
    pub factor: Bits<f32>,
}

/// One conditional mask removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RemoveEntry {
    pub condition: Option<OpRef>,
    pub mask: OpRef,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OpType {
    BoolConstant,
    BoolParameter,
    BoolAnd,
    BoolNot,
    BoolEqualScalarConst,
    ScalarConstant,
    ScalarParameter,
    ColorConstant,
    ColorParameter,
    MeshConstant,
    MeshMerge,
    MeshMorph,
    MeshDifference,
    MeshClipDeform,
    MeshClipWithMesh,
    MeshClipMorphPlane,
    MeshClipWithUvMask,
    MeshRemoveMask,
    MeshApplyLayout,
    MeshTransformWithBoundingMesh,
    MeshOptimizeSkinning,
    MeshConditional,
    ImageConstant,
    ImageCompose,
    ImageLayer,
    ImagePatch,
    ImageCrop,
    ImagePlainColor,
    ImageMipmap,
    ImagePixelFormat,
    ImageBlankLayout,
    ImageSwizzle,
    ImageConditional,
    LayoutConstant,
    LayoutMerge,
    LayoutPack,
    LayoutRemoveBlocks,
    LayoutFromMesh,
    LayoutConditional,
    InstanceAddComponent,
    InstanceAddLod,
    InstanceAddSurface,
    InstanceAddMesh,
    InstanceAddImage,
    InstanceAddScalar,
    InstanceAddVector,
    InstanceAddOverlayMaterial,
    InstanceConditional,
    InstanceSwitch,
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Op {
    BoolConstant(bool),
    BoolParameter {
        name: SmolStr,
        default: bool,
    },
    And {
        a: OpRef,
        b: OpRef,
    },
    Not {
        a: OpRef,
    },
    /// True when the scalar `value` equals `constant`.
    EqualScalarConst {
        value: OpRef,
        constant: i32,
    },
    ScalarConstant(Bits<f32>),
    ScalarParameter {
        name: SmolStr,
        default: Bits<f32>,
    },
    ColorConstant(Bits<Vec4>),
    ColorParameter {
        name: SmolStr,
        default: Bits<Vec4>,
    },

    MeshConstant {
        resource: ResourceId,
    },
    /// Appends `added` to `base`, giving the added geometry `new_surface_id`.
    MeshMerge {
        base: Option<OpRef>,
        added: OpRef,
        new_surface_id: u32,
    },
    MeshMorph {
        base: OpRef,
        target: OpRef,
        factor: OpRef,
    },
    MeshDifference {
        base: OpRef,
        target: OpRef,
    },
    MeshClipDeform {
        mesh: OpRef,
        clip_shape: OpRef,
        face_cull: FaceCullStrategy,
    },
    MeshClipWithMesh {
        source: OpRef,
        clip: OpRef,
    },
    MeshClipMorphPlane {
        source: OpRef,
        plane: ClipPlane,
    },
    MeshClipWithUvMask {
        source: OpRef,
        mask: OpRef,
        layout_channel: u8,
    },
    MeshRemoveMask {
        source: OpRef,
        removes: SmallVec<[RemoveEntry; 2]>,
    },
    MeshApplyLayout {
        mesh: OpRef,
        layout: OpRef,
        channel: u16,
    },
    MeshTransformWithBoundingMesh {
        source: OpRef,
        bounding: OpRef,
        matrix: Bits<Mat4>,
    },
    MeshOptimizeSkinning {
        source: OpRef,
    },

    ImageConstant {
        resource: ResourceId,
    },
    /// Writes `block_image` into the block `block_id` of `layout` over `base`.
    ImageCompose {
        layout: OpRef,
        base: OpRef,
        block_image: OpRef,
        mask: Option<OpRef>,
        block_id: u64,
    },
    ImageLayer {
        base: OpRef,
        blended: OpRef,
        mask: Option<OpRef>,
        blend: BlendType,
    },
    ImagePatch {
        base: OpRef,
        patch: OpRef,
        location: [u16; 2],
    },
    ImageCrop {
        source: OpRef,
        min: [u16; 2],
        size: [u16; 2],
    },
    ImagePlainColor {
        color: OpRef,
        size: [u16; 2],
        format: ImageFormat,
    },
    ImageMipmap {
        source: OpRef,
        levels: u8,
    },
    ImagePixelFormat {
        source: OpRef,
        format: ImageFormat,
    },
    ImageBlankLayout {
        layout: OpRef,
        block_size: [u16; 2],
        format: ImageFormat,
        mipmaps: u8,
    },
    ImageSwizzle {
        sources: [Option<OpRef>; 4],
        channels: [u8; 4],
        format: ImageFormat,
    },

    LayoutConstant(Arc<Layout>),
    LayoutMerge {
        base: Option<OpRef>,
        added: OpRef,
    },
    LayoutPack {
        source: OpRef,
    },
    /// Drops the blocks of `source` that no longer exist in `mesh`.
    LayoutRemoveBlocks {
        source: OpRef,
        mesh: OpRef,
    },
    LayoutFromMesh {
        mesh: OpRef,
        channel: u16,
    },

    AddComponent {
        instance: Option<OpRef>,
        component: OpRef,
        id: u32,
    },
    AddLod {
        lods: SmallVec<[Option<OpRef>; 4]>,
    },
    AddSurface {
        instance: Option<OpRef>,
        /// Per-surface instance data; `None` for a surface without parameters.
        surface: Option<OpRef>,
        id: u32,
        name: SmolStr,
    },
    AddMesh {
        instance: Option<OpRef>,
        mesh: OpRef,
    },
    AddImage {
        instance: Option<OpRef>,
        image: OpRef,
        name: SmolStr,
    },
    AddScalar {
        instance: Option<OpRef>,
        value: OpRef,
        name: SmolStr,
    },
    AddVector {
        instance: Option<OpRef>,
        value: OpRef,
        name: SmolStr,
    },
    AddOverlayMaterial {
        instance: Option<OpRef>,
        material: ResourceId,
    },
    InstanceSwitch {
        variable: OpRef,
        default: Option<OpRef>,
        cases: SmallVec<[(i32, OpRef); 4]>,
    },

    /// `yes` when `condition` holds, `no` otherwise. A missing branch is the
    /// empty value of `data_type`.
    Conditional {
        data_type: DataType,
        condition: OpRef,
        yes: Option<OpRef>,
        no: Option<OpRef>,
    },
}

impl Op {
    pub fn scalar(value: f32) -> Self {
        Op::ScalarConstant(Bits(value))
    }

    pub fn color(value: Vec4) -> Self {
        Op::ColorConstant(Bits(value))
    }

    pub fn op_type(&self) -> OpType {
        match self {
            Op::BoolConstant(_) => OpType::BoolConstant,
            Op::BoolParameter { .. } => OpType::BoolParameter,
            Op::And { .. } => OpType::BoolAnd,
            Op::Not { .. } => OpType::BoolNot,
            Op::EqualScalarConst { .. } => OpType::BoolEqualScalarConst,
            Op::ScalarConstant(_) => OpType::ScalarConstant,
            Op::ScalarParameter { .. } => OpType::ScalarParameter,
            Op::ColorConstant(_) => OpType::ColorConstant,
            Op::ColorParameter { .. } => OpType::ColorParameter,
            Op::MeshConstant { .. } => OpType::MeshConstant,
            Op::MeshMerge { .. } => OpType::MeshMerge,
            Op::MeshMorph { .. } => OpType::MeshMorph,
            Op::MeshDifference { .. } => OpType::MeshDifference,
            Op::MeshClipDeform { .. } => OpType::MeshClipDeform,
            Op::MeshClipWithMesh { .. } => OpType::MeshClipWithMesh,
            Op::MeshClipMorphPlane { .. } => OpType::MeshClipMorphPlane,
            Op::MeshClipWithUvMask { .. } => OpType::MeshClipWithUvMask,
            Op::MeshRemoveMask { .. } => OpType::MeshRemoveMask,
            Op::MeshApplyLayout { .. } => OpType::MeshApplyLayout,
            Op::MeshTransformWithBoundingMesh { .. } => OpType::MeshTransformWithBoundingMesh,
            Op::MeshOptimizeSkinning { .. } => OpType::MeshOptimizeSkinning,
            Op::ImageConstant { .. } => OpType::ImageConstant,
            Op::ImageCompose { .. } => OpType::ImageCompose,
            Op::ImageLayer { .. } => OpType::ImageLayer,
            Op::ImagePatch { .. } => OpType::ImagePatch,
            Op::ImageCrop { .. } => OpType::ImageCrop,
            Op::ImagePlainColor { .. } => OpType::ImagePlainColor,
            Op::ImageMipmap { .. } => OpType::ImageMipmap,
            Op::ImagePixelFormat { .. } => OpType::ImagePixelFormat,
            Op::ImageBlankLayout { .. } => OpType::ImageBlankLayout,
            Op::ImageSwizzle { .. } => OpType::ImageSwizzle,
            Op::LayoutConstant(_) => OpType::LayoutConstant,
            Op::LayoutMerge { .. } => OpType::LayoutMerge,
            Op::LayoutPack { .. } => OpType::LayoutPack,
            Op::LayoutRemoveBlocks { .. } => OpType::LayoutRemoveBlocks,
            Op::LayoutFromMesh { .. } => OpType::LayoutFromMesh,
            Op::AddComponent { .. } => OpType::InstanceAddComponent,
            Op::AddLod { .. } => OpType::InstanceAddLod,
            Op::AddSurface { .. } => OpType::InstanceAddSurface,
            Op::AddMesh { .. } => OpType::InstanceAddMesh,
            Op::AddImage { .. } => OpType::InstanceAddImage,
            Op::AddScalar { .. } => OpType::InstanceAddScalar,
            Op::AddVector { .. } => OpType::InstanceAddVector,
            Op::AddOverlayMaterial { .. } => OpType::InstanceAddOverlayMaterial,
            Op::InstanceSwitch { .. } => OpType::InstanceSwitch,
            Op::Conditional { data_type, .. } => match data_type {
                DataType::Mesh => OpType::MeshConditional,
                DataType::Image => OpType::ImageConditional,
                DataType::Layout => OpType::LayoutConditional,
                DataType::Instance => OpType::InstanceConditional,
                DataType::Bool | DataType::Scalar | DataType::Color => {
                    unreachable!("conditionals are only emitted for resource types")
                }
            },
        }
    }

    pub fn data_type(&self) -> DataType {
        match self {
            Op::BoolConstant(_)
            | Op::BoolParameter { .. }
            | Op::And { .. }
            | Op::Not { .. }
            | Op::EqualScalarConst { .. } => DataType::Bool,
            Op::ScalarConstant(_) | Op::ScalarParameter { .. } => DataType::Scalar,
            Op::ColorConstant(_) | Op::ColorParameter { .. } => DataType::Color,
            Op::MeshConstant { .. }
            | Op::MeshMerge { .. }
            | Op::MeshMorph { .. }
            | Op::MeshDifference { .. }
            | Op::MeshClipDeform { .. }
            | Op::MeshClipWithMesh { .. }
            | Op::MeshClipMorphPlane { .. }
            | Op::MeshClipWithUvMask { .. }
            | Op::MeshRemoveMask { .. }
            | Op::MeshApplyLayout { .. }
            | Op::MeshTransformWithBoundingMesh { .. }
            | Op::MeshOptimizeSkinning { .. } => DataType::Mesh,
            Op::ImageConstant { .. }
            | Op::ImageCompose { .. }
            | Op::ImageLayer { .. }
            | Op::ImagePatch { .. }
            | Op::ImageCrop { .. }
            | Op::ImagePlainColor { .. }
            | Op::ImageMipmap { .. }
            | Op::ImagePixelFormat { .. }
            | Op::ImageBlankLayout { .. }
            | Op::ImageSwizzle { .. } => DataType::Image,
            Op::LayoutConstant(_)
            | Op::LayoutMerge { .. }
            | Op::LayoutPack { .. }
            | Op::LayoutRemoveBlocks { .. }
            | Op::LayoutFromMesh { .. } => DataType::Layout,
            Op::AddComponent { .. }
            | Op::AddLod { .. }
            | Op::AddSurface { .. }
            | Op::AddMesh { .. }
            | Op::AddImage { .. }
            | Op::AddScalar { .. }
            | Op::AddVector { .. }
            | Op::AddOverlayMaterial { .. }
            | Op::InstanceSwitch { .. } => DataType::Instance,
            Op::Conditional { data_type, .. } => *data_type,
        }
    }

    /// Visits every child reference in declaration order.
    pub fn visit_children_mut(&mut self, f: &mut dyn FnMut(&mut OpRef)) {
        fn opt(child: &mut Option<OpRef>, f: &mut dyn FnMut(&mut OpRef)) {
            if let Some(child) = child {
                f(child);
            }
        }

        match self {
            Op::BoolConstant(_)
            | Op::BoolParameter { .. }
            | Op::ScalarConstant(_)
            | Op::ScalarParameter { .. }
            | Op::ColorConstant(_)
            | Op::ColorParameter { .. }
            | Op::MeshConstant { .. }
            | Op::ImageConstant { .. }
            | Op::LayoutConstant(_) => {}
            Op::And { a, b } => {
                f(a);
                f(b);
            }
            Op::Not { a } => f(a),
            Op::EqualScalarConst { value, .. } => f(value),
            Op::MeshMerge { base, added, .. } => {
                opt(base, f);
                f(added);
            }
            Op::MeshMorph {
                base,
                target,
                factor,
            } => {
                f(base);
                f(target);
                f(factor);
            }
            Op::MeshDifference { base, target } => {
                f(base);
                f(target);
            }
            Op::MeshClipDeform {
                mesh, clip_shape, ..
            } => {
                f(mesh);
                f(clip_shape);
            }
            Op::MeshClipWithMesh { source, clip } => {
                f(source);
                f(clip);
            }
            Op::MeshClipMorphPlane { source, .. }
            | Op::MeshOptimizeSkinning { source }
            | Op::LayoutPack { source }
            | Op::ImageCrop { source, .. }
            | Op::ImageMipmap { source, .. }
            | Op::ImagePixelFormat { source, .. } => f(source),
            Op::MeshClipWithUvMask { source, mask, .. } => {
                f(source);
                f(mask);
            }
            Op::MeshRemoveMask { source, removes } => {
                f(source);
                for remove in removes {
                    opt(&mut remove.condition, f);
                    f(&mut remove.mask);
                }
            }
            Op::MeshApplyLayout { mesh, layout, .. } => {
                f(mesh);
                f(layout);
            }
            Op::MeshTransformWithBoundingMesh {
                source, bounding, ..
            } => {
                f(source);
                f(bounding);
            }
            Op::ImageCompose {
                layout,
                base,
                block_image,
                mask,
                ..
            } => {
                f(layout);
                f(base);
                f(block_image);
                opt(mask, f);
            }
            Op::ImageLayer {
                base,
                blended,
                mask,
                ..
            } => {
                f(base);
                f(blended);
                opt(mask, f);
            }
            Op::ImagePatch { base, patch, .. } => {
                f(base);
                f(patch);
            }
            Op::ImagePlainColor { color, .. } => f(color),
            Op::ImageBlankLayout { layout, .. } => f(layout),
            Op::ImageSwizzle { sources, .. } => {
                for source in sources {
                    opt(source, f);
                }
            }
            Op::LayoutMerge { base, added } => {
                opt(base, f);
                f(added);
            }
            Op::LayoutRemoveBlocks { source, mesh } => {
                f(source);
                f(mesh);
            }
            Op::LayoutFromMesh { mesh, .. } => f(mesh),
            Op::AddComponent {
                instance,
                component,
                ..
            } => {
                opt(instance, f);
                f(component);
            }
            Op::AddLod { lods } => {
                for lod in lods {
                    opt(lod, f);
                }
            }
            Op::AddSurface {
                instance, surface, ..
            } => {
                opt(instance, f);
                opt(surface, f);
            }
            Op::AddMesh { instance, mesh } => {
                opt(instance, f);
                f(mesh);
            }
            Op::AddImage {
                instance, image, ..
            } => {
                opt(instance, f);
                f(image);
            }
            Op::AddScalar {
                instance, value, ..
            }
            | Op::AddVector {
                instance, value, ..
            } => {
                opt(instance, f);
                f(value);
            }
            Op::AddOverlayMaterial { instance, .. } => opt(instance, f),
            Op::InstanceSwitch {
                variable,
                default,
                cases,
            } => {
                f(variable);
                opt(default, f);
                for (_, case) in cases {
                    f(case);
                }
            }
            Op::Conditional {
                condition, yes, no, ..
            } => {
                f(condition);
                opt(yes, f);
                opt(no, f);
            }
        }
    }

    pub fn children(&self) -> SmallVec<[OpRef; 4]> {
        let mut children = SmallVec::new();
        self.clone().visit_children_mut(&mut |child| children.push(*child));
        children
    }

    /// Rebuilds the op with every child replaced by `map(child)`.
    pub fn with_children(&self, mut map: impl FnMut(OpRef) -> OpRef) -> Op {
        let mut op = self.clone();
        op.visit_children_mut(&mut |child| *child = map(*child));
        op
    }

    pub fn as_bool_constant(&self) -> Option<bool> {
        match self {
            Op::BoolConstant(value) => Some(*value),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use smallvec::smallvec;

    fn r(id: u32) -> OpRef {
        OpRef::new(id)
    }

    #[rstest]
    #[case(Op::BoolConstant(true), vec![])]
    #[case(Op::And { a: r(1), b: r(2) }, vec![r(1), r(2)])]
    #[case(Op::MeshMerge { base: None, added: r(3), new_surface_id: 1 }, vec![r(3)])]
    #[case(Op::Conditional { data_type: DataType::Mesh, condition: r(0), yes: Some(r(4)), no: None }, vec![r(0), r(4)])]
    #[case(Op::MeshRemoveMask { source: r(1), removes: smallvec![RemoveEntry { condition: Some(r(2)), mask: r(3) }] }, vec![r(1), r(2), r(3)])]
    #[case(Op::AddLod { lods: smallvec![Some(r(5)), None, Some(r(6))] }, vec![r(5), r(6)])]
    fn test_children(#[case] op: Op, #[case] expected: Vec<OpRef>) {
        assert_eq!(op.children().to_vec(), expected);
    }

    #[test]
    fn test_with_children_substitutes() {
        let op = Op::ImageLayer {
            base: r(1),
            blended: r(2),
            mask: Some(r(3)),
            blend: BlendType::Multiply,
        };
        let mapped = op.with_children(|child| OpRef::new(child.id() + 10));
        assert_eq!(mapped.children().to_vec(), vec![r(11), r(12), r(13)]);
        assert_eq!(mapped.op_type(), OpType::ImageLayer);
    }

    #[test]
    fn test_float_payloads_compare_by_bits() {
        assert_eq!(Op::scalar(f32::NAN), Op::scalar(f32::NAN));
        assert_ne!(Op::scalar(0.0), Op::scalar(-0.0));
    }

    #[rstest]
    #[case(DataType::Mesh, OpType::MeshConditional)]
    #[case(DataType::Image, OpType::ImageConditional)]
    #[case(DataType::Layout, OpType::LayoutConditional)]
    #[case(DataType::Instance, OpType::InstanceConditional)]
    fn test_conditional_op_type(#[case] data_type: DataType, #[case] expected: OpType) {
        let op = Op::Conditional {
            data_type,
            condition: r(0),
            yes: None,
            no: None,
        };
        assert_eq!(op.op_type(), expected);
        assert_eq!(op.data_type(), data_type);
    }
}
