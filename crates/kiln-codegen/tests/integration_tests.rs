use std::{collections::BTreeSet, sync::Arc};

use kiln_ast::{ImageFormat, Layout, LayoutBlock, Op, OpPool, OpRef, OpType, PackStrategy, ResourceId};
use kiln_codegen::{
    CodegenOptions, CompiledObject, Compiler, ExtendTexture, GroupKind, MessageKind, ModifierKind, NodeComponent,
    NodeComponentNew, NodeImage, NodeLod, NodeMesh, NodeModifier, NodeObject, NodeObjectGroup, NodeObjectNew,
    NodeSurface, NodeSurfaceNew, NodeSurfaceVariation, ObjectState, Severity, SurfaceEditTexture, SurfaceImage,
    SurfaceVariation,
};
use smol_str::SmolStr;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn surface(name: &str, resource: u32, tags: &[&str]) -> NodeSurfaceNew {
    NodeSurfaceNew {
        name: name.into(),
        mesh: Some(Arc::new(NodeMesh::new(ResourceId(resource)))),
        tags: tags.iter().map(|tag| SmolStr::new(tag)).collect(),
        ..NodeSurfaceNew::default()
    }
}

fn new_surface(surface: NodeSurfaceNew) -> Arc<NodeSurface> {
    Arc::new(NodeSurface::New(Arc::new(surface)))
}

fn component(name: &str, id: u32, lods: Vec<Vec<Arc<NodeSurface>>>) -> Arc<NodeComponent> {
    Arc::new(NodeComponent::New(Arc::new(NodeComponentNew {
        name: name.into(),
        id,
        lods: lods.into_iter().map(|surfaces| Arc::new(NodeLod { surfaces })).collect(),
        overlay_material: None,
    })))
}

fn object(name: &str, components: Vec<Arc<NodeComponent>>) -> NodeObjectNew {
    NodeObjectNew {
        name: name.into(),
        components,
        ..NodeObjectNew::default()
    }
}

fn compile(root: NodeObjectNew, options: CodegenOptions) -> CompiledObject {
    init_tracing();
    Compiler::new(options)
        .compile(&Arc::new(NodeObject::New(root)))
        .unwrap()
}

fn reachable(pool: &OpPool, root: OpRef) -> Vec<Op> {
    let mut seen = BTreeSet::new();
    let mut stack = vec![root];
    let mut ops = Vec::new();
    while let Some(op_ref) = stack.pop() {
        if !seen.insert(op_ref) {
            continue;
        }
        let op = pool.get(op_ref).unwrap();
        stack.extend(op.children());
        ops.push(op);
    }
    ops
}

fn count(compiled: &CompiledObject, state: &str, op_type: OpType) -> usize {
    let root = compiled.state(state).and_then(|state| state.root).unwrap();
    reachable(&compiled.pool, root)
        .iter()
        .filter(|op| op.op_type() == op_type)
        .count()
}

fn surface_names(compiled: &CompiledObject, state: &str) -> BTreeSet<SmolStr> {
    let root = compiled.state(state).and_then(|state| state.root).unwrap();
    reachable(&compiled.pool, root)
        .into_iter()
        .filter_map(|op| match op {
            Op::AddSurface { name, .. } => Some(name),
            _ => None,
        })
        .collect()
}

/// A surface that only exists while tag "A" is enabled, next to an
/// unconditional base surface.
fn tag_scenario(with_producer: bool) -> NodeObjectNew {
    let mut surfaces = vec![
        new_surface(surface("Base", 1, &[])),
        Arc::new(NodeSurface::Variation(NodeSurfaceVariation {
            default_surfaces: Vec::new(),
            variations: vec![SurfaceVariation {
                tag: "A".into(),
                surfaces: vec![new_surface(surface("S1", 2, &[]))],
            }],
        })),
    ];
    if with_producer {
        surfaces.push(new_surface(surface("S2", 3, &["A"])));
    }
    object("Root", vec![component("Body", 0, vec![surfaces])])
}

#[test]
fn test_surface_enabled_by_tag_producer() {
    let compiled = compile(tag_scenario(true), CodegenOptions::default());

    assert_eq!(
        surface_names(&compiled, "Default"),
        BTreeSet::from(["Base".into(), "S1".into(), "S2".into()])
    );
    assert_eq!(count(&compiled, "Default", OpType::InstanceConditional), 0);
    assert!(compiled.messages.is_empty());
}

#[test]
fn test_surface_with_undefined_tag_is_dropped() {
    let compiled = compile(tag_scenario(false), CodegenOptions::default());

    assert_eq!(surface_names(&compiled, "Default"), BTreeSet::from(["Base".into()]));
    assert_eq!(count(&compiled, "Default", OpType::MeshMerge), 0);
}

#[test]
fn test_lod_bias_drops_leading_lods() {
    let lods = (0..3)
        .map(|lod| vec![new_surface(surface("Skin", 10 + lod, &[]))])
        .collect();
    let root = NodeObjectNew {
        states: vec![
            ObjectState {
                name: "High".into(),
                lod_bias: 0,
            },
            ObjectState {
                name: "Low".into(),
                lod_bias: 2,
            },
            ObjectState {
                name: "Lowest".into(),
                lod_bias: 9,
            },
        ],
        ..object("Root", vec![component("Body", 0, lods)])
    };
    let compiled = compile(root, CodegenOptions::default());

    let lod_count = |state: &str| {
        let root = compiled.state(state).and_then(|state| state.root).unwrap();
        reachable(&compiled.pool, root)
            .into_iter()
            .find_map(|op| match op {
                Op::AddLod { lods } => Some(lods.len()),
                _ => None,
            })
            .unwrap()
    };
    assert_eq!(lod_count("High"), 3);
    assert_eq!(lod_count("Low"), 1);
    assert_eq!(lod_count("Lowest"), 1);

    for state in ["High", "Low", "Lowest"] {
        let address = compiled.state(state).and_then(|state| state.address).unwrap();
        assert_eq!(compiled.program.state(state).unwrap().root, address);
    }
}

#[test]
fn test_ignore_states_generates_default_only() {
    let root = NodeObjectNew {
        states: vec![ObjectState {
            name: "Low".into(),
            lod_bias: 1,
        }],
        ..object("Root", vec![component("Body", 0, vec![vec![new_surface(surface("Skin", 1, &[]))]])])
    };
    let options = CodegenOptions::from_toml_str("ignore_states = true").unwrap();
    let compiled = compile(root, options);

    assert_eq!(compiled.states.len(), 1);
    assert!(compiled.state("Default").is_some());
    assert!(compiled.state("Low").is_none());
}

#[test]
fn test_switch_without_variable_uses_placeholder() {
    let switch = Arc::new(NodeComponent::Switch {
        parameter: None,
        options: vec![
            Some(component("Short", 0, vec![vec![new_surface(surface("Short", 1, &[]))]])),
            Some(component("Long", 1, vec![vec![new_surface(surface("Long", 2, &[]))]])),
        ],
    });
    let compiled = compile(object("Root", vec![switch]), CodegenOptions::default());

    assert!(compiled.has_errors());
    assert_eq!(compiled.messages.len(), 1);
    assert_eq!(compiled.messages[0].kind, MessageKind::MissingConnection);

    let root = compiled.states[0].root.unwrap();
    let Op::InstanceSwitch { variable, cases, .. } = compiled.pool.get(root).unwrap() else {
        panic!("expected a switch at the root");
    };
    assert_eq!(cases.len(), 2);
    assert_eq!(compiled.pool.get(variable).unwrap(), Op::scalar(0.0));
}

#[test]
fn test_image_tiling_splits_large_images() {
    let mut skin = surface("Skin", 1, &[]);
    skin.images.push(SurfaceImage {
        name: "Albedo".into(),
        image: Some(Arc::new(NodeImage::Constant {
            resource: ResourceId(20),
            size: [1024, 512],
            format: ImageFormat::Rgba8,
        })),
        layout_channel: None,
        texture_size: [1024, 512],
        format: ImageFormat::Rgba8,
    });
    let root = || object("Root", vec![component("Body", 0, vec![vec![new_surface(skin.clone())]])]);

    let tiled = compile(root(), CodegenOptions::from_toml_str("image_tiling = 256").unwrap());
    assert_eq!(count(&tiled, "Default", OpType::ImageCrop), 8);
    assert_eq!(count(&tiled, "Default", OpType::ImagePatch), 8);

    let untouched = compile(root(), CodegenOptions::default());
    assert_eq!(count(&untouched, "Default", OpType::ImageCrop), 0);
}

fn body_modifier(name: &str, kind: ModifierKind) -> Arc<NodeModifier> {
    Arc::new(NodeModifier {
        required_tags: vec!["Body".into()],
        ..NodeModifier::new(name, kind)
    })
}

#[test]
fn test_modifiers_apply_in_fixed_order() {
    let mesh = |resource| Some(Arc::new(NodeMesh::new(ResourceId(resource))));
    let root = NodeObjectNew {
        // Declared in reverse of the order they must be applied in.
        modifiers: vec![
            body_modifier(
                "Fit",
                ModifierKind::TransformInMesh {
                    bounding: mesh(50),
                    transform: glam::Mat4::IDENTITY,
                },
            ),
            body_modifier("Clip", ModifierKind::ClipWithMesh { clip: mesh(51) }),
            body_modifier(
                "Morph",
                ModifierKind::Morph {
                    target: mesh(52),
                    factor: Some(Arc::new(kiln_codegen::NodeScalar::Constant(0.5))),
                },
            ),
            body_modifier("Remove", ModifierKind::MeshRemove { mask: mesh(53) }),
            body_modifier(
                "Extend",
                ModifierKind::MeshExtend {
                    mesh: mesh(54),
                    textures: Vec::new(),
                },
            ),
        ],
        ..object("Root", vec![component("Body", 0, vec![vec![new_surface(surface("Skin", 1, &["Body"]))]])])
    };
    let compiled = compile(root, CodegenOptions::default());
    assert!(compiled.messages.is_empty());

    let root = compiled.states[0].root.unwrap();
    let mut current = reachable(&compiled.pool, root)
        .into_iter()
        .find_map(|op| match op {
            Op::AddMesh { mesh, .. } => Some(mesh),
            _ => None,
        })
        .unwrap();

    let mut chain = Vec::new();
    loop {
        let op = compiled.pool.get(current).unwrap();
        chain.push(op.op_type());
        let next = match op {
            Op::MeshOptimizeSkinning { source }
            | Op::MeshTransformWithBoundingMesh { source, .. }
            | Op::MeshClipWithMesh { source, .. }
            | Op::MeshRemoveMask { source, .. } => Some(source),
            Op::MeshMorph { base, .. } => Some(base),
            Op::MeshMerge { base, .. } => base,
            _ => None,
        };
        match next {
            Some(next) => current = next,
            None => break,
        }
    }

    assert_eq!(
        chain,
        vec![
            OpType::MeshOptimizeSkinning,
            OpType::MeshTransformWithBoundingMesh,
            OpType::MeshClipWithMesh,
            OpType::MeshMorph,
            OpType::MeshRemoveMask,
            OpType::MeshMerge,
            OpType::MeshConstant,
        ]
    );
}

#[test]
fn test_modifier_scoped_to_other_component_is_skipped() {
    let root = NodeObjectNew {
        modifiers: vec![Arc::new(NodeModifier {
            required_component: Some(7),
            ..(*body_modifier("Clip", ModifierKind::ClipWithMesh {
                clip: Some(Arc::new(NodeMesh::new(ResourceId(51)))),
            }))
            .clone()
        })],
        ..object("Root", vec![component("Body", 0, vec![vec![new_surface(surface("Skin", 1, &["Body"]))]])])
    };
    let compiled = compile(root, CodegenOptions::default());
    assert_eq!(count(&compiled, "Default", OpType::MeshClipWithMesh), 0);
}

#[test]
fn test_duplicate_group_children_warn_once() {
    let child = |resource| {
        Arc::new(NodeObject::New(object(
            "Hat",
            vec![component("Hat", resource, vec![vec![new_surface(surface("Hat", resource, &[]))]])],
        )))
    };
    let root = NodeObjectNew {
        children: vec![Arc::new(NodeObject::Group(NodeObjectGroup {
            name: "Hats".into(),
            kind: GroupKind::ToggleEach,
            children: vec![child(1), child(2)],
        }))],
        states: vec![
            ObjectState {
                name: "High".into(),
                lod_bias: 0,
            },
            ObjectState {
                name: "Low".into(),
                lod_bias: 1,
            },
        ],
        ..object("Root", Vec::new())
    };
    let compiled = compile(root, CodegenOptions::default());

    let warnings = compiled
        .messages
        .iter()
        .filter(|message| message.severity == Severity::Warning)
        .collect::<Vec<_>>();
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].kind, MessageKind::DuplicateName);
    assert_eq!(warnings[0].context.as_deref(), Some("Hats"));

    let root = compiled.state("High").and_then(|state| state.root).unwrap();
    let Op::Conditional { condition, .. } = compiled.pool.get(root).unwrap() else {
        panic!("expected the toggled child at the root");
    };
    assert_eq!(
        compiled.pool.get(condition).unwrap(),
        Op::BoolParameter {
            name: "Hat".into(),
            default: false,
        }
    );
}

fn laid_out_mesh(resource: u32) -> Arc<NodeMesh> {
    Arc::new(
        NodeMesh::new(ResourceId(resource)).with_layout(
            Layout::new([2, 2], PackStrategy::Resizable)
                .with_block(LayoutBlock::new(1, [0, 0], [1, 1]))
                .with_block(LayoutBlock::new(2, [1, 0], [1, 2])),
        ),
    )
}

#[test]
fn test_shared_surface_reuses_first_lod_layout() {
    let lod = |resource| {
        vec![new_surface(NodeSurfaceNew {
            shared_surface_id: Some(7),
            mesh: Some(laid_out_mesh(resource)),
            ..surface("Skin", resource, &[])
        })]
    };
    let root = object("Root", vec![component("Body", 0, vec![lod(1), lod(2)])]);
    let compiled = compile(root, CodegenOptions::default());

    assert_eq!(count(&compiled, "Default", OpType::MeshApplyLayout), 2);
    assert_eq!(count(&compiled, "Default", OpType::LayoutPack), 1);
}

#[test]
fn test_surface_image_is_composed_per_block_with_edits() {
    let skin = NodeSurfaceNew {
        mesh: Some(laid_out_mesh(1)),
        images: vec![SurfaceImage {
            name: "Albedo".into(),
            image: Some(Arc::new(NodeImage::Constant {
                resource: ResourceId(30),
                size: [256, 256],
                format: ImageFormat::Rgba8,
            })),
            layout_channel: Some(0),
            texture_size: [256, 256],
            format: ImageFormat::Rgba8,
        }],
        ..surface("Skin", 1, &["Body"])
    };
    let root = NodeObjectNew {
        modifiers: vec![body_modifier(
            "Tattoo",
            ModifierKind::SurfaceEdit {
                textures: vec![SurfaceEditTexture {
                    name: "Albedo".into(),
                    patch: Some(Arc::new(NodeImage::Constant {
                        resource: ResourceId(31),
                        size: [64, 64],
                        format: ImageFormat::Rgba8,
                    })),
                    mask: None,
                    blend: kiln_ast::BlendType::Multiply,
                }],
            },
        )],
        ..object("Root", vec![component("Body", 0, vec![vec![new_surface(skin)]])])
    };
    let compiled = compile(root, CodegenOptions::default());

    assert_eq!(count(&compiled, "Default", OpType::ImageCompose), 2);
    assert_eq!(count(&compiled, "Default", OpType::ImageLayer), 2);
    let root = compiled.states[0].root.unwrap();
    let ops = reachable(&compiled.pool, root);
    let blank = ops
        .iter()
        .find_map(|op| match op {
            Op::ImageBlankLayout { block_size, .. } => Some(*block_size),
            _ => None,
        })
        .unwrap();
    assert_eq!(blank, [128, 128]);

    // The patch is cut to each block like the surface image itself.
    let crops = ops
        .iter()
        .filter_map(|op| match op {
            Op::ImageCrop { min, size, .. } => Some((*min, *size)),
            _ => None,
        })
        .collect::<BTreeSet<_>>();
    assert_eq!(
        crops,
        BTreeSet::from([
            ([0, 0], [128, 128]),
            ([128, 0], [128, 256]),
            ([0, 0], [32, 32]),
            ([32, 0], [32, 64]),
        ])
    );
}

fn albedo(resource: u32, size: [u16; 2]) -> SurfaceImage {
    SurfaceImage {
        name: "Albedo".into(),
        image: Some(Arc::new(NodeImage::Constant {
            resource: ResourceId(resource),
            size,
            format: ImageFormat::Rgba8,
        })),
        layout_channel: Some(0),
        texture_size: size,
        format: ImageFormat::Rgba8,
    }
}

fn composed_blocks(compiled: &CompiledObject) -> Vec<(u64, Op)> {
    let root = compiled.states[0].root.unwrap();
    let mut blocks = reachable(&compiled.pool, root)
        .into_iter()
        .filter_map(|op| match op {
            Op::ImageCompose {
                block_id, block_image, ..
            } => Some((block_id, compiled.pool.get(block_image).unwrap())),
            _ => None,
        })
        .collect::<Vec<_>>();
    blocks.sort_by_key(|(block_id, _)| *block_id);
    blocks
}

#[test]
fn test_each_layout_block_gets_its_own_crop() {
    let skin = NodeSurfaceNew {
        mesh: Some(laid_out_mesh(1)),
        images: vec![albedo(30, [512, 512])],
        ..surface("Skin", 1, &[])
    };
    let root = object("Root", vec![component("Body", 0, vec![vec![new_surface(skin)]])]);
    let compiled = compile(root, CodegenOptions::default());
    assert!(compiled.messages.is_empty());

    let blocks = composed_blocks(&compiled);
    assert_eq!(blocks.len(), 2);
    let Op::ImageCrop { min, size, .. } = blocks[0].1 else {
        panic!("block 1 is not cropped: {:?}", blocks[0].1);
    };
    assert_eq!((blocks[0].0, min, size), (1, [0, 0], [256, 256]));
    let Op::ImageCrop { min, size, .. } = blocks[1].1 else {
        panic!("block 2 is not cropped: {:?}", blocks[1].1);
    };
    assert_eq!((blocks[1].0, min, size), (2, [256, 0], [256, 512]));
}

#[test]
fn test_block_covering_whole_source_is_not_cropped() {
    let mesh = Arc::new(NodeMesh::new(ResourceId(1)).with_layout(
        Layout::new([1, 1], PackStrategy::Resizable).with_block(LayoutBlock::new(3, [0, 0], [1, 1])),
    ));
    let skin = NodeSurfaceNew {
        mesh: Some(mesh),
        images: vec![albedo(30, [128, 128])],
        ..surface("Skin", 1, &[])
    };
    let root = object("Root", vec![component("Body", 0, vec![vec![new_surface(skin)]])]);
    let compiled = compile(root, CodegenOptions::default());

    let blocks = composed_blocks(&compiled);
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].1, Op::ImageConstant { resource: ResourceId(30) });
}

#[test]
fn test_mesh_extension_composes_its_texture() {
    let sleeve_mesh = Arc::new(NodeMesh::new(ResourceId(60)).with_layout(
        Layout::new([2, 2], PackStrategy::Resizable).with_block(LayoutBlock::new(10, [0, 0], [2, 2])),
    ));
    let skin = NodeSurfaceNew {
        mesh: Some(laid_out_mesh(1)),
        images: vec![albedo(30, [256, 256])],
        ..surface("Skin", 1, &["Body"])
    };
    let root = NodeObjectNew {
        modifiers: vec![
            body_modifier(
                "Sleeve",
                ModifierKind::MeshExtend {
                    mesh: Some(sleeve_mesh),
                    textures: vec![ExtendTexture {
                        name: "Albedo".into(),
                        image: Arc::new(NodeImage::Constant {
                            resource: ResourceId(61),
                            size: [64, 64],
                            format: ImageFormat::Rgba8,
                        }),
                    }],
                },
            ),
            body_modifier(
                "Cuff",
                ModifierKind::MeshExtend {
                    mesh: Some(Arc::new(NodeMesh::new(ResourceId(62)))),
                    textures: Vec::new(),
                },
            ),
        ],
        ..object("Root", vec![component("Body", 0, vec![vec![new_surface(skin)]])])
    };
    let compiled = compile(root, CodegenOptions::default());

    let blocks = composed_blocks(&compiled);
    assert_eq!(blocks.iter().map(|(block_id, _)| *block_id).collect::<Vec<_>>(), vec![1, 2, 10]);
    assert_eq!(blocks[2].1, Op::ImageConstant { resource: ResourceId(61) });

    assert_eq!(compiled.messages.len(), 1);
    assert_eq!(compiled.messages[0].severity, Severity::Info);
    assert_eq!(compiled.messages[0].context.as_deref(), Some("Cuff"));
}

#[test]
fn test_before_operation_modifiers_leave_surfaces_alone() {
    let root = NodeObjectNew {
        modifiers: vec![Arc::new(NodeModifier {
            apply_before_normal_operations: true,
            ..(*body_modifier("Clip", ModifierKind::ClipWithMesh {
                clip: Some(Arc::new(NodeMesh::new(ResourceId(51)))),
            }))
            .clone()
        })],
        ..object("Root", vec![component("Body", 0, vec![vec![new_surface(surface("Skin", 1, &["Body"]))]])])
    };
    let compiled = compile(root, CodegenOptions::default());
    assert_eq!(count(&compiled, "Default", OpType::MeshClipWithMesh), 0);
}

#[test]
fn test_compile_with_wait_callback() {
    let compiled = Compiler::new(CodegenOptions {
        num_threads: 1,
        ..CodegenOptions::default()
    })
    .with_wait_callback(|| std::thread::yield_now())
    .compile(&Arc::new(NodeObject::New(tag_scenario(true))))
    .unwrap();

    assert_eq!(surface_names(&compiled, "Default").len(), 3);
}
