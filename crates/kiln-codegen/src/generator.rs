//! Main pass: turns the content graph into one op graph per object state.

use std::{collections::BTreeSet, sync::Arc};

use dashmap::{DashMap, mapref::entry::Entry};
use kiln_ast::{Bits, DataType, ImageFormat, Layout, LayoutBlock, Op, OpPool, OpRef, PoolError, RemoveEntry};
use smallvec::SmallVec;
use smol_str::SmolStr;

use crate::{
    error::{CodegenError, ErrorLog, MessageKind, Severity},
    first_pass::{FirstPass, SurfaceData},
    lower::Lowering,
    node::{
        ModifierKind, NodeComponent, NodeComponentNew, NodeMesh, NodeModifier, NodeObject, ObjectState, SurfaceImage, node_id,
    },
    options::CodegenOptions,
    second_pass,
    task::{Prerequisite, Scheduler, Task},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Uninitialized,
    FirstPass,
    SecondPass,
    MainPass,
    Done,
}

/// Root op of one object state; `None` if the state produced nothing.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedState {
    pub state: ObjectState,
    pub root: Option<OpRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct SurfaceResult {
    /// Instance data of the surface (images, scalars and vectors).
    surface: Option<OpRef>,
    mesh: Option<OpRef>,
}

type SurfaceTask = Task<Result<SurfaceResult, PoolError>>;
type LodTask = Task<Result<Option<OpRef>, PoolError>>;

/// Layouts of the mesh an extend modifier added.
#[derive(Debug, Clone)]
struct Extension {
    modifier: usize,
    layouts: Vec<Option<Arc<Layout>>>,
}

/// Mesh of a surface with its final per-channel layouts.
#[derive(Debug, Clone)]
struct SurfaceMesh {
    mesh: OpRef,
    layouts: Vec<Option<OpRef>>,
    reference_layouts: Vec<Option<Arc<Layout>>>,
    /// Channels whose layout only exists because an extension brought it.
    from_extension: Vec<bool>,
    extensions: Vec<Extension>,
}

struct ModifiedMesh {
    mesh: OpRef,
    layouts: Vec<Option<Arc<Layout>>>,
    fragments: Vec<Extension>,
}

struct Waiter<'a> {
    pump: Option<&'a mut dyn FnMut()>,
}

impl Waiter<'_> {
    fn wait<T: Clone>(&mut self, task: &Task<T>) -> T {
        match self.pump.as_deref_mut() {
            Some(pump) => task.wait_with(pump),
            None => task.wait(),
        }
    }
}

/// State shared by every generation task of one root.
struct Generation {
    lowering: Lowering,
    first: FirstPass,
    options: CodegenOptions,
    scheduler: Scheduler,
    objects: DashMap<(usize, usize, Option<OpRef>), Option<OpRef>>,
    components: DashMap<(usize, usize, Option<OpRef>), Option<OpRef>>,
    surfaces: DashMap<(usize, u32, usize), SurfaceTask>,
    shared_layouts: DashMap<u32, Vec<Option<OpRef>>>,
}

pub struct CodeGenerator {
    options: CodegenOptions,
    pool: Arc<OpPool>,
    log: Arc<ErrorLog>,
    scheduler: Scheduler,
    wait_callback: Option<Box<dyn FnMut()>>,
    stage: Stage,
    states: Vec<GeneratedState>,
}

impl std::fmt::Debug for CodeGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeGenerator")
            .field("options", &self.options)
            .field("stage", &self.stage)
            .field("states", &self.states)
            .finish_non_exhaustive()
    }
}

impl CodeGenerator {
    pub fn new(options: CodegenOptions) -> Result<Self, CodegenError> {
        options.validate()?;
        let scheduler = Scheduler::new(options.num_threads)?;
        Ok(Self {
            options,
            pool: Arc::new(OpPool::new()),
            log: Arc::new(ErrorLog::new()),
            scheduler,
            wait_callback: None,
            stage: Stage::Uninitialized,
            states: Vec::new(),
        })
    }

    /// Called repeatedly while waiting for generation tasks, so a single
    /// threaded host can keep pumping its own events.
    pub fn with_wait_callback(mut self, callback: impl FnMut() + 'static) -> Self {
        self.wait_callback = Some(Box::new(callback));
        self
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn pool(&self) -> &Arc<OpPool> {
        &self.pool
    }

    pub fn log(&self) -> &ErrorLog {
        &self.log
    }

    pub fn states(&self) -> &[GeneratedState] {
        &self.states
    }

    fn set_stage(&mut self, stage: Stage) {
        tracing::debug!(from = ?self.stage, to = ?stage, "Code generator stage");
        self.stage = stage;
    }

    /// Runs every pass over `root`. States are generated once; later calls
    /// keep the existing result.
    pub fn generate_root(&mut self, root: &Arc<NodeObject>) -> Result<&[GeneratedState], CodegenError> {
        if self.stage != Stage::Uninitialized {
            return Ok(&self.states);
        }

        self.set_stage(Stage::FirstPass);
        let lowering = Lowering::new(Arc::clone(&self.pool), Arc::clone(&self.log));
        let mut first = FirstPass::generate(&lowering, root, self.options.ignore_states)?;

        self.set_stage(Stage::SecondPass);
        second_pass::solve(&mut first, &lowering)?;

        self.set_stage(Stage::MainPass);
        let generation = Arc::new(Generation {
            lowering,
            first,
            options: self.options.clone(),
            scheduler: self.scheduler.clone(),
            objects: DashMap::new(),
            components: DashMap::new(),
            surfaces: DashMap::new(),
            shared_layouts: DashMap::new(),
        });

        let mut waiter = Waiter {
            pump: self
                .wait_callback
                .as_mut()
                .map(|callback| &mut **callback as &mut dyn FnMut()),
        };
        for (index, state) in generation.first.states.iter().enumerate() {
            let state_root = generation.generate_object(root, index, None, &mut waiter)?;
            tracing::debug!(state = %state.name, root = ?state_root, "Generated state");
            self.states.push(GeneratedState {
                state: state.clone(),
                root: state_root,
            });
        }

        self.set_stage(Stage::Done);
        Ok(&self.states)
    }
}

impl Generation {
    fn pool(&self) -> &OpPool {
        &self.lowering.pool
    }

    fn intern(&self, op: Op) -> Result<OpRef, PoolError> {
        self.lowering.intern(op)
    }

    fn conditional(
        &self,
        data_type: DataType,
        condition: Option<OpRef>,
        yes: OpRef,
        no: Option<OpRef>,
    ) -> Result<OpRef, PoolError> {
        match condition {
            None => Ok(yes),
            Some(condition) => self.intern(Op::Conditional {
                data_type,
                condition,
                yes: Some(yes),
                no,
            }),
        }
    }

    fn generate_object(
        self: &Arc<Self>,
        node: &Arc<NodeObject>,
        state: usize,
        base: Option<OpRef>,
        waiter: &mut Waiter<'_>,
    ) -> Result<Option<OpRef>, PoolError> {
        let key = (node_id(node), state, base);
        if let Some(op) = self.objects.get(&key) {
            return Ok(*op);
        }

        let mut current = base;
        match node.as_ref() {
            NodeObject::New(object) => {
                for component in &object.components {
                    current = self.generate_component(component, state, current, waiter)?;
                }
                for child in &object.children {
                    current = self.generate_object(child, state, current, waiter)?;
                }
            }
            NodeObject::Group(group) => {
                for child in &group.children {
                    current = self.generate_object(child, state, current, waiter)?;
                }
            }
        }

        Ok(*self.objects.entry(key).or_insert(current))
    }

    fn generate_component(
        self: &Arc<Self>,
        node: &Arc<NodeComponent>,
        state: usize,
        base: Option<OpRef>,
        waiter: &mut Waiter<'_>,
    ) -> Result<Option<OpRef>, PoolError> {
        let key = (node_id(node), state, base);
        if let Some(op) = self.components.get(&key) {
            tracing::trace!("Component cache hit");
            return Ok(*op);
        }

        let op = match node.as_ref() {
            NodeComponent::New(component) => self.generate_component_new(component, state, base, waiter)?,
            NodeComponent::Switch { parameter, options } => {
                if options.is_empty() {
                    base
                } else {
                    let variable = match parameter {
                        Some(parameter) => self.lowering.scalar(parameter)?,
                        None => self.lowering.missing_scalar("Switch variable", 0.0, None)?,
                    };
                    let mut cases = SmallVec::new();
                    for (index, option) in options.iter().enumerate() {
                        let branch = match option {
                            Some(option) => self.generate_component(option, state, base, waiter)?,
                            None => base,
                        };
                        if let Some(branch) = branch {
                            cases.push((index as i32, branch));
                        }
                    }
                    Some(self.intern(Op::InstanceSwitch {
                        variable,
                        default: base,
                        cases,
                    })?)
                }
            }
            NodeComponent::Variation { default, variations } => {
                let mut current = match default {
                    Some(default) => self.generate_component(default, state, base, waiter)?,
                    None => base,
                };
                // Built bottom-up, so the last variation is checked first.
                for variation in variations.iter().rev() {
                    let Some(tag) = self.first.tag_index(&variation.tag) else {
                        self.lowering.log.add(
                            Severity::Warning,
                            MessageKind::UnknownTag,
                            format!("Unknown tag found in component variation [{}].", variation.tag),
                            None,
                        );
                        continue;
                    };
                    let yes = match &variation.component {
                        Some(component) => self.generate_component(component, state, base, waiter)?,
                        None => base,
                    };
                    let condition = match self.first.tags[tag].generic_condition {
                        Some(condition) => condition,
                        None => self.pool().bool_constant(false)?,
                    };
                    current = Some(self.intern(Op::Conditional {
                        data_type: DataType::Instance,
                        condition,
                        yes,
                        no: current,
                    })?);
                }
                current
            }
        };

        Ok(*self.components.entry(key).or_insert(op))
    }

    fn generate_component_new(
        self: &Arc<Self>,
        node: &Arc<NodeComponentNew>,
        state: usize,
        base: Option<OpRef>,
        waiter: &mut Waiter<'_>,
    ) -> Result<Option<OpRef>, PoolError> {
        let lod_bias = self.first.states[state].lod_bias as usize;
        let first_lod = lod_bias.min(node.lods.len().saturating_sub(1));

        let mut lod_tasks: Vec<LodTask> = Vec::with_capacity(node.lods.len());
        for lod in first_lod..node.lods.len() {
            let task = self.generate_lod(node.id, lod, lod_tasks.last());
            lod_tasks.push(task);
        }

        let prerequisites = lod_tasks
            .iter()
            .map(|task| task as &dyn Prerequisite)
            .collect::<Vec<_>>();
        let task: LodTask = {
            let this = Arc::clone(self);
            let node = Arc::clone(node);
            let lod_tasks = lod_tasks.clone();
            self.scheduler.launch("component", &prerequisites, move || {
                let lods = lod_tasks
                    .iter()
                    .map(Task::wait)
                    .collect::<Result<SmallVec<[Option<OpRef>; 4]>, _>>()?;

                let mut instance = this.intern(Op::AddLod { lods })?;
                if let Some(material) = node.overlay_material {
                    instance = this.intern(Op::AddOverlayMaterial {
                        instance: Some(instance),
                        material,
                    })?;
                }

                let component = this.intern(Op::AddComponent {
                    instance: base,
                    component: instance,
                    id: node.id,
                })?;
                let condition = this
                    .first
                    .component(&node)
                    .and_then(|component| component.activation.final_condition);
                this.conditional(DataType::Instance, condition, component, base)
                    .map(Some)
            })
        };

        waiter.wait(&task)
    }

    /// Launches the assembly of one LOD after its surfaces and the previous LOD.
    fn generate_lod(self: &Arc<Self>, component_id: u32, lod: usize, previous: Option<&LodTask>) -> LodTask {
        let indices = self
            .first
            .surfaces
            .iter()
            .enumerate()
            .filter(|(_, surface)| surface.component_id == component_id && surface.lod == lod)
            .map(|(index, _)| index)
            .collect::<Vec<_>>();
        let surface_tasks = indices
            .iter()
            .map(|index| self.generate_surface(*index, previous))
            .collect::<Vec<_>>();

        let mut prerequisites = surface_tasks
            .iter()
            .map(|task| task as &dyn Prerequisite)
            .collect::<Vec<_>>();
        if let Some(previous) = previous {
            prerequisites.push(previous);
        }

        let this = Arc::clone(self);
        let tasks = surface_tasks.clone();
        self.scheduler.launch("lod", &prerequisites, move || {
            let mut instance: Option<OpRef> = None;
            let mut mesh: Option<OpRef> = None;

            // Surface ids start at 1; 0 is reserved by mesh merging.
            for (surface_id, (index, task)) in (1u32..).zip(indices.iter().zip(&tasks)) {
                let result = task.wait()?;
                let data = &this.first.surfaces[*index];
                let condition = data.activation.final_condition;

                let added = this.intern(Op::AddSurface {
                    instance,
                    surface: result.surface,
                    id: surface_id,
                    name: data.node.name.clone(),
                })?;
                instance = Some(this.conditional(DataType::Instance, condition, added, instance)?);

                if let Some(surface_mesh) = result.mesh {
                    let merged = this.intern(Op::MeshMerge {
                        base: mesh,
                        added: surface_mesh,
                        new_surface_id: surface_id,
                    })?;
                    mesh = Some(this.conditional(DataType::Mesh, condition, merged, mesh)?);
                }
            }

            if let Some(mesh) = mesh {
                let optimized = this.intern(Op::MeshOptimizeSkinning { source: mesh })?;
                instance = Some(this.intern(Op::AddMesh {
                    instance,
                    mesh: optimized,
                })?);
            }
            Ok(instance)
        })
    }

    /// Returns the task generating surface `index`, launching it on first request.
    fn generate_surface(self: &Arc<Self>, index: usize, previous: Option<&LodTask>) -> SurfaceTask {
        let data = &self.first.surfaces[index];
        let key = (node_id(&data.node), data.component_id, data.lod);

        match self.surfaces.entry(key) {
            Entry::Occupied(entry) => {
                tracing::debug!(surface = %data.node.name, "Surface cache hit");
                entry.get().clone()
            }
            Entry::Vacant(entry) => {
                let prerequisites = previous
                    .map(|previous| previous as &dyn Prerequisite)
                    .into_iter()
                    .collect::<Vec<_>>();
                let this = Arc::clone(self);
                let task = self
                    .scheduler
                    .launch("surface", &prerequisites, move || this.surface(index));
                entry.insert(task.clone());
                task
            }
        }
    }

    fn surface(&self, index: usize) -> Result<SurfaceResult, PoolError> {
        let data = &self.first.surfaces[index];
        let node = &data.node;
        let modifiers = self.modifiers_for(data.component_id, &node.tags);

        let mesh = match &node.mesh {
            Some(mesh) => Some(self.surface_mesh(data, mesh, &modifiers)?),
            None => {
                self.lowering.log.add(
                    Severity::Warning,
                    MessageKind::MissingConnection,
                    "Surface has no mesh",
                    Some(&node.name),
                );
                None
            }
        };

        let mut instance = None;
        for image in &node.images {
            let image_op = self.surface_image(data, image, mesh.as_ref(), &modifiers)?;
            instance = Some(self.intern(Op::AddImage {
                instance,
                image: image_op,
                name: image.name.clone(),
            })?);
        }
        for (name, scalar) in &node.scalars {
            let value = self.lowering.scalar(scalar)?;
            instance = Some(self.intern(Op::AddScalar {
                instance,
                value,
                name: name.clone(),
            })?);
        }
        for (name, color) in &node.colors {
            let value = self.lowering.color(color)?;
            instance = Some(self.intern(Op::AddVector {
                instance,
                value,
                name: name.clone(),
            })?);
        }

        Ok(SurfaceResult {
            surface: instance,
            mesh: mesh.map(|mesh| mesh.mesh),
        })
    }

    /// Modifiers targeting a surface of `component_id` carrying `tags`, in
    /// declaration order and without duplicates. Modifiers flagged to run
    /// before normal operations are left out.
    fn modifiers_for(&self, component_id: u32, tags: &[SmolStr]) -> Vec<usize> {
        if tags.is_empty() {
            return Vec::new();
        }

        let mut selected: Vec<usize> = Vec::new();
        for (index, modifier) in self.first.modifiers.iter().enumerate() {
            let node = &modifier.node;
            if node.apply_before_normal_operations {
                continue;
            }
            if node.required_component.is_some_and(|required| required != component_id) {
                continue;
            }
            if selected
                .iter()
                .any(|other| Arc::ptr_eq(&self.first.modifiers[*other].node, node))
            {
                continue;
            }
            if node.applies_to(tags) {
                selected.push(index);
            }
        }
        selected
    }

    fn mesh_constant(&self, node: &Arc<NodeMesh>) -> Result<OpRef, PoolError> {
        self.intern(Op::MeshConstant {
            resource: node.resource,
        })
    }

    fn required_mesh(&self, node: &Option<Arc<NodeMesh>>, what: &str, context: &str) -> Result<Option<OpRef>, PoolError> {
        match node {
            Some(node) => self.mesh_constant(node).map(Some),
            None => {
                self.lowering.log.add(
                    Severity::Error,
                    MessageKind::MissingConnection,
                    format!("Required connection not found: {what}"),
                    Some(context),
                );
                Ok(None)
            }
        }
    }

    /// Applies `apply` to every modifier in `active`, each result guarded by
    /// the modifier's condition.
    fn apply_each(
        &self,
        active: &[usize],
        mut current: OpRef,
        mut apply: impl FnMut(usize, &NodeModifier, OpRef) -> Result<Option<OpRef>, PoolError>,
    ) -> Result<OpRef, PoolError> {
        for index in active {
            let modifier = &self.first.modifiers[*index];
            if let Some(modified) = apply(*index, &modifier.node, current)? {
                current = self.conditional(
                    DataType::Mesh,
                    modifier.activation.final_condition,
                    modified,
                    Some(current),
                )?;
            }
        }
        Ok(current)
    }

    /// Applies the modifiers in their fixed order: extend, remove, morph,
    /// clip with mesh, clip with UV mask, clip morph plane, clip deform and
    /// transform in mesh.
    fn mesh_with_modifiers(
        &self,
        node: &Arc<NodeMesh>,
        component_id: u32,
        modifiers: &[usize],
        ignore: &BTreeSet<usize>,
    ) -> Result<ModifiedMesh, PoolError> {
        let base = self.mesh_constant(node)?;
        let active = modifiers
            .iter()
            .copied()
            .filter(|index| !ignore.contains(index))
            .collect::<Vec<_>>();
        let mut fragments = Vec::new();

        let mut current = self.apply_each(&active, base, |index, modifier, current| {
            let ModifierKind::MeshExtend { mesh, .. } = &modifier.kind else {
                return Ok(None);
            };
            let Some(fragment) = mesh else {
                self.required_mesh(mesh, "mesh extend fragment", &modifier.name)?;
                return Ok(None);
            };

            let mut fragment_ignore = ignore.clone();
            fragment_ignore.insert(index);
            let fragment_modifiers = self.modifiers_for(component_id, &modifier.enable_tags);
            let added = self.mesh_with_modifiers(fragment, component_id, &fragment_modifiers, &fragment_ignore)?;
            fragments.push(Extension {
                modifier: index,
                layouts: added.layouts,
            });
            self.intern(Op::MeshMerge {
                base: Some(current),
                added: added.mesh,
                new_surface_id: 0,
            })
            .map(Some)
        })?;

        let mut removes: SmallVec<[RemoveEntry; 2]> = SmallVec::new();
        for index in &active {
            let modifier = &self.first.modifiers[*index];
            if let ModifierKind::MeshRemove { mask } = &modifier.node.kind {
                if let Some(mask) = self.required_mesh(mask, "mesh remove mask", &modifier.node.name)? {
                    removes.push(RemoveEntry {
                        condition: modifier.activation.final_condition,
                        mask,
                    });
                }
            }
        }
        if !removes.is_empty() {
            current = self.intern(Op::MeshRemoveMask {
                source: current,
                removes,
            })?;
        }

        current = self.apply_each(&active, current, |_, modifier, current| {
            let ModifierKind::Morph { target, factor } = &modifier.kind else {
                return Ok(None);
            };
            let Some(target) = self.required_mesh(target, "morph target", &modifier.name)? else {
                return Ok(None);
            };
            let difference = self.intern(Op::MeshDifference { base, target })?;
            let factor = match factor {
                Some(factor) => self.lowering.scalar(factor)?,
                None => self.lowering.missing_scalar("morph factor", 1.0, Some(&modifier.name))?,
            };
            self.intern(Op::MeshMorph {
                base: current,
                target: difference,
                factor,
            })
            .map(Some)
        })?;

        current = self.apply_each(&active, current, |_, modifier, current| {
            let ModifierKind::ClipWithMesh { clip } = &modifier.kind else {
                return Ok(None);
            };
            let Some(clip) = self.required_mesh(clip, "clip mesh", &modifier.name)? else {
                return Ok(None);
            };
            self.intern(Op::MeshClipWithMesh { source: current, clip }).map(Some)
        })?;

        current = self.apply_each(&active, current, |_, modifier, current| {
            let ModifierKind::ClipWithUvMask { mask, layout_channel } = &modifier.kind else {
                return Ok(None);
            };
            let mask = match mask {
                Some(mask) => self.lowering.image(mask)?,
                None => self.lowering.missing_image("clip UV mask", Some(&modifier.name))?,
            };
            self.intern(Op::MeshClipWithUvMask {
                source: current,
                mask,
                layout_channel: *layout_channel,
            })
            .map(Some)
        })?;

        current = self.apply_each(&active, current, |_, modifier, current| {
            let ModifierKind::ClipMorphPlane { plane } = &modifier.kind else {
                return Ok(None);
            };
            self.intern(Op::MeshClipMorphPlane {
                source: current,
                plane: *plane,
            })
            .map(Some)
        })?;

        current = self.apply_each(&active, current, |_, modifier, current| {
            let ModifierKind::ClipDeform { shape, face_cull } = &modifier.kind else {
                return Ok(None);
            };
            let Some(clip_shape) = self.required_mesh(shape, "clip deform shape", &modifier.name)? else {
                return Ok(None);
            };
            self.intern(Op::MeshClipDeform {
                mesh: current,
                clip_shape,
                face_cull: *face_cull,
            })
            .map(Some)
        })?;

        current = self.apply_each(&active, current, |_, modifier, current| {
            let ModifierKind::TransformInMesh { bounding, transform } = &modifier.kind else {
                return Ok(None);
            };
            let Some(bounding) = self.required_mesh(bounding, "bounding mesh", &modifier.name)? else {
                return Ok(None);
            };
            self.intern(Op::MeshTransformWithBoundingMesh {
                source: current,
                bounding,
                matrix: Bits(*transform),
            })
            .map(Some)
        })?;

        Ok(ModifiedMesh {
            mesh: current,
            layouts: node.layouts.clone(),
            fragments,
        })
    }

    /// Generates the surface mesh and assembles its layouts: base blocks plus
    /// blocks of every extend fragment, cleaned against the final mesh and
    /// packed, unless an earlier LOD of the same shared surface already did.
    fn surface_mesh(&self, data: &SurfaceData, node: &Arc<NodeMesh>, modifiers: &[usize]) -> Result<SurfaceMesh, PoolError> {
        let modified = self.mesh_with_modifiers(node, data.component_id, modifiers, &BTreeSet::new())?;
        let channels = modified
            .fragments
            .iter()
            .map(|fragment| fragment.layouts.len())
            .chain([modified.layouts.len()])
            .max()
            .unwrap_or(0);

        let shared_id = data.node.shared_surface_id;
        let shared = shared_id.and_then(|id| self.shared_layouts.get(&id).map(|layouts| layouts.clone()));

        let mut mesh = modified.mesh;
        let mut layouts = vec![None; channels];
        let mut reference_layouts = vec![None; channels];
        let mut from_extension = vec![false; channels];
        for channel in 0..channels {
            let mut reference: Option<Arc<Layout>> = modified.layouts.get(channel).cloned().flatten();
            let mut layout = match &reference {
                Some(base) => Some(self.intern(Op::LayoutConstant(Arc::clone(base)))?),
                None => None,
            };

            for fragment in &modified.fragments {
                let Some(Some(fragment_layout)) = fragment.layouts.get(channel) else {
                    continue;
                };
                let fragment_layout = match &reference {
                    Some(base) if base.strategy != fragment_layout.strategy => {
                        self.lowering.log.add(
                            Severity::Info,
                            MessageKind::LayoutStrategyMismatch,
                            format!(
                                "Extended mesh layout strategy {:?} differs from the base strategy {:?}; using the base one.",
                                fragment_layout.strategy, base.strategy
                            ),
                            Some(&data.node.name),
                        );
                        Arc::new(Layout {
                            strategy: base.strategy,
                            ..fragment_layout.as_ref().clone()
                        })
                    }
                    Some(_) => Arc::clone(fragment_layout),
                    None => {
                        reference = Some(Arc::clone(fragment_layout));
                        Arc::clone(fragment_layout)
                    }
                };
                let added = self.intern(Op::LayoutConstant(fragment_layout))?;
                layout = Some(self.lowering.simplified(Op::LayoutMerge { base: layout, added })?);
            }

            let Some(layout) = layout else {
                continue;
            };
            let packed = match shared.as_ref().and_then(|shared| shared.get(channel).copied().flatten()) {
                Some(shared_layout) => shared_layout,
                None => {
                    let cleaned = self.intern(Op::LayoutRemoveBlocks { source: layout, mesh })?;
                    self.intern(Op::LayoutPack { source: cleaned })?
                }
            };
            mesh = self.intern(Op::MeshApplyLayout {
                mesh,
                layout: packed,
                channel: channel as u16,
            })?;
            layouts[channel] = Some(packed);
            reference_layouts[channel] = reference;
            from_extension[channel] = modified.layouts.get(channel).is_none_or(Option::is_none);
        }

        if let Some(id) = shared_id {
            self.shared_layouts.entry(id).or_insert_with(|| layouts.clone());
        }

        Ok(SurfaceMesh {
            mesh,
            layouts,
            reference_layouts,
            from_extension,
            extensions: modified.fragments,
        })
    }

    fn surface_image(
        &self,
        data: &SurfaceData,
        image: &SurfaceImage,
        mesh: Option<&SurfaceMesh>,
        modifiers: &[usize],
    ) -> Result<OpRef, PoolError> {
        let source = match &image.image {
            Some(node) => self.lowering.image(node)?,
            None => self
                .lowering
                .missing_image(&format!("surface image {}", image.name), Some(&data.node.name))?,
        };
        let source_size = image.image.as_ref().and_then(|node| node.size_hint());
        let texture = [u32::from(image.texture_size[0]), u32::from(image.texture_size[1])];

        let (Some(channel), Some(mesh)) = (image.layout_channel, mesh) else {
            let size = source_size.map(|size| [u32::from(size[0]), u32::from(size[1])]);
            let tiled = self.apply_tiling(source, size, image.format)?;
            return self.apply_image_edits(tiled, &image.name, modifiers, None);
        };

        let index = channel as usize;
        let layout = match mesh.layouts.get(index).copied().flatten() {
            Some(layout) => layout,
            None => self.intern(Op::LayoutFromMesh { mesh: mesh.mesh, channel })?,
        };
        let reference = mesh.reference_layouts.get(index).cloned().flatten();

        let block_size = match &reference {
            Some(reference) => [
                image.texture_size[0] / reference.grid_size[0].max(1),
                image.texture_size[1] / reference.grid_size[1].max(1),
            ],
            None => image.texture_size,
        };
        let mut current = self.intern(Op::ImageBlankLayout {
            layout,
            block_size,
            format: image.format,
            mipmaps: 1,
        })?;

        let from_extension = mesh.from_extension.get(index).copied().unwrap_or(false);
        match &reference {
            _ if from_extension => {}
            Some(reference) if !reference.blocks.is_empty() => {
                for block in &reference.blocks {
                    let (cropped, size) = self.crop_to_block(source, source_size, reference, block, &data.node.name)?;
                    let size = size.or_else(|| reference.block_pixel_size(block, texture));
                    let block_image = self.apply_tiling(cropped, size, image.format)?;
                    let block_image =
                        self.apply_image_edits(block_image, &image.name, modifiers, Some((&**reference, block)))?;
                    current = self.intern(Op::ImageCompose {
                        layout,
                        base: current,
                        block_image,
                        mask: None,
                        block_id: block.id,
                    })?;
                }
            }
            _ => {
                let block_image = self.apply_tiling(source, Some(texture), image.format)?;
                let block_image = self.apply_image_edits(block_image, &image.name, modifiers, None)?;
                current = self.intern(Op::ImageCompose {
                    layout,
                    base: current,
                    block_image,
                    mask: None,
                    block_id: 0,
                })?;
            }
        }

        self.apply_image_extends(current, layout, image, mesh, index, modifiers)
    }

    /// Crops `source` to the pixel rect of `block`, with the layout grid
    /// stretched over the source size. Returns the size of the result when
    /// it is known.
    fn crop_to_block(
        &self,
        source: OpRef,
        source_size: Option<[u16; 2]>,
        layout: &Layout,
        block: &LayoutBlock,
        context: &str,
    ) -> Result<(OpRef, Option<[u32; 2]>), PoolError> {
        let Some(size) = source_size.filter(|size| !size.contains(&0)) else {
            return Ok((source, None));
        };
        let size = [u32::from(size[0]), u32::from(size[1])];
        let grid = [
            u32::from(layout.grid_size[0].max(1)),
            u32::from(layout.grid_size[1].max(1)),
        ];
        let min = [
            u32::from(block.min[0]) * size[0] / grid[0],
            u32::from(block.min[1]) * size[1] / grid[1],
        ];
        let rect = [
            u32::from(block.size[0]) * size[0] / grid[0],
            u32::from(block.size[1]) * size[1] / grid[1],
        ];
        if min == [0, 0] && rect == size {
            return Ok((source, Some(size)));
        }

        // Rects past the source address repeated tiles of it.
        let tile_min = [min[0] / size[0], min[1] / size[1]];
        let tile_max = [
            (min[0] + rect[0]).saturating_sub(1) / size[0],
            (min[1] + rect[1]).saturating_sub(1) / size[1],
        ];
        if tile_min != tile_max {
            self.lowering.log.add(
                Severity::Error,
                MessageKind::UnsupportedBlock,
                format!("Layout block {} spans several texture tiles.", block.id),
                Some(context),
            );
            return Ok((source, Some(size)));
        }

        let cropped = self.intern(Op::ImageCrop {
            source,
            min: [
                to_u16(min[0] - tile_min[0] * size[0]),
                to_u16(min[1] - tile_min[1] * size[1]),
            ],
            size: [to_u16(rect[0]), to_u16(rect[1])],
        })?;
        Ok((cropped, Some(rect)))
    }

    /// Layers the patches of active surface edit modifiers over the image
    /// `name`, cropped to `block` when the image is generated per block.
    fn apply_image_edits(
        &self,
        mut current: OpRef,
        name: &str,
        modifiers: &[usize],
        block: Option<(&Layout, &LayoutBlock)>,
    ) -> Result<OpRef, PoolError> {
        for index in modifiers {
            let modifier = &self.first.modifiers[*index];
            let ModifierKind::SurfaceEdit { textures } = &modifier.node.kind else {
                continue;
            };
            for texture in textures.iter().filter(|texture| texture.name == name) {
                let mut blended = match &texture.patch {
                    Some(patch) => self.lowering.image(patch)?,
                    None => self
                        .lowering
                        .missing_image("surface edit patch", Some(&modifier.node.name))?,
                };
                let mut mask = texture
                    .mask
                    .as_ref()
                    .map(|mask| self.lowering.image(mask))
                    .transpose()?;
                if let Some((layout, block)) = block {
                    let patch_size = texture.patch.as_ref().and_then(|patch| patch.size_hint());
                    blended = self.crop_to_block(blended, patch_size, layout, block, &modifier.node.name)?.0;
                    if let Some(mask_op) = mask {
                        let mask_size = texture.mask.as_ref().and_then(|mask| mask.size_hint());
                        mask = Some(self.crop_to_block(mask_op, mask_size, layout, block, &modifier.node.name)?.0);
                    }
                }
                let layered = self.intern(Op::ImageLayer {
                    base: current,
                    blended,
                    mask,
                    blend: texture.blend,
                })?;
                current = self.conditional(
                    DataType::Image,
                    modifier.activation.final_condition,
                    layered,
                    Some(current),
                )?;
            }
        }
        Ok(current)
    }

    /// Composes the textures of active mesh extensions into the blocks their
    /// meshes added to layout `channel`.
    fn apply_image_extends(
        &self,
        mut current: OpRef,
        layout: OpRef,
        image: &SurfaceImage,
        mesh: &SurfaceMesh,
        channel: usize,
        modifiers: &[usize],
    ) -> Result<OpRef, PoolError> {
        for index in modifiers {
            let modifier = &self.first.modifiers[*index];
            let ModifierKind::MeshExtend {
                mesh: Some(_),
                textures,
            } = &modifier.node.kind
            else {
                continue;
            };
            let Some(texture) = textures.iter().find(|texture| texture.name == image.name) else {
                self.lowering.log.add(
                    Severity::Info,
                    MessageKind::MissingConnection,
                    format!("Texture `{}` is required to extend a mesh section.", image.name),
                    Some(&modifier.node.name),
                );
                continue;
            };
            let extend_layout = mesh
                .extensions
                .iter()
                .find(|extension| extension.modifier == *index)
                .and_then(|extension| extension.layouts.get(channel).cloned().flatten());
            let Some(extend_layout) = extend_layout else {
                self.lowering.log.add(
                    Severity::Warning,
                    MessageKind::MissingLayout,
                    format!("Extended mesh has no layout in channel {channel}."),
                    Some(&modifier.node.name),
                );
                continue;
            };

            let source = self.lowering.image(&texture.image)?;
            let source_size = texture.image.size_hint();
            let mut extended = current;
            for block in &extend_layout.blocks {
                let (cropped, size) =
                    self.crop_to_block(source, source_size, &extend_layout, block, &modifier.node.name)?;
                let block_image = self.apply_tiling(cropped, size, image.format)?;
                extended = self.intern(Op::ImageCompose {
                    layout,
                    base: extended,
                    block_image,
                    mask: None,
                    block_id: block.id,
                })?;
            }
            current = self.conditional(
                DataType::Image,
                modifier.activation.final_condition,
                extended,
                Some(current),
            )?;
        }
        Ok(current)
    }

    /// Rebuilds an image larger than the tile size as crops of `source`
    /// patched onto a plain image.
    fn apply_tiling(&self, source: OpRef, size: Option<[u32; 2]>, format: ImageFormat) -> Result<OpRef, PoolError> {
        let tile = self.options.image_tiling;
        let Some(size) = size else {
            return Ok(source);
        };
        if tile == 0 || (size[0] <= tile && size[1] <= tile) {
            return Ok(source);
        }

        let mut current = self.lowering.plain_image([to_u16(size[0]), to_u16(size[1])], format)?;
        for y in (0..size[1]).step_by(tile as usize) {
            for x in (0..size[0]).step_by(tile as usize) {
                let crop = self.intern(Op::ImageCrop {
                    source,
                    min: [to_u16(x), to_u16(y)],
                    size: [to_u16(tile.min(size[0] - x)), to_u16(tile.min(size[1] - y))],
                })?;
                current = self.intern(Op::ImagePatch {
                    base: current,
                    patch: crop,
                    location: [to_u16(x), to_u16(y)],
                })?;
            }
        }
        Ok(current)
    }
}

fn to_u16(value: u32) -> u16 {
    u16::try_from(value).unwrap_or(u16::MAX)
}
