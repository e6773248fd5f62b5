//! `kiln-codegen` lowers a declarative content graph (objects, components,
//! LODs, surfaces and modifiers) into a linked [`kiln_ast::Program`] with one
//! entry point per object state.
//!
//! Generation runs in three passes: discovery of surfaces, modifiers and tags,
//! solving the activation condition of each of them, and the main pass which
//! builds mesh, layout, image and instance ops on a task graph. Broken content
//! never aborts compilation; it is reported through [`CodegenMessage`]s and
//! replaced by placeholders.
//!
//! ## Examples
//!
//! ```rs
//! use std::sync::Arc;
//!
//! use kiln_ast::ResourceId;
//! use kiln_codegen::{
//!     Compiler, NodeComponent, NodeComponentNew, NodeLod, NodeMesh, NodeObject, NodeObjectNew, NodeSurface,
//!     NodeSurfaceNew,
//! };
//!
//! let surface = NodeSurfaceNew {
//!     name: "Skin".into(),
//!     mesh: Some(Arc::new(NodeMesh::new(ResourceId(1)))),
//!     ..NodeSurfaceNew::default()
//! };
//! let component = NodeComponentNew {
//!     name: "Body".into(),
//!     id: 0,
//!     lods: vec![Arc::new(NodeLod {
//!         surfaces: vec![Arc::new(NodeSurface::New(Arc::new(surface)))],
//!     })],
//!     overlay_material: None,
//! };
//! let root = Arc::new(NodeObject::New(NodeObjectNew {
//!     name: "Character".into(),
//!     components: vec![Arc::new(NodeComponent::New(Arc::new(component)))],
//!     ..NodeObjectNew::default()
//! }));
//!
//! let compiled = Compiler::default().compile(&root).unwrap();
//! assert!(compiled.state("Default").and_then(|state| state.address).is_some());
//! println!("{}", kiln_ast::dump_program(&compiled.program));
//! ```
mod compiler;
mod error;
mod first_pass;
mod generator;
mod lower;
mod node;
mod options;
mod second_pass;
mod task;

pub use compiler::{CompiledObject, CompiledState, Compiler};
pub use error::{CodegenError, CodegenMessage, ErrorLog, MessageKind, Severity};
pub use generator::{CodeGenerator, GeneratedState, Stage};
pub use node::{
    ComponentVariation, ExtendTexture, GroupKind, ModifierKind, MultipleTagPolicy, NodeBool, NodeColor, NodeComponent,
    NodeComponentNew, NodeImage, NodeLod, NodeMesh, NodeModifier, NodeObject, NodeObjectGroup, NodeObjectNew,
    NodeScalar, NodeSurface, NodeSurfaceNew, NodeSurfaceVariation, ObjectState, SurfaceEditTexture, SurfaceImage,
    SurfaceVariation,
};
pub use options::CodegenOptions;
pub use task::{Prerequisite, Scheduler, Task};
