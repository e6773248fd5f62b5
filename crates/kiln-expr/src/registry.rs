//! Static catalogue of expression variants.
//!
//! Authoring tools need to list which expression kinds can produce a given
//! output type and to instantiate one by name. The catalogue is built once on
//! first use and is immutable afterwards.

use std::sync::OnceLock;

use glam::{Vec2, Vec3, Vec4};
use rustc_hash::FxHashMap;
use smol_str::{SmolStr, format_smolstr};

use crate::{
    expr::{AnyExpr, BinaryOp, Expr},
    value::{ExprValue, LinearColor, OutputType},
};

/// What an expression variant is able to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Holds a literal value.
    Value,
    /// Reads a named external parameter.
    Binding,
    /// Combines child expressions.
    Operation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VariantKind {
    Constant,
    Binding,
    Binary(BinaryOp),
}

impl VariantKind {
    pub const fn capability(self) -> Capability {
        match self {
            VariantKind::Constant => Capability::Value,
            VariantKind::Binding => Capability::Binding,
            VariantKind::Binary(_) => Capability::Operation,
        }
    }

    fn suffix(self) -> &'static str {
        match self {
            VariantKind::Constant => "Constant",
            VariantKind::Binding => "Binding",
            VariantKind::Binary(op) => op.name(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantDesc {
    pub name: SmolStr,
    pub output_type: OutputType,
    pub kind: VariantKind,
}

impl VariantDesc {
    #[inline]
    pub fn capability(&self) -> Capability {
        self.kind.capability()
    }
}

#[derive(Debug)]
pub struct ExpressionRegistry {
    variants: Vec<VariantDesc>,
    by_name: FxHashMap<SmolStr, usize>,
}

impl ExpressionRegistry {
    pub fn global() -> &'static ExpressionRegistry {
        static REGISTRY: OnceLock<ExpressionRegistry> = OnceLock::new();
        REGISTRY.get_or_init(ExpressionRegistry::build)
    }

    fn build() -> Self {
        let kinds = [VariantKind::Constant, VariantKind::Binding]
            .into_iter()
            .chain(BinaryOp::ALL.into_iter().map(VariantKind::Binary));

        let variants = OutputType::ALL
            .into_iter()
            .flat_map(|output_type| {
                kinds.clone().map(move |kind| VariantDesc {
                    name: format_smolstr!("{}{}", output_type.name(), kind.suffix()),
                    output_type,
                    kind,
                })
            })
            .collect::<Vec<_>>();

        let by_name = variants
            .iter()
            .enumerate()
            .map(|(index, desc)| (desc.name.clone(), index))
            .collect();

        Self { variants, by_name }
    }

    pub fn all(&self) -> &[VariantDesc] {
        &self.variants
    }

    /// Every variant with `capability` producing `output_type`.
    pub fn variants(
        &self,
        capability: Capability,
        output_type: OutputType,
    ) -> impl Iterator<Item = &VariantDesc> {
        self.variants
            .iter()
            .filter(move |desc| desc.capability() == capability && desc.output_type == output_type)
    }

    pub fn lookup(&self, name: &str) -> Option<&VariantDesc> {
        self.by_name.get(name).map(|index| &self.variants[*index])
    }

    /// Instantiates a default-initialised node of the named variant.
    ///
    /// Operations start with two zero constants as children and bindings
    /// start with an empty name.
    pub fn create(&self, name: &str) -> Option<AnyExpr> {
        self.lookup(name)
            .map(|desc| instantiate(desc.output_type, desc.kind))
    }

    /// Describes the root node of `expr`.
    pub fn of_expr(&self, expr: &AnyExpr) -> Option<&VariantDesc> {
        fn kind_of<T: ExprValue>(expr: &Expr<T>) -> VariantKind {
            match expr {
                Expr::Constant(_) => VariantKind::Constant,
                Expr::Binding(_) => VariantKind::Binding,
                Expr::Binary { op, .. } => VariantKind::Binary(*op),
            }
        }

        let kind = match expr {
            AnyExpr::Float(e) => kind_of(e),
            AnyExpr::Vec2(e) => kind_of(e),
            AnyExpr::Vec3(e) => kind_of(e),
            AnyExpr::Vec4(e) => kind_of(e),
            AnyExpr::Color(e) => kind_of(e),
        };
        let output_type = expr.output_type();

        self.variants
            .iter()
            .find(|desc| desc.output_type == output_type && desc.kind == kind)
    }
}

fn default_expr<T: ExprValue>(kind: VariantKind) -> Expr<T> {
    match kind {
        VariantKind::Constant => Expr::Constant(T::zero()),
        VariantKind::Binding => Expr::Binding(SmolStr::default()),
        VariantKind::Binary(op) => Expr::binary(op, Expr::Constant(T::zero()), Expr::Constant(T::zero())),
    }
}

fn instantiate(output_type: OutputType, kind: VariantKind) -> AnyExpr {
    match output_type {
        OutputType::Float => AnyExpr::Float(default_expr::<f32>(kind)),
        OutputType::Vec2 => AnyExpr::Vec2(default_expr::<Vec2>(kind)),
        OutputType::Vec3 => AnyExpr::Vec3(default_expr::<Vec3>(kind)),
        OutputType::Vec4 => AnyExpr::Vec4(default_expr::<Vec4>(kind)),
        OutputType::Color => AnyExpr::Color(default_expr::<LinearColor>(kind)),
    }
}
