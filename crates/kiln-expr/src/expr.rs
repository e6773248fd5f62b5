//! Typed expression trees with build-time constant folding.
//!
//! An [`Expr`] is authored once, built once into a [`BuiltExpr`] and the built
//! form is evaluated repeatedly. Built expressions never mutate, so they can be
//! shared and evaluated concurrently as long as every caller brings its own
//! [`ParameterStore`].

use std::fmt;

use glam::{Vec2, Vec3, Vec4};
use smol_str::SmolStr;

use crate::{
    parameters::{ParameterBindings, ParameterStore, WORD_SIZE},
    value::{AnyValue, ExprValue, LinearColor, OutputType},
};

/// Denominators at or below this magnitude divide to zero.
pub const DIVIDE_EPSILON: f32 = 1.0e-8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Min,
    Max,
}

impl BinaryOp {
    pub const ALL: [BinaryOp; 6] = [
        BinaryOp::Add,
        BinaryOp::Subtract,
        BinaryOp::Multiply,
        BinaryOp::Divide,
        BinaryOp::Min,
        BinaryOp::Max,
    ];

    #[inline]
    pub fn apply_scalar(self, a: f32, b: f32) -> f32 {
        match self {
            BinaryOp::Add => a + b,
            BinaryOp::Subtract => a - b,
            BinaryOp::Multiply => a * b,
            BinaryOp::Divide => {
                if b.abs() <= DIVIDE_EPSILON {
                    0.0
                } else {
                    a / b
                }
            }
            BinaryOp::Min => a.min(b),
            BinaryOp::Max => a.max(b),
        }
    }

    /// Applies the operator channel by channel.
    #[inline]
    pub fn apply<T: ExprValue>(self, a: T, b: T) -> T {
        a.zip_map(b, |a, b| self.apply_scalar(a, b))
    }

    pub const fn name(self) -> &'static str {
        match self {
            BinaryOp::Add => "Add",
            BinaryOp::Subtract => "Subtract",
            BinaryOp::Multiply => "Multiply",
            BinaryOp::Divide => "Divide",
            BinaryOp::Min => "Min",
            BinaryOp::Max => "Max",
        }
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// State threaded through [`Expr::build`].
pub struct BuildContext<'a> {
    pub bindings: &'a mut dyn ParameterBindings,
}

impl<'a> BuildContext<'a> {
    pub fn new(bindings: &'a mut dyn ParameterBindings) -> Self {
        Self { bindings }
    }
}

/// State threaded through [`Expr::evaluate`] on an unbuilt tree.
#[derive(Clone, Copy, Default)]
pub struct EvalContext<'a> {
    pub store: ParameterStore<'a>,
    /// Resolves binding names on unbuilt trees. Without it bindings read zero.
    pub bindings: Option<&'a dyn ParameterBindings>,
}

impl<'a> EvalContext<'a> {
    pub fn new(store: ParameterStore<'a>, bindings: &'a dyn ParameterBindings) -> Self {
        Self {
            store,
            bindings: Some(bindings),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }
}

/// Authoring form of an expression producing a `T`.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr<T: ExprValue> {
    Constant(T),
    Binding(SmolStr),
    Binary {
        op: BinaryOp,
        a: Box<Expr<T>>,
        b: Box<Expr<T>>,
    },
}

impl<T: ExprValue> Expr<T> {
    pub fn constant(value: T) -> Self {
        Expr::Constant(value)
    }

    pub fn binding(name: impl Into<SmolStr>) -> Self {
        Expr::Binding(name.into())
    }

    pub fn binary(op: BinaryOp, a: Expr<T>, b: Expr<T>) -> Self {
        Expr::Binary {
            op,
            a: Box::new(a),
            b: Box::new(b),
        }
    }

    pub fn add(a: Expr<T>, b: Expr<T>) -> Self {
        Self::binary(BinaryOp::Add, a, b)
    }

    pub fn subtract(a: Expr<T>, b: Expr<T>) -> Self {
        Self::binary(BinaryOp::Subtract, a, b)
    }

    pub fn multiply(a: Expr<T>, b: Expr<T>) -> Self {
        Self::binary(BinaryOp::Multiply, a, b)
    }

    pub fn divide(a: Expr<T>, b: Expr<T>) -> Self {
        Self::binary(BinaryOp::Divide, a, b)
    }

    #[inline]
    pub fn output_type(&self) -> OutputType {
        T::OUTPUT_TYPE
    }

    pub fn is_constant(&self) -> bool {
        match self {
            Expr::Constant(_) => true,
            Expr::Binding(_) => false,
            Expr::Binary { a, b, .. } => a.is_constant() && b.is_constant(),
        }
    }

    /// Specializes the tree for runtime evaluation.
    ///
    /// Fully constant sub-trees are evaluated once against an empty store and
    /// replaced by a single constant; bindings are resolved to byte offsets.
    pub fn build(&self, ctx: &mut BuildContext<'_>) -> BuiltExpr<T> {
        if self.is_constant() {
            return BuiltExpr::Constant(self.evaluate(&EvalContext::empty()));
        }

        match self {
            Expr::Constant(value) => BuiltExpr::Constant(*value),
            Expr::Binding(name) => match ctx.bindings.register(name, T::OUTPUT_TYPE) {
                Some(slot) => BuiltExpr::Binding {
                    offset: slot * WORD_SIZE,
                },
                None => {
                    tracing::warn!(
                        name = %name,
                        output_type = %T::OUTPUT_TYPE,
                        "Unable to bind parameter, using zero"
                    );
                    BuiltExpr::Constant(T::zero())
                }
            },
            Expr::Binary { op, a, b } => BuiltExpr::Binary {
                op: *op,
                a: Box::new(a.build(ctx)),
                b: Box::new(b.build(ctx)),
            },
        }
    }

    /// Evaluates the unbuilt tree.
    pub fn evaluate(&self, ctx: &EvalContext<'_>) -> T {
        match self {
            Expr::Constant(value) => *value,
            Expr::Binding(name) => ctx
                .bindings
                .and_then(|bindings| bindings.lookup(name))
                .filter(|(_, output_type)| *output_type == T::OUTPUT_TYPE)
                .and_then(|(slot, _)| ctx.store.read((slot * WORD_SIZE) as usize))
                .unwrap_or_else(T::zero),
            Expr::Binary { op, a, b } => op.apply(a.evaluate(ctx), b.evaluate(ctx)),
        }
    }

    /// Number of nodes in the tree.
    pub fn node_count(&self) -> usize {
        match self {
            Expr::Constant(_) | Expr::Binding(_) => 1,
            Expr::Binary { a, b, .. } => 1 + a.node_count() + b.node_count(),
        }
    }
}

impl<T: ExprValue> From<T> for Expr<T> {
    fn from(value: T) -> Self {
        Expr::Constant(value)
    }
}

/// Runtime form of an expression, produced by [`Expr::build`].
#[derive(Debug, Clone, PartialEq)]
pub enum BuiltExpr<T: ExprValue> {
    Constant(T),
    /// Reads `size_of::<T>()` bytes at `offset` of the parameter store.
    Binding {
        offset: u32,
    },
    Binary {
        op: BinaryOp,
        a: Box<BuiltExpr<T>>,
        b: Box<BuiltExpr<T>>,
    },
}

impl<T: ExprValue> BuiltExpr<T> {
    #[inline]
    pub fn output_type(&self) -> OutputType {
        T::OUTPUT_TYPE
    }

    pub fn is_constant(&self) -> bool {
        match self {
            BuiltExpr::Constant(_) => true,
            BuiltExpr::Binding { .. } => false,
            BuiltExpr::Binary { a, b, .. } => a.is_constant() && b.is_constant(),
        }
    }

    pub fn as_constant(&self) -> Option<T> {
        match self {
            BuiltExpr::Constant(value) => Some(*value),
            _ => None,
        }
    }

    pub fn evaluate(&self, store: &ParameterStore<'_>) -> T {
        match self {
            BuiltExpr::Constant(value) => *value,
            BuiltExpr::Binding { offset } => store.read(*offset as usize).unwrap_or_else(|| {
                tracing::warn!(
                    offset = *offset,
                    store_len = store.len(),
                    "Parameter store too small for bound expression"
                );
                T::zero()
            }),
            BuiltExpr::Binary { op, a, b } => op.apply(a.evaluate(store), b.evaluate(store)),
        }
    }
}

macro_rules! dispatch_any {
    ($value:expr, $inner:ident => $body:expr, $wrap:ident) => {
        match $value {
            $wrap::Float($inner) => $body,
            $wrap::Vec2($inner) => $body,
            $wrap::Vec3($inner) => $body,
            $wrap::Vec4($inner) => $body,
            $wrap::Color($inner) => $body,
        }
    };
}

/// An [`Expr`] whose output type is only known at runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum AnyExpr {
    Float(Expr<f32>),
    Vec2(Expr<Vec2>),
    Vec3(Expr<Vec3>),
    Vec4(Expr<Vec4>),
    Color(Expr<LinearColor>),
}

impl AnyExpr {
    pub fn output_type(&self) -> OutputType {
        dispatch_any!(self, expr => expr.output_type(), AnyExpr)
    }

    pub fn is_constant(&self) -> bool {
        dispatch_any!(self, expr => expr.is_constant(), AnyExpr)
    }

    pub fn build(&self, ctx: &mut BuildContext<'_>) -> AnyBuiltExpr {
        match self {
            AnyExpr::Float(expr) => AnyBuiltExpr::Float(expr.build(ctx)),
            AnyExpr::Vec2(expr) => AnyBuiltExpr::Vec2(expr.build(ctx)),
            AnyExpr::Vec3(expr) => AnyBuiltExpr::Vec3(expr.build(ctx)),
            AnyExpr::Vec4(expr) => AnyBuiltExpr::Vec4(expr.build(ctx)),
            AnyExpr::Color(expr) => AnyBuiltExpr::Color(expr.build(ctx)),
        }
    }

    pub fn evaluate(&self, ctx: &EvalContext<'_>) -> AnyValue {
        dispatch_any!(self, expr => AnyValue::from(expr.evaluate(ctx)), AnyExpr)
    }
}

/// A [`BuiltExpr`] whose output type is only known at runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum AnyBuiltExpr {
    Float(BuiltExpr<f32>),
    Vec2(BuiltExpr<Vec2>),
    Vec3(BuiltExpr<Vec3>),
    Vec4(BuiltExpr<Vec4>),
    Color(BuiltExpr<LinearColor>),
}

impl AnyBuiltExpr {
    pub fn output_type(&self) -> OutputType {
        dispatch_any!(self, expr => expr.output_type(), AnyBuiltExpr)
    }

    pub fn is_constant(&self) -> bool {
        dispatch_any!(self, expr => expr.is_constant(), AnyBuiltExpr)
    }

    pub fn evaluate(&self, store: &ParameterStore<'_>) -> AnyValue {
        dispatch_any!(self, expr => AnyValue::from(expr.evaluate(store)), AnyBuiltExpr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameters::ParameterLayout;
    use rstest::rstest;

    fn store_with(words: &[(usize, f32)], len: usize) -> Vec<u8> {
        let mut bytes = vec![0u8; len];
        for (offset, value) in words {
            bytes[*offset..*offset + 4].copy_from_slice(&value.to_ne_bytes());
        }
        bytes
    }

    #[rstest]
    #[case(BinaryOp::Add, 6.0, 3.0, 9.0)]
    #[case(BinaryOp::Subtract, 6.0, 3.0, 3.0)]
    #[case(BinaryOp::Multiply, 6.0, 3.0, 18.0)]
    #[case(BinaryOp::Divide, 6.0, 3.0, 2.0)]
    #[case(BinaryOp::Divide, 6.0, 0.0, 0.0)]
    #[case(BinaryOp::Divide, 6.0, 1.0e-9, 0.0)]
    #[case(BinaryOp::Divide, 6.0, -1.0e-9, 0.0)]
    #[case(BinaryOp::Min, 6.0, 3.0, 3.0)]
    #[case(BinaryOp::Max, 6.0, 3.0, 6.0)]
    fn test_apply_scalar(#[case] op: BinaryOp, #[case] a: f32, #[case] b: f32, #[case] expected: f32) {
        assert_eq!(op.apply_scalar(a, b), expected);
    }

    #[test]
    fn test_divide_is_per_channel() {
        let a = Vec3::new(4.0, 5.0, 6.0);
        let b = Vec3::new(2.0, 0.0, 3.0);
        assert_eq!(BinaryOp::Divide.apply(a, b), Vec3::new(2.0, 0.0, 2.0));

        let a = LinearColor::new(1.0, 1.0, 1.0, 1.0);
        let b = LinearColor::new(0.0, 0.5, 1.0e-10, 4.0);
        assert_eq!(
            BinaryOp::Divide.apply(a, b),
            LinearColor::new(0.0, 2.0, 0.0, 0.25)
        );
    }

    #[test]
    fn test_constant_tree_folds_to_single_constant() {
        let expr = Expr::multiply(
            Expr::add(Expr::constant(1.0f32), Expr::constant(2.0)),
            Expr::subtract(Expr::constant(10.0), Expr::constant(4.0)),
        );
        let mut layout = ParameterLayout::new();
        let built = expr.build(&mut BuildContext::new(&mut layout));

        assert_eq!(built, BuiltExpr::Constant(18.0));
        assert!(layout.is_empty());
    }

    #[test]
    fn test_partially_constant_tree_folds_constant_branch() {
        let expr = Expr::add(
            Expr::binding("Speed"),
            Expr::multiply(Expr::constant(2.0f32), Expr::constant(3.0)),
        );
        let mut layout = ParameterLayout::new();
        let built = expr.build(&mut BuildContext::new(&mut layout));

        assert_eq!(
            built,
            BuiltExpr::Binary {
                op: BinaryOp::Add,
                a: Box::new(BuiltExpr::Binding { offset: 0 }),
                b: Box::new(BuiltExpr::Constant(6.0)),
            }
        );
        assert!(!built.is_constant());
    }

    #[test]
    fn test_binding_reads_from_assigned_offset() {
        let mut layout = ParameterLayout::new();
        layout.register("A", OutputType::Float);
        layout.register("B", OutputType::Float);
        layout.register("C", OutputType::Float);

        let built = Expr::<f32>::binding("Speed").build(&mut BuildContext::new(&mut layout));
        assert_eq!(built, BuiltExpr::Binding { offset: 12 });

        let bytes = store_with(&[(12, 42.0)], 16);
        assert_eq!(built.evaluate(&ParameterStore::new(&bytes)), 42.0);
    }

    #[test]
    fn test_failed_binding_builds_to_zero() {
        let mut layout = ParameterLayout::new();
        layout.register("Speed", OutputType::Vec3);

        let built = Expr::<f32>::binding("Speed").build(&mut BuildContext::new(&mut layout));
        assert_eq!(built, BuiltExpr::Constant(0.0));
    }

    #[test]
    fn test_unbuilt_evaluation_matches_built() {
        let expr = Expr::divide(
            Expr::binding("Size"),
            Expr::add(Expr::constant(Vec2::new(1.0, 0.0)), Expr::constant(Vec2::ONE)),
        );
        let mut layout = ParameterLayout::new();
        let built = expr.build(&mut BuildContext::new(&mut layout));

        let bytes = store_with(&[(0, 8.0), (4, 3.0)], 8);
        let store = ParameterStore::new(&bytes);
        let unbuilt = expr.evaluate(&EvalContext::new(store, &layout));

        assert_eq!(unbuilt, Vec2::new(4.0, 3.0));
        assert_eq!(built.evaluate(&store), unbuilt);
    }

    #[test]
    fn test_unresolved_binding_on_unbuilt_tree_reads_zero() {
        let expr = Expr::<f32>::add(Expr::binding("Missing"), Expr::constant(1.0));
        assert_eq!(expr.evaluate(&EvalContext::empty()), 1.0);
    }

    #[test]
    fn test_any_expr_dispatch() {
        let expr = AnyExpr::Vec3(Expr::add(
            Expr::constant(Vec3::ONE),
            Expr::constant(Vec3::X),
        ));
        let mut layout = ParameterLayout::new();
        let built = expr.build(&mut BuildContext::new(&mut layout));

        assert_eq!(expr.output_type(), OutputType::Vec3);
        assert!(built.is_constant());
        assert_eq!(
            built.evaluate(&ParameterStore::empty()),
            AnyValue::Vec3(Vec3::new(2.0, 1.0, 1.0))
        );
    }

    #[test]
    fn test_node_count() {
        let expr = Expr::add(Expr::constant(1.0f32), Expr::binding("x"));
        assert_eq!(expr.node_count(), 3);
    }
}
