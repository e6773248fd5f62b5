//! `kiln-expr` provides stateless expression trees, value distributions baked into
//! lookup tables, and a binding context that writes them into shader parameter buffers.
//!
//! ## Examples
//!
//! ```rs
//! use kiln_expr::{BuildContext, Expr, ParameterBindings, ParameterLayout, ParameterStore, OutputType};
//!
//! let mut layout = ParameterLayout::new();
//! layout.register("Gravity", OutputType::Float);
//!
//! let expr = Expr::multiply(Expr::binding("Gravity"), Expr::add(Expr::constant(1.0f32), Expr::constant(1.0)));
//! let built = expr.build(&mut BuildContext::new(&mut layout));
//!
//! let words = [9.8f32.to_bits()];
//! assert_eq!(built.evaluate(&ParameterStore::from_words(&words)), 19.6);
//!
//! // Bake a curve into a compact lookup table
//! use kiln_expr::{Curve, Distribution};
//!
//! let distribution = Distribution::<f32>::uniform_curve(Curve::linear(&[(0.0, 0.0), (1.0, 2.0)]));
//! assert_eq!(distribution.sample_count(), 2);
//! assert_eq!(distribution.sample(0.5), 1.0);
//! ```
mod binding;
mod curve;
mod distribution;
mod error;
mod expr;
mod options;
mod parameters;
mod range;
mod registry;
mod value;

pub mod lut;

pub use binding::{BindingContext, ScaleBias};
pub use curve::{Curve, CurveEvaluator, CurveKey, Interpolation};
pub use distribution::{BuiltDistribution, Distribution, DistributionMode};
pub use error::{BindingError, BufferKind, OptionsError};
pub use expr::{AnyBuiltExpr, AnyExpr, BinaryOp, BuildContext, BuiltExpr, DIVIDE_EPSILON, EvalContext, Expr};
pub use lut::SampleMode;
pub use options::DistributionOptions;
pub use parameters::{ParameterBindings, ParameterLayout, ParameterStore, WORD_SIZE};
pub use range::ValueRange;
pub use registry::{Capability, ExpressionRegistry, VariantDesc, VariantKind};
pub use value::{AnyValue, ExprValue, LinearColor, OutputType};
