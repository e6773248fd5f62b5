//! Authored value distributions and their baked lookup tables.

use smallvec::SmallVec;
use smol_str::SmolStr;

use crate::{
    curve::{Curve, CurveEvaluator},
    expr::{BuildContext, BuiltExpr, EvalContext, Expr},
    lut::{self, SampleMode},
    options::DistributionOptions,
    parameters::{ParameterBindings, ParameterStore, WORD_SIZE},
    range::ValueRange,
    value::ExprValue,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DistributionMode {
    Binding,
    Expression,
    #[default]
    UniformConstant,
    NonUniformConstant,
    UniformRange,
    NonUniformRange,
    UniformCurve,
    NonUniformCurve,
    ColorGradient,
}

impl DistributionMode {
    /// Whether one authored value is broadcast to every channel.
    pub const fn is_uniform(self) -> bool {
        matches!(
            self,
            DistributionMode::UniformConstant
                | DistributionMode::UniformRange
                | DistributionMode::UniformCurve
        )
    }

    pub const fn is_constant(self) -> bool {
        matches!(
            self,
            DistributionMode::UniformConstant | DistributionMode::NonUniformConstant
        )
    }

    pub const fn is_range(self) -> bool {
        matches!(
            self,
            DistributionMode::UniformRange | DistributionMode::NonUniformRange
        )
    }

    pub const fn is_curve(self) -> bool {
        matches!(
            self,
            DistributionMode::UniformCurve
                | DistributionMode::NonUniformCurve
                | DistributionMode::ColorGradient
        )
    }

    /// Resolved at evaluation time rather than baked.
    pub const fn is_dynamic(self) -> bool {
        matches!(self, DistributionMode::Binding | DistributionMode::Expression)
    }
}

/// An authored distribution of `T` values over a normalized time `u`.
///
/// Authoring fields describe the distribution; [`Distribution::update_values_from_distribution`]
/// derives the baked `values` and `time_range` read at runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct Distribution<T: ExprValue> {
    pub mode: DistributionMode,
    pub parameter_binding: Option<SmolStr>,
    pub parameter_expression: Option<Expr<T>>,
    /// Constants (one per channel, or one when uniform) or ranges (min row
    /// then max row).
    pub channel_constants_and_ranges: Vec<f32>,
    pub channel_curves: Vec<Curve>,
    /// Overrides [`DistributionOptions::max_lut_sample_count`].
    pub max_lut_sample_count: Option<usize>,
    pub lut_mode: SampleMode,
    values: Vec<f32>,
    time_range: (f32, f32),
}

impl<T: ExprValue> Default for Distribution<T> {
    fn default() -> Self {
        Self {
            mode: DistributionMode::default(),
            parameter_binding: None,
            parameter_expression: None,
            channel_constants_and_ranges: Vec::new(),
            channel_curves: Vec::new(),
            max_lut_sample_count: None,
            lut_mode: SampleMode::Sample,
            values: Vec::new(),
            time_range: (0.0, 1.0),
        }
    }
}

impl<T: ExprValue> Distribution<T> {
    fn authored(
        mode: DistributionMode,
        channel_constants_and_ranges: Vec<f32>,
        channel_curves: Vec<Curve>,
    ) -> Self {
        let mut distribution = Self {
            mode,
            channel_constants_and_ranges,
            channel_curves,
            ..Default::default()
        };
        distribution.update_values_from_distribution(&DistributionOptions::default());
        distribution
    }

    pub fn uniform_constant(value: f32) -> Self {
        Self::authored(DistributionMode::UniformConstant, vec![value], Vec::new())
    }

    pub fn constant(value: T) -> Self {
        let channels = (0..T::CHANNELS).map(|c| value.channel(c)).collect();
        Self::authored(DistributionMode::NonUniformConstant, channels, Vec::new())
    }

    pub fn uniform_range(min: f32, max: f32) -> Self {
        Self::authored(DistributionMode::UniformRange, vec![min, max], Vec::new())
    }

    pub fn range(min: T, max: T) -> Self {
        let rows = (0..T::CHANNELS)
            .map(|c| min.channel(c))
            .chain((0..T::CHANNELS).map(|c| max.channel(c)))
            .collect();
        Self::authored(DistributionMode::NonUniformRange, rows, Vec::new())
    }

    pub fn uniform_curve(curve: Curve) -> Self {
        Self::authored(DistributionMode::UniformCurve, Vec::new(), vec![curve])
    }

    pub fn curves(curves: Vec<Curve>) -> Self {
        Self::authored(DistributionMode::NonUniformCurve, Vec::new(), curves)
    }

    pub fn color_gradient(curves: Vec<Curve>) -> Self {
        Self::authored(DistributionMode::ColorGradient, Vec::new(), curves)
    }

    pub fn binding(name: impl Into<SmolStr>) -> Self {
        Self {
            mode: DistributionMode::Binding,
            parameter_binding: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn expression(expr: Expr<T>) -> Self {
        Self {
            mode: DistributionMode::Expression,
            parameter_expression: Some(expr),
            ..Default::default()
        }
    }

    pub fn with_lut_mode(mut self, lut_mode: SampleMode) -> Self {
        self.lut_mode = lut_mode;
        self.update_values_from_distribution(&DistributionOptions::default());
        self
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn time_range(&self) -> (f32, f32) {
        self.time_range
    }

    /// Number of baked samples.
    pub fn sample_count(&self) -> usize {
        self.values.len() / T::CHANNELS
    }

    pub fn display_as_color(&self) -> bool {
        self.mode == DistributionMode::ColorGradient
    }

    /// Re-derives the baked table from the authoring fields.
    ///
    /// Dynamic modes and insufficient authoring data leave the baked state
    /// untouched.
    pub fn update_values_from_distribution(&mut self, options: &DistributionOptions) {
        let channels = T::CHANNELS;
        let data = &self.channel_constants_and_ranges;

        let baked = match self.mode {
            DistributionMode::Binding | DistributionMode::Expression => None,
            DistributionMode::UniformConstant => data.first().map(|value| {
                let row = SmallVec::<[f32; 4]>::from_elem(*value, channels);
                (repeat_rows(&[&row[..], &row[..]]), (0.0, 1.0))
            }),
            DistributionMode::NonUniformConstant => (data.len() >= channels).then(|| {
                let row = &data[..channels];
                (repeat_rows(&[row, row]), (0.0, 1.0))
            }),
            DistributionMode::UniformRange => (data.len() >= 2).then(|| {
                let min = SmallVec::<[f32; 4]>::from_elem(data[0], channels);
                let max = SmallVec::<[f32; 4]>::from_elem(data[1], channels);
                (repeat_rows(&[&min[..], &max[..]]), (0.0, 1.0))
            }),
            DistributionMode::NonUniformRange => (data.len() >= channels * 2).then(|| {
                (
                    repeat_rows(&[&data[..channels], &data[channels..channels * 2]]),
                    (0.0, 1.0),
                )
            }),
            DistributionMode::UniformCurve => self.channel_curves.first().map(|curve| {
                let lut = lut::bake_curves(
                    &[curve as &dyn CurveEvaluator],
                    self.lut_mode,
                    &self.lut_options(options),
                );
                let values = lut
                    .values
                    .iter()
                    .flat_map(|value| std::iter::repeat_n(*value, channels))
                    .collect();
                (values, lut.time_range)
            }),
            DistributionMode::NonUniformCurve | DistributionMode::ColorGradient => {
                (self.channel_curves.len() >= channels).then(|| {
                    let curves = self.channel_curves[..channels]
                        .iter()
                        .map(|curve| curve as &dyn CurveEvaluator)
                        .collect::<SmallVec<[_; 4]>>();
                    let lut = lut::bake_curves(&curves, self.lut_mode, &self.lut_options(options));
                    (lut.values, lut.time_range)
                })
            }
        };

        if let Some((values, time_range)) = baked {
            self.values = values;
            self.time_range = time_range;
        }
    }

    fn lut_options(&self, options: &DistributionOptions) -> DistributionOptions {
        DistributionOptions {
            max_lut_sample_count: self
                .max_lut_sample_count
                .unwrap_or(options.max_lut_sample_count)
                .max(2),
            ..options.clone()
        }
    }

    /// Piecewise-linear read of the baked table at `u` in `[0, 1]`.
    pub fn sample(&self, u: f32) -> T {
        sample_values(&self.values, u)
    }

    /// Reads the baked table at an authored curve time.
    pub fn sample_at_time(&self, time: f32) -> T {
        self.sample(time_fraction(self.time_range, time))
    }

    /// Bounds of the values this distribution can produce.
    ///
    /// Binding mode registers its parameter and yields a bound range. Returns
    /// `None` for non-constant expressions and unbaked tables.
    pub fn to_value_range(&self, bindings: &mut dyn ParameterBindings) -> Option<ValueRange<T>> {
        match self.mode {
            DistributionMode::Binding => {
                let name = self.parameter_binding.as_ref()?;
                bindings
                    .register(name, T::OUTPUT_TYPE)
                    .map(ValueRange::bound)
            }
            DistributionMode::Expression => {
                let expr = self.parameter_expression.as_ref()?;
                expr.is_constant()
                    .then(|| ValueRange::constant(expr.evaluate(&EvalContext::empty())))
            }
            // Authored order is kept so scale and bias agree with the table.
            DistributionMode::UniformRange | DistributionMode::NonUniformRange => {
                let mut rows = self.values.chunks_exact(T::CHANNELS).map(T::from_channels);
                let min = rows.next()?;
                Some(ValueRange::new(min, rows.next().unwrap_or(min)))
            }
            _ => {
                let mut rows = self.values.chunks_exact(T::CHANNELS).map(T::from_channels);
                let mut range = ValueRange::constant(rows.next()?);
                rows.for_each(|row| range.include(row));
                Some(range)
            }
        }
    }

    /// Specializes the distribution for runtime evaluation.
    pub fn build(&self, ctx: &mut BuildContext<'_>) -> BuiltDistribution<T> {
        match self.mode {
            DistributionMode::Binding => {
                let slot = self
                    .parameter_binding
                    .as_ref()
                    .and_then(|name| ctx.bindings.register(name, T::OUTPUT_TYPE));
                match slot {
                    Some(slot) => BuiltDistribution::Binding {
                        offset: slot * WORD_SIZE,
                    },
                    None => {
                        tracing::warn!(
                            binding = ?self.parameter_binding,
                            output_type = %T::OUTPUT_TYPE,
                            "Unable to bind distribution parameter, using zero"
                        );
                        BuiltDistribution::zero()
                    }
                }
            }
            DistributionMode::Expression => match &self.parameter_expression {
                Some(expr) => BuiltDistribution::Expression(expr.build(ctx)),
                None => {
                    tracing::warn!("Expression distribution has no expression, using zero");
                    BuiltDistribution::zero()
                }
            },
            _ => BuiltDistribution::Lut {
                values: self.values.clone(),
                time_range: self.time_range,
            },
        }
    }
}

fn repeat_rows(rows: &[&[f32]]) -> Vec<f32> {
    rows.concat()
}

/// Position of `time` within `time_range` as a fraction clamped to `[0, 1]`.
fn time_fraction((start, end): (f32, f32), time: f32) -> f32 {
    let width = end - start;
    if width > 0.0 {
        ((time - start) / width).clamp(0.0, 1.0)
    } else {
        0.0
    }
}

fn sample_values<T: ExprValue>(values: &[f32], u: f32) -> T {
    if values.is_empty() {
        return T::zero();
    }
    T::from_channels(&lut::sample_lut(values, T::CHANNELS, u))
}

/// Runtime form of a [`Distribution`].
#[derive(Debug, Clone, PartialEq)]
pub enum BuiltDistribution<T: ExprValue> {
    Lut {
        values: Vec<f32>,
        time_range: (f32, f32),
    },
    Binding {
        offset: u32,
    },
    Expression(BuiltExpr<T>),
}

impl<T: ExprValue> BuiltDistribution<T> {
    fn zero() -> Self {
        BuiltDistribution::Lut {
            values: vec![0.0; T::CHANNELS * 2],
            time_range: (0.0, 1.0),
        }
    }

    /// Evaluates at an authored curve time. Tables map it through their
    /// baked time range; bindings and expressions ignore it.
    pub fn evaluate_at_time(&self, store: &ParameterStore<'_>, time: f32) -> T {
        match self {
            BuiltDistribution::Lut { values, time_range } => sample_values(values, time_fraction(*time_range, time)),
            _ => self.evaluate(store, time),
        }
    }

    /// Evaluates at `u` in `[0, 1]`, the fraction of the baked time range.
    pub fn evaluate(&self, store: &ParameterStore<'_>, u: f32) -> T {
        match self {
            BuiltDistribution::Lut { values, .. } => sample_values(values, u),
            BuiltDistribution::Binding { offset } => {
                store.read(*offset as usize).unwrap_or_else(|| {
                    tracing::warn!(
                        offset = *offset,
                        store_len = store.len(),
                        "Parameter store too small for bound distribution"
                    );
                    T::zero()
                })
            }
            BuiltDistribution::Expression(expr) => expr.evaluate(store),
        }
    }
}
