//! Property-based tests for kiln-expr expressions and lookup tables.
use glam::Vec3;
use kiln_expr::{
    BinaryOp, BuildContext, Curve, CurveEvaluator, DIVIDE_EPSILON, DistributionOptions, EvalContext, Expr,
    ParameterLayout, ParameterStore, SampleMode, lut,
};
use proptest::prelude::*;

mod strategies {
    use super::*;

    pub fn binary_op() -> impl Strategy<Value = BinaryOp> {
        prop::sample::select(BinaryOp::ALL.to_vec())
    }

    /// Float trees over a handful of parameter names.
    pub fn float_expr() -> impl Strategy<Value = Expr<f32>> {
        let leaf = prop_oneof![
            (-100.0f32..100.0).prop_map(Expr::<f32>::constant),
            prop::sample::select(vec!["a", "b", "c"]).prop_map(|name: &str| Expr::<f32>::binding(name)),
        ];
        leaf.prop_recursive(4, 32, 2, |inner| {
            (binary_op(), inner.clone(), inner).prop_map(|(op, a, b)| Expr::binary(op, a, b))
        })
    }

    pub fn constant_expr() -> impl Strategy<Value = Expr<f32>> {
        let leaf = (-100.0f32..100.0).prop_map(Expr::<f32>::constant);
        leaf.prop_recursive(4, 32, 2, |inner| {
            (binary_op(), inner.clone(), inner).prop_map(|(op, a, b)| Expr::binary(op, a, b))
        })
    }

    /// Piecewise-linear curves with keys on the 1/7 grid over [0, 1].
    pub fn grid_curve() -> impl Strategy<Value = Curve> {
        prop::collection::vec(-10.0f32..10.0, 8)
            .prop_map(|values| {
                let points = values
                    .iter()
                    .enumerate()
                    .map(|(i, value)| (i as f32 / 7.0, *value))
                    .collect::<Vec<_>>();
                Curve::linear(&points)
            })
    }

    /// Curves with a random number of keys, possibly with plateaus.
    pub fn plateau_curve() -> impl Strategy<Value = Curve> {
        prop::collection::vec((0.0f32..1.0, prop_oneof![Just(0.0f32), Just(1.0f32), -5.0f32..5.0]), 2..6)
            .prop_map(|points| Curve::linear(&points))
    }
}

fn same_float(a: f32, b: f32) -> bool {
    a == b || (a.is_nan() && b.is_nan())
}

fn has_binding(expr: &Expr<f32>) -> bool {
    match expr {
        Expr::Constant(_) => false,
        Expr::Binding(_) => true,
        Expr::Binary { a, b, .. } => has_binding(a) || has_binding(b),
    }
}

proptest! {
    #[test]
    fn built_evaluation_matches_unbuilt(
        expr in strategies::float_expr(),
        words in prop::collection::vec(-50.0f32..50.0, 3),
    ) {
        let mut layout = ParameterLayout::new();
        let built = expr.build(&mut BuildContext::new(&mut layout));

        let words = words.iter().map(|w| w.to_bits()).collect::<Vec<_>>();
        let store = ParameterStore::from_words(&words);

        let unbuilt = expr.evaluate(&EvalContext::new(store, &layout));
        prop_assert!(same_float(built.evaluate(&store), unbuilt));
        prop_assert_eq!(built.is_constant(), !has_binding(&expr));
    }

    #[test]
    fn constant_trees_fold_to_a_single_constant(expr in strategies::constant_expr()) {
        let mut layout = ParameterLayout::new();
        let built = expr.build(&mut BuildContext::new(&mut layout));

        let folded = built.as_constant();
        prop_assert!(folded.is_some());
        prop_assert!(same_float(folded.unwrap_or_default(), expr.evaluate(&EvalContext::empty())));
        prop_assert!(layout.is_empty());
    }

    #[test]
    fn divide_clamps_each_near_zero_channel(
        a in prop::array::uniform3(-1000.0f32..1000.0),
        b in prop::array::uniform3(prop_oneof![-1.0e-8f32..=1.0e-8, -1000.0f32..1000.0]),
    ) {
        let result = BinaryOp::Divide.apply(Vec3::from(a), Vec3::from(b));
        for i in 0..3 {
            if b[i].abs() <= DIVIDE_EPSILON {
                prop_assert_eq!(result[i], 0.0);
            } else {
                prop_assert_eq!(result[i], a[i] / b[i]);
            }
        }
    }

    #[test]
    fn optimized_lut_stays_within_threshold(curve in strategies::grid_curve()) {
        let options = DistributionOptions {
            reduce_time_range: false,
            ..Default::default()
        };
        let curves: [&dyn CurveEvaluator; 1] = [&curve];
        let baked = lut::bake_curves(&curves, SampleMode::Sample, &options);
        let max_count = options.max_lut_sample_count;

        prop_assert!(baked.values.len() >= 2);
        prop_assert!(baked.values.len() <= max_count);
        for k in 0..max_count {
            let u = k as f32 / (max_count - 1) as f32;
            let error = (lut::sample_lut(&baked.values, 1, u)[0] - curve.eval(u)).abs();
            prop_assert!(error <= options.lut_error_threshold + 1.0e-4, "u={} error={}", u, error);
        }
    }

    #[test]
    fn reduced_time_range_only_drops_flat_regions(curve in strategies::plateau_curve()) {
        let tolerance = 1.0e-4;
        let count = 64;
        let full = curve.time_range();
        let (start, end) = lut::reduce_time_range(&[&curve], full, count, tolerance);

        prop_assert!(start >= full.0 && end <= full.1 + 1.0e-5 && start <= end);

        let first = curve.eval(full.0);
        let last = curve.eval(lut::sample_time(full, count - 1, count));
        for i in 0..count {
            let time = lut::sample_time(full, i, count);
            let value = curve.eval(time);
            if start == end {
                prop_assert!(lut::nearly_equal(value, first, tolerance));
                continue;
            }
            if time < start {
                prop_assert!(lut::nearly_equal(value, first, tolerance));
            }
            if time > end {
                prop_assert!(lut::nearly_equal(value, last, tolerance));
            }
        }
    }
}
