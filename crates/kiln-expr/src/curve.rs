use serde::{Deserialize, Serialize};

/// A single-channel curve the distribution engine can sample.
pub trait CurveEvaluator {
    fn eval(&self, time: f32) -> f32;

    /// `(start, end)` of the authored domain.
    fn time_range(&self) -> (f32, f32);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Interpolation {
    Constant,
    #[default]
    Linear,
    Cubic,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CurveKey {
    pub time: f32,
    pub value: f32,
    /// How to interpolate from this key to the next one.
    #[serde(default)]
    pub interpolation: Interpolation,
}

impl CurveKey {
    pub const fn new(time: f32, value: f32, interpolation: Interpolation) -> Self {
        Self {
            time,
            value,
            interpolation,
        }
    }

    pub const fn linear(time: f32, value: f32) -> Self {
        Self::new(time, value, Interpolation::Linear)
    }
}

/// Keyed curve, clamped outside its keys.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Curve {
    keys: Vec<CurveKey>,
}

impl Curve {
    /// Builds a curve; keys are sorted by time.
    pub fn new(mut keys: Vec<CurveKey>) -> Self {
        keys.sort_by(|a, b| a.time.total_cmp(&b.time));
        Self { keys }
    }

    pub fn constant(value: f32) -> Self {
        Self::new(vec![CurveKey::linear(0.0, value)])
    }

    pub fn linear(points: &[(f32, f32)]) -> Self {
        Self::new(
            points
                .iter()
                .map(|(time, value)| CurveKey::linear(*time, *value))
                .collect(),
        )
    }

    pub fn keys(&self) -> &[CurveKey] {
        &self.keys
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn add_key(&mut self, key: CurveKey) {
        let index = self.keys.partition_point(|k| k.time <= key.time);
        self.keys.insert(index, key);
    }

    /// Catmull-Rom tangent at key `index`, in value per unit time.
    fn tangent(&self, index: usize) -> f32 {
        let last = self.keys.len() - 1;
        let prev = self.keys[index.saturating_sub(1)];
        let next = self.keys[(index + 1).min(last)];
        let dt = next.time - prev.time;
        if dt <= f32::EPSILON {
            0.0
        } else {
            (next.value - prev.value) / dt
        }
    }
}

impl CurveEvaluator for Curve {
    fn eval(&self, time: f32) -> f32 {
        let (first, last) = match (self.keys.first(), self.keys.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => return 0.0,
        };

        if time <= first.time {
            return first.value;
        }
        if time >= last.time {
            return last.value;
        }

        let next = self.keys.partition_point(|k| k.time <= time);
        let index = next - 1;
        let (k0, k1) = (self.keys[index], self.keys[next]);
        let dt = k1.time - k0.time;
        if dt <= f32::EPSILON {
            return k1.value;
        }
        let t = (time - k0.time) / dt;

        match k0.interpolation {
            Interpolation::Constant => k0.value,
            Interpolation::Linear => k0.value + (k1.value - k0.value) * t,
            Interpolation::Cubic => {
                let m0 = self.tangent(index) * dt;
                let m1 = self.tangent(next) * dt;
                let t2 = t * t;
                let t3 = t2 * t;
                let h00 = 2.0 * t3 - 3.0 * t2 + 1.0;
                let h10 = t3 - 2.0 * t2 + t;
                let h01 = -2.0 * t3 + 3.0 * t2;
                let h11 = t3 - t2;
                h00 * k0.value + h10 * m0 + h01 * k1.value + h11 * m1
            }
        }
    }

    fn time_range(&self) -> (f32, f32) {
        match (self.keys.first(), self.keys.last()) {
            (Some(first), Some(last)) => (first.time, last.time),
            _ => (0.0, 0.0),
        }
    }
}
