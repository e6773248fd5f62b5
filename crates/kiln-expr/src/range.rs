use crate::value::ExprValue;

/// A `(min, max)` pair that may instead be bound to an external parameter.
///
/// When `parameter_offset` is set the bound value wins and `min`/`max` are
/// ignored at evaluation time. The offset is in 4-byte words of the
/// render-parameter blob.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValueRange<T> {
    pub min: T,
    pub max: T,
    pub parameter_offset: Option<u32>,
}

impl<T: ExprValue> Default for ValueRange<T> {
    fn default() -> Self {
        Self::constant(T::zero())
    }
}

impl<T: ExprValue> ValueRange<T> {
    pub fn new(min: T, max: T) -> Self {
        Self {
            min,
            max,
            parameter_offset: None,
        }
    }

    pub fn constant(value: T) -> Self {
        Self::new(value, value)
    }

    /// A range whose value is read from the render parameters at `offset`.
    pub fn bound(offset: u32) -> Self {
        Self {
            min: T::zero(),
            max: T::zero(),
            parameter_offset: Some(offset),
        }
    }

    pub fn with_parameter_offset(mut self, offset: Option<u32>) -> Self {
        self.parameter_offset = offset;
        self
    }

    #[inline]
    pub fn is_bound(&self) -> bool {
        self.parameter_offset.is_some()
    }

    /// `max - min`, element-wise.
    pub fn scale(&self) -> T {
        self.max.zip_map(self.min, |max, min| max - min)
    }

    pub fn is_constant(&self) -> bool {
        !self.is_bound() && self.min == self.max
    }

    /// Grows the range so that it contains `value`.
    pub fn include(&mut self, value: T) {
        self.min = self.min.zip_map(value, f32::min);
        self.max = self.max.zip_map(value, f32::max);
    }
}
