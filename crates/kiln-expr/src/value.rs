use std::fmt;

use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec3, Vec4};
use serde::{Deserialize, Serialize};

/// The value type an expression or distribution produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutputType {
    Float,
    Vec2,
    Vec3,
    Vec4,
    Color,
}

impl OutputType {
    pub const ALL: [OutputType; 5] = [
        OutputType::Float,
        OutputType::Vec2,
        OutputType::Vec3,
        OutputType::Vec4,
        OutputType::Color,
    ];

    /// Number of `f32` channels of this type.
    pub const fn channels(self) -> usize {
        match self {
            OutputType::Float => 1,
            OutputType::Vec2 => 2,
            OutputType::Vec3 => 3,
            OutputType::Vec4 | OutputType::Color => 4,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            OutputType::Float => "Float",
            OutputType::Vec2 => "Vec2",
            OutputType::Vec3 => "Vec3",
            OutputType::Vec4 => "Vec4",
            OutputType::Color => "Color",
        }
    }
}

impl fmt::Display for OutputType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Linear-space RGBA color.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
pub struct LinearColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl LinearColor {
    pub const WHITE: LinearColor = LinearColor::new(1.0, 1.0, 1.0, 1.0);
    pub const BLACK: LinearColor = LinearColor::new(0.0, 0.0, 0.0, 1.0);

    pub const fn new(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }
}

/// A plain-old-data value made of `f32` channels.
///
/// Every operation on expression values is element-wise, so implementors only
/// need to expose their channels.
pub trait ExprValue: Pod + PartialEq + fmt::Debug + Send + Sync + 'static {
    const OUTPUT_TYPE: OutputType;
    const CHANNELS: usize = Self::OUTPUT_TYPE.channels();

    fn channel(&self, index: usize) -> f32;

    fn from_fn(f: impl FnMut(usize) -> f32) -> Self;

    #[inline]
    fn zero() -> Self {
        Self::zeroed()
    }

    #[inline]
    fn splat(value: f32) -> Self {
        Self::from_fn(|_| value)
    }

    #[inline]
    fn zip_map(self, other: Self, mut f: impl FnMut(f32, f32) -> f32) -> Self {
        Self::from_fn(|i| f(self.channel(i), other.channel(i)))
    }

    /// Builds a value from the first `CHANNELS` entries of `channels`.
    #[inline]
    fn from_channels(channels: &[f32]) -> Self {
        debug_assert!(channels.len() >= Self::CHANNELS);
        Self::from_fn(|i| channels[i])
    }
}

impl ExprValue for f32 {
    const OUTPUT_TYPE: OutputType = OutputType::Float;

    #[inline]
    fn channel(&self, _index: usize) -> f32 {
        *self
    }

    #[inline]
    fn from_fn(mut f: impl FnMut(usize) -> f32) -> Self {
        f(0)
    }
}

impl ExprValue for Vec2 {
    const OUTPUT_TYPE: OutputType = OutputType::Vec2;

    #[inline]
    fn channel(&self, index: usize) -> f32 {
        self[index]
    }

    #[inline]
    fn from_fn(mut f: impl FnMut(usize) -> f32) -> Self {
        let x = f(0);
        let y = f(1);
        Vec2::new(x, y)
    }
}

impl ExprValue for Vec3 {
    const OUTPUT_TYPE: OutputType = OutputType::Vec3;

    #[inline]
    fn channel(&self, index: usize) -> f32 {
        self[index]
    }

    #[inline]
    fn from_fn(mut f: impl FnMut(usize) -> f32) -> Self {
        let x = f(0);
        let y = f(1);
        let z = f(2);
        Vec3::new(x, y, z)
    }
}

impl ExprValue for Vec4 {
    const OUTPUT_TYPE: OutputType = OutputType::Vec4;

    #[inline]
    fn channel(&self, index: usize) -> f32 {
        self[index]
    }

    #[inline]
    fn from_fn(mut f: impl FnMut(usize) -> f32) -> Self {
        let x = f(0);
        let y = f(1);
        let z = f(2);
        let w = f(3);
        Vec4::new(x, y, z, w)
    }
}

impl ExprValue for LinearColor {
    const OUTPUT_TYPE: OutputType = OutputType::Color;

    #[inline]
    fn channel(&self, index: usize) -> f32 {
        match index {
            0 => self.r,
            1 => self.g,
            2 => self.b,
            3 => self.a,
            _ => panic!("LinearColor channel index out of range: {index}"),
        }
    }

    #[inline]
    fn from_fn(mut f: impl FnMut(usize) -> f32) -> Self {
        let r = f(0);
        let g = f(1);
        let b = f(2);
        let a = f(3);
        LinearColor::new(r, g, b, a)
    }
}

/// A value whose type is only known at runtime.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AnyValue {
    Float(f32),
    Vec2(Vec2),
    Vec3(Vec3),
    Vec4(Vec4),
    Color(LinearColor),
}

impl AnyValue {
    pub fn output_type(&self) -> OutputType {
        match self {
            AnyValue::Float(_) => OutputType::Float,
            AnyValue::Vec2(_) => OutputType::Vec2,
            AnyValue::Vec3(_) => OutputType::Vec3,
            AnyValue::Vec4(_) => OutputType::Vec4,
            AnyValue::Color(_) => OutputType::Color,
        }
    }

    pub fn zero(output_type: OutputType) -> Self {
        match output_type {
            OutputType::Float => AnyValue::Float(0.0),
            OutputType::Vec2 => AnyValue::Vec2(Vec2::ZERO),
            OutputType::Vec3 => AnyValue::Vec3(Vec3::ZERO),
            OutputType::Vec4 => AnyValue::Vec4(Vec4::ZERO),
            OutputType::Color => AnyValue::Color(LinearColor::default()),
        }
    }
}

impl From<f32> for AnyValue {
    fn from(value: f32) -> Self {
        AnyValue::Float(value)
    }
}

impl From<Vec2> for AnyValue {
    fn from(value: Vec2) -> Self {
        AnyValue::Vec2(value)
    }
}

impl From<Vec3> for AnyValue {
    fn from(value: Vec3) -> Self {
        AnyValue::Vec3(value)
    }
}

impl From<Vec4> for AnyValue {
    fn from(value: Vec4) -> Self {
        AnyValue::Vec4(value)
    }
}

impl From<LinearColor> for AnyValue {
    fn from(value: LinearColor) -> Self {
        AnyValue::Color(value)
    }
}
