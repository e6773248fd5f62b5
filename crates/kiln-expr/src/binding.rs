//! Sequential writer/reader used to fill shader parameter buffers.

use std::mem::{align_of, size_of};

use bytemuck::Pod;
use glam::{Mat4, Vec3};

use crate::{
    error::{BindingError, BufferKind},
    parameters::WORD_SIZE,
    range::ValueRange,
    value::ExprValue,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaleBias<T> {
    pub scale: T,
    pub bias: T,
}

#[inline]
fn align_up(offset: usize, align: usize) -> usize {
    offset.next_multiple_of(align)
}

fn checked_span(
    buffer: BufferKind,
    offset: usize,
    size: usize,
    capacity: usize,
) -> Result<std::ops::Range<usize>, BindingError> {
    match offset.checked_add(size) {
        Some(end) if end <= capacity => Ok(offset..end),
        _ => Err(BindingError::OutOfBounds {
            buffer,
            offset,
            size,
            capacity,
        }),
    }
}

/// Writes parameters into `output` and reads authored data from `input`.
///
/// Both cursors align to the accessed type before advancing by its size.
/// A context is not meant to be shared between threads.
pub struct BindingContext<'a> {
    output: &'a mut [u8],
    write_cursor: usize,
    input: &'a [u8],
    read_cursor: usize,
    render_parameters: &'a [u32],
}

impl<'a> BindingContext<'a> {
    pub fn new(output: &'a mut [u8], input: &'a [u8], render_parameters: &'a [u32]) -> Self {
        Self {
            output,
            write_cursor: 0,
            input,
            read_cursor: 0,
            render_parameters,
        }
    }

    pub fn write_offset(&self) -> usize {
        self.write_cursor
    }

    pub fn read_offset(&self) -> usize {
        self.read_cursor
    }

    pub fn write<T: Pod>(&mut self, value: T) -> Result<(), BindingError> {
        let offset = align_up(self.write_cursor, align_of::<T>());
        let span = checked_span(BufferKind::Output, offset, size_of::<T>(), self.output.len())?;
        self.output[span.clone()].copy_from_slice(bytemuck::bytes_of(&value));
        self.write_cursor = span.end;
        Ok(())
    }

    pub fn read<T: Pod>(&mut self) -> Result<T, BindingError> {
        let offset = align_up(self.read_cursor, align_of::<T>());
        let span = checked_span(BufferKind::Input, offset, size_of::<T>(), self.input.len())?;
        let value = bytemuck::pod_read_unaligned(&self.input[span.clone()]);
        self.read_cursor = span.end;
        Ok(value)
    }

    /// Reads the render parameter at word `offset`, or returns `default` when
    /// the value is not bound.
    pub fn read_parameter<T: Pod>(&self, offset: Option<u32>, default: T) -> Result<T, BindingError> {
        let Some(word) = offset else {
            return Ok(default);
        };
        let bytes: &[u8] = bytemuck::cast_slice(self.render_parameters);
        let start = word as usize * WORD_SIZE as usize;
        let span = checked_span(BufferKind::RenderParameters, start, size_of::<T>(), bytes.len())?;
        Ok(bytemuck::pod_read_unaligned(&bytes[span]))
    }

    /// A bound parameter replaces `min` and collapses the scale to zero.
    pub fn range_to_scale_bias<T: ExprValue>(
        &self,
        range: &ValueRange<T>,
    ) -> Result<ScaleBias<T>, BindingError> {
        let bias = self.read_parameter(range.parameter_offset, range.min)?;
        let scale = if range.is_bound() {
            T::zero()
        } else {
            range.scale()
        };
        Ok(ScaleBias { scale, bias })
    }

    pub fn range_to_value<T: ExprValue>(&self, range: &ValueRange<T>) -> Result<T, BindingError> {
        self.read_parameter(range.parameter_offset, range.min)
    }

    /// Like [`Self::range_to_scale_bias`] for positions expressed in another
    /// space. The bias is always transformed as a point; the scale only as a
    /// vector and only when unbound.
    pub fn range_to_scale_bias_in_space(
        &self,
        range: &ValueRange<Vec3>,
        transform: &Mat4,
    ) -> Result<ScaleBias<Vec3>, BindingError> {
        let bias = self.read_parameter(range.parameter_offset, range.min)?;
        let scale = if range.is_bound() {
            Vec3::ZERO
        } else {
            transform.transform_vector3(range.scale())
        };
        Ok(ScaleBias {
            scale,
            bias: transform.transform_point3(bias),
        })
    }

    /// Runs `f` to write a nested struct that the host layout places at
    /// `expected_offset`.
    pub fn write_struct<R>(
        &mut self,
        expected_offset: usize,
        align: usize,
        f: impl FnOnce(&mut Self) -> Result<R, BindingError>,
    ) -> Result<R, BindingError> {
        self.write_cursor = align_up(self.write_cursor, align.max(1));
        debug_assert_eq!(
            self.write_cursor, expected_offset,
            "nested struct written at the wrong offset"
        );
        f(self)
    }

    /// Writes `scale` then `bias`.
    pub fn write_range_scale_bias<T: ExprValue>(
        &mut self,
        range: &ValueRange<T>,
    ) -> Result<(), BindingError> {
        let ScaleBias { scale, bias } = self.range_to_scale_bias(range)?;
        self.write(scale)?;
        self.write(bias)
    }

    pub fn write_position_range_scale_bias(
        &mut self,
        range: &ValueRange<Vec3>,
        transform: &Mat4,
    ) -> Result<(), BindingError> {
        let ScaleBias { scale, bias } = self.range_to_scale_bias_in_space(range, transform)?;
        self.write(scale)?;
        self.write(bias)
    }
}
