use std::sync::Arc;

use dashmap::DashMap;
use glam::Vec4;
use kiln_ast::{Bits, ImageFormat, Op, OpPool, OpRef, PoolError, optimise_semantic};

use crate::{
    error::{ErrorLog, MessageKind, Severity},
    node::{NodeBool, NodeColor, NodeImage, NodeScalar, node_id},
};

/// Lowers value nodes (bools, scalars, colors, images) to interned ops,
/// caching the result per node.
#[derive(Debug)]
pub(crate) struct Lowering {
    pub pool: Arc<OpPool>,
    pub log: Arc<ErrorLog>,
    bools: DashMap<usize, OpRef>,
    scalars: DashMap<usize, OpRef>,
    colors: DashMap<usize, OpRef>,
    images: DashMap<usize, OpRef>,
}

impl Lowering {
    pub fn new(pool: Arc<OpPool>, log: Arc<ErrorLog>) -> Self {
        Self {
            pool,
            log,
            bools: DashMap::new(),
            scalars: DashMap::new(),
            colors: DashMap::new(),
            images: DashMap::new(),
        }
    }

    pub fn intern(&self, op: Op) -> Result<OpRef, PoolError> {
        self.pool.intern(op)
    }

    /// Interns `op` and applies semantic rules until none matches.
    pub fn simplified(&self, op: Op) -> Result<OpRef, PoolError> {
        let mut current = self.pool.intern(op)?;
        while let Some(next) = optimise_semantic(&self.pool, current)? {
            current = next;
        }
        Ok(current)
    }

    pub fn and(&self, a: OpRef, b: OpRef) -> Result<OpRef, PoolError> {
        self.simplified(Op::And { a, b })
    }

    pub fn not(&self, a: OpRef) -> Result<OpRef, PoolError> {
        self.simplified(Op::Not { a })
    }

    /// `a OR b` written as `NOT(NOT a AND NOT b)`.
    pub fn or(&self, a: OpRef, b: OpRef) -> Result<OpRef, PoolError> {
        let not_a = self.not(a)?;
        let not_b = self.not(b)?;
        let both = self.and(not_a, not_b)?;
        self.not(both)
    }

    /// Conjunction of two optional conditions, where `None` means always.
    pub fn and_optional(&self, a: Option<OpRef>, b: Option<OpRef>) -> Result<Option<OpRef>, PoolError> {
        match (a, b) {
            (Some(a), Some(b)) => self.and(a, b).map(Some),
            (a, None) => Ok(a),
            (None, b) => Ok(b),
        }
    }

    fn missing(&self, what: &str, context: Option<&str>) {
        self.log.add(
            Severity::Error,
            MessageKind::MissingConnection,
            format!("Required connection not found: {what}"),
            context,
        );
    }

    pub fn missing_bool(&self, what: &str, value: bool, context: Option<&str>) -> Result<OpRef, PoolError> {
        self.missing(what, context);
        self.pool.bool_constant(value)
    }

    pub fn missing_scalar(&self, what: &str, value: f32, context: Option<&str>) -> Result<OpRef, PoolError> {
        self.missing(what, context);
        self.pool.intern(Op::scalar(value))
    }

    pub fn missing_image(&self, what: &str, context: Option<&str>) -> Result<OpRef, PoolError> {
        self.missing(what, context);
        self.plain_image([4, 4], ImageFormat::Rgba8)
    }

    pub fn plain_image(&self, size: [u16; 2], format: ImageFormat) -> Result<OpRef, PoolError> {
        let color = self.pool.intern(Op::color(Vec4::ZERO))?;
        self.pool.intern(Op::ImagePlainColor { color, size, format })
    }

    pub fn bool(&self, node: &Arc<NodeBool>) -> Result<OpRef, PoolError> {
        let key = node_id(node);
        if let Some(op) = self.bools.get(&key) {
            return Ok(*op);
        }

        let op = match node.as_ref() {
            NodeBool::Constant(value) => self.pool.bool_constant(*value)?,
            NodeBool::Parameter { name, default } => self.intern(Op::BoolParameter {
                name: name.clone(),
                default: *default,
            })?,
            NodeBool::Not(source) => {
                let a = match source {
                    Some(source) => self.bool(source)?,
                    None => self.missing_bool("bool not source", true, None)?,
                };
                self.intern(Op::Not { a })?
            }
            NodeBool::And(a, b) => {
                let a = match a {
                    Some(a) => self.bool(a)?,
                    None => self.missing_bool("bool and first operand", true, None)?,
                };
                let b = match b {
                    Some(b) => self.bool(b)?,
                    None => self.missing_bool("bool and second operand", true, None)?,
                };
                self.intern(Op::And { a, b })?
            }
        };

        Ok(*self.bools.entry(key).or_insert(op))
    }

    pub fn scalar(&self, node: &Arc<NodeScalar>) -> Result<OpRef, PoolError> {
        let key = node_id(node);
        if let Some(op) = self.scalars.get(&key) {
            return Ok(*op);
        }

        let op = match node.as_ref() {
            NodeScalar::Constant(value) => self.intern(Op::scalar(*value))?,
            NodeScalar::Parameter { name, default } => self.intern(Op::ScalarParameter {
                name: name.clone(),
                default: Bits(*default),
            })?,
        };

        Ok(*self.scalars.entry(key).or_insert(op))
    }

    pub fn color(&self, node: &Arc<NodeColor>) -> Result<OpRef, PoolError> {
        let key = node_id(node);
        if let Some(op) = self.colors.get(&key) {
            return Ok(*op);
        }

        let op = match node.as_ref() {
            NodeColor::Constant(value) => self.intern(Op::color(*value))?,
            NodeColor::Parameter { name, default } => self.intern(Op::ColorParameter {
                name: name.clone(),
                default: Bits(*default),
            })?,
        };

        Ok(*self.colors.entry(key).or_insert(op))
    }

    pub fn image(&self, node: &Arc<NodeImage>) -> Result<OpRef, PoolError> {
        let key = node_id(node);
        if let Some(op) = self.images.get(&key) {
            return Ok(*op);
        }

        let op = match node.as_ref() {
            NodeImage::Constant { resource, .. } => self.intern(Op::ImageConstant { resource: *resource })?,
            NodeImage::Mipmap { source, levels } => {
                let source = self.required_image(source, "mipmap source")?;
                self.intern(Op::ImageMipmap {
                    source,
                    levels: *levels,
                })?
            }
            NodeImage::PixelFormat { source, format } => {
                let source = self.required_image(source, "pixel format source")?;
                self.intern(Op::ImagePixelFormat {
                    source,
                    format: *format,
                })?
            }
            NodeImage::Swizzle {
                sources,
                channels,
                format,
            } => {
                let mut ops = [None; 4];
                for (op, source) in ops.iter_mut().zip(sources) {
                    if let Some(source) = source {
                        *op = Some(self.image(source)?);
                    }
                }
                if ops.iter().all(Option::is_none) {
                    ops[0] = Some(self.missing_image("swizzle source", None)?);
                }
                self.intern(Op::ImageSwizzle {
                    sources: ops,
                    channels: *channels,
                    format: *format,
                })?
            }
            NodeImage::Layer {
                base,
                blended,
                mask,
                blend,
            } => {
                let base = self.required_image(base, "layer base")?;
                let blended = self.required_image(blended, "layer blended image")?;
                let mask = mask.as_ref().map(|mask| self.image(mask)).transpose()?;
                self.intern(Op::ImageLayer {
                    base,
                    blended,
                    mask,
                    blend: *blend,
                })?
            }
        };

        Ok(*self.images.entry(key).or_insert(op))
    }

    fn required_image(&self, node: &Option<Arc<NodeImage>>, what: &str) -> Result<OpRef, PoolError> {
        match node {
            Some(node) => self.image(node),
            None => self.missing_image(what, None),
        }
    }
}
