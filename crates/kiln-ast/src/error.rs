use thiserror::Error;

use crate::op::OpRef;

#[derive(Error, Debug, PartialEq, Eq, Clone, Copy)]
pub enum PoolError {
    #[error("Op references child {child} but the pool only holds {len} ops")]
    DanglingChild { child: OpRef, len: usize },
    #[error("Unknown op {0}")]
    UnknownOp(OpRef),
}
