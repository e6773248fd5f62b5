//! Three-valued evaluation of boolean ops.

use std::ops::Not;

use rustc_hash::FxHashMap;
use smol_str::SmolStr;

use crate::{
    error::PoolError,
    op::{Op, OpRef},
    pool::OpPool,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriState {
    True,
    False,
    Unknown,
}

impl From<bool> for TriState {
    fn from(value: bool) -> Self {
        if value { TriState::True } else { TriState::False }
    }
}

impl Not for TriState {
    type Output = TriState;

    fn not(self) -> TriState {
        match self {
            TriState::True => TriState::False,
            TriState::False => TriState::True,
            TriState::Unknown => TriState::Unknown,
        }
    }
}

impl TriState {
    pub fn and(self, other: TriState) -> TriState {
        match (self, other) {
            (TriState::False, _) | (_, TriState::False) => TriState::False,
            (TriState::True, TriState::True) => TriState::True,
            _ => TriState::Unknown,
        }
    }
}

/// Parameter values known during an analysis.
#[derive(Debug, Clone, Default)]
pub struct Facts {
    pub bools: FxHashMap<SmolStr, bool>,
    pub scalars: FxHashMap<SmolStr, i32>,
}

impl Facts {
    pub fn with_bool(mut self, name: impl Into<SmolStr>, value: bool) -> Self {
        self.bools.insert(name.into(), value);
        self
    }

    pub fn with_scalar(mut self, name: impl Into<SmolStr>, value: i32) -> Self {
        self.scalars.insert(name.into(), value);
        self
    }
}

/// Evaluates the boolean op `op_ref` under `facts`.
///
/// `cache` memoizes results per node and must only be reused across calls
/// with the same `facts`.
pub fn evaluate_bool(
    pool: &OpPool,
    op_ref: OpRef,
    facts: &Facts,
    cache: &mut FxHashMap<OpRef, TriState>,
) -> Result<TriState, PoolError> {
    if let Some(result) = cache.get(&op_ref) {
        return Ok(*result);
    }

    let result = match pool.get(op_ref)? {
        Op::BoolConstant(value) => value.into(),
        Op::BoolParameter { name, .. } => facts
            .bools
            .get(&name)
            .map_or(TriState::Unknown, |value| (*value).into()),
        Op::Not { a } => !evaluate_bool(pool, a, facts, cache)?,
        Op::And { a, b } => {
            let a = evaluate_bool(pool, a, facts, cache)?;
            if a == TriState::False {
                TriState::False
            } else {
                a.and(evaluate_bool(pool, b, facts, cache)?)
            }
        }
        Op::EqualScalarConst { value, constant } => match pool.get(value)? {
            Op::ScalarConstant(scalar) => (scalar.0 as i32 == constant).into(),
            Op::ScalarParameter { name, .. } => facts
                .scalars
                .get(&name)
                .map_or(TriState::Unknown, |value| (*value == constant).into()),
            _ => TriState::Unknown,
        },
        _ => TriState::Unknown,
    };

    cache.insert(op_ref, result);
    Ok(result)
}
