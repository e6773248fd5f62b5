//! Semantic simplification of interned op graphs.

use rustc_hash::FxHashMap;

use crate::{
    error::PoolError,
    op::{Op, OpRef},
    pool::OpPool,
};

/// Returns a cheaper op equivalent to `op_ref`, or `None` if no rule applies.
///
/// Replacements are always new or existing interned ops; `op_ref` itself is
/// never modified.
pub fn optimise_semantic(pool: &OpPool, op_ref: OpRef) -> Result<Option<OpRef>, PoolError> {
    let replacement = match pool.get(op_ref)? {
        Op::Not { a } => match pool.get(a)? {
            Op::BoolConstant(value) => Some(pool.bool_constant(!value)?),
            Op::Not { a: inner } => Some(inner),
            _ => None,
        },
        Op::And { a, b } if a == b => Some(a),
        Op::And { a, b } => {
            match (
                pool.get(a)?.as_bool_constant(),
                pool.get(b)?.as_bool_constant(),
            ) {
                (Some(false), _) => Some(a),
                (_, Some(false)) => Some(b),
                (Some(true), _) => Some(b),
                (_, Some(true)) => Some(a),
                _ => None,
            }
        }
        Op::Conditional { yes, no, .. } if yes.is_some() && yes == no => yes,
        Op::Conditional {
            condition, yes, no, ..
        } => match pool.get(condition)?.as_bool_constant() {
            Some(true) => yes,
            Some(false) => no,
            None => None,
        },
        Op::LayoutMerge { base: None, added } => Some(added),
        Op::MeshMerge { base: None, added, .. } => Some(added),
        Op::ImageMipmap { source, levels } => match pool.get(source)? {
            Op::ImageMipmap {
                levels: inner_levels,
                ..
            } if inner_levels == levels => Some(source),
            _ => None,
        },
        _ => None,
    };

    Ok(replacement.filter(|replacement| *replacement != op_ref))
}

/// Rebuilds the graph under `root` bottom-up until no rule applies anywhere.
pub fn optimise(pool: &OpPool, root: OpRef) -> Result<OpRef, PoolError> {
    let mut current = root;
    loop {
        let next = optimise_pass(pool, current)?;
        if next == current {
            return Ok(current);
        }
        tracing::debug!(from = %current, to = %next, "Optimisation pass changed root");
        current = next;
    }
}

fn optimise_pass(pool: &OpPool, root: OpRef) -> Result<OpRef, PoolError> {
    let mut rewritten: FxHashMap<OpRef, OpRef> = FxHashMap::default();
    let mut stack = vec![(root, false)];

    while let Some((op_ref, expanded)) = stack.pop() {
        if rewritten.contains_key(&op_ref) {
            continue;
        }

        let op = pool.get(op_ref)?;
        if !expanded {
            stack.push((op_ref, true));
            stack.extend(
                op.children()
                    .into_iter()
                    .filter(|child| !rewritten.contains_key(child))
                    .map(|child| (child, false)),
            );
            continue;
        }

        let rebuilt = op.with_children(|child| rewritten.get(&child).copied().unwrap_or(child));
        let mut current = if rebuilt == op {
            op_ref
        } else {
            pool.intern(rebuilt)?
        };
        while let Some(next) = optimise_semantic(pool, current)? {
            current = next;
        }
        rewritten.insert(op_ref, current);
    }

    Ok(rewritten.get(&root).copied().unwrap_or(root))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        layout::{Layout, PackStrategy},
        op::{DataType, ResourceId},
    };
    use smol_str::SmolStr;

    fn parameter(pool: &OpPool, name: &str) -> OpRef {
        pool.intern(Op::BoolParameter {
            name: SmolStr::new(name),
            default: false,
        })
        .unwrap()
    }

    #[test]
    fn test_not_constant_folds() {
        let pool = OpPool::new();
        let t = pool.bool_constant(true).unwrap();
        let not = pool.intern(Op::Not { a: t }).unwrap();
        let f = pool.bool_constant(false).unwrap();
        assert_eq!(optimise_semantic(&pool, not).unwrap(), Some(f));
    }

    #[test]
    fn test_double_negation() {
        let pool = OpPool::new();
        let p = parameter(&pool, "p");
        let not = pool.intern(Op::Not { a: p }).unwrap();
        let not_not = pool.intern(Op::Not { a: not }).unwrap();
        assert_eq!(optimise(&pool, not_not).unwrap(), p);
    }

    #[test]
    fn test_and_with_constants() {
        let pool = OpPool::new();
        let p = parameter(&pool, "p");
        let t = pool.bool_constant(true).unwrap();
        let f = pool.bool_constant(false).unwrap();
        let with_true = pool.intern(Op::And { a: t, b: p }).unwrap();
        let with_false = pool.intern(Op::And { a: p, b: f }).unwrap();
        let same = pool.intern(Op::And { a: p, b: p }).unwrap();

        assert_eq!(optimise(&pool, with_true).unwrap(), p);
        assert_eq!(optimise(&pool, with_false).unwrap(), f);
        assert_eq!(optimise(&pool, same).unwrap(), p);
    }

    #[test]
    fn test_nested_rewrite_reaches_fixed_point() {
        let pool = OpPool::new();
        let p = parameter(&pool, "p");
        let t = pool.bool_constant(true).unwrap();
        let not_t = pool.intern(Op::Not { a: t }).unwrap();
        let not_not_t = pool.intern(Op::Not { a: not_t }).unwrap();
        let and = pool.intern(Op::And { a: not_not_t, b: p }).unwrap();
        let mesh = pool.intern(Op::MeshConstant { resource: ResourceId(1) }).unwrap();
        let cond = pool
            .intern(Op::Conditional {
                data_type: DataType::Mesh,
                condition: and,
                yes: Some(mesh),
                no: None,
            })
            .unwrap();

        let optimised = optimise(&pool, cond).unwrap();
        assert_eq!(
            pool.get(optimised).unwrap(),
            Op::Conditional {
                data_type: DataType::Mesh,
                condition: p,
                yes: Some(mesh),
                no: None,
            }
        );
    }

    #[test]
    fn test_conditional_collapses() {
        let pool = OpPool::new();
        let p = parameter(&pool, "p");
        let f = pool.bool_constant(false).unwrap();
        let a = pool.intern(Op::MeshConstant { resource: ResourceId(1) }).unwrap();
        let b = pool.intern(Op::MeshConstant { resource: ResourceId(2) }).unwrap();

        let constant = pool
            .intern(Op::Conditional {
                data_type: DataType::Mesh,
                condition: f,
                yes: Some(a),
                no: Some(b),
            })
            .unwrap();
        let same_branches = pool
            .intern(Op::Conditional {
                data_type: DataType::Mesh,
                condition: p,
                yes: Some(a),
                no: Some(a),
            })
            .unwrap();
        let empty_branch = pool
            .intern(Op::Conditional {
                data_type: DataType::Mesh,
                condition: f,
                yes: Some(a),
                no: None,
            })
            .unwrap();

        assert_eq!(optimise(&pool, constant).unwrap(), b);
        assert_eq!(optimise(&pool, same_branches).unwrap(), a);
        assert_eq!(optimise(&pool, empty_branch).unwrap(), empty_branch);
    }

    #[test]
    fn test_merge_without_base() {
        let pool = OpPool::new();
        let layout = pool
            .intern(Op::LayoutConstant(Arc::new(Layout::new([4, 4], PackStrategy::Fixed))))
            .unwrap();
        let merge = pool.intern(Op::LayoutMerge { base: None, added: layout }).unwrap();
        assert_eq!(optimise(&pool, merge).unwrap(), layout);
    }
}
