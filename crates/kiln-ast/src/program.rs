//! Linear program produced by linking an op graph.

use std::fmt;

use itertools::Itertools;
use smallvec::SmallVec;
use smol_str::SmolStr;

use crate::{
    error::PoolError,
    op::{Op, OpRef, OpType},
    pool::OpPool,
};

/// Position of an instruction in a [`Program`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(u32);

impl Address {
    #[inline]
    pub const fn new(address: u32) -> Self {
        Self(address)
    }

    #[inline]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub op_type: OpType,
    /// Addresses of the op's children, in child order.
    pub args: SmallVec<[Address; 4]>,
    pub op: Op,
}

/// A named entry point of a program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramState {
    pub name: SmolStr,
    pub root: Address,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Program {
    pub instructions: Vec<Instruction>,
    pub states: Vec<ProgramState>,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn instruction(&self, address: Address) -> Option<&Instruction> {
        self.instructions.get(address.get() as usize)
    }

    pub fn state(&self, name: &str) -> Option<&ProgramState> {
        self.states.iter().find(|state| state.name == name)
    }

    /// Appends `root` and everything it depends on, children first.
    ///
    /// Ops linked by an earlier call keep their address, so linking is
    /// idempotent and shared sub-graphs are emitted once.
    pub fn link(&mut self, pool: &OpPool, root: OpRef) -> Result<Address, PoolError> {
        let mut stack = vec![(root, false)];

        while let Some((op_ref, expanded)) = stack.pop() {
            let entry = pool.entry(op_ref)?;
            if entry.linked_address().is_some() {
                continue;
            }

            let children = entry.op.children();
            if !expanded {
                stack.push((op_ref, true));
                for child in children.iter().rev() {
                    if pool.entry(*child)?.linked_address().is_none() {
                        stack.push((*child, false));
                    }
                }
                continue;
            }

            let args = children
                .iter()
                .map(|child| {
                    pool.entry(*child)?
                        .linked_address()
                        .map(Address::new)
                        .ok_or(PoolError::UnknownOp(*child))
                })
                .collect::<Result<SmallVec<[Address; 4]>, _>>()?;

            let address = self.instructions.len() as u32;
            if entry.set_linked_address(address) == address {
                self.instructions.push(Instruction {
                    op_type: entry.op.op_type(),
                    args,
                    op: entry.op.clone(),
                });
            }
        }

        pool.entry(root)?
            .linked_address()
            .map(Address::new)
            .ok_or(PoolError::UnknownOp(root))
    }

    /// Links `root` and registers it as the entry point `name`.
    pub fn add_state(&mut self, pool: &OpPool, name: impl Into<SmolStr>, root: OpRef) -> Result<Address, PoolError> {
        let root = self.link(pool, root)?;
        self.states.push(ProgramState {
            name: name.into(),
            root,
        });
        Ok(root)
    }
}

/// Human-readable listing of a program.
///
/// ```text
/// 0000 BoolConstant
/// 0001 MeshConstant
/// 0002 MeshConditional [0000, 0001]
/// state "Default" -> 0002
/// ```
pub fn dump_program(program: &Program) -> String {
    ProgramDump(program).to_string()
}

struct ProgramDump<'a>(&'a Program);

impl fmt::Display for ProgramDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (address, instruction) in self.0.instructions.iter().enumerate() {
            write!(f, "{} {}", Address::new(address as u32), instruction.op_type)?;
            if !instruction.args.is_empty() {
                write!(f, " [{}]", instruction.args.iter().join(", "))?;
            }
            writeln!(f)?;
        }
        for state in &self.0.states {
            writeln!(f, "state {:?} -> {}", state.name.as_str(), state.root)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::{DataType, ResourceId};

    fn sample_graph(pool: &OpPool) -> OpRef {
        let t = pool.bool_constant(true).unwrap();
        let mesh = pool.intern(Op::MeshConstant { resource: ResourceId(3) }).unwrap();
        pool.intern(Op::Conditional {
            data_type: DataType::Mesh,
            condition: t,
            yes: Some(mesh),
            no: None,
        })
        .unwrap()
    }

    #[test]
    fn test_link_emits_children_first() {
        let pool = OpPool::new();
        let root = sample_graph(&pool);
        let mut program = Program::new();
        let address = program.link(&pool, root).unwrap();

        assert_eq!(address, Address::new(2));
        assert_eq!(program.instructions[2].args.to_vec(), vec![Address::new(0), Address::new(1)]);
    }

    #[test]
    fn test_link_is_idempotent() {
        let pool = OpPool::new();
        let root = sample_graph(&pool);
        let mut program = Program::new();
        let first = program.link(&pool, root).unwrap();
        let second = program.link(&pool, root).unwrap();

        assert_eq!(first, second);
        assert_eq!(program.len(), 3);
    }

    #[test]
    fn test_shared_child_emitted_once() {
        let pool = OpPool::new();
        let p = pool
            .intern(Op::BoolParameter {
                name: "p".into(),
                default: true,
            })
            .unwrap();
        let not = pool.intern(Op::Not { a: p }).unwrap();
        let and = pool.intern(Op::And { a: p, b: not }).unwrap();
        let mut program = Program::new();
        program.link(&pool, and).unwrap();

        assert_eq!(program.len(), 3);
    }

    #[test]
    fn test_dump_program() {
        let pool = OpPool::new();
        let root = sample_graph(&pool);
        let mut program = Program::new();
        program.add_state(&pool, "Default", root).unwrap();

        assert_eq!(
            dump_program(&program),
            "0000 BoolConstant\n0001 MeshConstant\n0002 MeshConditional [0000, 0001]\nstate \"Default\" -> 0002\n"
        );
        assert_eq!(program.state("Default").map(|s| s.root), Some(Address::new(2)));
    }
}
