//! `kiln-ast` holds the operation DAG of the kiln compiler: a closed vocabulary
//! of ops, a hash-consing pool that deduplicates them, three-valued evaluation
//! of boolean conditions, a semantic optimiser and the linker that flattens a
//! graph into a [`Program`].
//!
//! ## Examples
//!
//! ```rs
//! use kiln_ast::{Op, OpPool, Program, optimise};
//!
//! let pool = OpPool::new();
//! let t = pool.bool_constant(true).unwrap();
//! let not = pool.intern(Op::Not { a: t }).unwrap();
//! let folded = optimise(&pool, not).unwrap();
//! assert_eq!(pool.get(folded).unwrap(), Op::BoolConstant(false));
//!
//! let mut program = Program::new();
//! program.add_state(&pool, "Default", folded).unwrap();
//! println!("{}", kiln_ast::dump_program(&program));
//! ```
mod error;
mod eval;
mod layout;
mod op;
mod optimize;
mod pool;
mod program;

pub use error::PoolError;
pub use eval::{Facts, TriState, evaluate_bool};
pub use layout::{Layout, LayoutBlock, PackStrategy};
pub use op::{
    BlendType, Bits, ClipPlane, DataType, FaceCullStrategy, ImageFormat, Op, OpRef, OpType, RemoveEntry, ResourceId,
};
pub use optimize::{optimise, optimise_semantic};
pub use pool::{OpPool, PoolEntry, structural_hash};
pub use program::{Address, Instruction, Program, ProgramState, dump_program};
