use std::sync::Arc;

use itertools::Itertools;
use kiln_ast::{Address, OpPool, OpRef, Program, optimise};

use crate::{
    error::{CodegenError, CodegenMessage, Severity},
    generator::CodeGenerator,
    node::{NodeObject, ObjectState},
    options::CodegenOptions,
};

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledState {
    pub state: ObjectState,
    pub root: Option<OpRef>,
    /// Entry point in the program; `None` for a state that produced nothing.
    pub address: Option<Address>,
}

/// Result of compiling one object: the op pool, the linked program and every
/// content message raised along the way.
#[derive(Debug)]
pub struct CompiledObject {
    pub pool: Arc<OpPool>,
    pub program: Program,
    pub states: Vec<CompiledState>,
    pub messages: Vec<CodegenMessage>,
}

impl CompiledObject {
    pub fn state(&self, name: &str) -> Option<&CompiledState> {
        self.states.iter().find(|state| state.state.name == name)
    }

    pub fn has_errors(&self) -> bool {
        self.messages.iter().any(|message| message.severity == Severity::Error)
    }
}

pub struct Compiler {
    options: CodegenOptions,
    wait_callback: Option<Box<dyn FnMut()>>,
}

impl std::fmt::Debug for Compiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compiler")
            .field("options", &self.options)
            .field("wait_callback", &self.wait_callback.is_some())
            .finish()
    }
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new(CodegenOptions::default())
    }
}

impl Compiler {
    pub fn new(options: CodegenOptions) -> Self {
        Self {
            options,
            wait_callback: None,
        }
    }

    /// See [`CodeGenerator::with_wait_callback`].
    pub fn with_wait_callback(mut self, callback: impl FnMut() + 'static) -> Self {
        self.wait_callback = Some(Box::new(callback));
        self
    }

    /// Generates every state of `root`, optimises the state roots when
    /// enabled and links them into one program.
    pub fn compile(self, root: &Arc<NodeObject>) -> Result<CompiledObject, CodegenError> {
        let optimize = self.options.optimize;
        let mut generator = CodeGenerator::new(self.options)?;
        if let Some(callback) = self.wait_callback {
            generator = generator.with_wait_callback(callback);
        }

        let generated = generator.generate_root(root)?.to_vec();
        let pool = Arc::clone(generator.pool());

        let mut program = Program::new();
        let mut states = Vec::with_capacity(generated.len());
        for generated_state in generated {
            let root = match generated_state.root {
                Some(root) if optimize => Some(optimise(&pool, root)?),
                root => root,
            };
            let address = match root {
                Some(root) => Some(program.add_state(&pool, generated_state.state.name.clone(), root)?),
                None => None,
            };
            states.push(CompiledState {
                state: generated_state.state,
                root,
                address,
            });
        }

        let messages = generator.log().messages();
        let severities = messages.iter().counts_by(|message| message.severity);
        tracing::info!(
            object = root.name(),
            states = states.len(),
            instructions = program.len(),
            errors = severities.get(&Severity::Error).copied().unwrap_or(0),
            warnings = severities.get(&Severity::Warning).copied().unwrap_or(0),
            "Compiled object"
        );

        Ok(CompiledObject {
            pool,
            program,
            states,
            messages,
        })
    }
}
