//! # nbjit - selective JIT compilation for notebook cells
//!
//! A cell is a block of code in which some sub-expressions are marked as
//! **holes**, the values the user iterates on. On first submission the
//! cell is split around its holes, partially evaluated against the known
//! bindings, compiled to native code, and linked into one shared object
//! per compilation unit. On every later submission the session diffs the
//! structural fingerprints and recompiles only the shared objects that
//! actually changed, typically just the hole that was edited.
//!
//! ## Quick start
//!
//! ```no_run
//! use nbjit::{new_session, read_program};
//!
//! let mut session = new_session();
//! let ast = read_program("x = 10\n@hole y = 5\nz = x + y\nreturn z").unwrap();
//! let result = session.run_cell(&ast, "cell-1").unwrap();
//! assert_eq!(result.value, 15);
//!
//! // Editing only the hole recompiles only the hole.
//! let ast = read_program("x = 10\n@hole y = 20\nz = x + y\nreturn z").unwrap();
//! let result = session.run_cell(&ast, "cell-1").unwrap();
//! assert_eq!(result.value, 30);
//! assert!(!result.main_rebuilt);
//! ```
//!
//! ## Architecture
//!
//! A submission flows through the stages once per compilation unit:
//!
//! 1. **Hole rewriter** - recognize hole annotations, compute guard sets
//! 2. **Partial evaluator** - fold everything the bindings decide
//! 3. **IR builder** - lower to Cranelift IR, one exported function
//! 4. **Native backend** - emit an object, link a shared object
//! 5. **Loader / session** - dlopen, invoke, cache by fingerprint
//!
//! Compiled code calls back into the process through a small C-ABI
//! runtime library for boxed values (dictionaries, symbols).

pub mod ast;
pub mod backend;
pub mod codegen;
pub mod error;
pub mod holes;
pub mod loader;
pub mod partial;
pub mod pipeline;
pub mod reader;
pub mod runtime;
pub mod session;

pub use ast::{BinOp, Expr, Literal};
pub use error::NbError;
pub use reader::{read_expr, read_program, ParseError};
pub use session::{new_session, CellClass, CellResult, PureOutcome, Session};
