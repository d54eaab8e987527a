//! Lazy computation graph.
//!
//! - [`Variable`]: handle to one logical value.
//! - [`Node`]: one recorded operation with its backward retention flags.
//! - [`Tape`]: append-only recorder; closes evaluation [`Region`]s.
//! - [`Graph`]: a recorded function body (leaf function or closure).

mod function;
mod node;
mod tape;
mod variable;

pub use function::{Capture, Graph, GraphId, GraphKind};
pub use node::{Node, NodeId};
pub use tape::{Region, Tape};
pub use variable::{Origin, VarId, VarType, Variable};
