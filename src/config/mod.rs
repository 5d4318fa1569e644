//! Script configuration.
//!
//! - `script` - document types (`Script`, `Settings`, `Step`, `InstanceSettings`)
//! - `parser` - JSON loading
//! - `validation` - static checks run before any step executes
//! - `duration` - human-readable duration strings

mod duration;
mod parser;
mod script;
mod validation;

pub use duration::*;
pub use parser::*;
pub use script::*;
