//! Scripted models
//!
//! A scripted model is a flat op program plus a tensor table, detached from
//! the module tree. It is saved as SafeTensors with the program in the
//! header metadata and can be loaded and executed on its own.

mod model;
mod program;


pub use model::{ScriptedModel, FORMAT_KEY, FORMAT_VERSION, PROGRAM_KEY};
pub use program::Op;
