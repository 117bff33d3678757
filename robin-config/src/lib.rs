//! Config synthesizer: a pure function turning a normalized,
//! sorted list of `ServiceRegistration`s into haproxy's textual
//! configuration. No templating engine: sections are assembled with
//! `std::fmt::Write` and concatenated in a fixed order, the same
//! "assemble typed sections, concatenate deterministically" shape used
//! to build a config from an AST.

pub mod error;
pub mod options;
pub mod render;

pub use error::{RenderError, Result};
pub use options::RenderOptions;
pub use render::render;
