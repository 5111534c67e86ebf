//! Command-line helpers shared by the workspace binaries.

mod color;

pub use color::ColorWhen;
