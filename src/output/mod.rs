//! Output formatting

pub mod json;
pub mod text;

pub use json::{write_json_output, write_plan_output};
pub use text::{print_plan, print_summary};
