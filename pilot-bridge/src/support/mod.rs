pub mod constants;
pub mod reporting;
pub mod text;
