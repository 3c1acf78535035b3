//! The inbound turn pipeline, from adapter message to delivered reply.

pub mod access_control;
pub mod access_identity;
pub mod backend_errors;
pub mod commands;
pub mod deduper;
pub mod pipeline;
pub mod prompt_execution;
pub mod run_execution;
pub mod session_binding;
pub mod session_factory;
