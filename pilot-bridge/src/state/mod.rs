pub mod model_store;
pub mod run_registry;
pub mod run_state;
