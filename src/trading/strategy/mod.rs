pub mod engine;
pub mod oracle;
pub mod state;
pub mod store;
