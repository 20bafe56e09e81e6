pub mod cursor;
pub mod mailbox;
pub mod parser;
pub mod poller;
pub mod security;
pub mod store;
