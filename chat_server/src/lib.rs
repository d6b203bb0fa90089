pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod fanout;
pub mod handler;
pub mod outbox;
pub mod presence;
pub mod registry;
pub mod store;
