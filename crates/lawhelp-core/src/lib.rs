pub mod chat;
pub mod completion;
pub mod config;
pub mod db;
pub mod drafting;
pub mod extract;
pub mod fallback;
pub mod jurisdiction;
pub mod pdf;
pub mod session;
pub mod signing;
pub mod storage;
pub mod types;

pub use types::*;
