pub mod error;
pub mod memory;
pub mod decode;
pub mod derived;
pub mod history;
pub mod engine;
pub mod run;
pub mod storage;
pub mod config;
pub mod session;
