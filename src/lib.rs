pub mod app;
pub mod config;
pub mod definition;
pub mod execution_log;
pub mod handlers;
pub mod hydration;
pub mod orchestration;
pub mod provider;
pub mod shared;
pub mod storage;
