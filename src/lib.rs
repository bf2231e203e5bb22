pub mod actions;
pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod fs_util;
pub mod isa;
pub mod jobs;
pub mod maintenance;
pub mod output;
pub mod paths;
pub mod signature;
pub mod storage;
pub mod transfer;
