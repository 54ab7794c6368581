pub mod config;
pub mod mem_system;
pub mod perf_log;
pub mod sparse_mem;
pub mod top;
pub mod traffic;
