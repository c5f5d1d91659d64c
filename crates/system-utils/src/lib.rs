pub mod process;
pub mod ssh;
