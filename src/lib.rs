pub mod api;
pub mod boot_mode;
pub mod chip;
pub mod image;
pub mod isp;
pub mod operation;
mod operation_runner;
pub mod protocol;
pub mod selector;
pub mod targets;
pub mod transport;

#[cfg(test)]
mod testing;
