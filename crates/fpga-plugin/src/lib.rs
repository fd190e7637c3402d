//! Node daemon for FPGA regions: discovers regions, advertises them to
//! kubelet as extended resources and reprograms them on allocation.

pub mod allocator;
pub mod app;
pub mod app_builder;
pub mod config;
pub mod device_plugin;
pub mod inventory;
pub mod lease_reconciler;
pub mod pod_lookup;
pub mod reprogram;
pub mod scanner;
