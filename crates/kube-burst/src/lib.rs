pub mod app;
pub mod cgroup;
pub mod config;
pub mod k8s;
pub mod policy;
