//! Relay Link - 推流转发进程监督服务
//!
//! 为每个推流任务维护一个 ffmpeg 子进程，负责启动、停止、更新配置，
//! 并通过周期性健康检查在进程意外退出时自动重启。

pub mod cache;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod health;
pub mod progress;
pub mod state;
pub mod store;
pub mod stream;
pub mod supervisor;
pub mod web;

#[cfg(test)]
mod testing;
