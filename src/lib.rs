//! Hive - 编辑器智能助手编排核心
//!
//! 模块划分：
//! - **protocol**: 线上信封、上下文快照、行分隔 JSON 编解码
//! - **transport**: 双向链路（stdio / TCP / 内存）
//! - **correlation**: 请求关联层（挂起表、超时、取消、流式分块）
//! - **supervisor**: 后端进程监管（就绪、探活、退避重启）
//! - **gateway**: 编辑器会话与监管中继
//! - **backend**: 沙箱后端的请求分派与 Provider
//! - **core**: 错误分类、生命周期状态、恢复策略、会话、优雅关闭
//! - **config**: 配置加载（TOML + 环境变量）
//! - **observability**: 日志初始化

pub mod backend;
pub mod config;
pub mod core;
pub mod correlation;
pub mod gateway;
pub mod observability;
pub mod protocol;
pub mod supervisor;
pub mod transport;
