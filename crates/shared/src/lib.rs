//! 共享库
//!
//! 包含规则引擎各组件共用的配置加载与可观测性（日志、指标）基础设施代码。

pub mod config;
pub mod observability;
