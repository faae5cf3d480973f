//! Hive - Rust 智能体任务编排核心
//!
//! 模块划分：
//! - **agent**: 计划值类型、规划器（创建 / 细化 / 反思）、计划执行器、任务事件
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类与恢复、任务取消注册表、优雅关闭
//! - **engine**: 任务生命周期引擎、关系持久化、归档、调度工作池、维护循环、健康报告
//! - **llm**: 推理能力抽象与实现（OpenAI 兼容 / Mock）、重试包装、向量嵌入
//! - **memory**: 双层记忆（KV 短期层 + 向量长期层）、批量写入、Agent 记忆、上下文组装
//! - **observability**: tracing 初始化
//! - **tools**: 工具注册表与执行器

pub mod agent;
pub mod config;
pub mod core;
pub mod engine;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod tools;
