//! 工具层：Tool trait、注册表、带超时与审计日志的执行器

pub mod echo;
pub mod executor;
pub mod registry;

pub use echo::EchoTool;
pub use executor::ToolExecutor;
pub use registry::{Tool, ToolRegistry, ToolResult, ToolSpec};
