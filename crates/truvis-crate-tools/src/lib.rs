//! Truvis 工具集
//!
//! 目前只包含日志初始化，供各个 binary 在启动时调用。

pub mod init_log;
