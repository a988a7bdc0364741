//! 内容域同步服务
//!
//! 每个内容域一个文件：域自己的离线记录类型、服务端接口边界和同步
//! 服务。所有服务都实现 [`crate::sync::scheduler::SyncAgent`]，由站点
//! 调度器统一驱动。

pub mod assign;
pub mod forum;
pub mod glossary;
pub mod wiki;
pub mod workshop;
