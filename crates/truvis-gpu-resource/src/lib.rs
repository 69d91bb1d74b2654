//! GPU 资源的生命周期管理
//!
//! - [`resources::pool`]：带 generation 的句柄池，过期句柄不会访问到新的对象
//! - [`commands::submit_ring`]：固定数量的 command buffer 环，每次提交得到一个 [`commands::submit_token::GfxSubmitToken`]
//! - [`resources::deferred_queue`]：等到相关提交完成之后再释放 native 对象
//! - [`staging::staging_ring`]：host -> device 传输使用的环形 staging buffer
//! - [`resource_manager::GfxResourceManager`]：把以上组件组合在一起的对外接口
//!
//! 底层图形 API 通过 [`backend::GfxBackend`] 抽象，测试使用 [`backend::headless`] 在 CPU 上模拟。

pub mod backend;
pub mod commands;
pub mod config;
pub mod error;
pub mod resource_manager;
pub mod resources;
pub mod staging;
