//! 会话标签模块

pub mod api;
pub mod service;

pub use api::LabelApi;
pub use service::LabelManager;
