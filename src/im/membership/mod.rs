//! 会话成员模块

pub mod service;

pub use service::MembershipManager;
