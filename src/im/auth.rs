//! 登录 / 注册
//!
//! 演示环境不下发真实验证码，固定使用 [`DEMO_OTP`]。登录成功后把用户写入本地会话。

use crate::im::error::{ChatError, ChatResult};
use crate::im::gateway::Gateway;
use crate::im::session::SessionStore;
use crate::im::types::User;
use crate::im::user::{normalize_phone, UserApi};
use std::sync::Arc;
use tracing::{info, warn};

/// 演示用固定验证码
pub const DEMO_OTP: &str = "123456";

/// 手机号位数（不含区号）
const MOBILE_DIGITS: usize = 10;

/// 校验本地手机号：必须是 10 位数字
pub fn validate_mobile(mobile: &str) -> ChatResult<()> {
    if mobile.len() == MOBILE_DIGITS && mobile.chars().all(|c| c.is_ascii_digit()) {
        Ok(())
    } else {
        Err(ChatError::Validation("请输入 10 位手机号".to_string()))
    }
}

fn validate_otp(otp: &str) -> ChatResult<()> {
    if otp.trim() == DEMO_OTP {
        Ok(())
    } else {
        Err(ChatError::Validation("验证码错误".to_string()))
    }
}

/// 认证服务
pub struct AuthService {
    users: UserApi,
    sessions: SessionStore,
    phone_prefix: String,
}

impl AuthService {
    pub fn new(gateway: Arc<dyn Gateway>, sessions: SessionStore, phone_prefix: &str) -> Self {
        Self {
            users: UserApi::new(gateway),
            sessions,
            phone_prefix: phone_prefix.to_string(),
        }
    }

    /// 登录：用户必须已注册
    pub async fn sign_in(&self, mobile: &str, otp: &str) -> ChatResult<User> {
        validate_mobile(mobile)?;
        validate_otp(otp)?;

        let number = normalize_phone(&self.phone_prefix, mobile);
        info!("[Auth] 🔐 正在登录: {}", number);
        let user = match self.users.resolve_by_phone(&number).await {
            Ok(user) => user,
            Err(ChatError::NotFound(_)) => {
                warn!("[Auth] 手机号未注册: {}", number);
                return Err(ChatError::NotFound("请先注册".to_string()));
            }
            Err(e) => return Err(e),
        };

        self.sessions.save(&user).await?;
        info!("[Auth] ✅ 登录成功，用户ID: {}", user.id);
        Ok(user)
    }

    /// 注册：手机号不能重复，昵称不能为空
    pub async fn sign_up(&self, mobile: &str, otp: &str, full_name: &str) -> ChatResult<User> {
        validate_mobile(mobile)?;
        validate_otp(otp)?;
        let full_name = full_name.trim();
        if full_name.is_empty() {
            return Err(ChatError::Validation("请输入姓名".to_string()));
        }

        let number = normalize_phone(&self.phone_prefix, mobile);
        if !self.users.find_by_phone(&number).await?.is_empty() {
            return Err(ChatError::AlreadyExists(
                "该手机号已注册".to_string(),
            ));
        }

        let avatar_url = format!(
            "https://api.dicebear.com/7.x/avataaars/svg?seed={}",
            chrono::Utc::now().timestamp_millis()
        );
        let user = self
            .users
            .create_user(&number, full_name, &avatar_url)
            .await?;
        self.sessions.save(&user).await?;
        info!("[Auth] ✅ 注册成功，用户ID: {}", user.id);
        Ok(user)
    }
}
