//! 乐观更新命令
//!
//! 本地状态先于远程确认变更，远程失败时按同一个命令对象回滚。消息发送和标签切换都走
//! 这套接口，保证失败处理方式一致。

/// 可应用、可回滚的本地状态变更
pub trait Optimistic<S> {
    /// 假设远程操作会成功，立即修改本地状态
    fn apply(&mut self, state: &mut S);

    /// 远程操作失败后撤销 `apply` 的效果
    fn revert(&mut self, state: &mut S);
}
