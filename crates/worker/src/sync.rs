use chrono::{DateTime, Utc};

use longtask_core::{RowImage, RowPatch};

/// 共享表单行的本地同步状态。
///
/// 三件事：最近读到的远端镜像、尚未提交的本地覆盖层、上次见到的
/// 乐观并发令牌。合并规则：远端令牌变了说明覆盖层基于过期数据，
/// 整体作废、远端为准；令牌没变则刷新不能冲掉还没提交的本地修改。
pub struct SyncedState<R: RowImage> {
    remote: Option<R>,
    pending: R::Patch,
    last_token: Option<DateTime<Utc>>,
    deleted: bool,
}

impl<R: RowImage> SyncedState<R> {
    pub fn new() -> Self {
        Self {
            remote: None,
            pending: R::Patch::default(),
            last_token: None,
            deleted: false,
        }
    }

    pub fn remote(&self) -> Option<&R> {
        self.remote.as_ref()
    }

    pub fn remote_mut(&mut self) -> Option<&mut R> {
        self.remote.as_mut()
    }

    /// 上次见到的令牌。
    pub fn token(&self) -> Option<DateTime<Utc>> {
        self.last_token
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// 标记后备行已不存在。
    pub fn set_deleted(&mut self) {
        self.deleted = true;
        self.remote = None;
        self.pending = R::Patch::default();
    }

    /// 合并新读到的远端镜像。行重新出现时撤销删除标记。
    pub fn set_remote(&mut self, row: R) {
        self.deleted = false;
        if self.last_token != row.change_token() {
            // 令牌前移：本地覆盖层基于过期数据，作废
            self.pending = R::Patch::default();
            self.last_token = row.change_token();
            self.remote = Some(row);
        } else {
            let mut row = row;
            self.pending.apply_to(&mut row);
            self.remote = Some(row);
        }
    }

    /// 暂存一笔本地修改。
    pub fn stage(&mut self, f: impl FnOnce(&mut R::Patch)) {
        f(&mut self.pending);
    }

    pub fn pending(&self) -> &R::Patch {
        &self.pending
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// 条件写成功：覆盖层落到镜像上并清空。
    pub fn committed(&mut self) {
        if let Some(row) = self.remote.as_mut() {
            self.pending.apply_to(row);
        }
        self.pending = R::Patch::default();
    }

    /// 条件写落空：丢弃覆盖层并作废镜像，强迫之后重新读取。
    pub fn conflicted(&mut self) {
        self.pending = R::Patch::default();
        self.remote = None;
    }

    /// 只作废镜像，保留覆盖层不动。
    pub fn invalidate(&mut self) {
        self.remote = None;
    }
}

impl<R: RowImage> Default for SyncedState<R> {
    fn default() -> Self {
        Self::new()
    }
}
