//! 阶段监管：取消令牌与「同一工作单元同一时刻只跑一个阶段」的租约
//!
//! 持有根 CancellationToken，关闭时取消全部运行中的阶段；每个阶段运行前按
//! (project_id, scene_id) 申请租约，已被占用则返回 StageInProgress。租约随 drop 释放。

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use crate::core::PipelineError;

/// 阶段监管器
#[derive(Debug, Clone, Default)]
pub struct StageSupervisor {
    cancel_token: CancellationToken,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

/// 运行中阶段的租约
#[derive(Debug)]
pub struct StageLease {
    key: String,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl StageLease {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for StageLease {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&self.key);
    }
}

impl StageSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// 创建子 token（用于单个阶段运行）
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }

    /// 触发关闭
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    fn acquire_key(&self, key: String) -> Result<StageLease, PipelineError> {
        if self.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        let mut set = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
        if !set.insert(key.clone()) {
            return Err(PipelineError::StageInProgress { key });
        }
        Ok(StageLease {
            key,
            in_flight: self.in_flight.clone(),
        })
    }

    /// 工作单元级租约
    pub fn acquire(&self, project_id: &str, scene_id: &str) -> Result<StageLease, PipelineError> {
        self.acquire_key(format!("{project_id}/{scene_id}"))
    }

    /// 项目级租约（起草新场景时使用，单元尚不存在）
    pub fn acquire_project(&self, project_id: &str) -> Result<StageLease, PipelineError> {
        self.acquire_key(format!("{project_id}/*drafting"))
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_lease_is_rejected_until_drop() {
        let sup = StageSupervisor::new();
        let lease = sup.acquire("p1", "scene_1").unwrap();
        assert!(matches!(
            sup.acquire("p1", "scene_1"),
            Err(PipelineError::StageInProgress { .. })
        ));
        assert!(sup.acquire("p1", "scene_2").is_ok());
        drop(lease);
        assert!(sup.acquire("p1", "scene_1").is_ok());
        assert_eq!(sup.in_flight_count(), 0);
    }

    #[test]
    fn test_cancelled_supervisor_rejects_new_leases() {
        let sup = StageSupervisor::new();
        let child = sup.child_token();
        sup.cancel();
        assert!(child.is_cancelled());
        assert_eq!(sup.acquire("p", "s").unwrap_err(), PipelineError::Cancelled);
    }
}
