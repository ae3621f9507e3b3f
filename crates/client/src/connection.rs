//! 客户端自动连接策略
//!
//! 纯函数决策：上次连接过的设备重新出现就重连；只有一个
//! 候选就自动连接；否则交给用户选择。连接建立后发现循环
//! 继续以更慢的节奏运行，以便观察Worker侧服务列表的变化。

use relay_domain::entities::DeviceAnnouncement;

/// 自动连接决策
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectDecision {
    /// 重连到之前的设备
    Reconnect(String),
    /// 唯一候选，自动连接
    AutoConnect(String),
    /// 多个候选，需要用户选择
    NeedsSelection(Vec<String>),
    /// 没有可用设备
    NoDevices,
}

/// 根据发现结果决定连接目标
pub fn choose_device(
    previous_device_id: Option<&str>,
    candidates: &[DeviceAnnouncement],
) -> ConnectDecision {
    if candidates.is_empty() {
        return ConnectDecision::NoDevices;
    }
    if let Some(previous) = previous_device_id {
        if candidates.iter().any(|ann| ann.device_id == previous) {
            return ConnectDecision::Reconnect(previous.to_string());
        }
    }
    if candidates.len() == 1 {
        return ConnectDecision::AutoConnect(candidates[0].device_id.clone());
    }
    ConnectDecision::NeedsSelection(
        candidates
            .iter()
            .map(|ann| ann.device_id.clone())
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use relay_domain::entities::DeviceKind;

    use super::*;

    fn ann(device_id: &str) -> DeviceAnnouncement {
        DeviceAnnouncement {
            device_id: device_id.to_string(),
            device_name: device_id.to_string(),
            device_kind: DeviceKind::Desktop,
            services: vec![],
            last_seen_at: Utc::now(),
            is_active: true,
        }
    }

    #[test]
    fn test_no_devices() {
        assert_eq!(choose_device(None, &[]), ConnectDecision::NoDevices);
        // 之前连过的设备也救不了空列表
        assert_eq!(choose_device(Some("a"), &[]), ConnectDecision::NoDevices);
    }

    #[test]
    fn test_previous_device_wins() {
        let candidates = vec![ann("a"), ann("b")];
        assert_eq!(
            choose_device(Some("b"), &candidates),
            ConnectDecision::Reconnect("b".to_string())
        );
    }

    #[test]
    fn test_single_candidate_auto_connects() {
        let candidates = vec![ann("a")];
        assert_eq!(
            choose_device(None, &candidates),
            ConnectDecision::AutoConnect("a".to_string())
        );
        // 之前的设备不在线时，唯一候选照样自动连接
        assert_eq!(
            choose_device(Some("gone"), &candidates),
            ConnectDecision::AutoConnect("a".to_string())
        );
    }

    #[test]
    fn test_multiple_candidates_need_selection() {
        let candidates = vec![ann("a"), ann("b")];
        assert_eq!(
            choose_device(None, &candidates),
            ConnectDecision::NeedsSelection(vec!["a".to_string(), "b".to_string()])
        );
    }
}
