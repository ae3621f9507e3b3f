use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 单侧统计信息
///
/// 提交方与处理方各自独立维护，平均耗时按加权滑动方式累积。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelaySideStats {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub average_processing_time_ms: f64,
    pub last_request_at: Option<DateTime<Utc>>,
}

impl RelaySideStats {
    /// 记录一次完成的请求
    pub fn record(&mut self, success: bool, processing_time_ms: u64) {
        self.total += 1;
        if success {
            self.successful += 1;
        } else {
            self.failed += 1;
        }
        let n = self.total as f64;
        self.average_processing_time_ms =
            (self.average_processing_time_ms * (n - 1.0) + processing_time_ms as f64) / n;
        self.last_request_at = Some(Utc::now());
    }

    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.successful as f64 / self.total as f64 * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weighted_average_accumulation() {
        let mut stats = RelaySideStats::default();
        stats.record(true, 100);
        stats.record(true, 300);
        assert_eq!(stats.total, 2);
        assert_eq!(stats.successful, 2);
        assert!((stats.average_processing_time_ms - 200.0).abs() < f64::EPSILON);

        stats.record(false, 500);
        assert_eq!(stats.failed, 1);
        assert!((stats.average_processing_time_ms - 300.0).abs() < f64::EPSILON);
        assert!(stats.last_request_at.is_some());
    }

    #[test]
    fn test_success_rate() {
        let mut stats = RelaySideStats::default();
        assert_eq!(stats.success_rate(), 0.0);
        stats.record(true, 10);
        stats.record(true, 10);
        stats.record(false, 10);
        assert!((stats.success_rate() - 66.666).abs() < 0.01);
    }
}
