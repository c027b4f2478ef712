//! 作业统计（派生数据，定期重算，以作业表计数为准）

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::stage::Stage;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineMetrics {
    pub job_id: String,
    pub total_students: i32,
    pub completed: i32,
    pub failed: i32,
    /// 已完成学生从入队到评分完成的平均耗时（秒）
    pub avg_total_time: f64,
    pub avg_extract_time: Option<f64>,
    pub avg_chunk_time: Option<f64>,
    pub avg_map_time: Option<f64>,
    pub avg_grade_time: Option<f64>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineMetrics {
    pub fn stage_average(&self, stage: Stage) -> Option<f64> {
        match stage {
            Stage::Extract => self.avg_extract_time,
            Stage::Chunk => self.avg_chunk_time,
            Stage::Map => self.avg_map_time,
            Stage::Grade => self.avg_grade_time,
        }
    }

    pub fn completion_rate(&self) -> f64 {
        if self.total_students > 0 {
            (self.completed as f64 / self.total_students as f64 * 1000.0).round() / 10.0
        } else {
            0.0
        }
    }
}
