//! 学生处理上下文
//!
//! 封装"我正在处理哪个作业的哪个学号"这一信息，主要用于日志前缀

use std::fmt::Display;

use crate::models::StudentQueueEntry;

/// 学生处理上下文
#[derive(Debug, Clone)]
pub struct StudentCtx {
    /// 作业ID
    pub job_id: String,

    /// 学号
    pub roll_number: String,

    /// 试卷ID
    pub question_paper_id: String,
}

impl StudentCtx {
    pub fn new(job_id: String, roll_number: String, question_paper_id: String) -> Self {
        Self {
            job_id,
            roll_number,
            question_paper_id,
        }
    }
}

impl From<&StudentQueueEntry> for StudentCtx {
    fn from(entry: &StudentQueueEntry) -> Self {
        Self::new(
            entry.job_id.clone(),
            entry.roll_number.clone(),
            entry.question_paper_id.clone(),
        )
    }
}

impl Display for StudentCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[作业 {} 学号 {}]", self.job_id, self.roll_number)
    }
}
