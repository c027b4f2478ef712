//! 阶段枚举与状态枚举
//!
//! 阶段顺序固定：`discovered → extract → chunk → map → grade → done`

use std::fmt;
use std::str::FromStr;

use phf::phf_map;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, StoreError};

/// 处理阶段（不含作业级的 discovery）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// 文字识别
    Extract,
    /// 语义切分
    Chunk,
    /// 答案与题目对应
    Map,
    /// 评分
    Grade,
}

/// 阶段名（含旧系统的叫法）
static STAGE_NAMES: phf::Map<&'static str, Stage> = phf_map! {
    "extract" => Stage::Extract,
    "ocr" => Stage::Extract,
    "chunk" => Stage::Chunk,
    "chunking" => Stage::Chunk,
    "map" => Stage::Map,
    "qa" => Stage::Map,
    "grade" => Stage::Grade,
    "grading" => Stage::Grade,
};

impl Stage {
    /// 按处理顺序排列的全部阶段
    pub const ALL: [Stage; 4] = [Stage::Extract, Stage::Chunk, Stage::Map, Stage::Grade];

    /// 标准名称
    pub fn name(self) -> &'static str {
        match self {
            Stage::Extract => "extract",
            Stage::Chunk => "chunk",
            Stage::Map => "map",
            Stage::Grade => "grade",
        }
    }

    /// 在顺序中的位置（从 0 开始）
    pub fn index(self) -> usize {
        self as usize
    }

    /// 下一个阶段；最后一个阶段返回 None
    pub fn next(self) -> Option<Stage> {
        Stage::ALL.get(self.index() + 1).copied()
    }

    /// 从名称解析阶段（忽略大小写）
    pub fn parse(s: &str) -> Option<Stage> {
        STAGE_NAMES.get(s.trim().to_lowercase().as_str()).copied()
    }

    pub fn pending_state(self) -> CurrentStage {
        CurrentStage::of(self, StageStatus::Pending)
    }

    pub fn processing_state(self) -> CurrentStage {
        CurrentStage::of(self, StageStatus::Processing)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Stage {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::parse(s).ok_or_else(|| PipelineError::UnknownStage(s.to_string()))
    }
}

/// 单个阶段的状态
///
/// `Waiting` 表示还没轮到该阶段。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    #[default]
    Waiting,
    Pending,
    Processing,
    Completed,
    Failed,
}

/// 学生整体状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

impl OverallStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, OverallStatus::Completed | OverallStatus::Failed)
    }
}

/// 学生当前所处的位置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CurrentStage {
    #[default]
    Discovered,
    ExtractPending,
    ExtractProcessing,
    ExtractCompleted,
    ChunkPending,
    ChunkProcessing,
    ChunkCompleted,
    MapPending,
    MapProcessing,
    MapCompleted,
    GradePending,
    GradeProcessing,
    GradeCompleted,
    Failed,
}

impl CurrentStage {
    /// 由阶段和阶段状态组合出当前位置
    ///
    /// `Waiting` 和 `Failed` 不对应某个阶段内的位置，分别落到
    /// `Discovered` 与 `Failed`。
    pub fn of(stage: Stage, status: StageStatus) -> CurrentStage {
        use CurrentStage::*;
        match (stage, status) {
            (_, StageStatus::Failed) => Failed,
            (_, StageStatus::Waiting) => Discovered,
            (Stage::Extract, StageStatus::Pending) => ExtractPending,
            (Stage::Extract, StageStatus::Processing) => ExtractProcessing,
            (Stage::Extract, StageStatus::Completed) => ExtractCompleted,
            (Stage::Chunk, StageStatus::Pending) => ChunkPending,
            (Stage::Chunk, StageStatus::Processing) => ChunkProcessing,
            (Stage::Chunk, StageStatus::Completed) => ChunkCompleted,
            (Stage::Map, StageStatus::Pending) => MapPending,
            (Stage::Map, StageStatus::Processing) => MapProcessing,
            (Stage::Map, StageStatus::Completed) => MapCompleted,
            (Stage::Grade, StageStatus::Pending) => GradePending,
            (Stage::Grade, StageStatus::Processing) => GradeProcessing,
            (Stage::Grade, StageStatus::Completed) => GradeCompleted,
        }
    }

    /// 当前位置所属的阶段；`Discovered` 属于 extract 之前
    pub fn stage(self) -> Option<Stage> {
        use CurrentStage::*;
        match self {
            ExtractPending | ExtractProcessing | ExtractCompleted => Some(Stage::Extract),
            ChunkPending | ChunkProcessing | ChunkCompleted => Some(Stage::Chunk),
            MapPending | MapProcessing | MapCompleted => Some(Stage::Map),
            GradePending | GradeProcessing | GradeCompleted => Some(Stage::Grade),
            Discovered | Failed => None,
        }
    }

    /// 沿固定顺序的序号，用于判断是否只向前推进
    pub fn ordinal(self) -> usize {
        self as usize
    }
}

macro_rules! text_enum {
    ($ty:ty, $column:literal, { $($variant:path => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(self) -> &'static str {
                match self {
                    $($variant => $text),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = StoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($variant),)+
                    other => Err(StoreError::Corrupt {
                        column: $column.to_string(),
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

text_enum!(StageStatus, "stage_status", {
    StageStatus::Waiting => "waiting",
    StageStatus::Pending => "pending",
    StageStatus::Processing => "processing",
    StageStatus::Completed => "completed",
    StageStatus::Failed => "failed",
});

text_enum!(OverallStatus, "overall_status", {
    OverallStatus::Pending => "pending",
    OverallStatus::Processing => "processing",
    OverallStatus::Completed => "completed",
    OverallStatus::Failed => "failed",
});

text_enum!(CurrentStage, "current_stage", {
    CurrentStage::Discovered => "discovered",
    CurrentStage::ExtractPending => "extract_pending",
    CurrentStage::ExtractProcessing => "extract_processing",
    CurrentStage::ExtractCompleted => "extract_completed",
    CurrentStage::ChunkPending => "chunk_pending",
    CurrentStage::ChunkProcessing => "chunk_processing",
    CurrentStage::ChunkCompleted => "chunk_completed",
    CurrentStage::MapPending => "map_pending",
    CurrentStage::MapProcessing => "map_processing",
    CurrentStage::MapCompleted => "map_completed",
    CurrentStage::GradePending => "grade_pending",
    CurrentStage::GradeProcessing => "grade_processing",
    CurrentStage::GradeCompleted => "grade_completed",
    CurrentStage::Failed => "failed",
});
