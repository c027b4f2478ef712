/// 学号发现服务客户端
///
/// 一个作业只调用一次：服务读取扫描件，识别每份答卷上的学号章。
use async_trait::async_trait;
use serde_json::{json, Value};

use super::http::{build_client, post_json};
use super::DiscoveryAdapter;
use crate::config::Config;
use crate::error::{AdapterError, AppError, AppResult};
use crate::models::PipelineJob;

const ENDPOINT: &str = "discovery";

/// 学号发现服务客户端
pub struct HttpDiscoveryClient {
    client: reqwest::Client,
    base_url: String,
    crop_percentage: f64,
}

impl HttpDiscoveryClient {
    pub fn new(config: &Config) -> AppResult<Self> {
        let client = build_client().map_err(AppError::from)?;
        Ok(Self {
            client,
            base_url: config.discovery_url.trim_end_matches('/').to_string(),
            crop_percentage: config.crop_percentage,
        })
    }
}

#[async_trait]
impl DiscoveryAdapter for HttpDiscoveryClient {
    async fn discover(&self, job: &PipelineJob) -> Result<Vec<String>, AdapterError> {
        let url = format!("{}/{}", self.base_url, job.job_id);
        let payload = json!({
            "question_paper_uuid": job.question_paper_id,
            "source_ref": job.source_ref,
            "crop_percentage": self.crop_percentage
        });
        let body = post_json(&self.client, ENDPOINT, &url, &payload).await?;
        parse_roll_numbers(&body)
    }
}

/// 从响应中取出学号
///
/// 接受 `roll_numbers: [...]`，或按学生分组的 `student_groups` / `students`
/// 数组（每项带 `roll_number`）。数字形式的学号转成字符串。
pub fn parse_roll_numbers(body: &Value) -> Result<Vec<String>, AdapterError> {
    if let Some(list) = body.get("roll_numbers").and_then(Value::as_array) {
        return Ok(list.iter().filter_map(scalar_text).collect());
    }

    for key in ["student_groups", "students"] {
        if let Some(groups) = body.get(key).and_then(Value::as_array) {
            return Ok(groups
                .iter()
                .filter_map(|g| g.get("roll_number"))
                .filter_map(scalar_text)
                .collect());
        }
    }

    Err(AdapterError::Decode(
        "发现服务响应中没有 roll_numbers / student_groups".to_string(),
    ))
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flat_list() {
        let body = json!({"roll_numbers": ["1", 2, null, "3"]});
        assert_eq!(parse_roll_numbers(&body).unwrap(), vec!["1", "2", "3"]);
    }

    #[test]
    fn test_parse_student_groups() {
        let body = json!({
            "job_id": "job_1",
            "student_groups": [
                {"student_id": 1, "roll_number": "101", "total_pages": 4},
                {"student_id": 2, "roll_number": "102", "total_pages": 3}
            ]
        });
        assert_eq!(parse_roll_numbers(&body).unwrap(), vec!["101", "102"]);
    }

    #[test]
    fn test_missing_roster_is_decode_error() {
        let err = parse_roll_numbers(&json!({"status": "ok"})).unwrap_err();
        assert!(matches!(err, AdapterError::Decode(_)));
    }
}
