//! HTTP 调用与响应分类
//!
//! - 网络错误、5xx、408、429：瞬时错误
//! - 其他 4xx：永久错误
//! - 2xx 但响应体为 `{"success": false}` 或 `{"status": "error"}`：
//!   默认按瞬时错误处理，`"retryable": false` 时为永久错误

use reqwest::StatusCode;
use serde_json::Value;
use tracing::debug;

use crate::error::AdapterError;
use crate::utils::truncate_text;

/// 构建共享的 HTTP 客户端；超时由调用方按阶段控制
pub fn build_client() -> Result<reqwest::Client, AdapterError> {
    reqwest::Client::builder()
        .connect_timeout(std::time::Duration::from_secs(10))
        .build()
        .map_err(|e| AdapterError::Permanent {
            endpoint: "http-client".to_string(),
            message: format!("无法创建 HTTP 客户端: {}", e),
        })
}

/// POST 一个 JSON 请求并返回响应体
pub async fn post_json(
    client: &reqwest::Client,
    endpoint: &str,
    url: &str,
    payload: &Value,
) -> Result<Value, AdapterError> {
    debug!("POST {} ({}) payload: {}", url, endpoint, payload);

    let response = client
        .post(url)
        .json(payload)
        .send()
        .await
        .map_err(|e| transport_error(endpoint, &e))?;

    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| transport_error(endpoint, &e))?;

    classify_status(endpoint, status, &body)?;

    if body.trim().is_empty() {
        return Ok(Value::Null);
    }
    let value: Value = serde_json::from_str(&body).map_err(|e| {
        AdapterError::Decode(format!("{} 返回的不是 JSON: {}", endpoint, e))
    })?;
    check_body(endpoint, &value)?;
    Ok(value)
}

fn transport_error(endpoint: &str, err: &reqwest::Error) -> AdapterError {
    AdapterError::Transient {
        endpoint: endpoint.to_string(),
        message: err.to_string(),
    }
}

/// 按 HTTP 状态码分类
pub fn classify_status(endpoint: &str, status: StatusCode, body: &str) -> Result<(), AdapterError> {
    if status.is_success() {
        return Ok(());
    }

    let message = format!("HTTP {}: {}", status.as_u16(), truncate_text(body, 200));
    let transient = status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS;

    if transient {
        Err(AdapterError::Transient {
            endpoint: endpoint.to_string(),
            message,
        })
    } else {
        Err(AdapterError::Permanent {
            endpoint: endpoint.to_string(),
            message,
        })
    }
}

/// 2xx 响应体里声明的失败
pub fn check_body(endpoint: &str, body: &Value) -> Result<(), AdapterError> {
    let declared_failure = body.get("success").and_then(Value::as_bool) == Some(false)
        || body.get("status").and_then(Value::as_str) == Some("error");
    if !declared_failure {
        return Ok(());
    }

    let message = body
        .get("error")
        .or_else(|| body.get("message"))
        .map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .unwrap_or_else(|| "服务返回失败".to_string());

    if body.get("retryable").and_then(Value::as_bool) == Some(false) {
        Err(AdapterError::Permanent {
            endpoint: endpoint.to_string(),
            message,
        })
    } else {
        Err(AdapterError::Transient {
            endpoint: endpoint.to_string(),
            message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_classification() {
        assert!(classify_status("ocr", StatusCode::OK, "").is_ok());

        for code in [500u16, 502, 503, 408, 429] {
            let status = StatusCode::from_u16(code).unwrap();
            let err = classify_status("ocr", status, "busy").unwrap_err();
            assert!(err.is_retryable(), "HTTP {} 应可重试", code);
        }
        for code in [400u16, 404, 422] {
            let status = StatusCode::from_u16(code).unwrap();
            let err = classify_status("ocr", status, "bad input").unwrap_err();
            assert!(!err.is_retryable(), "HTTP {} 不应重试", code);
        }
    }

    #[test]
    fn test_body_declared_failure() {
        assert!(check_body("qa", &json!({"success": true, "data": {}})).is_ok());
        assert!(check_body("qa", &json!({"results": []})).is_ok());

        let err = check_body("qa", &json!({"success": false, "error": "no chunks"})).unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("no chunks"));

        let err = check_body(
            "qa",
            &json!({"success": false, "retryable": false, "message": "unknown paper"}),
        )
        .unwrap_err();
        assert!(matches!(err, AdapterError::Permanent { .. }));

        let err = check_body("stamps", &json!({"status": "error", "error": "s3 down"})).unwrap_err();
        assert!(err.is_retryable());
    }
}
