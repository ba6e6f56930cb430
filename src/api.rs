use crate::model::{ReadStatus, ReadingState};
use serde::{Deserialize, Serialize};

const SUCCESS: &str = "Success";

/// Body of a device reading-state PUT.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReadingStatesRequest {
    #[serde(default)]
    pub reading_states: Vec<ReadingState>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct ResultStatus {
    pub result: String,
}

impl ResultStatus {
    fn success() -> Self {
        ResultStatus {
            result: SUCCESS.to_owned(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct UpdateResult {
    pub entitlement_id: String,
    pub current_bookmark_result: ResultStatus,
    pub statistics_result: ResultStatus,
    pub status_info_result: ResultStatus,
}

/// The device expects this exact acknowledgement, one entry per item sent.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct UpdateResponse {
    pub request_result: String,
    pub update_results: Vec<UpdateResult>,
}

impl UpdateResponse {
    pub fn success_for<I, S>(entitlement_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        UpdateResponse {
            request_result: SUCCESS.to_owned(),
            update_results: entitlement_ids
                .into_iter()
                .map(|id| UpdateResult {
                    entitlement_id: id.into(),
                    current_bookmark_result: ResultStatus::success(),
                    statistics_result: ResultStatus::success(),
                    status_info_result: ResultStatus::success(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct WebProgressRequest {
    pub file_id: Option<i64>,
    pub percent: f64,
    pub href: Option<String>,
    pub position: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReadStatusRequest {
    pub status: ReadStatus,
}

#[derive(Debug, Serialize)]
pub struct APIResponse<T> {
    pub data: T,
}

#[derive(Debug, Serialize, Default)]
pub struct StatusResponse {
    pub status: String,
}

impl StatusResponse {
    pub fn new_from_msg(msg: &str) -> Self {
        StatusResponse {
            status: msg.to_owned(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_response_shape() {
        let response = UpdateResponse::success_for(["3", "9"]);
        let json = serde_json::to_value(&response).unwrap();

        assert_eq!(json["RequestResult"], "Success");
        assert_eq!(json["UpdateResults"].as_array().unwrap().len(), 2);
        assert_eq!(json["UpdateResults"][1]["EntitlementId"], "9");
        assert_eq!(json["UpdateResults"][0]["CurrentBookmarkResult"]["Result"], "Success");
        assert_eq!(json["UpdateResults"][0]["StatisticsResult"]["Result"], "Success");
        assert_eq!(json["UpdateResults"][0]["StatusInfoResult"]["Result"], "Success");
    }

    #[test]
    fn test_request_without_states() {
        let request: ReadingStatesRequest = serde_json::from_str("{}").unwrap();
        assert!(request.reading_states.is_empty());
    }

    #[test]
    fn test_read_status_request() {
        let request: ReadStatusRequest = serde_json::from_str(r#"{"status":"READ"}"#).unwrap();
        assert_eq!(request.status, ReadStatus::Read);
    }
}
