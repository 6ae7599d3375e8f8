//! Inbound job messages, outbound results, and the service catalog.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::{JobError, Result};

/// A job request as delivered by the queue.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct QueueMessage {
    pub message_id: String,
    pub message_type: String,
    pub data: BackendRequest,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct BackendRequest {
    pub service: String,
    pub parameters: Map<String, Value>,
    pub user_id: String,
}

/// The single terminal message published for a job.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResultMessage {
    pub message_id: String,
    pub message_type: String,
    pub data: ResultData,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct ResultData {
    pub message: String,
    pub success: bool,
    pub file_upload_path: String,
}

impl ResultMessage {
    pub fn success(
        message_id: &str,
        message_type: &str,
        message: impl Into<String>,
        file_upload_path: impl Into<String>,
    ) -> Self {
        Self::build(message_id, message_type, true, message.into(), file_upload_path.into())
    }

    pub fn failure(message_id: &str, message_type: &str, message: impl Into<String>) -> Self {
        Self::build(message_id, message_type, false, message.into(), String::new())
    }

    fn build(
        message_id: &str,
        message_type: &str,
        success: bool,
        message: String,
        file_upload_path: String,
    ) -> Self {
        Self {
            message_id: message_id.to_string(),
            message_type: message_type.to_string(),
            data: ResultData {
                message,
                success,
                file_upload_path,
            },
        }
    }
}

#[derive(Debug)]
pub struct ServiceSpec {
    pub name: &'static str,
    pub required: &'static [&'static str],
    pub optional: &'static [&'static str],
}

impl ServiceSpec {
    /// Parameter names the service neither requires nor accepts.
    pub fn unrecognized<'a>(&self, parameters: &'a Map<String, Value>) -> Vec<&'a str> {
        parameters
            .keys()
            .map(String::as_str)
            .filter(|name| !self.required.contains(name) && !self.optional.contains(name))
            .collect()
    }
}

pub const SERVICES: &[ServiceSpec] = &[
    ServiceSpec {
        name: "bbox_intersect",
        required: &["tdei_dataset_id", "bbox"],
        optional: &[],
    },
    ServiceSpec {
        name: "dataset_tag_road",
        required: &["target_dataset_id", "source_dataset_id"],
        optional: &[],
    },
    ServiceSpec {
        name: "spatial_join",
        required: &[
            "target_dataset_id",
            "target_dimension",
            "source_dataset_id",
            "source_dimension",
            "join_condition",
        ],
        optional: &[
            "join_filter_target",
            "join_filter_source",
            "filter_target",
            "filter_source",
            "transform_target",
            "transform_source",
            "aggregate",
            "attributes",
        ],
    },
    ServiceSpec {
        name: "union_join",
        required: &["tdei_dataset_id_one", "tdei_dataset_id_two"],
        optional: &["proximity"],
    },
    ServiceSpec {
        name: "osw_osm_export",
        required: &["tdei_dataset_id"],
        optional: &[],
    },
];

/// Looks up the service and checks its required parameters are present.
pub fn validate(request: &BackendRequest) -> Result<&'static ServiceSpec> {
    let spec = SERVICES
        .iter()
        .find(|spec| spec.name == request.service)
        .ok_or_else(|| JobError::invalid("Service not found"))?;
    for name in spec.required {
        let present = match request.parameters.get(*name) {
            None | Some(Value::Null) => false,
            Some(Value::String(text)) => !text.trim().is_empty(),
            Some(_) => true,
        };
        if !present {
            return Err(JobError::invalid(format!("Missing required parameter: {name}")));
        }
    }
    let ignored = spec.unrecognized(&request.parameters);
    if !ignored.is_empty() {
        warn!(service = spec.name, parameters = ?ignored, "ignoring unrecognized parameters");
    }
    Ok(spec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(service: &str, parameters: Value) -> BackendRequest {
        BackendRequest {
            service: service.to_string(),
            parameters: parameters.as_object().cloned().unwrap_or_default(),
            user_id: "user-1".to_string(),
        }
    }

    #[test]
    fn decodes_camel_case_envelope() {
        let raw = json!({
            "messageId": "job-42",
            "messageType": "BACKEND_REQUEST",
            "data": {
                "service": "bbox_intersect",
                "parameters": {"tdei_dataset_id": "d1", "bbox": "0,0,1,1"},
                "user_id": "u1"
            }
        });
        let message: QueueMessage = serde_json::from_value(raw).expect("decode");
        assert_eq!(message.message_id, "job-42");
        assert_eq!(message.data.parameters["bbox"], "0,0,1,1");
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let raw = json!({
            "messageId": "job-42",
            "messageType": "BACKEND_REQUEST",
            "data": {"service": "x", "parameters": {}, "user_id": "u1", "extra": 1}
        });
        assert!(serde_json::from_value::<QueueMessage>(raw).is_err());
    }

    #[test]
    fn catalog_rejects_unknown_service_and_missing_params() {
        let err = validate(&request("teleport", json!({}))).expect_err("unknown");
        assert_eq!(err.public_message(), "Service not found");

        let err = validate(&request("union_join", json!({"tdei_dataset_id_one": "a", "tdei_dataset_id_two": ""})))
            .expect_err("missing");
        assert_eq!(err.public_message(), "Missing required parameter: tdei_dataset_id_two");

        let spec = validate(&request("osw_osm_export", json!({"tdei_dataset_id": "a"}))).expect("valid");
        assert_eq!(spec.name, "osw_osm_export");
    }

    #[test]
    fn catalog_lists_every_accepted_parameter() {
        let spec = validate(&request(
            "spatial_join",
            json!({
                "target_dataset_id": "t",
                "target_dimension": "edge",
                "source_dataset_id": "s",
                "source_dimension": "point",
                "join_condition": "ST_Intersects(geometry_target, geometry_source)",
                "filter_source": "highway = 'street_lamp'",
                "transform_target": "ST_Buffer(geometry_target, 5)",
                "attributes": ["highway"],
                "radius": 5,
            }),
        ))
        .expect("unknown parameters are not fatal");
        let params = request("spatial_join", json!({"aggregate": [], "radius": 5, "tdei": 1}));
        let mut ignored = spec.unrecognized(&params.parameters);
        ignored.sort_unstable();
        assert_eq!(ignored, ["radius", "tdei"]);

        let union = validate(&request("union_join", json!({"tdei_dataset_id_one": "a", "tdei_dataset_id_two": "b"})))
            .expect("valid");
        let params = request("union_join", json!({"tdei_dataset_id_one": "a", "proximity": 2}));
        assert!(union.unrecognized(&params.parameters).is_empty());
    }

    #[test]
    fn result_serializes_with_wire_names() {
        let result = ResultMessage::success("job-1", "BACKEND_REQUEST", "Dataset uploaded successfully!", "https://x/y.zip");
        let value = serde_json::to_value(&result).expect("encode");
        assert_eq!(value["messageId"], "job-1");
        assert_eq!(value["data"]["file_upload_path"], "https://x/y.zip");
        assert_eq!(value["data"]["success"], true);
    }
}
