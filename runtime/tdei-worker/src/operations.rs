//! Each backend service as a plan value: what to run, where the output
//! goes, and how it is packaged.

use std::collections::HashMap;

use postgres_protocol::escape::escape_literal;
use serde_json::{Map, Value};
use tdei_db::{DbSession, JsonRow, SqlValue};

use crate::error::{JobError, Result};
use crate::message::{BackendRequest, validate};
use crate::pipeline::{CursorPlan, OutputFormat, geojson_header};
use crate::query::{JoinSpec, compile};

pub const CONTAINER: &str = "osw";
pub const DEFAULT_PROXIMITY: f64 = 0.5;

const DATASET_METADATA_SQL: &str = "SELECT event_info as edges, node_info as nodes, zone_info as zones, \
     ext_point_info as extensions_points, ext_line_info as extensions_lines, \
     ext_polygon_info as extensions_polygons FROM content.dataset WHERE tdei_dataset_id = $1";
const EXTENSION_METADATA_SQL: &str =
    "SELECT name, file_meta FROM content.extension_file WHERE tdei_dataset_id = $1";
const DATASET_NAMES_SQL: &str =
    "SELECT tdei_dataset_id::text AS tdei_dataset_id, name FROM content.dataset WHERE tdei_dataset_id IN ($1, $2)";

/// Where envelope headers (and, for unions, the archive name) come from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MetadataSource {
    Dataset(String),
    /// Headers from the first dataset; archive named after both.
    Union { one: String, two: String },
    /// No headers; the dataset only has to exist.
    Exists(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Packaging {
    /// Zip every output file into `output_file_name`.
    Archive,
    /// Report the single output file directly.
    SingleFile,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct JobPlan {
    pub operation: &'static str,
    pub container: String,
    pub file_path: String,
    pub output_file_name: String,
    pub metadata: MetadataSource,
    /// Statements run inside the transaction before planning.
    pub prelude: Vec<Statement>,
    pub cursor_plan: CursorPlan,
    pub format: OutputFormat,
    pub packaging: Packaging,
}

/// Envelope material loaded inside the job's transaction.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResolvedMetadata {
    pub headers: HashMap<String, String>,
    pub default_header: String,
    pub output_file_name: Option<String>,
}

/// Validates a request and turns it into a plan. Nothing here touches the
/// database.
pub fn plan(job_id: &str, request: &BackendRequest) -> Result<JobPlan> {
    let service = validate(request)?;
    let params = &request.parameters;
    match service.name {
        "bbox_intersect" => {
            let dataset = text_param(params, "tdei_dataset_id")?;
            let bbox = bbox_param(params.get("bbox"))?;
            let mut values = vec![SqlValue::text(dataset.clone())];
            values.extend(bbox.iter().copied().map(SqlValue::Float));
            Ok(JobPlan {
                operation: "bbox_intersect",
                container: CONTAINER.to_string(),
                file_path: format!("backend-jobs/{job_id}/{dataset}"),
                output_file_name: format!("bbox-intersect-{job_id}.zip"),
                metadata: MetadataSource::Dataset(dataset),
                prelude: Vec::new(),
                cursor_plan: planning_function("content.bbox_intersect($1, $2, $3, $4, $5)", values),
                format: OutputFormat::GeoJson,
                packaging: Packaging::Archive,
            })
        }
        "dataset_tag_road" => {
            let target = text_param(params, "target_dataset_id")?;
            let source = text_param(params, "source_dataset_id")?;
            Ok(JobPlan {
                operation: "dataset_tag_road",
                container: CONTAINER.to_string(),
                file_path: format!("backend-jobs/{job_id}/{target}"),
                output_file_name: format!("dataset-tag-road-{job_id}.zip"),
                metadata: MetadataSource::Dataset(target.clone()),
                prelude: vec![Statement {
                    sql: "SELECT content.dataset_tag_road($1, $2)".to_string(),
                    params: vec![SqlValue::text(target.clone()), SqlValue::text(source)],
                }],
                cursor_plan: planning_function("content.extract_dataset($1)", vec![SqlValue::text(target)]),
                format: OutputFormat::GeoJson,
                packaging: Packaging::Archive,
            })
        }
        "spatial_join" => {
            let spec: JoinSpec = serde_json::from_value(Value::Object(params.clone()))
                .map_err(|err| JobError::invalid(format!("Invalid spatial join parameters: {err}")))?;
            let sql = compile(&spec)?;
            let target = spec.target_dataset_id.trim().to_string();
            Ok(JobPlan {
                operation: "spatial_join",
                container: CONTAINER.to_string(),
                file_path: format!("backend-jobs/{job_id}/{target}"),
                output_file_name: format!("spatial-query-{job_id}.zip"),
                metadata: MetadataSource::Dataset(target.clone()),
                prelude: Vec::new(),
                cursor_plan: planning_function(
                    "content.tdei_dataset_spatial_join($1, $2, $3)",
                    vec![
                        SqlValue::text(target),
                        SqlValue::text(sql),
                        SqlValue::text(spec.target_dimension.trim().to_ascii_lowercase()),
                    ],
                ),
                format: OutputFormat::GeoJson,
                packaging: Packaging::Archive,
            })
        }
        "union_join" => {
            let one = text_param(params, "tdei_dataset_id_one")?;
            let two = text_param(params, "tdei_dataset_id_two")?;
            let proximity = proximity_param(params.get("proximity"))?;
            Ok(JobPlan {
                operation: "union_join",
                container: CONTAINER.to_string(),
                file_path: format!("backend-jobs/{job_id}/{one}_{two}"),
                output_file_name: format!("union_dataset-jobId_{job_id}.zip"),
                metadata: MetadataSource::Union {
                    one: one.clone(),
                    two: two.clone(),
                },
                prelude: Vec::new(),
                cursor_plan: planning_function(
                    "content.tdei_union_dataset($1, $2, $3)",
                    vec![SqlValue::text(one), SqlValue::text(two), SqlValue::Float(proximity)],
                ),
                format: OutputFormat::GeoJson,
                packaging: Packaging::Archive,
            })
        }
        "osw_osm_export" => {
            let dataset = text_param(params, "tdei_dataset_id")?;
            Ok(JobPlan {
                operation: "osw_osm_export",
                container: CONTAINER.to_string(),
                file_path: format!("backend-jobs/{job_id}/{dataset}"),
                output_file_name: OutputFormat::OsmXml.file_name(&dataset),
                metadata: MetadataSource::Exists(dataset.clone()),
                prelude: Vec::new(),
                cursor_plan: CursorPlan::Declared {
                    file_name: dataset.clone(),
                    cursor_name: "osm_export".to_string(),
                    query: format!(
                        "SELECT export_osm_xml AS line FROM content.export_osm_xml({})",
                        escape_literal(&dataset)
                    ),
                },
                format: OutputFormat::OsmXml,
                packaging: Packaging::SingleFile,
            })
        }
        _ => Err(JobError::invalid("Service not found")),
    }
}

fn planning_function(call: &str, params: Vec<SqlValue>) -> CursorPlan {
    CursorPlan::Function {
        sql: format!("SELECT file_name, cursor_ref::text AS cursor_ref FROM {call}"),
        params,
    }
}

fn text_param(params: &Map<String, Value>, name: &str) -> Result<String> {
    match params.get(name) {
        Some(Value::String(value)) if !value.trim().is_empty() => Ok(value.trim().to_string()),
        Some(Value::Number(value)) => Ok(value.to_string()),
        Some(_) => Err(JobError::invalid(format!("Invalid parameter: {name}"))),
        None => Err(JobError::invalid(format!("Missing required parameter: {name}"))),
    }
}

/// Accepts four numbers as an array or a comma-separated string.
pub fn bbox_param(value: Option<&Value>) -> Result<[f64; 4]> {
    let invalid = || JobError::invalid("Invalid bbox parameters");
    let parts: Vec<f64> = match value {
        Some(Value::String(text)) => text
            .split(',')
            .map(|part| part.trim().parse::<f64>().map_err(|_| invalid()))
            .collect::<Result<_>>()?,
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::Number(number) => number.as_f64().ok_or_else(invalid),
                Value::String(text) => text.trim().parse::<f64>().map_err(|_| invalid()),
                _ => Err(invalid()),
            })
            .collect::<Result<_>>()?,
        _ => return Err(invalid()),
    };
    let bbox: [f64; 4] = parts.try_into().map_err(|_| invalid())?;
    if bbox.iter().any(|value| !value.is_finite()) {
        return Err(invalid());
    }
    Ok(bbox)
}

/// Defaults to [`DEFAULT_PROXIMITY`] when absent.
pub fn proximity_param(value: Option<&Value>) -> Result<f64> {
    let invalid = || JobError::invalid("Invalid proximity parameter");
    let proximity = match value {
        None | Some(Value::Null) => return Ok(DEFAULT_PROXIMITY),
        Some(Value::Number(number)) => number.as_f64().ok_or_else(invalid)?,
        Some(Value::String(text)) if text.trim().is_empty() => return Ok(DEFAULT_PROXIMITY),
        Some(Value::String(text)) => text.trim().parse::<f64>().map_err(|_| invalid())?,
        Some(_) => return Err(invalid()),
    };
    if proximity.is_finite() {
        Ok(proximity)
    } else {
        Err(invalid())
    }
}

/// Replaces every character outside `[A-Za-z0-9]` with `_`.
pub fn url_safe_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn not_found(dataset: &str) -> JobError {
    JobError::invalid(format!("Dataset with ID {dataset} not found."))
}

/// Loads envelope headers for the plan's output keys.
pub async fn resolve_metadata(
    session: &mut dyn DbSession,
    plan: &JobPlan,
    schema_url: &str,
) -> Result<ResolvedMetadata> {
    let default_header = match plan.format {
        OutputFormat::GeoJson => geojson_header(None, schema_url),
        OutputFormat::OsmXml => String::new(),
    };
    let mut resolved = ResolvedMetadata {
        default_header,
        ..ResolvedMetadata::default()
    };
    let dataset = match &plan.metadata {
        MetadataSource::Exists(dataset) => {
            let rows = session
                .query(DATASET_METADATA_SQL, &[SqlValue::text(dataset.clone())])
                .await?;
            if rows.is_empty() {
                return Err(not_found(dataset));
            }
            return Ok(resolved);
        }
        MetadataSource::Dataset(dataset) => dataset,
        MetadataSource::Union { one, two } => {
            let rows = session
                .query(
                    DATASET_NAMES_SQL,
                    &[SqlValue::text(one.clone()), SqlValue::text(two.clone())],
                )
                .await?;
            let name_of = |id: &str| {
                rows.iter()
                    .find(|row| row.get("tdei_dataset_id").and_then(Value::as_str) == Some(id))
                    .map(|row| url_safe_name(row.get("name").and_then(Value::as_str).unwrap_or_default()))
                    .ok_or_else(|| not_found(id))
            };
            let (name_one, name_two) = (name_of(one)?, name_of(two)?);
            resolved.output_file_name = Some(format!(
                "{name_one}_{name_two}-{}",
                plan.output_file_name
            ));
            one
        }
    };

    let rows = session
        .query(DATASET_METADATA_SQL, &[SqlValue::text(dataset.clone())])
        .await?;
    let row = rows.first().ok_or_else(|| not_found(dataset))?;
    for (key, value) in row {
        resolved
            .headers
            .insert(key.clone(), geojson_header(Some(value), schema_url));
    }

    let extensions = session
        .query(EXTENSION_METADATA_SQL, &[SqlValue::text(dataset.clone())])
        .await?;
    for file in &extensions {
        if let Some(name) = extension_name(file) {
            resolved
                .headers
                .insert(name, geojson_header(file.get("file_meta"), schema_url));
        }
    }
    Ok(resolved)
}

fn extension_name(row: &JsonRow) -> Option<String> {
    row.get("name")
        .and_then(Value::as_str)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(service: &str, parameters: Value) -> BackendRequest {
        BackendRequest {
            service: service.to_string(),
            parameters: parameters.as_object().cloned().unwrap_or_default(),
            user_id: "u".to_string(),
        }
    }

    #[test]
    fn bbox_accepts_string_and_array_forms() {
        assert_eq!(bbox_param(Some(&json!("0,0,1,1"))).expect("string"), [0.0, 0.0, 1.0, 1.0]);
        assert_eq!(
            bbox_param(Some(&json!([-122.3, 47.6, "-122.2", 47.7]))).expect("array"),
            [-122.3, 47.6, -122.2, 47.7]
        );
        for bad in [json!("0,0,1"), json!([1, 2, 3, 4, 5]), json!("a,b,c,d"), json!(4)] {
            assert_eq!(
                bbox_param(Some(&bad)).expect_err("invalid").public_message(),
                "Invalid bbox parameters"
            );
        }
    }

    #[test]
    fn proximity_defaults_and_validates() {
        assert_eq!(proximity_param(None).expect("default"), 0.5);
        assert_eq!(proximity_param(Some(&json!("2.5"))).expect("string"), 2.5);
        assert_eq!(proximity_param(Some(&json!(1))).expect("number"), 1.0);
        assert_eq!(
            proximity_param(Some(&json!("abc"))).expect_err("text").public_message(),
            "Invalid proximity parameter"
        );
    }

    #[test]
    fn names_are_made_url_safe() {
        assert_eq!(url_safe_name("King County (2024)"), "King_County__2024_");
    }

    #[test]
    fn bbox_plan_binds_dataset_and_coordinates() {
        let plan = plan(
            "job-1",
            &request("bbox_intersect", json!({"tdei_dataset_id": "d1", "bbox": "1,2,3,4"})),
        )
        .expect("plan");
        assert_eq!(plan.file_path, "backend-jobs/job-1/d1");
        assert_eq!(plan.output_file_name, "bbox-intersect-job-1.zip");
        let CursorPlan::Function { sql, params } = plan.cursor_plan else {
            panic!("expected a planning function");
        };
        assert!(sql.ends_with("FROM content.bbox_intersect($1, $2, $3, $4, $5)"));
        assert_eq!(params[0], SqlValue::text("d1"));
        assert_eq!(params[4], SqlValue::Float(4.0));
    }

    #[test]
    fn spatial_join_compiles_before_any_query() {
        let plan = plan(
            "job-2",
            &request(
                "spatial_join",
                json!({
                    "target_dataset_id": "t",
                    "target_dimension": "edge",
                    "source_dataset_id": "s",
                    "source_dimension": "point",
                    "join_condition": "ST_Intersects(geometry_target, geometry_source)",
                    "aggregate": ["array_agg(highway) as highways"]
                }),
            ),
        )
        .expect("plan");
        assert_eq!(plan.output_file_name, "spatial-query-job-2.zip");
        let CursorPlan::Function { params, .. } = plan.cursor_plan else {
            panic!("expected a planning function");
        };
        let SqlValue::Text(sql) = &params[1] else {
            panic!("compiled sql is bound as text");
        };
        assert!(sql.contains("'ext:highways'"));
        assert_eq!(params[2], SqlValue::text("edge"));
    }

    #[test]
    fn osm_export_declares_its_own_cursor() {
        let plan = plan("job-3", &request("osw_osm_export", json!({"tdei_dataset_id": "d'1"})))
            .expect("plan");
        assert_eq!(plan.packaging, Packaging::SingleFile);
        assert_eq!(plan.output_file_name, "osm.d'1.xml");
        let CursorPlan::Declared { query, .. } = plan.cursor_plan else {
            panic!("expected a declared cursor");
        };
        assert_eq!(query, "SELECT export_osm_xml AS line FROM content.export_osm_xml('d''1')");
    }

    #[test]
    fn union_rejects_bad_proximity() {
        let err = plan(
            "job-4",
            &request(
                "union_join",
                json!({"tdei_dataset_id_one": "a", "tdei_dataset_id_two": "b", "proximity": "abc"}),
            ),
        )
        .expect_err("proximity");
        assert_eq!(err.public_message(), "Invalid proximity parameter");
    }
}
