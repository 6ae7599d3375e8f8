//! Spatial-join query compiler.
//!
//! A [`JoinSpec`] arrives from semi-trusted request parameters. Compilation
//! rejects denylisted text, parses every expression into an AST, qualifies
//! identifiers against the `target`/`source` aliases, and renders one SQL
//! statement with the dataset ids inlined as escaped literals.

mod denylist;
mod dimension;
mod expr;

use postgres_protocol::escape::escape_literal;
use serde::Deserialize;

pub use denylist::{DENYLIST, normalize_whitespace};
pub use dimension::Dimension;
pub use expr::{ColumnRef, quote_extension_refs};

use crate::error::{JobError, Result};
use expr::{Resolver, SOURCE_ALIAS, Scope, TARGET_ALIAS};

/// Declarative spatial join, as carried in `spatial_join` parameters.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct JoinSpec {
    pub target_dataset_id: String,
    pub target_dimension: String,
    pub source_dataset_id: String,
    pub source_dimension: String,
    pub join_condition: String,
    #[serde(default, alias = "filter_target")]
    pub join_filter_target: Option<String>,
    #[serde(default, alias = "filter_source")]
    pub join_filter_source: Option<String>,
    /// Wraps `geometry_target` before it is used in the join condition.
    #[serde(default)]
    pub transform_target: Option<String>,
    /// Wraps `geometry_source` before it is used in the join condition.
    #[serde(default)]
    pub transform_source: Option<String>,
    #[serde(default)]
    pub aggregate: Vec<String>,
    /// Source columns copied into the target properties as `ext:<name>`.
    #[serde(default)]
    pub attributes: Vec<String>,
}

impl JoinSpec {
    fn fields(&self) -> impl Iterator<Item = (&'static str, &str)> {
        [
            ("target_dataset_id", Some(self.target_dataset_id.as_str())),
            ("target_dimension", Some(self.target_dimension.as_str())),
            ("source_dataset_id", Some(self.source_dataset_id.as_str())),
            ("source_dimension", Some(self.source_dimension.as_str())),
            ("join_condition", Some(self.join_condition.as_str())),
            ("join_filter_target", self.join_filter_target.as_deref()),
            ("join_filter_source", self.join_filter_source.as_deref()),
            ("transform_target", self.transform_target.as_deref()),
            ("transform_source", self.transform_source.as_deref()),
        ]
        .into_iter()
        .filter_map(|(name, value)| value.map(|value| (name, value)))
        .chain(self.aggregate.iter().map(|entry| ("aggregate", entry.as_str())))
        .chain(self.attributes.iter().map(|entry| ("attributes", entry.as_str())))
    }

    fn normalized(&self) -> Self {
        let optional = |value: &Option<String>| {
            value
                .as_deref()
                .map(normalize_whitespace)
                .filter(|value| !value.is_empty())
        };
        let list = |entries: &[String]| {
            entries
                .iter()
                .map(|entry| normalize_whitespace(entry))
                .filter(|entry| !entry.is_empty())
                .collect()
        };
        Self {
            target_dataset_id: normalize_whitespace(&self.target_dataset_id),
            target_dimension: normalize_whitespace(&self.target_dimension),
            source_dataset_id: normalize_whitespace(&self.source_dataset_id),
            source_dimension: normalize_whitespace(&self.source_dimension),
            join_condition: normalize_whitespace(&self.join_condition),
            join_filter_target: optional(&self.join_filter_target),
            join_filter_source: optional(&self.join_filter_source),
            transform_target: optional(&self.transform_target),
            transform_source: optional(&self.transform_source),
            aggregate: list(&self.aggregate),
            attributes: list(&self.attributes),
        }
    }
}

/// Compiles a join spec into a single `SELECT` statement.
pub fn compile(spec: &JoinSpec) -> Result<String> {
    denylist::scan(spec.fields())?;
    let spec = spec.normalized();

    let target: Dimension = spec
        .target_dimension
        .parse()
        .ok()
        .filter(|dim: &Dimension| dim.can_be_target())
        .ok_or_else(|| JobError::invalid("Invalid target dimension"))?;
    let source: Dimension = spec
        .source_dimension
        .parse()
        .map_err(|()| JobError::invalid("Invalid source dimension"))?;
    let mut resolver = Resolver::new(target, source)?;
    if let Some(text) = spec.transform_target.as_deref() {
        resolver.transform(Scope::Target, text)?;
    }
    if let Some(text) = spec.transform_source.as_deref() {
        resolver.transform(Scope::Source, text)?;
    }

    let mut fragments = spec
        .aggregate
        .iter()
        .map(|entry| aggregate_fragment(&resolver, entry))
        .collect::<Result<Vec<_>>>()?;
    let mut attribute_columns = Vec::with_capacity(spec.attributes.len());
    for entry in &spec.attributes {
        let (column, key) = resolver.attribute(entry)?;
        fragments.push(format!(
            "jsonb_build_object({}, {column})",
            escape_literal(&format!("ext:{key}"))
        ));
        attribute_columns.push(column.to_string());
    }

    if spec.join_condition.is_empty() {
        return Err(JobError::invalid("Invalid join condition"));
    }
    let (join_condition, _) =
        resolver.expression(&spec.join_condition, Scope::Join, "Invalid join condition")?;
    let target_filter = spec
        .join_filter_target
        .as_deref()
        .map(|text| resolver.expression(text, Scope::Target, "Invalid join filter"))
        .transpose()?;
    let source_filter = spec
        .join_filter_source
        .as_deref()
        .map(|text| resolver.expression(text, Scope::Source, "Invalid join filter"))
        .transpose()?;

    let required = target
        .required_columns()
        .iter()
        .map(|column| format!("{TARGET_ALIAS}.{column}"))
        .collect::<Vec<_>>()
        .join(", ");
    let group_by = attribute_columns
        .iter()
        .fold(required.clone(), |acc, column| format!("{acc}, {column}"));
    let feature = if fragments.is_empty() {
        format!("({TARGET_ALIAS}.feature::jsonb)::json AS feature")
    } else {
        format!(
            "jsonb_set({TARGET_ALIAS}.feature::jsonb, '{{properties}}', \
             COALESCE({TARGET_ALIAS}.feature::jsonb -> 'properties', '{{}}'::jsonb) || {}, true)::json AS feature",
            fragments.join(" || ")
        )
    };

    let mut on = format!(
        "({join_condition}) AND {SOURCE_ALIAS}.tdei_dataset_id = {}",
        escape_literal(&spec.source_dataset_id)
    );
    if let Some((filter, _)) = target_filter {
        on.push_str(&format!(" AND ({filter})"));
    }
    if let Some((filter, _)) = source_filter {
        on.push_str(&format!(" AND ({filter})"));
    }

    let sql = format!(
        "SELECT {required}, {feature} FROM {} {TARGET_ALIAS} LEFT JOIN {} {SOURCE_ALIAS} ON {on} \
         WHERE {TARGET_ALIAS}.tdei_dataset_id = {} GROUP BY {group_by}, {TARGET_ALIAS}.feature::jsonb",
        target.table(),
        source.table(),
        escape_literal(&spec.target_dataset_id),
    );

    // A placeholder can only survive inside a literal or quoted identifier.
    let lowered = sql.to_ascii_lowercase();
    if lowered.contains("geometry_target") || lowered.contains("geometry_source") {
        return Err(JobError::invalid("Invalid join condition"));
    }
    Ok(sql)
}

fn aggregate_fragment(resolver: &Resolver, entry: &str) -> Result<String> {
    let (expr, alias, mut columns) = resolver.aggregate(entry)?;
    columns.dedup_by(|a, b| a.rendered == b.rendered);
    let alias = match alias {
        Some(alias) => alias.value,
        None if !columns.is_empty() => columns
            .iter()
            .map(|column| column.name.trim_start_matches("ext:").to_string())
            .collect::<Vec<_>>()
            .join("_"),
        None => return Err(JobError::invalid("Invalid aggregate syntax")),
    };
    let key = escape_literal(&format!("ext:{alias}"));
    let aggregate = if columns.is_empty() {
        expr.to_string()
    } else {
        let not_null = columns
            .iter()
            .map(|column| format!("{} IS NOT NULL", column.rendered))
            .collect::<Vec<_>>()
            .join(" AND ");
        format!("{expr} FILTER (WHERE {not_null})")
    };
    Ok(format!(
        "CASE WHEN {aggregate} IS NOT NULL THEN jsonb_build_object({key}, {aggregate}) ELSE '{{}}'::jsonb END"
    ))
}
