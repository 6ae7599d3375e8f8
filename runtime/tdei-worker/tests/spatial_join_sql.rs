use proptest::prelude::*;
use tdei_worker::query::DENYLIST;
use tdei_worker::{JoinSpec, compile};

const TARGETS: [&str; 6] = ["edge", "node", "zone", "point", "line", "polygon"];
const SOURCES: [&str; 7] = ["edge", "node", "zone", "point", "line", "polygon", "extension"];
const FIELDS: [&str; 11] = [
    "target_dataset_id",
    "target_dimension",
    "source_dataset_id",
    "source_dimension",
    "join_condition",
    "join_filter_target",
    "join_filter_source",
    "transform_target",
    "transform_source",
    "aggregate",
    "attributes",
];

fn sidewalk_lamps() -> JoinSpec {
    JoinSpec {
        target_dataset_id: "fa8e12ea6b0c4d3e8b385b87b268e76b".into(),
        target_dimension: "edge".into(),
        source_dataset_id: "0d661b69495d47fb838862edf699fe09".into(),
        source_dimension: "point".into(),
        join_condition: "ST_Contains(ST_Buffer(geometry_target, 5), geometry_source)".into(),
        join_filter_target: Some("highway = 'footway'".into()),
        join_filter_source: Some("highway = 'street_lamp'".into()),
        aggregate: vec!["array_agg(highway) as lamps".into()],
        ..JoinSpec::default()
    }
}

fn inject(spec: &mut JoinSpec, field: &str, text: String) {
    match field {
        "target_dataset_id" => spec.target_dataset_id = text,
        "target_dimension" => spec.target_dimension = text,
        "source_dataset_id" => spec.source_dataset_id = text,
        "source_dimension" => spec.source_dimension = text,
        "join_condition" => spec.join_condition = text,
        "join_filter_target" => spec.join_filter_target = Some(text),
        "join_filter_source" => spec.join_filter_source = Some(text),
        "transform_target" => spec.transform_target = Some(text),
        "transform_source" => spec.transform_source = Some(text),
        "attributes" => spec.attributes.push(text),
        _ => spec.aggregate.push(text),
    }
}

fn mixed_case(keyword: &str, upper: &[bool]) -> String {
    keyword
        .chars()
        .zip(upper.iter().cycle())
        .map(|(c, up)| if *up { c.to_ascii_uppercase() } else { c.to_ascii_lowercase() })
        .collect()
}

fn denylisted(text: &str) -> bool {
    let upper = text.to_ascii_uppercase();
    DENYLIST.iter().any(|keyword| upper.contains(keyword))
}

fn join_condition() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("ST_Intersects(geometry_target, geometry_source)".to_string()),
        (1u32..200).prop_map(|d| format!("ST_DWithin(geometry_target, geometry_source, {d})")),
        (1u32..50).prop_map(|d| format!("ST_Contains(ST_Buffer(GEOMETRY_TARGET, {d}), geometry_source)")),
    ]
}

proptest! {
    #[test]
    fn denylisted_text_is_rejected_in_every_field(
        field in prop::sample::select(FIELDS.to_vec()),
        keyword in prop::sample::select(DENYLIST.to_vec()),
        upper in prop::collection::vec(any::<bool>(), 8),
        prefix in "[a-z ]{0,6}",
        suffix in "[a-z ]{0,6}",
    ) {
        let mut spec = sidewalk_lamps();
        inject(&mut spec, field, format!("{prefix}{}{suffix}", mixed_case(keyword, &upper)));
        let err = compile(&spec).expect_err("denylisted text compiles");
        prop_assert_eq!(err.public_message(), format!("Harmful keyword found in input : {field}"));
    }

    #[test]
    fn placeholders_never_survive_and_output_is_stable(
        target in prop::sample::select(TARGETS.to_vec()),
        source in prop::sample::select(SOURCES.to_vec()),
        condition in join_condition(),
    ) {
        let mut spec = sidewalk_lamps();
        spec.target_dimension = target.to_string();
        spec.source_dimension = source.to_string();
        spec.join_condition = condition;
        let sql = compile(&spec).expect("valid spec compiles");
        let lowered = sql.to_ascii_lowercase();
        prop_assert!(!lowered.contains("geometry_target"));
        prop_assert!(!lowered.contains("geometry_source"));
        prop_assert_eq!(compile(&spec).expect("recompile"), sql);
    }

    #[test]
    fn aggregate_columns_are_qualified_and_keyed(
        func in prop::sample::select(vec!["array_agg", "count", "max", "min"]),
        column in "c_[a-z]{1,8}",
        alias in "a_[a-z]{1,8}",
    ) {
        prop_assume!(!denylisted(&column) && !denylisted(&alias));
        let mut spec = sidewalk_lamps();
        spec.aggregate = vec![format!("{func}({column}) AS {alias}")];
        let sql = compile(&spec).expect("aggregate compiles");
        let key = format!("'ext:{alias}'");
        let qualified = format!("source.{column}");
        let bare = format!("({column})");
        prop_assert!(sql.contains(&key));
        prop_assert!(sql.contains(&qualified));
        prop_assert!(!sql.contains(&bare));
    }
}

#[test]
fn extension_source_filters_read_feature_properties() {
    let mut spec = sidewalk_lamps();
    spec.source_dimension = "extension".into();
    spec.join_filter_source = Some("amenity='bench'".into());
    spec.aggregate = vec!["array_agg(amenity) as benches".into()];
    let sql = compile(&spec).expect("compile");
    assert!(sql.contains("LEFT JOIN content.extension source"));
    assert!(sql.contains("(source.feature -> 'properties' ->> 'amenity') = 'bench'"));
    assert!(sql.contains("ST_Transform(source.feature_loc, 3857)"));
    assert!(!sql.contains("source.amenity"));
}

#[test]
fn qualified_references_must_name_the_compiled_side() {
    let mut spec = sidewalk_lamps();
    spec.join_condition =
        "ST_Intersects(geometry_target, geometry_source) AND source.highway = target.highway".into();
    let sql = compile(&spec).expect("both aliases allowed in the join condition");
    assert!(sql.contains("source.highway = target.highway"));

    let mut spec = sidewalk_lamps();
    spec.join_filter_target = Some("source.highway = 'footway'".into());
    assert_eq!(
        compile(&spec).expect_err("wrong side").public_message(),
        "Invalid join filter"
    );

    let mut spec = sidewalk_lamps();
    spec.join_condition = "ST_Intersects(geometry_target, dataset.geom)".into();
    assert_eq!(
        compile(&spec).expect_err("foreign alias").public_message(),
        "Invalid join condition"
    );
}

#[test]
fn subqueries_and_trailing_tokens_are_rejected() {
    for filter in [
        "highway IN (SELECT highway FROM content.edge)",
        "EXISTS (SELECT 1)",
        "highway = (SELECT 'x')",
        "highway = ANY(ARRAY(SELECT highway FROM content.edge))",
        "query_to_xml('select * from content.dataset', true, false, '') IS NOT NULL",
        "length(dblink('host=elsewhere', 'select 1')) > 0",
        "highway = 'footway' footway",
    ] {
        let mut spec = sidewalk_lamps();
        spec.join_filter_target = Some(filter.into());
        assert_eq!(
            compile(&spec).expect_err(filter).public_message(),
            "Invalid join filter",
            "{filter}"
        );
    }
}

#[test]
fn zone_targets_select_their_required_columns() {
    let mut spec = sidewalk_lamps();
    spec.target_dimension = "Zone".into();
    spec.join_filter_target = Some("_w_id IS NOT NULL".into());
    let sql = compile(&spec).expect("compile");
    assert!(sql.starts_with("SELECT target.zone_id, target.zone_loc, target.node_ids,"));
    assert!(sql.contains("(target.node_ids IS NOT NULL)"));
    assert!(sql.contains("FROM content.zone target"));
}

#[test]
fn blank_join_condition_is_rejected() {
    let mut spec = sidewalk_lamps();
    spec.join_condition = "   ".into();
    assert_eq!(
        compile(&spec).expect_err("blank").public_message(),
        "Invalid join condition"
    );
}

#[test]
fn aggregates_with_their_own_filter_or_window_are_rejected() {
    for aggregate in [
        "count(*) FILTER (WHERE true) AS everything",
        "array_agg(highway) OVER () AS lamps",
        "array_agg(ARRAY(SELECT highway FROM content.edge)) AS leaked",
    ] {
        let mut spec = sidewalk_lamps();
        spec.aggregate = vec![aggregate.into()];
        assert_eq!(
            compile(&spec).expect_err(aggregate).public_message(),
            "Invalid aggregate syntax",
            "{aggregate}"
        );
    }
}

#[test]
fn attributes_and_transforms_flow_into_the_statement() {
    let mut spec = sidewalk_lamps();
    spec.transform_source = Some("ST_Centroid(geometry_source)".into());
    spec.attributes = vec!["highway as lamp_kind".into()];
    let sql = compile(&spec).expect("compile");
    assert!(sql.contains("ST_Contains(ST_Buffer(ST_Transform(target.edge_loc, 3857), 5), ST_Centroid(ST_Transform(source.point_loc, 3857)))"));
    assert!(sql.contains("jsonb_build_object('ext:lamp_kind', source.highway)"));
    assert!(sql.ends_with("source.highway, target.feature::jsonb"));
}
