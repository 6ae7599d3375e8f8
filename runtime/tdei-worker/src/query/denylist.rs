use crate::error::{JobError, Result};

/// Case-insensitive substrings that reject a join spec outright.
pub const DENYLIST: [&str; 8] = [
    ";", "DROP", "DELETE", "UPDATE", "INSERT", "ALTER", "CREATE", "TRUNCATE",
];

/// Fails on the first field whose text contains a denylisted keyword.
/// This is a conservative substring scan, so `updated_at` is rejected too.
pub fn scan<'a, 'b>(fields: impl IntoIterator<Item = (&'a str, &'b str)>) -> Result<()> {
    for (field, text) in fields {
        let upper = text.to_ascii_uppercase();
        if DENYLIST.iter().any(|keyword| upper.contains(keyword)) {
            return Err(JobError::invalid(format!(
                "Harmful keyword found in input : {field}"
            )));
        }
    }
    Ok(())
}

/// Trims and collapses every whitespace run to a single space.
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_keywords_in_any_case() {
        let err = scan([("join_condition", "1=1"), ("aggregate", "array_agg(x); drop table t")])
            .expect_err("denylisted");
        assert_eq!(err.public_message(), "Harmful keyword found in input : aggregate");

        assert!(scan([("join_filter_source", "Truncate")]).is_err());
        assert!(scan([("join_filter_source", "highway='footway'")]).is_ok());
    }

    #[test]
    fn whitespace_runs_collapse() {
        assert_eq!(
            normalize_whitespace("  ST_Intersects(\n\tgeometry_target,   geometry_source ) "),
            "ST_Intersects( geometry_target, geometry_source )"
        );
    }
}
