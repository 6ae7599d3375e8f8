use std::fmt;
use std::str::FromStr;

/// Geometry kinds a spatial join can address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Dimension {
    Edge,
    Node,
    Zone,
    Point,
    Line,
    Polygon,
    Extension,
}

impl Dimension {
    pub const ALL: [Dimension; 7] = [
        Dimension::Edge,
        Dimension::Node,
        Dimension::Zone,
        Dimension::Point,
        Dimension::Line,
        Dimension::Polygon,
        Dimension::Extension,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Edge => "edge",
            Self::Node => "node",
            Self::Zone => "zone",
            Self::Point => "point",
            Self::Line => "line",
            Self::Polygon => "polygon",
            Self::Extension => "extension",
        }
    }

    pub fn table(self) -> &'static str {
        match self {
            Self::Edge => "content.edge",
            Self::Node => "content.node",
            Self::Zone => "content.zone",
            Self::Point => "content.extension_point",
            Self::Line => "content.extension_line",
            Self::Polygon => "content.extension_polygon",
            Self::Extension => "content.extension",
        }
    }

    pub fn geometry_column(self) -> &'static str {
        match self {
            Self::Edge => "edge_loc",
            Self::Node => "node_loc",
            Self::Zone => "zone_loc",
            Self::Point => "point_loc",
            Self::Line => "line_loc",
            Self::Polygon => "polygon_loc",
            Self::Extension => "feature_loc",
        }
    }

    /// Columns every output row of this dimension carries. Empty for
    /// `extension`, which cannot be a join target.
    pub fn required_columns(self) -> &'static [&'static str] {
        match self {
            Self::Edge => &["edge_id", "edge_loc", "orig_node_id", "dest_node_id"],
            Self::Node => &["node_id", "node_loc"],
            Self::Zone => &["zone_id", "zone_loc", "node_ids"],
            Self::Point => &["point_id", "point_loc"],
            Self::Line => &["line_id", "line_loc"],
            Self::Polygon => &["polygon_id", "polygon_loc"],
            Self::Extension => &[],
        }
    }

    pub fn can_be_target(self) -> bool {
        !matches!(self, Self::Extension)
    }

    /// Attributes live in the feature payload rather than in columns.
    pub fn is_extension(self) -> bool {
        matches!(self, Self::Extension)
    }

    /// Maps OSW field names onto this dimension's columns.
    pub fn resolve_field<'a>(self, name: &'a str) -> &'a str {
        match (self, name) {
            (Self::Edge, "_id") => "edge_id",
            (Self::Edge, "_u_id") => "orig_node_id",
            (Self::Edge, "_v_id") => "dest_node_id",
            (Self::Node, "_id") => "node_id",
            (Self::Zone, "_id") => "zone_id",
            (Self::Zone, "_w_id") => "node_ids",
            (Self::Point, "_id") => "point_id",
            (Self::Line, "_id") => "line_id",
            (Self::Polygon, "_id") => "polygon_id",
            _ => name,
        }
    }

    /// `ST_Transform(<alias>.<geometry column>, 3857)`.
    pub fn geometry_expr(self, alias: &str) -> String {
        format!("ST_Transform({alias}.{}, 3857)", self.geometry_column())
    }
}

impl FromStr for Dimension {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        Self::ALL
            .into_iter()
            .find(|dim| dim.as_str().eq_ignore_ascii_case(value))
            .ok_or(())
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_names_case_insensitively() {
        assert_eq!("Edge".parse(), Ok(Dimension::Edge));
        assert_eq!(" polygon ".parse(), Ok(Dimension::Polygon));
        assert_eq!("extension".parse(), Ok(Dimension::Extension));
        assert_eq!("invalid_dimension".parse::<Dimension>(), Err(()));
    }

    #[test]
    fn osw_aliases_resolve_per_dimension() {
        assert_eq!(Dimension::Edge.resolve_field("_u_id"), "orig_node_id");
        assert_eq!(Dimension::Point.resolve_field("_id"), "point_id");
        assert_eq!(Dimension::Node.resolve_field("_u_id"), "_u_id");
        assert_eq!(Dimension::Edge.resolve_field("highway"), "highway");
    }

    #[test]
    fn extension_is_source_only() {
        assert!(!Dimension::Extension.can_be_target());
        assert!(Dimension::Extension.required_columns().is_empty());
        assert!(Dimension::Zone.can_be_target());
    }
}
