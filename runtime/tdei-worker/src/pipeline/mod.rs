//! The streaming query-to-archive pipeline.

pub mod archive;
pub mod cursor;
pub mod envelope;
pub mod sink;

pub use archive::{ArchiveAssembler, ArchiveOutcome, SettlePolicy};
pub use cursor::{CursorPlan, CursorRef, StreamSummary, stream_plan};
pub use envelope::geojson_header;
pub use sink::SinkManager;

/// Live state of one job's uploads.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UploadContext {
    pub container_name: String,
    /// Job-scoped prefix every file is written under.
    pub file_path: String,
    pub output_file_name: String,
    /// Per-output file URLs, in finalization order.
    pub remote_urls: Vec<String>,
    pub zip_url: Option<String>,
}

impl UploadContext {
    pub fn new(
        container_name: impl Into<String>,
        file_path: impl Into<String>,
        output_file_name: impl Into<String>,
    ) -> Self {
        Self {
            container_name: container_name.into(),
            file_path: file_path.into(),
            output_file_name: output_file_name.into(),
            remote_urls: Vec::new(),
            zip_url: None,
        }
    }
}

/// How rows are serialized into output files.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    /// `osw.<key>.geojson`: envelope header, comma-separated features, `]}`.
    GeoJson,
    /// `osm.<key>.xml`: one line per row.
    OsmXml,
}

impl OutputFormat {
    pub fn file_name(self, key: &str) -> String {
        match self {
            Self::GeoJson => format!("osw.{key}.geojson"),
            Self::OsmXml => format!("osm.{key}.xml"),
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            Self::GeoJson => "application/json",
            Self::OsmXml => "application/xml",
        }
    }
}
