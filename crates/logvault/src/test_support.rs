//! Builders shared by unit tests

use crate::types::{SourceKind, Truss};
use std::path::PathBuf;

pub(crate) fn sample_truss(path: &str, ts: i64) -> Truss {
    Truss {
        device_name: "Dev".to_string(),
        channel_number: 1,
        object_key: String::new(),
        start_timestamp_ms: ts,
        recordset_ordinal: 0,
        recordset_base_name: "1) Flight".to_string(),
        source_path: PathBuf::from(path),
        resolved_path: PathBuf::from(path),
        link_path: None,
        object_directory: String::new(),
        file_size: 10,
        file_modified_ms: 0,
        kind: SourceKind::SelfDescribing,
        complete: false,
    }
}
