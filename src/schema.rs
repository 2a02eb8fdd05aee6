use std::{fs, path::Path, path::PathBuf};

use anyhow::Result;
use chat_update::Update;
use schemars::schema_for;

use crate::config::FlowConfig;
use crate::pipeline::HandlingReport;
use crate::road::Journey;
use crate::step::Continuation;

/// Write JSON schemas of everything that crosses a process boundary into
/// `out_dir`. Returns the written files.
pub fn write_schema(out_dir: &Path) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(out_dir)?;

    let schemas = [
        ("update.schema.json", serde_json::to_string_pretty(&schema_for!(Update))?),
        ("continuation.schema.json", serde_json::to_string_pretty(&schema_for!(Continuation))?),
        ("journey.schema.json", serde_json::to_string_pretty(&schema_for!(Journey))?),
        ("report.schema.json", serde_json::to_string_pretty(&schema_for!(HandlingReport))?),
        ("config.schema.json", serde_json::to_string_pretty(&schema_for!(FlowConfig))?),
    ];

    let mut written = Vec::with_capacity(schemas.len());
    for (file, json) in schemas {
        let path = out_dir.join(file);
        fs::write(&path, json)?;
        written.push(path);
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_schema() {
        let dir = tempfile::tempdir().unwrap();
        let written = write_schema(&dir.path().join("schemas")).unwrap();

        assert_eq!(written.len(), 5);
        let update = fs::read_to_string(dir.path().join("schemas/update.schema.json")).unwrap();
        assert!(update.contains("chat_id"));
        let continuation = fs::read_to_string(dir.path().join("schemas/continuation.schema.json")).unwrap();
        assert!(continuation.contains("initializer"));
    }
}
