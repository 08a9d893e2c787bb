//! Mesh documents written to storage.
//!
//! A [`MeshDocument`] is the serde JSON rendition of a mesh view or of a
//! single object's mesh.  Parent directories are created on demand.

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use gsm_types::{ColorScheme, GsmError, Label, MeshBlock};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshDocument {
    pub generated_at: DateTime<Utc>,
    /// `None` for a whole-scene mesh.
    pub label: Option<Label>,
    pub color_scheme: ColorScheme,
    pub vertex_count: usize,
    pub blocks: Vec<MeshBlock>,
}

impl MeshDocument {
    pub fn new(label: Option<Label>, color_scheme: ColorScheme, blocks: Vec<MeshBlock>) -> Self {
        Self {
            generated_at: Utc::now(),
            label,
            color_scheme,
            vertex_count: blocks.iter().map(|b| b.vertices.len()).sum(),
            blocks,
        }
    }
}

/// File name used for one object's mesh inside an export directory.
pub fn segment_mesh_path(dir: &Path, label: Label) -> PathBuf {
    dir.join(format!("segment_{}.json", label.0))
}

/// Write `document` to `path` as pretty JSON.
///
/// # Errors
///
/// [`GsmError::Export`] when the file cannot be created or written.
pub fn write_mesh(path: &Path, document: &MeshDocument) -> Result<(), GsmError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|e| GsmError::Export(format!("cannot create {}: {e}", parent.display())))?;
    }
    let file = File::create(path)
        .map_err(|e| GsmError::Export(format!("cannot create {}: {e}", path.display())))?;
    serde_json::to_writer_pretty(BufWriter::new(file), document)
        .map_err(|e| GsmError::Export(format!("cannot write {}: {e}", path.display())))?;
    info!(
        path = %path.display(),
        blocks = document.blocks.len(),
        vertices = document.vertex_count,
        "mesh written"
    );
    Ok(())
}

/// Read a document back.
pub fn read_mesh(path: &Path) -> Result<MeshDocument, GsmError> {
    let text = fs::read_to_string(path)
        .map_err(|e| GsmError::Export(format!("cannot read {}: {e}", path.display())))?;
    serde_json::from_str(&text).map_err(|e| GsmError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use gsm_types::{BlockIndex, Color, Point3};

    #[test]
    fn written_document_reads_back() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested/scene.json");
        let doc = MeshDocument::new(
            None,
            ColorScheme::Instance,
            vec![MeshBlock {
                index: BlockIndex::new(1, 2, 3),
                vertices: vec![Point3::new(1.0, 2.0, 3.0), Point3::new(1.5, 2.0, 3.0)],
                colors: vec![Color::GRAY, Color::GRAY],
            }],
        );
        write_mesh(&path, &doc)?;

        let back = read_mesh(&path)?;
        assert_eq!(back.vertex_count, 2);
        assert_eq!(back.color_scheme, ColorScheme::Instance);
        assert_eq!(back.blocks[0].index, BlockIndex::new(1, 2, 3));
        Ok(())
    }

    #[test]
    fn segment_paths_are_named_by_label() {
        let p = segment_mesh_path(Path::new("/tmp/out"), Label(12));
        assert_eq!(p, PathBuf::from("/tmp/out/segment_12.json"));
    }

    #[test]
    fn unwritable_path_is_an_export_error() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let blocker = dir.path().join("file");
        fs::write(&blocker, b"x")?;
        let result = write_mesh(&blocker.join("mesh.json"), &MeshDocument::new(None, ColorScheme::Label, vec![]));
        assert!(matches!(result, Err(GsmError::Export(_))));
        Ok(())
    }
}
