use anyhow::{Context, Result};
use eido_common::EidoDocument;
use std::fs;
use std::path::{Path, PathBuf};

/// Writes `eido` to `<dir>/<id>.json`. Documents without a usable id are
/// named after the time they arrived.
pub fn save_eido(dir: &Path, eido: &EidoDocument) -> Result<PathBuf> {
    fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let name = match eido.id() {
        Some(id) if !id.is_empty() && !id.contains(['/', '\\']) && !id.starts_with('.') => id.to_string(),
        _ => format!("eido_{}", chrono::Local::now().format("%Y%m%d_%H%M%S%.3f")),
    };
    let path = dir.join(format!("{name}.json"));
    let text = eido.to_json()?;
    fs::write(&path, text).with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_files_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let eido = EidoDocument::from_json(r#"{"$id":"e-42","incidentComponent":{"$id":"i"}}"#).unwrap();
        let path = save_eido(dir.path(), &eido).unwrap();
        assert_eq!(path, dir.path().join("e-42.json"));
        assert_eq!(EidoDocument::from_json(&fs::read_to_string(&path).unwrap()).unwrap(), eido);

        let unsafe_id = EidoDocument::from_json(r#"{"$id":"../x"}"#).unwrap();
        let path = save_eido(dir.path(), &unsafe_id).unwrap();
        assert!(path.file_name().unwrap().to_string_lossy().starts_with("eido_"));
    }
}
