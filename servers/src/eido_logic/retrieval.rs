//! Retrieval backed by a directory of `<referenceId>.json` files.

use eido_common::core::PeerIdentity;
use eido_common::retrieve::{EidoRetrieval, RetrievalOutcome};
use eido_common::EidoDocument;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

pub struct DirectoryRetrieval {
    dir: PathBuf,
}

impl DirectoryRetrieval {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl EidoRetrieval for DirectoryRetrieval {
    fn retrieve(&self, reference_id: &str, peer: &PeerIdentity) -> RetrievalOutcome {
        // Reference ids name files directly; anything that could leave the directory is refused.
        if reference_id.contains(['/', '\\']) || reference_id.starts_with('.') {
            log::warn!("Refusing reference id {:?} from {}", reference_id, peer);
            return RetrievalOutcome::Declined(404);
        }
        let path = self.dir.join(format!("{reference_id}.json"));
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return RetrievalOutcome::Declined(404),
            Err(e) => {
                log::error!("Failed to read {}: {}", path.display(), e);
                return RetrievalOutcome::Declined(500);
            }
        };
        match EidoDocument::from_json(&text) {
            Ok(eido) => RetrievalOutcome::Found(eido),
            Err(e) => {
                log::error!("{} is not valid JSON: {}", path.display(), e);
                RetrievalOutcome::Declined(500)
            }
        }
    }
}
