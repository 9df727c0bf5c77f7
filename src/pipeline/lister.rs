//! Object listing: enumerate the source keys for a fresh batch.

use crate::error::BatchError;
use crate::storage::ObjectStore;
use tracing::info;

/// List every key under `prefix` whose extension is in `extensions`.
///
/// The order is whatever the store returns, which every bundled store keeps
/// sorted, so listing an unchanged store twice yields the same job order.
/// Failures are batch-fatal and are not retried here.
pub async fn list_sources(
    store: &dyn ObjectStore,
    prefix: &str,
    extensions: &[String],
) -> Result<Vec<String>, BatchError> {
    let keys = store
        .list(prefix, extensions)
        .await
        .map_err(|e| BatchError::Enumeration {
            location: format!("{}/{}", store.describe().trim_end_matches('/'), prefix),
            detail: e.to_string(),
        })?;

    info!(
        "Found {} source object(s) under {}/{} ({})",
        keys.len(),
        store.describe().trim_end_matches('/'),
        prefix,
        extensions.join(", ")
    );
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalStore;
    use tempfile::TempDir;

    #[tokio::test]
    async fn lists_matching_keys_in_order() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("in/sub")).unwrap();
        std::fs::write(dir.path().join("in/b.pdf"), b"x").unwrap();
        std::fs::write(dir.path().join("in/sub/a.pdf"), b"x").unwrap();
        std::fs::write(dir.path().join("in/skip.docx"), b"x").unwrap();

        let store = LocalStore::new(dir.path());
        let keys = list_sources(&store, "in", &["pdf".to_string()]).await.unwrap();
        assert_eq!(keys, vec!["in/b.pdf", "in/sub/a.pdf"]);
    }

    #[tokio::test]
    async fn unreachable_root_is_enumeration_error() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::new(dir.path().join("missing"));
        let err = list_sources(&store, "", &["pdf".to_string()]).await.unwrap_err();
        assert!(matches!(err, BatchError::Enumeration { .. }), "got: {err}");
    }
}
