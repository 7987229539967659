use crate::error::{Result, store_error};
use crate::message::Operation;
use songbook_storage::{FileStore, SaveMode, TextFile};

/// Load a text file, creating it with `default` if it does not exist.
///
/// Used for files the application cannot work without (such as a folder's
/// index). Any failure other than "not found" is returned as-is.
pub async fn load_or_create_text(store: &dyn FileStore, path: &str, default: &str) -> Result<TextFile> {
    match store.load_text(path).await {
        Ok(file) => Ok(file),
        Err(err) if err.is_not_found() => {
            tracing::info!(path = %path, backend = store.name(), "Recreating missing file");
            let metadata = store
                .save_text(path.into(), SaveMode::Overwrite, default)
                .await
                .map_err(|err| store_error(Operation::Save, path, err))?;
            Ok(TextFile { metadata, text: default.to_string() })
        },
        Err(err) => Err(store_error(Operation::Load, path, err)),
    }
}
