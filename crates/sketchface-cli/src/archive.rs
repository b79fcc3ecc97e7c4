//! Per-upload archive of the sketch and its reconstruction.
//!
//! Layout under the logs directory:
//!
//! ```text
//! logs/
//!   log.txt                      one line per upload
//!   <stem>/<name>                the uploaded sketch
//!   <stem>/reconstructed_<name>  the winning reconstruction
//! ```

use std::io::Write;
use std::path::{Path, PathBuf};

pub struct UploadArchive {
    logs_dir: PathBuf,
}

impl UploadArchive {
    pub fn new(logs_dir: impl Into<PathBuf>) -> Self {
        Self {
            logs_dir: logs_dir.into(),
        }
    }

    /// Copy both images into `<logs>/<stem>/` and append a line to `log.txt`.
    ///
    /// Returns the folder the upload was stored in. Re-uploading a sketch
    /// with the same name overwrites the earlier copies.
    pub fn store(&self, sketch: &Path, reconstruction: &Path) -> std::io::Result<PathBuf> {
        let name = sketch
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "sketch path has no file name",
                )
            })?;
        let stem = sketch
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| name.clone());

        let folder = self.logs_dir.join(&stem);
        std::fs::create_dir_all(&folder)?;
        std::fs::copy(sketch, folder.join(&name))?;
        std::fs::copy(reconstruction, folder.join(format!("reconstructed_{name}")))?;

        let mut log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.logs_dir.join("log.txt"))?;
        writeln!(log, "Upload '{name}': Stored in {}/{stem}/", self.logs_dir.display())?;

        tracing::info!(upload = %name, folder = %folder.display(), "upload archived");
        Ok(folder)
    }
}
