//! Bundling of log-type files before upload

use crate::error::{Result, UplinkError};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

/// Directory every bundled file is placed under inside the archive
const ENTRY_DIR: &str = "pack";

/// Extension of produced bundles. The content is a plain deflate zip.
const BUNDLE_EXTENSION: &str = "tgz";

/// `.log` and `.json` files are bundled before upload
pub fn is_log_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("log") || ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

/// Name a bundle of `src` is published under: `<stem>.tgz`
pub fn bundle_name(src: &Path) -> Result<String> {
    let stem = src
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| UplinkError::Archive(format!("no file stem: {}", src.display())))?;
    Ok(format!("{}.{}", stem, BUNDLE_EXTENSION))
}

/// Write `src` as the single entry `pack/<file name>` of a deflate zip
fn write_bundle(src: &Path, out: &File) -> Result<()> {
    let name = src
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| UplinkError::Archive(format!("no file name: {}", src.display())))?;

    let mut zip = ZipWriter::new(BufWriter::new(out));
    let options =
        SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    zip.start_file(format!("{}/{}", ENTRY_DIR, name), options)?;
    let mut input = BufReader::new(File::open(src)?);
    std::io::copy(&mut input, &mut zip)?;

    let writer = zip.finish()?;
    writer
        .into_inner()
        .map_err(|e| UplinkError::Io(e.into_error()))?
        .sync_all()?;
    Ok(())
}

/// Bundle `src` into a file of its own inside `staging_dir`. Bundles of
/// equally named files from different folders never share a path.
pub fn archive_file(src: &Path, staging_dir: &Path) -> Result<PathBuf> {
    let name = bundle_name(src)?;
    let suffix = format!(".{}", BUNDLE_EXTENSION);
    let prefix = format!("{}.", name.strip_suffix(&suffix).unwrap_or(&name));

    // removed on drop until kept
    let bundle = tempfile::Builder::new()
        .prefix(&prefix)
        .suffix(&suffix)
        .tempfile_in(staging_dir)?;
    write_bundle(src, bundle.as_file())?;

    let (_, path) = bundle.keep().map_err(|e| UplinkError::Io(e.error))?;
    Ok(path)
}

/// Archive `src` into `staging_dir` off the async runtime and return the
/// bundle path. Nothing is left behind on failure.
pub async fn archive_log_file(src: &Path, staging_dir: &Path) -> Result<PathBuf> {
    tokio::fs::create_dir_all(staging_dir).await?;

    let src = src.to_path_buf();
    let staging_dir = staging_dir.to_path_buf();
    tokio::task::spawn_blocking(move || archive_file(&src, &staging_dir))
        .await
        .map_err(|e| UplinkError::Archive(format!("archive task failed: {}", e)))?
}
