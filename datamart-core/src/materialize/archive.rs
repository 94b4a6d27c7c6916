use std::{
    fs::{self, File},
    io,
    path::{Path, PathBuf},
};

use tracing::info;
use zip::{CompressionMethod, ZipWriter, write::SimpleFileOptions};

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<(String, PathBuf)>) -> io::Result<()> {
    let mut entries: Vec<_> = fs::read_dir(dir)?.collect::<io::Result<_>>()?;
    entries.sort_by_key(|entry| entry.file_name());
    for entry in entries {
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_files(root, &path, out)?;
        } else if let Ok(relative) = path.strip_prefix(root) {
            let name = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            out.push((name, path));
        }
    }
    Ok(())
}

/// Entries this large need ZIP64 headers.
fn needs_zip64(len: u64) -> bool {
    len >= u64::from(u32::MAX)
}

/// Zip the contents of `dir` (paths relative to it) into `archive`.
pub fn zip_directory(dir: &Path, archive: &Path) -> io::Result<()> {
    let mut files = Vec::new();
    collect_files(dir, dir, &mut files)?;

    let mut zip = ZipWriter::new(File::create(archive)?);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    for (name, path) in files {
        let mut file = File::open(path)?;
        let options = options.large_file(needs_zip64(file.metadata()?.len()));
        zip.start_file(name, options).map_err(io::Error::other)?;
        io::copy(&mut file, &mut zip)?;
    }
    zip.finish().map_err(io::Error::other)?.sync_all()
}

/// If a writer produced a directory at `output`, replace it with a zip
/// archive of the same name. Returns whether packaging happened.
pub fn package_if_directory(output: &Path) -> io::Result<bool> {
    if !fs::metadata(output)?.is_dir() {
        return Ok(false);
    }
    info!(path = %output.display(), "Result is a directory, creating ZIP file");
    let mut archive = output.as_os_str().to_owned();
    archive.push(".zip");
    let archive = PathBuf::from(archive);
    zip_directory(output, &archive)?;
    fs::remove_dir_all(output)?;
    fs::rename(&archive, output)?;
    Ok(true)
}
