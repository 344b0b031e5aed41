use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;
use uuid::Uuid;

pub fn ensure_dir<P: AsRef<Path>>(path: P) -> io::Result<()> {
    fs::create_dir_all(path)
}

/// Write JSON to a file atomically: unique temp file in the same directory,
/// fsync, 0600, then rename onto the final name. A concurrent reader sees
/// either the old contents or the new contents, never a partial write.
pub fn atomic_write_json<T: serde::Serialize, P: AsRef<Path>>(path: P, data: &T) -> io::Result<()> {
    let path = path.as_ref();
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;

    ensure_dir(parent)?;

    let temp_name = format!(
        ".tmp.{}.{}",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("file"),
        Uuid::new_v4()
    );
    let temp_path = parent.join(temp_name);

    {
        let mut file = File::create(&temp_path)?;
        let json = serde_json::to_string_pretty(data)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(fs::Permissions::from_mode(0o600))?;
        }
    }

    if let Err(e) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(e);
    }
    Ok(())
}

/// Same as [`atomic_write_json`] but refuses to replace an existing file.
/// Returns `ErrorKind::AlreadyExists` when the final name is taken.
pub fn atomic_create_json<T: serde::Serialize, P: AsRef<Path>>(
    path: P,
    data: &T,
) -> io::Result<()> {
    let path = path.as_ref();
    if path.exists() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} already exists", path.display()),
        ));
    }
    atomic_write_json(path, data)
}

/// Read JSON from a file.
pub fn read_json<T: serde::de::DeserializeOwned, P: AsRef<Path>>(path: P) -> io::Result<T> {
    let file = File::open(path)?;
    let reader = io::BufReader::new(file);
    serde_json::from_reader(reader).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

pub fn remove_file_if_exists<P: AsRef<Path>>(path: P) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
