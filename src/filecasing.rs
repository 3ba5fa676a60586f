use std::{fs, io, path::Path};
use walkdir::WalkDir;

/// Renames every file and directory under `root` to lower case, children
/// before their parent, and reports each changed path relative to `root` in
/// its original casing. Restore by feeding the reported paths back to
/// [`restore_case`].
pub fn make_lower_case(root: &Path, deliver: &mut dyn FnMut(String)) -> io::Result<()> {
    for entry in WalkDir::new(root).min_depth(1).contents_first(true) {
        let entry = entry.map_err(|err| {
            err.into_io_error()
                .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "walk loop"))
        })?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let lower = name.to_lowercase();
        if name == lower {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?
            .to_string_lossy()
            .into_owned();
        fs::rename(entry.path(), entry.path().with_file_name(&lower))?;
        deliver(relative);
    }
    Ok(())
}

/// Restores the casing of the entry at the base of `original`, a path
/// previously reported by [`make_lower_case`]. The directory part is assumed
/// to still be lower-cased; parents recorded after their children restore
/// themselves on later calls.
pub fn restore_case(root: &Path, original: &str) -> io::Result<()> {
    let original = Path::new(original);
    let parent = original
        .parent()
        .map(|dir| dir.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    let name = original
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let lower = name.to_string_lossy().to_lowercase();
    let dir = root.join(parent);
    fs::rename(dir.join(lower), dir.join(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn lower_and_restore_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("Addons/SubDir")).unwrap();
        fs::write(root.join("Addons/SubDir/File.PBO"), b"x").unwrap();
        fs::write(root.join("readme.txt"), b"x").unwrap();

        let mut changed = Vec::new();
        make_lower_case(root, &mut |path| changed.push(path)).unwrap();

        // Children are reported before their parents.
        assert_eq!(
            changed,
            vec![
                "Addons/SubDir/File.PBO".to_string(),
                "Addons/SubDir".to_string(),
                "Addons".to_string(),
            ]
        );
        assert!(root.join("addons/subdir/file.pbo").exists());
        assert!(root.join("readme.txt").exists());
        assert!(!root.join("Addons").exists());

        for path in &changed {
            restore_case(root, path).unwrap();
        }
        assert!(root.join("Addons/SubDir/File.PBO").exists());
        assert!(!root.join("addons").exists());
    }

    #[test]
    fn restore_missing_entry_reports_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = restore_case(dir.path(), "Gone/File.PBO").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn already_lowercase_tree_reports_nothing() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("addons")).unwrap();
        fs::write(dir.path().join("addons/mod.pbo"), b"x").unwrap();

        let mut changed = Vec::new();
        make_lower_case(dir.path(), &mut |path| changed.push(path)).unwrap();
        assert!(changed.is_empty());
    }
}
