/// Filesystem helpers for moving working directories in and out of jails
use std::fs;
use std::io;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

/// Recursively copy `src` to `dst`, creating `dst` when missing
///
/// File modes are kept and symlinks are recreated rather than followed.
pub fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    let metadata = fs::symlink_metadata(src)?;
    let file_type = metadata.file_type();

    if file_type.is_symlink() {
        let target = fs::read_link(src)?;
        if fs::symlink_metadata(dst).is_ok() {
            fs::remove_file(dst)?;
        }
        symlink(target, dst)?;
    } else if file_type.is_dir() {
        fs::create_dir_all(dst)?;
        for entry in fs::read_dir(src)? {
            let entry = entry?;
            copy_tree(&entry.path(), &dst.join(entry.file_name()))?;
        }
        // Applied last so read-only directories can still be filled
        fs::set_permissions(dst, metadata.permissions())?;
    } else {
        fs::copy(src, dst)?;
    }

    Ok(())
}

/// Remove a directory tree; a missing tree is not an error
pub fn remove_tree(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Sorted relative paths of everything below `root`
pub fn tree_listing(root: &Path) -> io::Result<Vec<PathBuf>> {
    let mut listing = Vec::new();
    collect(root, Path::new(""), &mut listing)?;
    listing.sort();
    Ok(listing)
}

fn collect(dir: &Path, relative: &Path, listing: &mut Vec<PathBuf>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let rel = relative.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            collect(&entry.path(), &rel, listing)?;
        }
        listing.push(rel);
    }
    Ok(())
}
