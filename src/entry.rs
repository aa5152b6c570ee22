use std::path::{Component, Path, PathBuf};
use tar_rs as tar;

/// Closed set of entry types the engine knows how to route.
///
/// Decoded from the tar type flag; tags outside this set (PAX headers,
/// GNU long-name records, sparse files) are skipped by the engine with
/// a warning rather than aborting the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Regular,
    Directory,
    Symlink,
    Hardlink,
    BlockDevice,
    CharDevice,
    Fifo,
}

impl EntryKind {
    pub fn from_tar(entry_type: tar::EntryType) -> Option<Self> {
        use tar::EntryType;
        match entry_type {
            EntryType::Regular | EntryType::Continuous => Some(EntryKind::Regular),
            EntryType::Directory => Some(EntryKind::Directory),
            EntryType::Symlink => Some(EntryKind::Symlink),
            EntryType::Link => Some(EntryKind::Hardlink),
            EntryType::Block => Some(EntryKind::BlockDevice),
            EntryType::Char => Some(EntryKind::CharDevice),
            EntryType::Fifo => Some(EntryKind::Fifo),
            _ => None,
        }
    }
}

/// Normalizes a stream path so it cannot escape the destination root.
/// `.` components are dropped, `..` pops, absolute prefixes are ignored.
pub fn normalize_entry_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();

    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(c) => out.push(c),
            Component::RootDir | Component::Prefix(_) => {}
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_kind_from_tar() {
        use tar::EntryType;
        assert_eq!(
            EntryKind::from_tar(EntryType::Regular),
            Some(EntryKind::Regular)
        );
        assert_eq!(
            EntryKind::from_tar(EntryType::Link),
            Some(EntryKind::Hardlink)
        );
        assert_eq!(
            EntryKind::from_tar(EntryType::Block),
            Some(EntryKind::BlockDevice)
        );
        assert_eq!(EntryKind::from_tar(EntryType::XHeader), None);
        assert_eq!(EntryKind::from_tar(EntryType::GNULongName), None);
    }

    #[test]
    fn test_normalize_entry_path() {
        assert_eq!(
            normalize_entry_path(Path::new("./etc/hosts")),
            PathBuf::from("etc/hosts")
        );
        assert_eq!(
            normalize_entry_path(Path::new("/etc/hosts")),
            PathBuf::from("etc/hosts")
        );
        assert_eq!(
            normalize_entry_path(Path::new("../../etc/passwd")),
            PathBuf::from("etc/passwd")
        );
        assert_eq!(
            normalize_entry_path(Path::new("a/b/../c")),
            PathBuf::from("a/c")
        );
    }
}
