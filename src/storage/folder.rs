//! Folder emulation over flat object stores / 目录模拟
//!
//! An otherwise-empty folder exists only through its stub object at
//! `<path>/folder.stubxx`. Every driver must write and recognise exactly
//! this name; changing it requires bumping `FOLDER_STUB_VERSION`.

use std::collections::BTreeMap;

use super::Entry;
use crate::utils::{folder_prefix, normalize_path};

/// Reserved file name of the folder stub / 目录占位文件名
pub const FOLDER_STUB_NAME: &str = "folder.stubxx";

/// Version of the stub naming convention / 占位约定版本
pub const FOLDER_STUB_VERSION: u32 = 1;

/// Stub object path for a folder / 目录占位对象路径
pub fn stub_path(folder: &str) -> String {
    format!("{}{}", folder_prefix(folder), FOLDER_STUB_NAME)
}

pub fn is_stub(path: &str) -> bool {
    crate::utils::file_name(path) == FOLDER_STUB_NAME
}

/// Group a flat recursive listing into the direct children of `prefix` / 按层级分组
///
/// Files directly under the prefix are returned as-is (stubs hidden), deeper
/// objects collapse into one virtual folder per first remaining segment.
/// Folders come first, each group sorted by name.
pub fn group_listing(prefix: &str, objects: &[Entry]) -> Vec<Entry> {
    let base = folder_prefix(prefix);
    let mut folders: BTreeMap<String, Entry> = BTreeMap::new();
    let mut files: Vec<Entry> = Vec::new();

    for object in objects {
        let path = normalize_path(&object.path);
        let rest = match path.strip_prefix(&base) {
            Some(rest) if !rest.is_empty() => rest,
            _ => continue,
        };

        let mut segments = rest.split('/');
        let first = segments.next().unwrap_or_default();
        let remaining: Vec<&str> = segments.collect();

        if remaining.is_empty() {
            if first != FOLDER_STUB_NAME {
                files.push(object.clone());
            }
            continue;
        }

        let folder = folders
            .entry(first.to_string())
            .or_insert_with(|| Entry::folder(&format!("{}{}", base, first)));
        if remaining.len() > 1 {
            folder.has_directories = true;
        }
        if remaining.len() == 1 && remaining[0] == FOLDER_STUB_NAME {
            folder.created = object.created.or(object.modified);
        }
        if object.modified > folder.modified {
            folder.modified = object.modified;
        }
    }

    files.sort_by(|a, b| a.name.cmp(&b.name));
    let mut result: Vec<Entry> = folders.into_values().collect();
    result.extend(files);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(path: &str) -> Entry {
        Entry::file(path, 3, None)
    }

    #[test]
    fn test_stub_path() {
        assert_eq!(stub_path("/docs/"), "docs/folder.stubxx");
        assert_eq!(stub_path(""), "folder.stubxx");
        assert!(is_stub("docs/folder.stubxx"));
        assert!(!is_stub("docs/readme.md"));
    }

    #[test]
    fn test_group_listing() {
        let objects = vec![
            file("docs/readme.md"),
            file("docs/folder.stubxx"),
            file("docs/img/a.png"),
            file("docs/img/thumbs/a.png"),
            file("docs/empty/folder.stubxx"),
            file("other/x.txt"),
        ];
        let listed = group_listing("docs", &objects);
        let names: Vec<&str> = listed.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["empty", "img", "readme.md"]);

        let img = &listed[1];
        assert!(img.is_dir);
        assert_eq!(img.path, "docs/img");
        assert!(img.has_directories);

        let empty = &listed[0];
        assert!(empty.is_dir);
        assert!(!empty.has_directories);
    }

    #[test]
    fn test_stub_only_folder_is_empty() {
        let objects = vec![file("docs/empty/folder.stubxx")];
        assert!(group_listing("docs/empty", &objects).is_empty());
        assert!(group_listing("docs/emp", &objects).is_empty());
        assert_eq!(group_listing("docs", &objects)[0].path, "docs/empty");
    }

    #[test]
    fn test_group_root() {
        let objects = vec![file("a.txt"), file("dir/b.txt"), file("folder.stubxx")];
        let listed = group_listing("", &objects);
        assert_eq!(listed.len(), 2);
        assert!(listed[0].is_dir);
        assert_eq!(listed[1].path, "a.txt");
    }
}
