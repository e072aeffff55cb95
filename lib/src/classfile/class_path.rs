use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;

/// Source of classfile bytes
pub trait ClassPath {
    /// Bytes of the classfile for an internal (slash separated) class name
    ///
    /// `None` means the class is not on this class path at all, as opposed to an error reading it.
    fn open(&self, name: &str) -> Option<io::Result<Vec<u8>>>;
}

/// List of directories searched in order, where `a/B` is found at `<dir>/a/B.class`
pub struct DirectoryClassPath {
    directories: Vec<PathBuf>,
}

impl DirectoryClassPath {
    pub fn new(directories: Vec<PathBuf>) -> DirectoryClassPath {
        DirectoryClassPath { directories }
    }

    /// Parse a class path string such as `classes:lib/classes`
    pub fn from_path_list(paths: &str) -> DirectoryClassPath {
        DirectoryClassPath::new(std::env::split_paths(paths).collect())
    }
}

impl ClassPath for DirectoryClassPath {
    fn open(&self, name: &str) -> Option<io::Result<Vec<u8>>> {
        let relative = format!("{}.class", name);
        self.directories
            .iter()
            .map(|dir| dir.join(&relative))
            .find(|path| path.is_file())
            .map(fs::read)
    }
}

/// Class path backed by an in-memory map (eg. for tests)
#[derive(Default)]
pub struct MemoryClassPath {
    classes: HashMap<String, Vec<u8>>,
}

impl MemoryClassPath {
    pub fn new() -> MemoryClassPath {
        MemoryClassPath::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, bytes: Vec<u8>) {
        self.classes.insert(name.into(), bytes);
    }

    pub fn with(mut self, name: impl Into<String>, bytes: Vec<u8>) -> MemoryClassPath {
        self.insert(name, bytes);
        self
    }
}

impl ClassPath for MemoryClassPath {
    fn open(&self, name: &str) -> Option<io::Result<Vec<u8>>> {
        self.classes.get(name).map(|bytes| Ok(bytes.clone()))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn memory_lookup() {
        let path = MemoryClassPath::new().with("a/B", vec![1, 2, 3]);
        assert_eq!(path.open("a/B").unwrap().unwrap(), vec![1, 2, 3]);
        assert!(path.open("a/C").is_none());
    }

    #[test]
    fn directory_lookup() {
        let dir = std::env::temp_dir().join(format!("suite-cp-{}", std::process::id()));
        fs::create_dir_all(dir.join("a")).unwrap();
        fs::write(dir.join("a").join("B.class"), [0xCA, 0xFE]).unwrap();

        let path = DirectoryClassPath::new(vec![PathBuf::from("/nonexistent"), dir.clone()]);
        assert_eq!(path.open("a/B").unwrap().unwrap(), vec![0xCA, 0xFE]);
        assert!(path.open("a/Missing").is_none());

        fs::remove_dir_all(dir).unwrap();
    }
}
