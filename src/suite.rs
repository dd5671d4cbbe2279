//! Suite discovery.
//!
//! The builder walks the root depth-first with a single [`WalkDir`], keeping
//! the chain of open directories on a stack. Every directory yields a
//! [`DirectoryNode`], which may at the same time be a test unit (it has direct
//! image children) and a container of further nodes (it has subdirectories
//! with content). Both roles are honored.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::Config;
use crate::convert::{DocumentConverter, ExternalConverter};
use crate::error::{DiscoveryError, DiscoveryResult};
use crate::unit::{DocumentTest, FileKind, FolderTest, SingleFileTest, TestUnit};

/// Traversal result for one directory
#[derive(Debug)]
pub struct DirectoryNode {
    pub path: PathBuf,
    /// Set when the directory has at least one direct image child
    pub folder: Option<FolderTest>,
    pub documents: Vec<DocumentTest>,
    /// Subdirectories with qualifying content
    pub children: Vec<DirectoryNode>,
}

impl DirectoryNode {
    pub fn is_test_unit(&self) -> bool {
        self.folder.is_some()
    }

    pub fn has_children(&self) -> bool {
        !self.children.is_empty()
    }

    /// Whether nothing under this directory qualifies
    pub fn is_empty(&self) -> bool {
        self.folder.is_none() && self.documents.is_empty() && self.children.is_empty()
    }

    /// Flatten into units, depth-first: own folder test, own documents, then children
    fn collect_units(self, split_steps: bool, units: &mut Vec<Box<dyn TestUnit>>) {
        if let Some(folder) = self.folder {
            if split_steps {
                for step in folder.split() {
                    units.push(Box::new(step));
                }
            } else {
                units.push(Box::new(folder));
            }
        }
        for document in self.documents {
            units.push(Box::new(document));
        }
        for child in self.children {
            child.collect_units(split_steps, units);
        }
    }
}

/// A directory whose entries are still being read
struct PendingDir {
    path: PathBuf,
    images: Vec<PathBuf>,
    documents: Vec<DocumentTest>,
    children: Vec<DirectoryNode>,
}

impl PendingDir {
    fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            images: Vec::new(),
            documents: Vec::new(),
            children: Vec::new(),
        }
    }
}

/// The discovered units of one root, with the configuration they share
pub struct Suite {
    root: PathBuf,
    config: Arc<Config>,
    units: Vec<Box<dyn TestUnit>>,
}

impl Suite {
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn units(&self) -> &[Box<dyn TestUnit>] {
        &self.units
    }

    pub fn names(&self) -> Vec<&str> {
        self.units.iter().map(|u| u.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Hand the units over for execution
    pub fn into_units(self) -> Vec<Box<dyn TestUnit>> {
        self.units
    }
}

/// Builds a [`Suite`] from a directory tree or a single file
pub struct SuiteBuilder {
    config: Arc<Config>,
    converter: Arc<dyn DocumentConverter>,
}

impl SuiteBuilder {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            converter: Arc::new(ExternalConverter::default()),
        }
    }

    /// Use a specific converter for document tests
    pub fn with_converter(mut self, converter: Arc<dyn DocumentConverter>) -> Self {
        self.converter = converter;
        self
    }

    /// Discover every unit under `root`.
    ///
    /// Fails only when `root` itself is missing or unreadable; unreadable
    /// subtrees are skipped with a warning.
    pub fn build(&self, root: &Path) -> DiscoveryResult<Suite> {
        let root = fs::canonicalize(root).map_err(|e| unreadable(root, e))?;
        let metadata = fs::metadata(&root).map_err(|e| unreadable(&root, e))?;

        let mut units: Vec<Box<dyn TestUnit>> = Vec::new();
        if metadata.is_dir() {
            fs::read_dir(&root).map_err(|e| unreadable(&root, e))?;
            let tree = self.walk(&root)?;
            tree.collect_units(self.config.split_steps, &mut units);
        } else if let Some(unit) = self.file_unit(&root, &root) {
            units.push(unit);
        }

        info!("Discovered {} unit(s) under {}", units.len(), root.display());
        Ok(Suite {
            root,
            config: Arc::clone(&self.config),
            units,
        })
    }

    fn walk(&self, root: &Path) -> Result<DirectoryNode, walkdir::Error> {
        let mut stack: Vec<PendingDir> = Vec::new();

        for entry in WalkDir::new(root).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) if e.path() == Some(root) => return Err(e),
                Err(e) => {
                    // A directory that could not be listed is dropped with its subtree
                    if stack.last().is_some_and(|dir| Some(dir.path.as_path()) == e.path()) {
                        stack.pop();
                        warn!("Skipping unreadable directory: {}", e);
                    } else {
                        warn!("Skipping unreadable entry: {}", e);
                    }
                    continue;
                }
            };

            while stack.len() > entry.depth() {
                self.close_dir(&mut stack, root);
            }

            let path = entry.path();
            let file_type = entry.file_type();
            if file_type.is_dir() {
                stack.push(PendingDir::new(path));
                continue;
            }
            // Symlinked files are followed, symlinked directories are not
            if !(file_type.is_file() || (file_type.is_symlink() && path.is_file())) {
                continue;
            }
            let Some(dir) = stack.last_mut() else {
                continue;
            };

            match FileKind::of(path) {
                FileKind::Image => dir.images.push(path.to_path_buf()),
                FileKind::Document => {
                    if let Some(document) = self.document_unit(path, root) {
                        dir.documents.push(document);
                    }
                }
                FileKind::Other => {}
            }
        }

        while !stack.is_empty() {
            if let Some(tree) = self.close_dir(&mut stack, root) {
                return Ok(tree);
            }
        }
        Ok(self.finish_dir(PendingDir::new(root), root))
    }

    /// Pop the innermost open directory and attach its node to the parent.
    ///
    /// Returns the node once the root itself is closed.
    fn close_dir(&self, stack: &mut Vec<PendingDir>, root: &Path) -> Option<DirectoryNode> {
        let node = self.finish_dir(stack.pop()?, root);
        match stack.last_mut() {
            None => Some(node),
            Some(_) if node.is_empty() => {
                debug!("Nothing to test in {}", node.path.display());
                None
            }
            Some(parent) => {
                parent.children.push(node);
                None
            }
        }
    }

    fn finish_dir(&self, dir: PendingDir, root: &Path) -> DirectoryNode {
        let PendingDir {
            path,
            images,
            documents,
            children,
        } = dir;

        let folder = (!images.is_empty()).then(|| {
            debug!("Folder test {} ({} images)", path.display(), images.len());
            FolderTest::new(self.unit_name(root, &path), &path, images, Arc::clone(&self.config))
        });

        DirectoryNode {
            path,
            folder,
            documents,
            children,
        }
    }

    /// Unit for a root that is a single file
    fn file_unit(&self, path: &Path, root: &Path) -> Option<Box<dyn TestUnit>> {
        match FileKind::of(path) {
            FileKind::Image => Some(Box::new(SingleFileTest::new(
                self.unit_name(root, path),
                path,
                Arc::clone(&self.config),
            ))),
            FileKind::Document => self
                .document_unit(path, root)
                .map(|d| Box::new(d) as Box<dyn TestUnit>),
            FileKind::Other => {
                warn!("{} is neither an image nor a document", path.display());
                None
            }
        }
    }

    fn document_unit(&self, path: &Path, root: &Path) -> Option<DocumentTest> {
        if !self.config.capabilities.document_conversion {
            warn!("Skipping {}: document conversion is not available", path.display());
            return None;
        }
        Some(DocumentTest::new(
            self.unit_name(root, path),
            path,
            Arc::clone(&self.config),
            Arc::clone(&self.converter),
        ))
    }

    fn unit_name(&self, root: &Path, path: &Path) -> String {
        match &self.config.forced_name {
            Some(forced) => forced.clone(),
            None => relative_name(root, path),
        }
    }
}

fn unreadable(path: &Path, source: std::io::Error) -> DiscoveryError {
    match source.kind() {
        ErrorKind::NotFound => DiscoveryError::NotFound(path.to_path_buf()),
        _ => DiscoveryError::Unreadable {
            path: path.to_path_buf(),
            source,
        },
    }
}

/// Name of `path` relative to `root`, prefixed with the root's own name.
///
/// `/data/b` + `/data/b/c/x.png` gives `b/c/x.png`; the root itself is `b`.
pub fn relative_name(root: &Path, path: &Path) -> String {
    let label = root
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| root.display().to_string());

    match path.strip_prefix(root) {
        Ok(rel) if rel.as_os_str().is_empty() => label,
        Ok(rel) => {
            let parts: Vec<String> = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().to_string())
                .collect();
            format!("{}/{}", label, parts.join("/"))
        }
        Err(_) => path.display().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::write_png;
    use crate::config::Capabilities;
    use tempfile::TempDir;

    fn builder(config: Config) -> SuiteBuilder {
        SuiteBuilder::new(Arc::new(config))
    }

    #[test]
    fn test_folder_is_unit_and_container() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("b");
        write_png(&root.join("1.png"), 1, 1);
        write_png(&root.join("c/2.png"), 1, 1);
        fs::create_dir_all(root.join("empty/deeper")).unwrap();

        let root = fs::canonicalize(&root).unwrap();
        let tree = builder(Config::new("App")).walk(&root).unwrap();
        assert!(tree.is_test_unit());
        assert!(tree.has_children());
        assert_eq!(tree.children.len(), 1);
        assert!(tree.children[0].is_test_unit());
        assert!(!tree.children[0].has_children());
    }

    #[test]
    fn test_build_names_relative_to_root() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("b");
        write_png(&root.join("1.png"), 1, 1);
        write_png(&root.join("c/d/2.png"), 1, 1);
        fs::write(root.join("c/readme.txt"), "x").unwrap();

        let suite = builder(Config::new("App")).build(&root).unwrap();
        assert_eq!(suite.names(), vec!["b", "b/c/d"]);
    }

    #[test]
    fn test_sibling_order_after_nested_directories() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("r");
        write_png(&root.join("a/deep/er/1.png"), 1, 1);
        write_png(&root.join("a/2.png"), 1, 1);
        write_png(&root.join("b/1.png"), 1, 1);
        write_png(&root.join("z.png"), 1, 1);
        fs::create_dir_all(root.join("c/empty")).unwrap();

        let suite = builder(Config::new("App")).build(&root).unwrap();
        assert_eq!(suite.names(), vec!["r", "r/a", "r/a/deep/er", "r/b"]);

        let root = fs::canonicalize(&root).unwrap();
        let tree = builder(Config::new("App")).walk(&root).unwrap();
        let children: Vec<&Path> = tree.children.iter().map(|c| c.path.as_path()).collect();
        assert_eq!(children, vec![root.join("a").as_path(), root.join("b").as_path()]);
        // "deep" has no images of its own but contains "er"
        assert!(!tree.children[0].children[0].is_test_unit());
        assert!(tree.children[0].children[0].has_children());
    }

    #[test]
    fn test_documents_follow_capability() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("docs");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("a.pdf"), b"%PDF").unwrap();
        fs::write(root.join("b.ps"), b"%!PS").unwrap();

        let suite = builder(Config::new("App")).build(&root).unwrap();
        assert_eq!(suite.names(), vec!["docs/a.pdf", "docs/b.ps"]);

        let without = Config::new("App").capabilities(Capabilities {
            document_conversion: false,
        });
        assert!(builder(without).build(&root).unwrap().is_empty());
    }

    #[test]
    fn test_missing_root() {
        let dir = TempDir::new().unwrap();
        let result = builder(Config::new("App")).build(&dir.path().join("nope"));
        assert!(matches!(result, Err(DiscoveryError::NotFound(_))));
    }

    #[test]
    fn test_other_file_root_is_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("notes.txt");
        fs::write(&path, "x").unwrap();
        assert!(builder(Config::new("App")).build(&path).unwrap().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_unreadable_subtree_is_skipped() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let root = dir.path().join("r");
        write_png(&root.join("ok/1.png"), 1, 1);
        write_png(&root.join("locked/1.png"), 1, 1);
        let locked = root.join("locked");
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();

        // Privileged users can read it anyway
        let readable = fs::read_dir(&locked).is_ok();
        let suite = builder(Config::new("App")).build(&root).unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();

        if !readable {
            assert_eq!(suite.names(), vec!["r/ok"]);
        }
    }

    #[test]
    fn test_relative_name() {
        let root = Path::new("/data/b");
        assert_eq!(relative_name(root, root), "b");
        assert_eq!(relative_name(root, Path::new("/data/b/c/x.png")), "b/c/x.png");
        assert_eq!(relative_name(root, Path::new("/other")), "/other");
    }
}
