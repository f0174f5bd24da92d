use anyhow::Context as _;
use inotify::{EventMask, WatchDescriptor, WatchMask, Watches};
use std::collections::{BTreeMap, HashMap};
use std::ffi::{CString, OsStr};
use std::fs;
use std::io;
use std::os::fd::{AsFd as _, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt as _;
use std::path::{Path, PathBuf};

/// Inotify mask installed on every watched directory. ONLYDIR guards
/// against a directory being replaced by a file between open and watch.
fn watch_mask() -> WatchMask {
    WatchMask::CREATE
        | WatchMask::DELETE
        | WatchMask::MOVED_FROM
        | WatchMask::MOVED_TO
        | WatchMask::ONLYDIR
}

/// Callbacks invoked by [`TreeWatch`] on confirmed hierarchy changes.
///
/// Implemented by the consumer (the release handler); there is exactly one
/// handler per tree and it is passed into each dispatching call, so the
/// tree never stores a reference to it.
pub trait TreeWatchHandler {
    /// A tracked directory became visible (created, moved in, or found by
    /// the post-watch scan). `directory_fd` is the open handle for it.
    fn on_directory_created(&mut self, relative_path: &Path, directory_fd: BorrowedFd<'_>);

    /// A tracked directory disappeared (deleted or moved away).
    fn on_directory_deleted(&mut self, relative_path: &Path);

    /// The inotify event queue overflowed; tracking for this tree is no
    /// longer reliable until the process is restarted.
    fn on_inotify_error(&mut self, error: anyhow::Error);
}

/// One node of the in-memory mirror of the watched directory hierarchy.
///
/// The node's name is its key in the parent's `children` map; nodes are
/// addressed by slash-separated relative path walked down from the root,
/// which replaces a parent back-pointer for path reconstruction.
struct Directory {
    /// Open handle, held while the backing directory exists on disk.
    fd: Option<OwnedFd>,
    /// Valid only while `fd` is valid.
    watch: Option<WatchDescriptor>,
    /// Keep this node in the tree even after its directory disappears,
    /// so it is re-armed automatically when the directory reappears.
    persist: bool,
    /// Watch and recurse into every child, not just explicitly added ones.
    all: bool,
    children: BTreeMap<String, Directory>,
}

impl Directory {
    fn new(persist: bool, all: bool) -> Self {
        Self {
            fd: None,
            watch: None,
            persist,
            all,
            children: BTreeMap::new(),
        }
    }

    fn is_open(&self) -> bool {
        self.fd.is_some()
    }
}

/// Watch registration state shared by the recursive tree operations.
/// Split out of [`TreeWatch`] so a node and the watch bookkeeping can be
/// borrowed at the same time.
struct WatchCtx<'a> {
    watches: &'a mut Watches,
    map: &'a mut HashMap<WatchDescriptor, PathBuf>,
}

impl WatchCtx<'_> {
    fn arm(&mut self, fd: &OwnedFd, relative_path: &Path) -> io::Result<WatchDescriptor> {
        let wd = self.watches.add(fd_path(fd), watch_mask())?;
        self.map.insert(wd.clone(), relative_path.to_path_buf());
        Ok(wd)
    }

    fn disarm(&mut self, wd: WatchDescriptor) {
        self.map.remove(&wd);
        // The kernel drops the watch on its own when the inode goes away;
        // EINVAL from a late removal is expected.
        let _ = self.watches.remove(wd);
    }
}

/// Recursive inotify watcher over an evolving directory hierarchy.
///
/// Tracks a tree of [`Directory`] nodes mirroring the watched portion of
/// the filesystem, registers/releases inotify watches as directories
/// appear and disappear, and reports confirmed changes through a
/// [`TreeWatchHandler`]. Newly opened directories are always re-scanned
/// for pre-existing entries, so a child created faster than its parent's
/// watch installation is still observed exactly once.
pub struct TreeWatch {
    watches: Watches,
    root: Directory,
    watch_map: HashMap<WatchDescriptor, PathBuf>,
}

impl TreeWatch {
    /// Open `base_path` and install the root watch. Failure here is a
    /// startup error; everything after construction is best-effort.
    pub fn new(mut watches: Watches, base_path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let base_path = base_path.into();
        let fd = open_dir(&base_path)
            .with_context(|| format!("failed to open {}", base_path.display()))?;

        let mut watch_map = HashMap::new();
        let wd = watches
            .add(fd_path(&fd), watch_mask())
            .with_context(|| format!("failed to watch {}", base_path.display()))?;
        watch_map.insert(wd.clone(), PathBuf::new());

        let mut root = Directory::new(true, false);
        root.fd = Some(fd);
        root.watch = Some(wd);

        Ok(Self {
            watches,
            root,
            watch_map,
        })
    }

    /// Register `relative_path` (slash-separated, relative to the watched
    /// root) for monitoring. Missing intermediate nodes are created as
    /// plain placeholders; the final component is marked persistent and
    /// fully recursive. Components that do not exist on disk yet stay
    /// closed and are armed once inotify reports their creation.
    pub fn add(
        &mut self,
        relative_path: &str,
        handler: &mut dyn TreeWatchHandler,
    ) -> anyhow::Result<()> {
        let segments: Vec<&str> = relative_path
            .split('/')
            .filter(|s| !s.is_empty())
            .collect();
        anyhow::ensure!(
            !segments.is_empty(),
            "empty watch path {relative_path:?}"
        );
        anyhow::ensure!(
            segments.iter().all(|s| *s != "." && *s != ".."),
            "watch path {relative_path:?} must not contain . or .. components"
        );

        let mut node = &mut self.root;
        for (i, segment) in segments.iter().enumerate() {
            let last = i + 1 == segments.len();
            node = node
                .children
                .entry((*segment).to_string())
                .or_insert_with(|| Directory::new(false, false));
            if last {
                node.persist = true;
                node.all = true;
            }
        }

        // Eagerly open whatever part of the chain already exists on disk.
        // Opening a node scans it, which in turn opens tracked children,
        // so arming the first closed node is enough for the whole chain.
        let mut ctx = WatchCtx {
            watches: &mut self.watches,
            map: &mut self.watch_map,
        };
        let mut parent = &mut self.root;
        let mut rel = PathBuf::new();
        let mut remaining = segments.iter();
        loop {
            let Some(segment) = remaining.next() else {
                // Every component was already open. The leaf has just
                // become recursive, so rescan it for children that
                // predate this registration; already-open children are
                // deduplicated by `child_appeared`.
                Self::scan(parent, &rel, &mut ctx, handler);
                break;
            };
            let open = parent
                .children
                .get(*segment)
                .is_some_and(Directory::is_open);
            if !open {
                Self::child_appeared(parent, &rel, segment, &mut ctx, handler);
                break;
            }
            rel.push(segment);
            match parent.children.get_mut(*segment) {
                Some(child) => parent = child,
                None => break,
            }
        }

        Ok(())
    }

    /// Interpret one raw inotify event against the tree.
    pub fn handle_event(
        &mut self,
        wd: &WatchDescriptor,
        mask: EventMask,
        name: Option<&OsStr>,
        handler: &mut dyn TreeWatchHandler,
    ) {
        if mask.contains(EventMask::Q_OVERFLOW) {
            handler.on_inotify_error(anyhow::anyhow!(
                "inotify event queue overflowed; directory tracking is no longer reliable"
            ));
            return;
        }
        if mask.contains(EventMask::IGNORED) {
            // Kernel-side watch removal; the node (if any) was already
            // closed when we processed the deletion itself.
            self.watch_map.remove(wd);
            return;
        }

        let Some(rel) = self.watch_map.get(wd).cloned() else {
            // Event for a watch we already released: expected churn.
            return;
        };
        let Some(name) = name.and_then(|n| n.to_str()) else {
            return;
        };
        if !mask.contains(EventMask::ISDIR) {
            return;
        }

        let mut ctx = WatchCtx {
            watches: &mut self.watches,
            map: &mut self.watch_map,
        };
        let Some(node) = node_mut(&mut self.root, &rel) else {
            return;
        };

        if mask.intersects(EventMask::CREATE | EventMask::MOVED_TO) {
            Self::child_appeared(node, &rel, name, &mut ctx, handler);
        } else if mask.intersects(EventMask::DELETE | EventMask::MOVED_FROM) {
            Self::child_disappeared(node, &rel, name, &mut ctx, handler);
        }
    }

    /// A directory named `name` became visible under `parent`. Opens a
    /// tracked (possibly previously closed) child, or creates a new one
    /// when the parent recurses into everything; other names are ignored.
    fn child_appeared(
        parent: &mut Directory,
        parent_rel: &Path,
        name: &str,
        ctx: &mut WatchCtx<'_>,
        handler: &mut dyn TreeWatchHandler,
    ) {
        if !parent.children.contains_key(name) {
            if !parent.all {
                return;
            }
            parent
                .children
                .insert(name.to_string(), Directory::new(false, true));
        }

        let Some(parent_fd) = parent.fd.as_ref() else {
            return;
        };
        let rel = parent_rel.join(name);
        let Some(child) = parent.children.get_mut(name) else {
            return;
        };
        if child.is_open() {
            // Duplicate notification (event raced the scan).
            return;
        }

        let fd = match open_dir_at(parent_fd, name) {
            Ok(fd) => fd,
            Err(e) if matches!(e.raw_os_error(), Some(libc::ENOENT) | Some(libc::ENOTDIR)) => {
                // Already gone again, or not a directory after all. The
                // node stays closed; a later event will re-arm or prune it.
                return;
            }
            Err(e) => {
                crate::reaper::daemon::reaper_event(
                    "watch",
                    format!("failed to open {}: {e}", rel.display()),
                );
                return;
            }
        };
        let wd = match ctx.arm(&fd, &rel) {
            Ok(wd) => wd,
            Err(e) => {
                crate::reaper::daemon::reaper_event(
                    "watch",
                    format!("failed to watch {}: {e}", rel.display()),
                );
                return;
            }
        };
        child.fd = Some(fd);
        child.watch = Some(wd);
        if let Some(fd) = child.fd.as_ref() {
            handler.on_directory_created(&rel, fd.as_fd());
        }

        // Children may already exist by the time the watch is in place;
        // scan so nothing created before this point is missed.
        Self::scan(child, &rel, ctx, handler);
    }

    /// Synthesize `child_appeared` for every subdirectory already present
    /// in an open node.
    fn scan(
        node: &mut Directory,
        rel: &Path,
        ctx: &mut WatchCtx<'_>,
        handler: &mut dyn TreeWatchHandler,
    ) {
        let Some(fd) = node.fd.as_ref() else {
            return;
        };
        let entries = match fs::read_dir(fd_path(fd)) {
            Ok(entries) => entries,
            Err(e) => {
                crate::reaper::daemon::reaper_event(
                    "watch",
                    format!("failed to scan {}: {e}", rel.display()),
                );
                return;
            }
        };
        let mut names = Vec::new();
        for entry in entries.flatten() {
            if entry.file_type().is_ok_and(|t| t.is_dir()) {
                if let Ok(name) = entry.file_name().into_string() {
                    names.push(name);
                }
            }
        }
        for name in names {
            Self::child_appeared(node, rel, &name, ctx, handler);
        }
    }

    /// A tracked child of `parent` disappeared: tear its subtree down.
    /// Unknown names are ignored (already reaped, or never tracked).
    fn child_disappeared(
        parent: &mut Directory,
        parent_rel: &Path,
        name: &str,
        ctx: &mut WatchCtx<'_>,
        handler: &mut dyn TreeWatchHandler,
    ) {
        let rel = parent_rel.join(name);
        let persist = match parent.children.get_mut(name) {
            Some(child) => {
                Self::close_subtree(child, &rel, ctx, handler);
                child.persist
            }
            None => return,
        };
        if !persist {
            parent.children.remove(name);
        }
    }

    /// Close a node and its descendants, children before parents: release
    /// handles and watches, fire the deleted callback for every node that
    /// was open, and prune non-persistent children.
    fn close_subtree(
        node: &mut Directory,
        rel: &Path,
        ctx: &mut WatchCtx<'_>,
        handler: &mut dyn TreeWatchHandler,
    ) {
        let names: Vec<String> = node.children.keys().cloned().collect();
        for name in names {
            let child_rel = rel.join(&name);
            let persist = match node.children.get_mut(&name) {
                Some(child) => {
                    Self::close_subtree(child, &child_rel, ctx, handler);
                    child.persist
                }
                None => continue,
            };
            if !persist {
                node.children.remove(&name);
            }
        }

        if let Some(wd) = node.watch.take() {
            ctx.disarm(wd);
        }
        if node.fd.take().is_some() {
            handler.on_directory_deleted(rel);
        }
    }
}

fn node_mut<'a>(root: &'a mut Directory, rel: &Path) -> Option<&'a mut Directory> {
    let mut node = root;
    for component in rel.components() {
        node = node.children.get_mut(component.as_os_str().to_str()?)?;
    }
    Some(node)
}

/// Path through which an already-open directory handle can be handed to
/// inotify and `read_dir` without re-resolving the original name.
fn fd_path(fd: &OwnedFd) -> PathBuf {
    PathBuf::from(format!("/proc/self/fd/{}", fd.as_raw_fd()))
}

fn open_dir(path: &Path) -> io::Result<OwnedFd> {
    let c = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    // SAFETY: plain open(2); returns -1 and sets errno on failure.
    let fd = unsafe {
        libc::open(
            c.as_ptr(),
            libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fd is a freshly opened descriptor we own.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Open a subdirectory relative to an already-open parent handle, so the
/// lookup cannot race with a concurrent rename of an ancestor.
fn open_dir_at(parent: &OwnedFd, name: &str) -> io::Result<OwnedFd> {
    let c = CString::new(name).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    // SAFETY: openat(2) with a valid parent descriptor.
    let fd = unsafe {
        libc::openat(
            parent.as_raw_fd(),
            c.as_ptr(),
            libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fd is a freshly opened descriptor we own.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

#[cfg(test)]
impl TreeWatch {
    fn watch_count(&self) -> usize {
        self.watch_map.len()
    }

    fn is_tracked(&self, rel: &str) -> bool {
        node_ref(&self.root, rel).is_some()
    }

    fn is_open(&self, rel: &str) -> bool {
        node_ref(&self.root, rel).is_some_and(Directory::is_open)
    }
}

#[cfg(test)]
fn node_ref<'a>(root: &'a Directory, rel: &str) -> Option<&'a Directory> {
    let mut node = root;
    for segment in rel.split('/').filter(|s| !s.is_empty()) {
        node = node.children.get(segment)?;
    }
    Some(node)
}
