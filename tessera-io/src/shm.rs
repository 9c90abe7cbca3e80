use std::fmt::{Debug, Formatter};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

use memmap2::MmapMut;
use tempfile::NamedTempFile;
use tessera_error::{TesseraResult, tessera_bail, tessera_err};

/// Allocates memory regions that workers fill and consumers read without copying.
pub trait SharedArena: Debug + Send + Sync + 'static {
    /// Allocates a zeroed region of `nbytes` bytes.
    fn allocate(&self, nbytes: usize) -> TesseraResult<SharedRegion>;
}

/// Names a [`SharedRegion`] so it can be mapped again, possibly by another process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShmHandle {
    path: Option<PathBuf>,
    len: usize,
}

impl ShmHandle {
    /// The backing file, or `None` for anonymous regions that only this process can see.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// A mapped region of shared memory.
///
/// The region hands out raw views. It performs no synchronisation of its own: callers must
/// ensure a region is written by at most one party at a time and never read while written.
/// The slot and stage protocols built on top of it provide that guarantee.
pub struct SharedRegion {
    ptr: NonNull<u8>,
    len: usize,
    handle: ShmHandle,
    // Kept alive for the lifetime of `ptr`.
    _map: MmapMut,
    // Present when this region created its backing file, which is unlinked on drop.
    _file: Option<NamedTempFile>,
}

// SAFETY: the region is plain memory. Exclusive access is the caller's contract, see the
// type-level documentation.
unsafe impl Send for SharedRegion {}
// SAFETY: as above.
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    fn from_map(mut map: MmapMut, path: Option<PathBuf>, file: Option<NamedTempFile>) -> Self {
        let len = map.len();
        let ptr = NonNull::new(map.as_mut_ptr()).unwrap_or(NonNull::dangling());
        Self {
            ptr,
            len,
            handle: ShmHandle { path, len },
            _map: map,
            _file: file,
        }
    }

    /// Maps an existing file-backed region by its handle.
    pub fn open(handle: &ShmHandle) -> TesseraResult<Self> {
        let Some(path) = handle.path() else {
            tessera_bail!("anonymous regions cannot be mapped by handle");
        };
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        if file.metadata()?.len() < handle.len as u64 {
            tessera_bail!(
                OutOfBounds: "{} is shorter than the {} bytes named by its handle",
                path.display(),
                handle.len
            );
        }
        // SAFETY: the file is owned by the arena that created it and never truncated while the
        // handle is live.
        let map = unsafe { memmap2::MmapOptions::new().len(handle.len).map_mut(&file) }?;
        Ok(Self::from_map(map, Some(path.to_path_buf()), None))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn handle(&self) -> &ShmHandle {
        &self.handle
    }

    /// Returns a shared view of the region.
    ///
    /// # Safety
    ///
    /// No mutable view of the region may be live for the lifetime of the returned slice.
    pub unsafe fn as_slice(&self) -> &[u8] {
        // SAFETY: `ptr` is valid for `len` bytes while the mapping is held; aliasing is the
        // caller's contract.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Returns a mutable view of the region.
    ///
    /// # Safety
    ///
    /// No other view of the region may be live for the lifetime of the returned slice.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
        // SAFETY: see `as_slice`; exclusivity is the caller's contract.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Debug for SharedRegion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("len", &self.len)
            .field("path", &self.handle.path)
            .finish()
    }
}

/// An arena of anonymous mappings, visible to the threads of this process only.
#[derive(Debug, Default, Clone, Copy)]
pub struct AnonymousArena;

impl SharedArena for AnonymousArena {
    fn allocate(&self, nbytes: usize) -> TesseraResult<SharedRegion> {
        if nbytes == 0 {
            tessera_bail!("cannot allocate an empty shared region");
        }
        let map = MmapMut::map_anon(nbytes)?;
        Ok(SharedRegion::from_map(map, None, None))
    }
}

/// An arena of file-backed mappings that any process holding a [`ShmHandle`] can map.
#[derive(Debug, Clone)]
pub struct FileArena {
    dir: PathBuf,
}

impl FileArena {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// An arena in `/dev/shm` where available, otherwise in the temporary directory.
    pub fn system() -> Self {
        let shm = Path::new("/dev/shm");
        if shm.is_dir() {
            Self::new(shm)
        } else {
            Self::new(std::env::temp_dir())
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl SharedArena for FileArena {
    fn allocate(&self, nbytes: usize) -> TesseraResult<SharedRegion> {
        if nbytes == 0 {
            tessera_bail!("cannot allocate an empty shared region");
        }
        let file = tempfile::Builder::new()
            .prefix("tessera-")
            .tempfile_in(&self.dir)
            .map_err(|e| tessera_err!("creating region in {}: {e}", self.dir.display()))?;
        file.as_file().set_len(nbytes as u64)?;
        // SAFETY: the file was just created by us and is sized before mapping.
        let map = unsafe { MmapMut::map_mut(file.as_file()) }?;
        log::trace!("allocated {nbytes} byte region at {}", file.path().display());
        Ok(SharedRegion::from_map(
            map,
            Some(file.path().to_path_buf()),
            Some(file),
        ))
    }
}
