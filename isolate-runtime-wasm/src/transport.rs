//! Getting a binary's bytes into this address space.
//!
//! A request carries either an owned byte block or host-side handles to a
//! shared-memory region and/or a plain file descriptor. Descriptor sources
//! are mapped read-only when possible and copied onto the heap otherwise.
//! The resolved [`TransportOutcome`] owns whatever was acquired and releases
//! it exactly once, on drop, with the action matching its [`Ownership`].

use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::ops::Deref;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::ptr::NonNull;

use log::{debug, error, info, warn};

use crate::config::HarnessConfig;
use crate::error::TransportError;

/// A host-side shared-memory object. Yields a fresh descriptor that the
/// transport owns and closes once the bytes are mapped or copied.
pub trait SharedRegion {
    fn dup_descriptor(&self) -> io::Result<OwnedFd>;
}

impl SharedRegion for File {
    fn dup_descriptor(&self) -> io::Result<OwnedFd> {
        self.as_fd().try_clone_to_owned()
    }
}

impl SharedRegion for OwnedFd {
    fn dup_descriptor(&self) -> io::Result<OwnedFd> {
        self.try_clone()
    }
}

/// A host-side wrapper around a plain file descriptor. The descriptor stays
/// owned by the wrapper; the transport only borrows it.
pub trait DescriptorHandle {
    fn descriptor(&self) -> Option<BorrowedFd<'_>>;
}

impl DescriptorHandle for File {
    fn descriptor(&self) -> Option<BorrowedFd<'_>> {
        Some(self.as_fd())
    }
}

impl DescriptorHandle for OwnedFd {
    fn descriptor(&self) -> Option<BorrowedFd<'_>> {
        Some(self.as_fd())
    }
}

pub enum BinarySource {
    /// The host handed over the raw bytes.
    Bytes(Vec<u8>),
    /// The bytes live behind descriptors. The shared-memory region is tried
    /// first, the plain descriptor second.
    Descriptors {
        shared_memory: Option<Box<dyn SharedRegion + Send>>,
        descriptor: Option<Box<dyn DescriptorHandle + Send>>,
    },
}

impl fmt::Debug for BinarySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            Self::Descriptors { shared_memory, descriptor } => f
                .debug_struct("Descriptors")
                .field("shared_memory", &shared_memory.is_some())
                .field("descriptor", &descriptor.is_some())
                .finish(),
        }
    }
}

/// One invocation's input. Immutable once built.
#[derive(Debug)]
pub struct ExecutionRequest {
    source: BinarySource,
    declared_size: usize,
    memory_budget_mb: u32,
}

impl ExecutionRequest {
    pub fn new(source: BinarySource, declared_size: usize, memory_budget_mb: u32) -> Self {
        Self { source, declared_size, memory_budget_mb }
    }

    pub fn direct(bytes: Vec<u8>, declared_size: usize, memory_budget_mb: u32) -> Self {
        Self::new(BinarySource::Bytes(bytes), declared_size, memory_budget_mb)
    }

    pub fn shared_memory(
        region: impl SharedRegion + Send + 'static,
        declared_size: usize,
        memory_budget_mb: u32,
    ) -> Self {
        let source = BinarySource::Descriptors {
            shared_memory: Some(Box::new(region)),
            descriptor: None,
        };
        Self::new(source, declared_size, memory_budget_mb)
    }

    pub fn descriptor(
        handle: impl DescriptorHandle + Send + 'static,
        declared_size: usize,
        memory_budget_mb: u32,
    ) -> Self {
        let source = BinarySource::Descriptors {
            shared_memory: None,
            descriptor: Some(Box::new(handle)),
        };
        Self::new(source, declared_size, memory_budget_mb)
    }

    pub fn source(&self) -> &BinarySource {
        &self.source
    }

    pub fn declared_size(&self) -> usize {
        self.declared_size
    }

    pub fn memory_budget_mb(&self) -> u32 {
        self.memory_budget_mb
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    DirectCopy,
    SharedMemoryMap,
    SharedMemoryFallbackCopy,
    DescriptorFallbackRead,
}

impl Strategy {
    /// Value of the report's `Transport:` line.
    pub fn transport_name(self) -> &'static str {
        match self {
            Self::DirectCopy => "Direct Byte Array (Hybrid)",
            Self::SharedMemoryMap => "Shared Memory (mmap FD)",
            Self::SharedMemoryFallbackCopy => "Shared Memory (Fallback)",
            Self::DescriptorFallbackRead => "File Descriptor (Fallback)",
        }
    }

    /// Value of the report's `Strategy:` line.
    pub fn strategy_name(self) -> &'static str {
        match self {
            Self::DirectCopy => "Copy",
            Self::SharedMemoryMap => "NDK/Ashmem",
            Self::SharedMemoryFallbackCopy | Self::DescriptorFallbackRead => "Heap Copy",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} / {}", self.transport_name(), self.strategy_name())
    }
}

/// Release action owed for a resolved buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// The caller owns the bytes; nothing to release.
    Borrowed,
    MustFree,
    MustUnmap,
}

/// A read-only, private mapping of a descriptor. Unmapped on drop.
pub struct MappedRegion {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the mapping is private and read-only, so sharing or moving the
// pointer across threads cannot race with writers in this process.
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    /// Maps `len` bytes of `fd` from offset 0.
    ///
    /// Regular files shorter than `len` are refused up front: touching a
    /// mapped page past end-of-file raises `SIGBUS` instead of an error.
    pub fn map_readonly(fd: BorrowedFd<'_>, len: usize) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "cannot map zero bytes"));
        }

        if let Some(size) = regular_file_size(fd)? {
            if size < len as u64 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("descriptor holds {} bytes, {} declared", size, len),
                ));
            }
        }

        // SAFETY: a fresh PROT_READ/MAP_PRIVATE mapping aliases no Rust
        // object; failure is reported through MAP_FAILED.
        let raw = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                fd.as_raw_fd(),
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let ptr = NonNull::new(raw.cast::<u8>())
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned null"))?;

        #[cfg(test)]
        instrument::record(instrument::Event::Map);
        Ok(Self { ptr, len })
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }
}

impl Deref for MappedRegion {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: `ptr` points at `len` readable bytes until `drop` unmaps them.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        // SAFETY: exactly the region returned by mmap, unmapped once.
        if unsafe { libc::munmap(self.ptr.as_ptr().cast(), self.len) } != 0 {
            error!("munmap failed: {}", io::Error::last_os_error());
        }
        #[cfg(test)]
        instrument::record(instrument::Event::Unmap);
    }
}

/// Size of `fd` when it is a regular file, `None` for pipes, sockets and
/// other descriptors without a meaningful length.
fn regular_file_size(fd: BorrowedFd<'_>) -> io::Result<Option<u64>> {
    // SAFETY: fstat fills the zeroed stat struct we own.
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd.as_raw_fd(), &mut st) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok((st.st_mode & libc::S_IFMT == libc::S_IFREG).then_some(st.st_size as u64))
}

/// Heap copy of a descriptor's contents.
pub struct HeapBuffer(Vec<u8>);

impl HeapBuffer {
    /// Reserves `len` bytes without touching them; pages are only committed
    /// as the read fills them.
    fn allocate(len: usize) -> Result<Self, TransportError> {
        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(len)
            .map_err(|_| TransportError::AllocationFailed(len))?;
        #[cfg(test)]
        instrument::record(instrument::Event::Alloc);
        Ok(Self(bytes))
    }
}

impl Deref for HeapBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl Drop for HeapBuffer {
    fn drop(&mut self) {
        #[cfg(test)]
        instrument::record(instrument::Event::Free);
    }
}

enum Buffer<'a> {
    Borrowed(&'a [u8]),
    Heap(HeapBuffer),
    Mapped(MappedRegion),
}

/// The bytes of one request plus how they were obtained.
pub struct TransportOutcome<'a> {
    strategy: Strategy,
    buffer: Buffer<'a>,
}

impl<'a> TransportOutcome<'a> {
    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn ownership(&self) -> Ownership {
        match self.buffer {
            Buffer::Borrowed(_) => Ownership::Borrowed,
            Buffer::Heap(_) => Ownership::MustFree,
            Buffer::Mapped(_) => Ownership::MustUnmap,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        match &self.buffer {
            Buffer::Borrowed(bytes) => bytes,
            Buffer::Heap(heap) => heap,
            Buffer::Mapped(region) => region,
        }
    }

    /// Releases the buffer now and reports which action ran.
    pub fn release(self) -> Ownership {
        let ownership = self.ownership();
        drop(self);
        ownership
    }
}

impl fmt::Debug for TransportOutcome<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportOutcome")
            .field("strategy", &self.strategy)
            .field("ownership", &self.ownership())
            .field("len", &self.bytes().len())
            .finish()
    }
}

/// Resolves requests into buffers, trying strategies in priority order.
#[derive(Debug, Clone)]
pub struct BinaryTransport {
    attempt_mmap: bool,
}

impl Default for BinaryTransport {
    fn default() -> Self {
        Self { attempt_mmap: true }
    }
}

impl BinaryTransport {
    pub fn new(attempt_mmap: bool) -> Self {
        Self { attempt_mmap }
    }

    pub fn from_config(config: &HarnessConfig) -> Self {
        Self::new(config.attempt_mmap)
    }

    pub fn resolve<'a>(
        &self,
        request: &'a ExecutionRequest,
    ) -> Result<TransportOutcome<'a>, TransportError> {
        let declared = request.declared_size();
        match request.source() {
            BinarySource::Bytes(bytes) => {
                let bytes = bytes.get(..declared).ok_or(TransportError::DeclaredSizeTooLarge {
                    declared,
                    available: bytes.len(),
                })?;
                Ok(TransportOutcome {
                    strategy: Strategy::DirectCopy,
                    buffer: Buffer::Borrowed(bytes),
                })
            }
            BinarySource::Descriptors { shared_memory, descriptor } => {
                if let Some(region) = shared_memory {
                    match region.dup_descriptor() {
                        Ok(fd) => {
                            return self.from_descriptor(
                                fd.as_fd(),
                                declared,
                                Strategy::SharedMemoryFallbackCopy,
                            );
                        }
                        Err(e) => error!("Shared memory FD extraction failed: {}", e),
                    }
                }

                if let Some(fd) = descriptor.as_ref().and_then(|handle| handle.descriptor()) {
                    return self.from_descriptor(fd, declared, Strategy::DescriptorFallbackRead);
                }

                Err(TransportError::NoUsableSource)
            }
        }
    }

    fn from_descriptor(
        &self,
        fd: BorrowedFd<'_>,
        declared: usize,
        fallback: Strategy,
    ) -> Result<TransportOutcome<'static>, TransportError> {
        if self.attempt_mmap {
            match MappedRegion::map_readonly(fd, declared) {
                Ok(region) => {
                    info!("mmap successful at address: {:p} ({} bytes)", region.as_ptr(), declared);
                    return Ok(TransportOutcome {
                        strategy: Strategy::SharedMemoryMap,
                        buffer: Buffer::Mapped(region),
                    });
                }
                Err(e) => warn!(
                    "mmap failed: {} (errno: {}). Attempting fallback to heap read...",
                    e,
                    e.raw_os_error().unwrap_or(0)
                ),
            }
        }

        let heap = read_fully(fd, declared)?;
        info!("Fallback successful. Loaded {} bytes via heap read.", heap.len());
        Ok(TransportOutcome { strategy: fallback, buffer: Buffer::Heap(heap) })
    }
}

/// Reads exactly `declared` bytes from the start of `fd`.
fn read_fully(fd: BorrowedFd<'_>, declared: usize) -> Result<HeapBuffer, TransportError> {
    // The declared size comes from the caller; a short regular file is
    // rejected before anything is reserved for it.
    if let Some(size) = regular_file_size(fd)? {
        if size < declared as u64 {
            error!("Read failed during fallback: descriptor holds {} of {} bytes", size, declared);
            return Err(TransportError::ShortRead { read: size as usize, declared });
        }
    }

    let mut buffer = HeapBuffer::allocate(declared)?;
    let mut file = File::from(fd.try_clone_to_owned()?);

    // A mapping attempt leaves the cursor alone, but the host may have read
    // from the descriptor already. Pipes cannot seek; read what is there.
    if let Err(e) = file.seek(SeekFrom::Start(0)) {
        debug!("Descriptor not seekable ({}), reading from current position", e);
    }

    // `read_to_end` retries interrupted reads and fills the reserved
    // capacity in place; `take` stops it at the declared size.
    if let Err(e) = file.take(declared as u64).read_to_end(&mut buffer.0) {
        error!("Read failed during fallback: {}", e);
        return Err(TransportError::Io(e));
    }
    let total = buffer.0.len();
    if total < declared {
        error!("Read failed during fallback: EOF after {} of {} bytes", total, declared);
        return Err(TransportError::ShortRead { read: total, declared });
    }
    Ok(buffer)
}
