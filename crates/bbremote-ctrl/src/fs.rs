//! Host directory export.
//!
//! The remote agent reaches files on the host through `fs` packets. Each
//! request names an operation and is answered with a matching `fs_return`.
//! Failures travel back as negative errno values so the agent can hand them
//! straight to its own filesystem layer.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, warn};

use crate::error::{CtrlError, Result};
use crate::packet::{put_str, BodyReader};

/// Open flags as the agent sends them.
pub mod open_flags {
    pub const O_ACCMODE: u32 = 0o3;
    pub const O_RDONLY: u32 = 0o0;
    pub const O_WRONLY: u32 = 0o1;
    pub const O_RDWR: u32 = 0o2;
    pub const O_CREAT: u32 = 0o100;
    pub const O_EXCL: u32 = 0o200;
    pub const O_TRUNC: u32 = 0o1000;
    pub const O_APPEND: u32 = 0o2000;
}

pub const ENOENT: i32 = 2;
pub const EIO: i32 = 5;
pub const EBADF: i32 = 9;
pub const EACCES: i32 = 13;
pub const EEXIST: i32 = 17;
pub const EINVAL: i32 = 22;
pub const ENOSYS: i32 = 38;
pub const ELOOP: i32 = 40;

/// Largest chunk returned by one read.
pub const MAX_READ: u32 = 32 * 1024;

const OP_OPEN: u8 = 1;
const OP_CLOSE: u8 = 2;
const OP_READ: u8 = 3;
const OP_WRITE: u8 = 4;
const OP_STAT: u8 = 5;
const OP_READDIR: u8 = 6;
const OP_TRUNCATE: u8 = 7;

/// A file operation requested by the remote agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsRequest {
    Open { flags: u32, path: String },
    Close { handle: u32 },
    Read { handle: u32, offset: u64, size: u32 },
    Write { handle: u32, offset: u64, data: Bytes },
    Stat { path: String },
    Readdir { path: String },
    Truncate { handle: u32, size: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Directory,
}

/// Answer to an [`FsRequest`]. `result` is zero or a negative errno.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsReply {
    Open { result: i32, handle: u32, size: u64 },
    Close { result: i32 },
    Read { result: i32, data: Bytes },
    Write { result: i32, written: u32 },
    Stat { result: i32, kind: FileKind, size: u64 },
    Readdir { result: i32, names: Vec<String> },
    Truncate { result: i32 },
}

impl FsRequest {
    pub(crate) fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        match self {
            Self::Open { flags, path } => {
                buf.put_u8(OP_OPEN);
                buf.put_u32(*flags);
                put_str(buf, path)?;
            }
            Self::Close { handle } => {
                buf.put_u8(OP_CLOSE);
                buf.put_u32(*handle);
            }
            Self::Read {
                handle,
                offset,
                size,
            } => {
                buf.put_u8(OP_READ);
                buf.put_u32(*handle);
                buf.put_u64(*offset);
                buf.put_u32(*size);
            }
            Self::Write {
                handle,
                offset,
                data,
            } => {
                buf.put_u8(OP_WRITE);
                buf.put_u32(*handle);
                buf.put_u64(*offset);
                buf.put_slice(data);
            }
            Self::Stat { path } => {
                buf.put_u8(OP_STAT);
                put_str(buf, path)?;
            }
            Self::Readdir { path } => {
                buf.put_u8(OP_READDIR);
                put_str(buf, path)?;
            }
            Self::Truncate { handle, size } => {
                buf.put_u8(OP_TRUNCATE);
                buf.put_u32(*handle);
                buf.put_u64(*size);
            }
        }
        Ok(())
    }

    pub(crate) fn decode(body: &mut BodyReader) -> Result<Self> {
        let request = match body.u8()? {
            OP_OPEN => Self::Open {
                flags: body.u32()?,
                path: body.string()?,
            },
            OP_CLOSE => Self::Close {
                handle: body.u32()?,
            },
            OP_READ => Self::Read {
                handle: body.u32()?,
                offset: body.u64()?,
                size: body.u32()?,
            },
            OP_WRITE => Self::Write {
                handle: body.u32()?,
                offset: body.u64()?,
                data: body.rest(),
            },
            OP_STAT => Self::Stat {
                path: body.string()?,
            },
            OP_READDIR => Self::Readdir {
                path: body.string()?,
            },
            OP_TRUNCATE => Self::Truncate {
                handle: body.u32()?,
                size: body.u64()?,
            },
            op => return Err(CtrlError::Decode(format!("unknown fs operation {op}"))),
        };
        Ok(request)
    }

    /// The reply sent when nothing is exported.
    pub fn unsupported(&self) -> FsReply {
        FsReply::error(self, -ENOSYS)
    }
}

impl FsReply {
    /// A reply of the right shape for `request` carrying only `result`.
    pub fn error(request: &FsRequest, result: i32) -> Self {
        match request {
            FsRequest::Open { .. } => Self::Open {
                result,
                handle: 0,
                size: 0,
            },
            FsRequest::Close { .. } => Self::Close { result },
            FsRequest::Read { .. } => Self::Read {
                result,
                data: Bytes::new(),
            },
            FsRequest::Write { .. } => Self::Write { result, written: 0 },
            FsRequest::Stat { .. } => Self::Stat {
                result,
                kind: FileKind::File,
                size: 0,
            },
            FsRequest::Readdir { .. } => Self::Readdir {
                result,
                names: Vec::new(),
            },
            FsRequest::Truncate { .. } => Self::Truncate { result },
        }
    }

    pub fn result(&self) -> i32 {
        match self {
            Self::Open { result, .. }
            | Self::Close { result }
            | Self::Read { result, .. }
            | Self::Write { result, .. }
            | Self::Stat { result, .. }
            | Self::Readdir { result, .. }
            | Self::Truncate { result } => *result,
        }
    }

    pub(crate) fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        match self {
            Self::Open {
                result,
                handle,
                size,
            } => {
                buf.put_u8(OP_OPEN);
                buf.put_i32(*result);
                buf.put_u32(*handle);
                buf.put_u64(*size);
            }
            Self::Close { result } => {
                buf.put_u8(OP_CLOSE);
                buf.put_i32(*result);
            }
            Self::Read { result, data } => {
                buf.put_u8(OP_READ);
                buf.put_i32(*result);
                buf.put_slice(data);
            }
            Self::Write { result, written } => {
                buf.put_u8(OP_WRITE);
                buf.put_i32(*result);
                buf.put_u32(*written);
            }
            Self::Stat { result, kind, size } => {
                buf.put_u8(OP_STAT);
                buf.put_i32(*result);
                buf.put_u8(match kind {
                    FileKind::File => 0,
                    FileKind::Directory => 1,
                });
                buf.put_u64(*size);
            }
            Self::Readdir { result, names } => {
                buf.put_u8(OP_READDIR);
                buf.put_i32(*result);
                let count = u16::try_from(names.len())
                    .map_err(|_| CtrlError::Encode(format!("{} directory entries", names.len())))?;
                buf.put_u16(count);
                for name in names {
                    put_str(buf, name)?;
                }
            }
            Self::Truncate { result } => {
                buf.put_u8(OP_TRUNCATE);
                buf.put_i32(*result);
            }
        }
        Ok(())
    }

    pub(crate) fn decode(body: &mut BodyReader) -> Result<Self> {
        let op = body.u8()?;
        let result = body.i32()?;
        let reply = match op {
            OP_OPEN => Self::Open {
                result,
                handle: body.u32()?,
                size: body.u64()?,
            },
            OP_CLOSE => Self::Close { result },
            OP_READ => Self::Read {
                result,
                data: body.rest(),
            },
            OP_WRITE => Self::Write {
                result,
                written: body.u32()?,
            },
            OP_STAT => Self::Stat {
                result,
                kind: match body.u8()? {
                    0 => FileKind::File,
                    1 => FileKind::Directory,
                    other => return Err(CtrlError::Decode(format!("invalid file kind {other}"))),
                },
                size: body.u64()?,
            },
            OP_READDIR => {
                let count = body.u16()?;
                let mut names = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    names.push(body.string()?);
                }
                Self::Readdir { result, names }
            }
            OP_TRUNCATE => Self::Truncate { result },
            op => return Err(CtrlError::Decode(format!("unknown fs operation {op}"))),
        };
        Ok(reply)
    }
}

/// Serves one host directory to the remote agent.
///
/// Every path is resolved below the export root. Parent components are
/// rejected outright and symlinks that lead outside the root are refused.
#[derive(Debug)]
pub struct FsServer {
    root: PathBuf,
    handles: HashMap<u32, File>,
    next_handle: u32,
}

impl FsServer {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let path = root.as_ref();
        let export_error = |source| CtrlError::Export {
            path: path.to_path_buf(),
            source,
        };
        let root = path.canonicalize().map_err(export_error)?;
        if !root.is_dir() {
            return Err(export_error(io::Error::new(
                io::ErrorKind::InvalidInput,
                "not a directory",
            )));
        }
        debug!(root = %root.display(), "exporting directory");
        Ok(Self {
            root,
            handles: HashMap::new(),
            next_handle: 1,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Files currently held open by the agent.
    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    pub fn handle(&mut self, request: &FsRequest) -> FsReply {
        let reply = self.dispatch(request);
        if reply.result() < 0 {
            debug!(?request, errno = -reply.result(), "fs request failed");
        }
        reply
    }

    fn dispatch(&mut self, request: &FsRequest) -> FsReply {
        let result = match request {
            FsRequest::Open { flags, path } => self.open(*flags, path),
            FsRequest::Close { handle } => match self.handles.remove(handle) {
                Some(_) => Ok(FsReply::Close { result: 0 }),
                None => Err(-EBADF),
            },
            FsRequest::Read {
                handle,
                offset,
                size,
            } => self.read(*handle, *offset, *size),
            FsRequest::Write {
                handle,
                offset,
                data,
            } => self.write(*handle, *offset, data),
            FsRequest::Stat { path } => self.stat(path),
            FsRequest::Readdir { path } => self.readdir(path),
            FsRequest::Truncate { handle, size } => self
                .file(*handle)
                .and_then(|file| file.set_len(*size).map_err(|e| errno(&e)))
                .map(|()| FsReply::Truncate { result: 0 }),
        };
        result.unwrap_or_else(|result| FsReply::error(request, result))
    }

    fn open(&mut self, flags: u32, path: &str) -> std::result::Result<FsReply, i32> {
        use self::open_flags::*;

        let target = self.resolve(path)?;
        let mut options = OpenOptions::new();
        match flags & O_ACCMODE {
            O_RDONLY => options.read(true),
            O_WRONLY => options.write(true),
            O_RDWR => options.read(true).write(true),
            _ => return Err(-EINVAL),
        };
        let creates = flags & O_CREAT != 0;
        if creates && flags & O_EXCL != 0 {
            options.create_new(true);
        } else if creates {
            options.create(true);
        }
        if flags & O_TRUNC != 0 {
            options.truncate(true);
        }
        if flags & O_APPEND != 0 {
            options.append(true);
        }

        let file = options.open(&target).map_err(|e| errno(&e))?;
        let size = file.metadata().map_err(|e| errno(&e))?.len();

        let handle = self.next_handle;
        self.next_handle = self.next_handle.wrapping_add(1).max(1);
        self.handles.insert(handle, file);
        Ok(FsReply::Open {
            result: 0,
            handle,
            size,
        })
    }

    fn read(&mut self, handle: u32, offset: u64, size: u32) -> std::result::Result<FsReply, i32> {
        let file = self.file(handle)?;
        file.seek(SeekFrom::Start(offset)).map_err(|e| errno(&e))?;
        let mut data = Vec::with_capacity(size.min(MAX_READ) as usize);
        file.take(u64::from(size.min(MAX_READ)))
            .read_to_end(&mut data)
            .map_err(|e| errno(&e))?;
        Ok(FsReply::Read {
            result: 0,
            data: Bytes::from(data),
        })
    }

    fn write(&mut self, handle: u32, offset: u64, data: &[u8]) -> std::result::Result<FsReply, i32> {
        let file = self.file(handle)?;
        file.seek(SeekFrom::Start(offset)).map_err(|e| errno(&e))?;
        file.write_all(data).map_err(|e| errno(&e))?;
        Ok(FsReply::Write {
            result: 0,
            written: data.len() as u32,
        })
    }

    fn stat(&self, path: &str) -> std::result::Result<FsReply, i32> {
        let target = self.resolve(path)?;
        let meta = target.metadata().map_err(|e| errno(&e))?;
        let kind = if meta.is_dir() {
            FileKind::Directory
        } else {
            FileKind::File
        };
        Ok(FsReply::Stat {
            result: 0,
            kind,
            size: meta.len(),
        })
    }

    fn readdir(&self, path: &str) -> std::result::Result<FsReply, i32> {
        let target = self.resolve(path)?;
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&target).map_err(|e| errno(&e))? {
            let entry = entry.map_err(|e| errno(&e))?;
            match entry.file_name().into_string() {
                Ok(name) => names.push(name),
                Err(name) => warn!(?name, "skipping non-UTF-8 directory entry"),
            }
        }
        names.sort();
        Ok(FsReply::Readdir { result: 0, names })
    }

    fn file(&mut self, handle: u32) -> std::result::Result<&mut File, i32> {
        self.handles.get_mut(&handle).ok_or(-EBADF)
    }

    /// Map an agent path onto the export root.
    fn resolve(&self, path: &str) -> std::result::Result<PathBuf, i32> {
        let mut target = self.root.clone();
        for component in Path::new(path).components() {
            match component {
                Component::Normal(part) => target.push(part),
                Component::RootDir | Component::CurDir => {}
                Component::ParentDir | Component::Prefix(_) => return Err(-EINVAL),
            }
        }

        match real_path(&target) {
            Ok(real) if real.starts_with(&self.root) => Ok(real),
            Ok(real) => {
                warn!(path, resolved = %real.display(), "refusing path outside export root");
                Err(-EACCES)
            }
            Err(err) => Err(errno(&err)),
        }
    }
}

/// Symlink hops followed by hand before giving up with `ELOOP`.
const MAX_LINK_HOPS: usize = 16;

/// Where `path` really lands, following symlinks even when they dangle.
///
/// A missing final component resolves against its canonical parent, so the
/// result is what an `O_CREAT` open would create.
fn real_path(path: &Path) -> io::Result<PathBuf> {
    let mut current = path.to_path_buf();
    for _ in 0..MAX_LINK_HOPS {
        match std::fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => match current.canonicalize() {
                Ok(real) => return Ok(real),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    let link = std::fs::read_link(&current)?;
                    current = match current.parent() {
                        Some(dir) => dir.join(link),
                        None => link,
                    };
                }
                Err(err) => return Err(err),
            },
            Ok(_) => return current.canonicalize(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                let (Some(dir), Some(name)) = (current.parent(), current.file_name()) else {
                    return Err(io::Error::from_raw_os_error(EINVAL));
                };
                return Ok(dir.canonicalize()?.join(name));
            }
            Err(err) => return Err(err),
        }
    }
    Err(io::Error::from_raw_os_error(ELOOP))
}

fn errno(err: &io::Error) -> i32 {
    let code = err.raw_os_error().unwrap_or(match err.kind() {
        io::ErrorKind::NotFound => ENOENT,
        io::ErrorKind::PermissionDenied => EACCES,
        io::ErrorKind::AlreadyExists => EEXIST,
        io::ErrorKind::InvalidInput => EINVAL,
        _ => EIO,
    });
    -code
}
