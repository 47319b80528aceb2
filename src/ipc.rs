//! Request and reply model of the kernel IPC layer.
//!
//! Requests are heap-owned records handed to a resource manager's queue;
//! the handler mutates the output buffers in place and then replies through
//! the result slot. The record mirrors the shared-memory layout the kernel
//! uses: one command kind, a handle for everything but `Open`, and one
//! command-specific payload.

use std::fmt;

use bitflags::bitflags;
use num_enum::TryFromPrimitive;
use smallvec::SmallVec;

use crate::error::IosError;
use crate::queue::Queue;

/// Command kind of an IPC request.
#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive)]
#[repr(u32)]
#[allow(missing_docs)]
pub enum Command {
    Open = 1,
    Close = 2,
    Read = 3,
    Write = 4,
    Seek = 5,
    Ioctl = 6,
    Ioctlv = 7,
    /// Completion of a request this process issued to another manager.
    Reply = 8,
}

bitflags! {
    /// Access mode requested on open, and enforced on every read/write.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct OpenMode: u32 {
        /// Descriptor may be read from.
        const READ = 0x1;
        /// Descriptor may be written to.
        const WRITE = 0x2;
    }
}

/// Seek origin accepted by the filesystem services.
#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive)]
#[repr(i32)]
pub enum SeekOrigin {
    /// From the start of the file.
    Set = 0,
    /// From the current position.
    Cur = 1,
    /// From the end of the file.
    End = 2,
}

/// Identity of the process that issued a request, captured by the kernel at
/// open time.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Caller {
    /// Owner identifier of the calling title.
    pub uid: u32,
    /// Group ("maker") identifier of the calling title.
    pub gid: u16,
}

/// Command-specific payload of a request. Output buffers are owned by the
/// request and travel back to the caller in the [`Reply`].
#[derive(Debug)]
pub enum RequestBody {
    /// Open a device or file path.
    Open {
        /// Path as copied into kernel memory (after any hook rewriting).
        path: String,
        /// Requested access mode (raw; values above read|write are refused).
        mode: u32,
        /// Identity of the opener.
        caller: Caller,
    },
    /// Release a handle.
    Close,
    /// Read into a buffer of the given size.
    Read {
        /// Caller's buffer, sized to the requested length.
        buf: Vec<u8>,
    },
    /// Write the given bytes.
    Write {
        /// Bytes to write.
        data: Vec<u8>,
    },
    /// Move the file cursor.
    Seek {
        /// Signed displacement.
        offset: i32,
        /// Raw origin selector; values outside [`SeekOrigin`] are refused.
        origin: i32,
    },
    /// Device control with one input and one in/out buffer.
    Ioctl {
        /// Command number.
        cmd: u32,
        /// Input buffer.
        input: Vec<u8>,
        /// In/out buffer, pre-sized by the caller.
        output: Vec<u8>,
    },
    /// Device control with scatter/gather vectors; the first `input.len()`
    /// vectors are inputs, the rest outputs.
    Ioctlv {
        /// Command number.
        cmd: u32,
        /// Input vectors.
        input: SmallVec<[Vec<u8>; 4]>,
        /// Output vectors, each pre-sized by the caller.
        output: SmallVec<[Vec<u8>; 4]>,
    },
}

impl RequestBody {
    /// The command kind this payload belongs to.
    pub fn command(&self) -> Command {
        match self {
            RequestBody::Open { .. } => Command::Open,
            RequestBody::Close => Command::Close,
            RequestBody::Read { .. } => Command::Read,
            RequestBody::Write { .. } => Command::Write,
            RequestBody::Seek { .. } => Command::Seek,
            RequestBody::Ioctl { .. } => Command::Ioctl,
            RequestBody::Ioctlv { .. } => Command::Ioctlv,
        }
    }
}

/// Completion record sent back to the caller.
#[derive(Debug)]
pub struct Reply {
    /// Result slot: non-negative success value or a negative error (the
    /// disc service uses positive bit codes instead).
    pub result: i32,
    /// Output buffers, in the same order the request carried them.
    pub output: SmallVec<[Vec<u8>; 4]>,
}

/// A request as delivered to a resource manager.
///
/// Dropping a request without calling [`Request::reply`] would leave the
/// caller blocked forever, which mirrors what losing a kernel request would
/// do on the real system; handlers must reply exactly once.
pub struct Request {
    /// Handle the command targets; unspecified for `Open`.
    pub handle: i32,
    /// Command payload.
    pub body: RequestBody,
    reply_to: Queue<Reply>,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("handle", &self.handle)
            .field("body", &self.body)
            .finish_non_exhaustive()
    }
}

impl Request {
    /// Pair a new request with the capacity-1 queue its reply will land on.
    pub fn new(handle: i32, body: RequestBody) -> (Request, Queue<Reply>) {
        let reply_to = Queue::new(1);
        (
            Request {
                handle,
                body,
                reply_to: reply_to.clone(),
            },
            reply_to,
        )
    }

    /// Complete the request, handing the mutated output buffers back.
    pub fn reply(self, result: i32) {
        let output = match self.body {
            RequestBody::Ioctl { output, .. } => {
                let mut v = SmallVec::new();
                v.push(output);
                v
            }
            RequestBody::Ioctlv { output, .. } => output,
            RequestBody::Read { buf } => {
                let mut v = SmallVec::new();
                v.push(buf);
                v
            }
            _ => SmallVec::new(),
        };
        self.reply_to.send(Reply { result, output });
    }

    /// Fail the request with a kernel-level error.
    pub fn reply_error(self, err: IosError) {
        self.reply(err.into());
    }

    /// The single in/out buffer of an `Ioctl` request, if that is what this
    /// is. Used by handlers that park requests and fill them in later.
    pub fn ioctl_output(&mut self) -> Option<&mut [u8]> {
        match &mut self.body {
            RequestBody::Ioctl { output, .. } => Some(output.as_mut_slice()),
            _ => None,
        }
    }
}

/// Most vectors an ioctlv may carry on each side; counts above this are
/// refused before any handler sees the request.
pub const MAX_VECTORS: usize = 31;

/// Borrowed view of an ioctlv's vectors during dispatch.
#[derive(Debug)]
pub struct Vectors<'a> {
    /// Input vectors.
    pub input: &'a [Vec<u8>],
    /// Output vectors, mutated in place.
    pub output: &'a mut [Vec<u8>],
}

impl Vectors<'_> {
    /// Total number of vectors.
    pub fn count(&self) -> usize {
        self.input.len() + self.output.len()
    }

    /// True when any vector is declared with a length of zero. The real
    /// services treat such vectors as absent; handlers check this before
    /// touching vector contents.
    pub fn has_empty(&self, index: usize) -> bool {
        self.at(index).map(|v| v.is_empty()).unwrap_or(true)
    }

    fn at(&self, index: usize) -> Option<&[u8]> {
        if index < self.input.len() {
            Some(&self.input[index])
        } else {
            self.output
                .get(index - self.input.len())
                .map(|v| v.as_slice())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_carries_outputs_back() {
        let (req, rx) = Request::new(
            0,
            RequestBody::Ioctl {
                cmd: 7,
                input: vec![1, 2, 3],
                output: vec![0; 8],
            },
        );
        let mut req = req;
        req.ioctl_output().unwrap()[..4].copy_from_slice(&[9, 9, 9, 9]);
        req.reply(0);
        let reply = rx.receive();
        assert_eq!(reply.result, 0);
        assert_eq!(&reply.output[0][..4], &[9, 9, 9, 9]);
    }

    #[test]
    fn open_mode_bounds() {
        assert!(OpenMode::from_bits(3).is_some());
        assert!(OpenMode::from_bits(4).is_none());
    }

    #[test]
    fn command_numbers() {
        assert_eq!(Command::try_from(1u32), Ok(Command::Open));
        assert_eq!(Command::try_from(7u32), Ok(Command::Ioctlv));
        assert!(Command::try_from(9u32).is_err());
    }
}
