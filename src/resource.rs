//! Resource managers, dispatch sessions and open-path routing.
//!
//! A [`Resource`] is the handler side of one registered device path: it
//! receives requests from a bounded queue and answers them through the
//! result slot, exactly like a kernel-resident service would. [`Session`]
//! owns the queue and the dispatch loop; [`Router`] models the kernel's
//! resource-manager table, including the fall-through to the real services
//! when an emulator answers "not found".

use std::fmt;
use std::sync::Arc;
use std::thread;

use log::error;
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::error::IosError;
use crate::ipc::Caller;
use crate::ipc::MAX_VECTORS;
use crate::ipc::Reply;
use crate::ipc::Request;
use crate::ipc::RequestBody;
use crate::ipc::Vectors;
use crate::queue::Queue;

/// Capacity of a resource manager's request queue.
pub(crate) const REQUEST_QUEUE_DEPTH: usize = 8;

/// Handler for one registered device path.
///
/// Every method has a default that answers the way the kernel does for an
/// unsupported command, so an implementation only overrides what its
/// service actually speaks. A handler that needs to defer its reply (the
/// notification channel parks long-polls) overrides [`Resource::handle_request`]
/// instead of the typed methods.
pub trait Resource: Send {
    /// Dispatch one request to the typed methods and reply.
    fn handle_request(&mut self, mut req: Request) {
        let fd = req.handle;
        let result = match &mut req.body {
            RequestBody::Open { path, mode, caller } => {
                let path = std::mem::take(path);
                self.open(&path, *mode, *caller)
            }
            RequestBody::Close => self.close(fd),
            RequestBody::Read { buf } => self.read(fd, buf.as_mut_slice()),
            RequestBody::Write { data } => self.write(fd, data.as_slice()),
            RequestBody::Seek { offset, origin } => self.seek(fd, *offset, *origin),
            RequestBody::Ioctl { cmd, input, output } => {
                self.ioctl(fd, *cmd, input.as_slice(), output.as_mut_slice())
            }
            RequestBody::Ioctlv { cmd, input, output } => {
                // The vector arrays live in a fixed kernel buffer; counts
                // past its capacity never reach a handler.
                if input.len() > MAX_VECTORS || output.len() > MAX_VECTORS {
                    IosError::Invalid.into()
                } else {
                    self.ioctlv(fd, *cmd, Vectors { input, output })
                }
            }
        };
        req.reply(result);
    }

    /// Open a path this manager registered for.
    fn open(&mut self, path: &str, mode: u32, caller: Caller) -> i32 {
        let _ = (path, mode, caller);
        IosError::NotFound.into()
    }

    /// Release a handle.
    fn close(&mut self, fd: i32) -> i32 {
        let _ = fd;
        0
    }

    /// Read into the caller's buffer; returns the byte count.
    fn read(&mut self, fd: i32, buf: &mut [u8]) -> i32 {
        let _ = (fd, buf);
        IosError::Invalid.into()
    }

    /// Write the caller's bytes; returns the byte count.
    fn write(&mut self, fd: i32, data: &[u8]) -> i32 {
        let _ = (fd, data);
        IosError::Invalid.into()
    }

    /// Move the file cursor; returns the new position.
    fn seek(&mut self, fd: i32, offset: i32, origin: i32) -> i32 {
        let _ = (fd, offset, origin);
        IosError::Invalid.into()
    }

    /// Device control with a single input and in/out buffer.
    fn ioctl(&mut self, fd: i32, cmd: u32, input: &[u8], output: &mut [u8]) -> i32 {
        let _ = (fd, cmd, input, output);
        IosError::Invalid.into()
    }

    /// Device control with scatter/gather vectors.
    fn ioctlv(&mut self, fd: i32, cmd: u32, vectors: Vectors<'_>) -> i32 {
        let _ = (fd, cmd, vectors);
        IosError::Invalid.into()
    }
}

/// The forwarding surface towards the real kernel services. On the console
/// every method is a syscall into the unpatched kernel; tests substitute
/// in-process fakes.
pub trait KernelIpc: Send + Sync {
    /// Open a path under the emulator's own identity.
    fn open(&self, path: &str, mode: u32) -> i32;

    /// Open a path while temporarily assuming the caller's identity, used
    /// when the filesystem emulator acquires its privileged real handle on
    /// behalf of a client.
    fn open_as(&self, path: &str, mode: u32, caller: Caller) -> i32 {
        let _ = caller;
        self.open(path, mode)
    }

    /// Close a real handle.
    fn close(&self, fd: i32) -> i32;

    /// Read from a real handle.
    fn read(&self, fd: i32, buf: &mut [u8]) -> i32;

    /// Write to a real handle.
    fn write(&self, fd: i32, data: &[u8]) -> i32;

    /// Seek a real handle.
    fn seek(&self, fd: i32, offset: i32, origin: i32) -> i32;

    /// Forward an ioctl verbatim.
    fn ioctl(&self, fd: i32, cmd: u32, input: &[u8], output: &mut [u8]) -> i32;

    /// Forward an ioctlv verbatim.
    fn ioctlv(&self, fd: i32, cmd: u32, vectors: Vectors<'_>) -> i32;
}

/// Sender half of a resource manager's request queue.
#[derive(Clone, Debug)]
pub struct Port {
    queue: Queue<Request>,
}

impl Port {
    fn call(&self, handle: i32, body: RequestBody) -> Reply {
        let (req, rx) = Request::new(handle, body);
        self.queue.send(req);
        rx.receive()
    }

    /// Issue an open request.
    pub fn open(&self, path: &str, mode: u32, caller: Caller) -> i32 {
        self.call(
            -1,
            RequestBody::Open {
                path: path.to_owned(),
                mode,
                caller,
            },
        )
        .result
    }

    /// Issue a close request.
    pub fn close(&self, fd: i32) -> i32 {
        self.call(fd, RequestBody::Close).result
    }

    /// Issue a read of `len` bytes; returns the result slot and the buffer.
    pub fn read(&self, fd: i32, len: usize) -> (i32, Vec<u8>) {
        let mut reply = self.call(fd, RequestBody::Read { buf: vec![0; len] });
        (reply.result, reply.output.pop().unwrap_or_default())
    }

    /// Issue a write.
    pub fn write(&self, fd: i32, data: &[u8]) -> i32 {
        self.call(
            fd,
            RequestBody::Write {
                data: data.to_vec(),
            },
        )
        .result
    }

    /// Issue a seek.
    pub fn seek(&self, fd: i32, offset: i32, origin: i32) -> i32 {
        self.call(fd, RequestBody::Seek { offset, origin }).result
    }

    /// Issue an ioctl with an output buffer of `out_len` bytes.
    pub fn ioctl(&self, fd: i32, cmd: u32, input: &[u8], out_len: usize) -> (i32, Vec<u8>) {
        let mut reply = self.call(
            fd,
            RequestBody::Ioctl {
                cmd,
                input: input.to_vec(),
                output: vec![0; out_len],
            },
        );
        (reply.result, reply.output.pop().unwrap_or_default())
    }

    /// Issue an ioctlv.
    pub fn ioctlv(
        &self,
        fd: i32,
        cmd: u32,
        inputs: &[&[u8]],
        out_lens: &[usize],
    ) -> (i32, Vec<Vec<u8>>) {
        let input: SmallVec<[Vec<u8>; 4]> = inputs.iter().map(|v| v.to_vec()).collect();
        let output: SmallVec<[Vec<u8>; 4]> = out_lens.iter().map(|&l| vec![0; l]).collect();
        let reply = self.call(fd, RequestBody::Ioctlv { cmd, input, output });
        (reply.result, reply.output.into_vec())
    }

    /// Enqueue a raw request without waiting for its reply.
    pub fn send(&self, req: Request) {
        self.queue.send(req);
    }
}

/// A resource manager bound to its request queue.
pub struct Session<R> {
    queue: Queue<Request>,
    resource: R,
}

impl<R> fmt::Debug for Session<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

impl<R: Resource + 'static> Session<R> {
    /// Create a session with the standard queue depth of 8.
    pub fn new(resource: R) -> Session<R> {
        Session {
            queue: Queue::new(REQUEST_QUEUE_DEPTH),
            resource,
        }
    }

    /// A sender handle for this session's queue.
    pub fn port(&self) -> Port {
        Port {
            queue: self.queue.clone(),
        }
    }

    /// Receive and dispatch a single request, blocking until one arrives.
    pub fn handle_one(&mut self) {
        let req = self.queue.receive();
        self.resource.handle_request(req);
    }

    /// Dispatch a request if one is queued.
    pub fn try_handle_one(&mut self) -> bool {
        match self.queue.try_receive() {
            Some(req) => {
                self.resource.handle_request(req);
                true
            }
            None => false,
        }
    }

    /// Direct access to the handler, for tests.
    pub fn resource_mut(&mut self) -> &mut R {
        &mut self.resource
    }

    /// Move the session onto its own dispatch thread.
    pub fn spawn(mut self, name: &str) -> thread::JoinHandle<()> {
        thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                loop {
                    self.handle_one();
                }
            })
            .expect("spawn resource thread")
    }
}

#[derive(Clone)]
enum Target {
    Port(Port),
    Kernel(Arc<dyn KernelIpc>),
}

/// An open descriptor together with the manager that owns it, as returned
/// by [`Router::open`]. This mirrors the kernel's per-descriptor owner
/// bookkeeping: follow-up commands go to whoever answered the open.
#[derive(Clone)]
pub struct RouteHandle {
    target: Target,
    fd: i32,
}

impl fmt::Debug for RouteHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteHandle")
            .field("fd", &self.fd)
            .finish_non_exhaustive()
    }
}

impl RouteHandle {
    /// The descriptor value the owning manager returned.
    pub fn fd(&self) -> i32 {
        self.fd
    }

    /// Close the descriptor.
    pub fn close(&self) -> i32 {
        match &self.target {
            Target::Port(p) => p.close(self.fd),
            Target::Kernel(k) => k.close(self.fd),
        }
    }

    /// Read up to `len` bytes.
    pub fn read(&self, len: usize) -> (i32, Vec<u8>) {
        match &self.target {
            Target::Port(p) => p.read(self.fd, len),
            Target::Kernel(k) => {
                let mut buf = vec![0; len];
                let ret = k.read(self.fd, &mut buf);
                (ret, buf)
            }
        }
    }

    /// Write `data`.
    pub fn write(&self, data: &[u8]) -> i32 {
        match &self.target {
            Target::Port(p) => p.write(self.fd, data),
            Target::Kernel(k) => k.write(self.fd, data),
        }
    }

    /// Seek.
    pub fn seek(&self, offset: i32, origin: i32) -> i32 {
        match &self.target {
            Target::Port(p) => p.seek(self.fd, offset, origin),
            Target::Kernel(k) => k.seek(self.fd, offset, origin),
        }
    }

    /// Ioctl with an `out_len`-byte output buffer.
    pub fn ioctl(&self, cmd: u32, input: &[u8], out_len: usize) -> (i32, Vec<u8>) {
        match &self.target {
            Target::Port(p) => p.ioctl(self.fd, cmd, input, out_len),
            Target::Kernel(k) => {
                let mut out = vec![0; out_len];
                let ret = k.ioctl(self.fd, cmd, input, &mut out);
                (ret, out)
            }
        }
    }

    /// Ioctlv.
    pub fn ioctlv(&self, cmd: u32, inputs: &[&[u8]], out_lens: &[usize]) -> (i32, Vec<Vec<u8>>) {
        match &self.target {
            Target::Port(p) => p.ioctlv(self.fd, cmd, inputs, out_lens),
            Target::Kernel(k) => {
                let input: Vec<Vec<u8>> = inputs.iter().map(|v| v.to_vec()).collect();
                let mut output: Vec<Vec<u8>> = out_lens.iter().map(|&l| vec![0; l]).collect();
                let ret = k.ioctlv(
                    self.fd,
                    cmd,
                    Vectors {
                        input: &input,
                        output: &mut output,
                    },
                );
                (ret, output)
            }
        }
    }
}

/// The kernel's resource-manager table: registered path prefixes in front,
/// the real services behind them.
///
/// An open is offered to registered managers in order of descending prefix
/// length; a manager that answers "not found" passes the open along, and if
/// nobody claims it the open goes to the real kernel. That fall-through is
/// what lets the filesystem emulator decline `/dev/net/...` and friends
/// without breaking them.
pub struct Router {
    routes: Mutex<Vec<(String, Port)>>,
    kernel: Arc<dyn KernelIpc>,
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let routes = self.routes.lock();
        f.debug_struct("Router")
            .field(
                "routes",
                &routes.iter().map(|(p, _)| p.clone()).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

impl Router {
    /// Create a table backed by the given real-service surface.
    pub fn new(kernel: Arc<dyn KernelIpc>) -> Router {
        Router {
            routes: Mutex::new(Vec::new()),
            kernel,
        }
    }

    /// Register a path prefix for a manager. Registering is what makes the
    /// alias visible; the open hook must not be installed before every
    /// emulator has done this.
    pub fn register(&self, path: &str, port: Port) {
        let mut routes = self.routes.lock();
        if routes.iter().any(|(p, _)| p == path) {
            error!("duplicate resource registration for {path}");
            return;
        }
        routes.push((path.to_owned(), port));
        routes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
    }

    /// The real-service surface behind the table.
    pub fn kernel(&self) -> Arc<dyn KernelIpc> {
        Arc::clone(&self.kernel)
    }

    /// Open `path`, consulting registered managers first.
    pub fn open(&self, path: &str, mode: u32, caller: Caller) -> Result<RouteHandle, i32> {
        let routes = self.routes.lock().clone();
        for (prefix, port) in &routes {
            if !path.starts_with(prefix.as_str()) {
                continue;
            }
            let fd = port.open(path, mode, caller);
            if fd == i32::from(IosError::NotFound) {
                continue;
            }
            if fd < 0 {
                return Err(fd);
            }
            return Ok(RouteHandle {
                target: Target::Port(port.clone()),
                fd,
            });
        }
        let fd = self.kernel.open_as(path, mode, caller);
        if fd < 0 {
            return Err(fd);
        }
        Ok(RouteHandle {
            target: Target::Kernel(Arc::clone(&self.kernel)),
            fd,
        })
    }
}
