use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{Adapter, AdapterTarget};
use crate::callbacks::{Callback, CallbackId, Context, SyscallArgs, When};
use crate::state::Register;
use crate::syscall::{decode_return, nr};
use crate::thread::Tid;
use crate::trace::Transcript;

/// Largest data excerpt kept per record.
const MAX_EXCERPT: u32 = 256;

/// File operation observed by [`TraceFileIo`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileIoOp {
    /// `read`
    Read,
    /// `write`
    Write,
    /// `close`
    Close,
    /// `lseek`
    Lseek,
}

impl FileIoOp {
    const fn from_callno(callno: u32) -> Option<Self> {
        match callno {
            nr::READ => Some(Self::Read),
            nr::WRITE => Some(Self::Write),
            nr::CLOSE => Some(Self::Close),
            nr::LSEEK => Some(Self::Lseek),
            _ => None,
        }
    }

    const fn name(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Close => "close",
            Self::Lseek => "lseek",
        }
    }
}

/// One observed operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileIoRecord {
    /// Calling thread.
    pub tid: Tid,
    /// Operation.
    pub op: FileIoOp,
    /// Guest descriptor.
    pub fd: u32,
    /// Raw `r0` after the call; `None` when the default action was suppressed.
    pub result: Option<u32>,
    /// Bytes transferred, for successful reads and writes.
    pub data: Vec<u8>,
}

#[derive(Debug)]
struct FileIoObserver {
    fds: Mutex<BTreeSet<u32>>,
    records: Mutex<Vec<FileIoRecord>>,
    transcript: Transcript,
}

impl FileIoObserver {
    fn record(&self, enabled: bool, args: &SyscallArgs, cx: &Context<'_>) -> Option<FileIoRecord> {
        let op = FileIoOp::from_callno(args.callno)?;
        let fd = args.arg(0);
        if !self.fds.lock().contains(&fd) {
            return None;
        }
        let result = if enabled {
            cx.thread().map(|thread| thread.regs().get(Register::R0))
        } else {
            None
        };
        let data = match (op, result.map(decode_return)) {
            (FileIoOp::Read | FileIoOp::Write, Some(Ok(n))) => cx
                .process()
                .memory()
                .read_vec(args.arg(1), n.min(MAX_EXCERPT) as usize)
                .unwrap_or_default(),
            _ => Vec::new(),
        };
        Some(FileIoRecord {
            tid: args.tid,
            op,
            fd,
            result,
            data,
        })
    }
}

fn describe(record: &FileIoRecord) -> String {
    let mut line = format!("[{}] {}({})", record.tid, record.op.name(), record.fd);
    match record.result.map(decode_return) {
        None => line.push_str(" suppressed"),
        Some(Ok(value)) => {
            let _ = write!(line, " = {value}");
        }
        Some(Err(errno)) => {
            let _ = write!(line, " = -{}", errno.desc());
        }
    }
    if !record.data.is_empty() {
        let _ = write!(line, " {:?}", String::from_utf8_lossy(&record.data));
    }
    line
}

impl Callback<SyscallArgs> for FileIoObserver {
    fn call(&self, enabled: bool, args: &SyscallArgs, cx: &mut Context<'_>) -> bool {
        if let Some(record) = self.record(enabled, args, cx) {
            self.transcript.line(&describe(&record));
            self.records.lock().push(record);
        }
        enabled
    }

    fn duplicate(self: Arc<Self>) -> Arc<dyn Callback<SyscallArgs>> {
        self
    }
}

/// Records `read`, `write`, `close` and `lseek` on chosen descriptors
/// without altering them.
#[derive(Debug, Clone)]
pub struct TraceFileIo {
    observer: Arc<FileIoObserver>,
}

impl TraceFileIo {
    /// Tracer writing its lines to `transcript`.
    #[must_use]
    pub fn new(transcript: Transcript) -> Self {
        Self {
            observer: Arc::new(FileIoObserver {
                fds: Mutex::new(BTreeSet::new()),
                records: Mutex::new(Vec::new()),
                transcript,
            }),
        }
    }

    /// Starts tracing `fd`.
    pub fn trace_fd(&self, fd: u32) -> &Self {
        self.observer.fds.lock().insert(fd);
        self
    }

    /// Stops tracing `fd`.
    pub fn untrace_fd(&self, fd: u32) -> &Self {
        self.observer.fds.lock().remove(&fd);
        self
    }

    /// Traced descriptors.
    #[must_use]
    pub fn traced_fds(&self) -> Vec<u32> {
        self.observer.fds.lock().iter().copied().collect()
    }

    /// Everything recorded so far.
    #[must_use]
    pub fn records(&self) -> Vec<FileIoRecord> {
        self.observer.records.lock().clone()
    }

    fn callback(&self) -> Arc<dyn Callback<SyscallArgs>> {
        Arc::clone(&self.observer) as Arc<dyn Callback<SyscallArgs>>
    }
}

impl Adapter for TraceFileIo {
    fn attach(&self, target: &mut dyn AdapterTarget) {
        let callback = self.callback();
        target.each_callbacks(&mut |callbacks| {
            callbacks.add_syscall_callback(When::After, Arc::clone(&callback));
        });
    }

    fn detach(&self, target: &mut dyn AdapterTarget) {
        let id = CallbackId::of_arc(&self.callback());
        target.each_callbacks(&mut |callbacks| {
            callbacks.remove::<SyscallArgs>(When::After, id);
        });
    }
}
