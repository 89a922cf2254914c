//! In-process model of the framework's request packets.
//!
//! An [`Irp`] is owned by exactly one layer at a time. Completing it consumes it, so a request
//! cannot be completed twice. A layer that has to see the lower device's completion before
//! finishing its own work (start-device) pushes a completion hook with [`Irp::forward_and_wait`];
//! completing an IRP with a pending hook hands the packet back to that layer instead of the
//! original submitter.

use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use crate::config::PnpBusInformation;
use crate::error::Status;
use crate::lower::LowerDevice;
use crate::relations::DeviceRelations;

static NEXT_IRP_ID: AtomicU64 = AtomicU64::new(1);

/// Request categories ("major functions") the framework can send to the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Pnp(PnpMinor),
    DeviceControl(DeviceControlRequest),
    Power(PowerMinor),
    Create,
    Close,
    SystemControl,
    /// Raw major code of a category the bus has no handler for.
    Other(u8),
}

impl Request {
    pub fn major(&self) -> Major {
        match self {
            Request::Pnp(_) => Major::Pnp,
            Request::DeviceControl(_) => Major::DeviceControl,
            Request::Power(_) => Major::Power,
            Request::Create => Major::Create,
            Request::Close => Major::Close,
            Request::SystemControl => Major::SystemControl,
            Request::Other(code) => Major::Other(*code),
        }
    }
}

/// Request category without its parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Major {
    Pnp,
    DeviceControl,
    Power,
    Create,
    Close,
    SystemControl,
    Other(u8),
}

/// Lifecycle ("PnP") minor codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PnpMinor {
    StartDevice,
    QueryRemoveDevice,
    RemoveDevice,
    CancelRemoveDevice,
    StopDevice,
    QueryStopDevice,
    CancelStopDevice,
    QueryDeviceRelations(RelationType),
    QueryCapabilities,
    QueryResources,
    QueryResourceRequirements,
    QueryDeviceText(DeviceTextType),
    QueryBusInformation,
    QueryPnpDeviceState,
    SurpriseRemoval,
    Other(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationType {
    Bus,
    Ejection,
    Power,
    Removal,
    TargetDevice,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceTextType {
    Description,
    LocationInformation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerMinor {
    WaitWake,
    PowerSequence,
    SetPower,
    QueryPower,
}

/// Parameters of a device-control request.
///
/// `input_length` is the length the caller declared, which need not match the buffer that was
/// actually supplied; `input` is `None` when no system buffer was attached at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceControlRequest {
    pub code: u32,
    pub input: Option<Vec<u8>>,
    pub input_length: usize,
}

impl DeviceControlRequest {
    pub fn new(code: u32, input: Vec<u8>) -> Self {
        let input_length = input.len();
        Self {
            code,
            input: Some(input),
            input_length,
        }
    }

    pub fn without_buffer(code: u32, input_length: usize) -> Self {
        Self {
            code,
            input: None,
            input_length,
        }
    }
}

/// Device capabilities, filled in by the lower device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceCapabilities {
    pub removable: bool,
    pub surprise_removal_ok: bool,
    pub silent_install: bool,
    pub raw_device_ok: bool,
}

/// Result payload attached to a request (`IoStatus.Information`).
#[derive(Debug, Default)]
pub enum Information {
    #[default]
    None,
    /// NUL-terminated UTF-16 text; ownership passes to whoever receives it.
    Text(Vec<u16>),
    /// Copy of the bus descriptor; carried inline so answering never allocates.
    BusInformation(PnpBusInformation),
    Relations(DeviceRelations),
    Capabilities(DeviceCapabilities),
    /// Unit number assigned by an attach request.
    Unit(u32),
}

type CancelRoutine = Box<dyn FnOnce() + Send>;

struct CancelState {
    cancelled: AtomicBool,
    routine: Mutex<Option<CancelRoutine>>,
}

impl CancelState {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        let routine = self.routine.lock().expect("cancel lock poisoned").take();
        if let Some(routine) = routine {
            routine();
        }
    }
}

/// One in-flight request.
pub struct Irp {
    id: u64,
    request: Request,
    status: Status,
    information: Information,
    cancel: Arc<CancelState>,
    hooks: Vec<mpsc::Sender<Irp>>,
    caller: Option<mpsc::Sender<CompletedIrp>>,
}

impl fmt::Debug for Irp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Irp")
            .field("id", &self.id)
            .field("request", &self.request)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

impl Irp {
    /// Creates a request and the handle its submitter uses to observe completion.
    ///
    /// New requests start out with `NotSupported`, matching what the framework puts in the status
    /// block of a freshly built lifecycle request.
    pub fn new(request: Request) -> (Irp, IrpHandle) {
        let id = NEXT_IRP_ID.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel();
        let cancel = Arc::new(CancelState {
            cancelled: AtomicBool::new(false),
            routine: Mutex::new(None),
        });
        let irp = Irp {
            id,
            request,
            status: Status::NotSupported,
            information: Information::None,
            cancel: Arc::clone(&cancel),
            hooks: Vec::new(),
            caller: Some(tx),
        };
        let handle = IrpHandle { id, rx, cancel };
        (irp, handle)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn set_status(&mut self, status: Status) {
        self.status = status;
    }

    pub fn information(&self) -> &Information {
        &self.information
    }

    pub fn set_information(&mut self, information: Information) {
        self.information = information;
    }

    pub fn take_information(&mut self) -> Information {
        mem::take(&mut self.information)
    }

    /// Completes the request ("passes it up"), consuming it.
    pub fn complete(mut self) {
        while let Some(hook) = self.hooks.pop() {
            match hook.send(self) {
                Ok(()) => return,
                // The layer that pushed the hook is gone; keep unwinding the stack.
                Err(mpsc::SendError(irp)) => self = irp,
            }
        }

        let Some(caller) = self.caller.take() else {
            return;
        };
        let completed = CompletedIrp {
            id: self.id,
            status: self.status,
            information: self.take_information(),
        };
        let _ = caller.send(completed);
    }

    /// Sets the final status and completes the request.
    pub fn complete_with(mut self, status: Status) {
        self.status = status;
        self.complete();
    }

    /// Passes the request to `lower` and blocks until the lower device completes it.
    ///
    /// Returns `None` if the lower device lost the request; it has then already been completed
    /// to the submitter and must not be touched again.
    pub fn forward_and_wait(mut self, lower: &dyn LowerDevice) -> Option<Irp> {
        let (tx, rx) = mpsc::channel();
        self.hooks.push(tx);
        lower.dispatch(self);
        rx.recv().ok()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.cancelled.load(Ordering::SeqCst)
    }

    /// Registers the routine run if the request is cancelled while parked somewhere.
    ///
    /// Returns `false` when the request was already cancelled; the routine is then not kept and
    /// the caller owns completing the request.
    pub(crate) fn set_cancel_routine(&self, routine: CancelRoutine) -> bool {
        let mut slot = self.cancel.routine.lock().expect("cancel lock poisoned");
        *slot = Some(routine);
        if self.is_cancelled() {
            slot.take();
            return false;
        }
        true
    }

    /// Deregisters the cancel routine.
    ///
    /// Returns `false` if the routine was already claimed by a concurrent cancel.
    pub(crate) fn clear_cancel_routine(&self) -> bool {
        self.cancel
            .routine
            .lock()
            .expect("cancel lock poisoned")
            .take()
            .is_some()
    }
}

impl Drop for Irp {
    fn drop(&mut self) {
        if let Some(caller) = self.caller.take() {
            tracing::error!(irp = self.id, request = ?self.request, "request dropped without completion");
            let _ = caller.send(CompletedIrp {
                id: self.id,
                status: Status::Cancelled,
                information: mem::take(&mut self.information),
            });
        }
    }
}

/// Submitter-side view of a request.
pub struct IrpHandle {
    id: u64,
    rx: mpsc::Receiver<CompletedIrp>,
    cancel: Arc<CancelState>,
}

impl IrpHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Blocks until the request is completed.
    pub fn wait(&self) -> CompletedIrp {
        self.rx.recv().unwrap_or_else(|_| CompletedIrp::lost(self.id))
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<CompletedIrp> {
        match self.rx.recv_timeout(timeout) {
            Ok(done) => Some(done),
            Err(mpsc::RecvTimeoutError::Timeout) => None,
            Err(mpsc::RecvTimeoutError::Disconnected) => Some(CompletedIrp::lost(self.id)),
        }
    }

    pub fn try_result(&self) -> Option<CompletedIrp> {
        match self.rx.try_recv() {
            Ok(done) => Some(done),
            Err(mpsc::TryRecvError::Empty) => None,
            Err(mpsc::TryRecvError::Disconnected) => Some(CompletedIrp::lost(self.id)),
        }
    }

    /// Requests cancellation. A request parked in a queue is completed with `Cancelled`; one
    /// already being processed runs to completion.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// A completed request as seen by its submitter.
#[derive(Debug)]
pub struct CompletedIrp {
    pub id: u64,
    pub status: Status,
    pub information: Information,
}

impl CompletedIrp {
    fn lost(id: u64) -> Self {
        Self {
            id,
            status: Status::Cancelled,
            information: Information::None,
        }
    }

    pub fn relations(&self) -> Option<&DeviceRelations> {
        match &self.information {
            Information::Relations(relations) => Some(relations),
            _ => None,
        }
    }

    /// Decodes a text payload, dropping the terminating NUL.
    pub fn text(&self) -> Option<String> {
        match &self.information {
            Information::Text(wide) => {
                let end = wide.iter().position(|&c| c == 0).unwrap_or(wide.len());
                Some(String::from_utf16_lossy(&wide[..end]))
            }
            _ => None,
        }
    }

    pub fn unit(&self) -> Option<u32> {
        match self.information {
            Information::Unit(unit) => Some(unit),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CompleteLater(Mutex<Vec<Irp>>);

    impl LowerDevice for CompleteLater {
        fn dispatch(&self, irp: Irp) -> Status {
            self.0.lock().unwrap().push(irp);
            Status::Pending
        }
    }

    #[test]
    fn complete_delivers_status_and_information() {
        let (mut irp, handle) = Irp::new(Request::Create);
        irp.set_information(Information::Unit(7));
        irp.complete_with(Status::Success);

        let done = handle.wait();
        assert_eq!(done.status, Status::Success);
        assert_eq!(done.unit(), Some(7));
    }

    #[test]
    fn dropping_an_uncompleted_request_reports_cancelled() {
        let (irp, handle) = Irp::new(Request::Close);
        drop(irp);
        assert_eq!(handle.wait().status, Status::Cancelled);
    }

    #[test]
    fn forward_and_wait_returns_the_request_to_the_hook_owner() {
        struct Succeed;
        impl LowerDevice for Succeed {
            fn dispatch(&self, irp: Irp) -> Status {
                irp.complete_with(Status::Success);
                Status::Success
            }
        }

        let (irp, handle) = Irp::new(Request::Pnp(PnpMinor::StartDevice));
        let irp = irp.forward_and_wait(&Succeed).expect("lower completed the request");
        assert_eq!(irp.status(), Status::Success);
        assert!(handle.try_result().is_none(), "submitter must not see the inner completion");

        irp.complete();
        assert_eq!(handle.wait().status, Status::Success);
    }

    #[test]
    fn forward_and_wait_blocks_until_a_late_completion() {
        let lower = Arc::new(CompleteLater(Mutex::new(Vec::new())));
        let completer = Arc::clone(&lower);
        let (irp, handle) = Irp::new(Request::Pnp(PnpMinor::StartDevice));

        let waiter = std::thread::spawn(move || {
            let irp = irp.forward_and_wait(&*lower).expect("request comes back");
            irp.complete();
        });

        let pending = loop {
            if let Some(irp) = completer.0.lock().unwrap().pop() {
                break irp;
            }
            std::thread::yield_now();
        };
        pending.complete_with(Status::Unsuccessful);

        waiter.join().unwrap();
        assert_eq!(handle.wait().status, Status::Unsuccessful);
    }

    #[test]
    fn cancel_runs_the_registered_routine_once() {
        let (irp, handle) = Irp::new(Request::Create);
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        assert!(irp.set_cancel_routine(Box::new(move || flag.store(true, Ordering::SeqCst))));

        handle.cancel();
        assert!(ran.load(Ordering::SeqCst));
        assert!(irp.is_cancelled());
        assert!(!irp.clear_cancel_routine());
        irp.complete_with(Status::Cancelled);
    }

    #[test]
    fn set_cancel_routine_refuses_an_already_cancelled_request() {
        let (irp, handle) = Irp::new(Request::Create);
        handle.cancel();
        assert!(!irp.set_cancel_routine(Box::new(|| panic!("must not run"))));
        irp.complete_with(Status::Cancelled);
    }

    #[test]
    fn text_payload_decodes_without_terminator() {
        let (mut irp, handle) = Irp::new(Request::Create);
        let wide: Vec<u16> = "Disk Bus".encode_utf16().chain(std::iter::once(0)).collect();
        irp.set_information(Information::Text(wide));
        irp.complete_with(Status::Success);
        assert_eq!(handle.wait().text().as_deref(), Some("Disk Bus"));
    }
}
