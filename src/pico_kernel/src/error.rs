//! Error types.
//!
//! Every kernel service has its own error enum listing exactly the outcomes
//! it can produce. All of them convert into the flat [`ResultCode`]
//! namespace, which is what gets recorded in the diagnostic error ring.
//!
//! Contention outcomes (timeout, would-block on a full/empty buffer,
//! deletion of the waited object) are ordinary `Err` values that the caller
//! must inspect; they are *not* recorded in the error ring. Usage errors
//! (bad context, bad id, bad parameter, unlock by non-owner, …) are
//! recorded.
use core::fmt;

use crate::{klock, utils::Init, KernelTraits, UTicks};

/// The flat error namespace shared by every kernel service.
#[repr(i8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    /// The service completed successfully.
    Success = 0,
    /// The service was used in a context where it is not allowed (e.g. a
    /// blocking call from an interrupt handler, or from within a critical
    /// section).
    BadContext = -1,
    /// The identifier does not name a live kernel object.
    BadId = -2,
    /// A parameter was out of range.
    BadParam = -3,
    /// The object is not in a state that allows the operation.
    BadObjectState = -4,
    /// A control-block slot or backing memory could not be obtained.
    NoMemory = -5,
    /// The wait timed out.
    Timeout = -6,
    /// The waited object was deleted.
    Deleted = -7,
    /// The mutex is not owned by the calling task.
    NotOwner = -8,
    /// The operation would overflow a counter.
    WouldOverflow = -9,
    /// The buffer is full and the caller requested a non-blocking
    /// operation.
    Full = -10,
    /// The buffer is empty and the caller requested a non-blocking
    /// operation.
    Empty = -11,
    /// A zero-copy grant is already active on this stream buffer.
    GrantInUse = -12,
    /// Structural corruption was detected and the object was reset.
    Corrupted = -13,
}

impl ResultCode {
    /// Whether this code describes a contention outcome rather than a usage
    /// error. Contention outcomes are not recorded in the error ring.
    pub fn is_contention(self) -> bool {
        matches!(
            self,
            Self::Success | Self::Timeout | Self::Deleted | Self::Full | Self::Empty
        )
    }
}

macro_rules! define_suberror {
    (
        $( #[doc $( $doc:tt )*] )*
        $( #[into( $Supererror:path )] )*
        $vis:vis enum $Name:ident {
            $( $Variant:ident, )*
        }
    ) => {
        $( #[doc $( $doc )*] )*
        #[derive(PartialEq, Eq, Copy, Clone)]
        $vis enum $Name {
            $( $Variant ),*
        }

        impl fmt::Debug for $Name {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                ResultCode::from(*self).fmt(f)
            }
        }

        define_suberror! {
            @into
            #[into(ResultCode)]
            $( #[into( $Supererror )] )*
            enum $Name {
                $( $Variant, )*
            }
        }
    };

    (
        @into
        #[into( $Supererror0:path )]
        $( #[into( $Supererror:path )] )*
        enum $Name:ident {
            $( $Variant:ident, )*
        }
    ) => {
        impl From<$Name> for $Supererror0 {
            #[inline]
            fn from(x: $Name) -> Self {
                match x {
                    $( $Name::$Variant => Self::$Variant ),*
                }
            }
        }

        define_suberror! {
            @into
            $( #[into( $Supererror )] )*
            enum $Name {
                $( $Variant, )*
            }
        }
    };

    ( @into enum $($_:tt)* ) => {};
}

macro_rules! define_error {
    (
        $( #[$meta:meta] )*
        pub enum $Name:ident {
            $( $Variant:ident, )*
        }
    ) => {
        $( #[$meta] )*
        #[derive(Debug, PartialEq, Eq, Copy, Clone)]
        pub enum $Name {
            $( $Variant ),*
        }

        impl From<$Name> for ResultCode {
            #[inline]
            fn from(x: $Name) -> Self {
                match x {
                    $( $Name::$Variant => Self::$Variant ),*
                }
            }
        }
    };
}

// Service error enums
// ---------------------------------------------------------------------------

define_error! {
    /// Error type for [`System::create_task`](crate::System::create_task).
    pub enum CreateTaskError { BadContext, BadParam, NoMemory, }
}
define_error! {
    /// Error type for [`System::delete_task`](crate::System::delete_task).
    pub enum DeleteTaskError { BadContext, BadId, BadObjectState, }
}
define_error! {
    /// Error type for [`System::suspend_task`](crate::System::suspend_task).
    pub enum SuspendTaskError { BadContext, BadId, BadObjectState, }
}
define_error! {
    /// Error type for [`System::resume_task`](crate::System::resume_task).
    pub enum ResumeTaskError { BadContext, BadId, BadObjectState, }
}
define_error! {
    /// Error type for
    /// [`System::set_task_priority`](crate::System::set_task_priority).
    pub enum SetTaskPriorityError { BadContext, BadId, BadParam, BadObjectState, }
}
define_error! {
    /// Error type for the task introspection services.
    pub enum QueryTaskError { BadContext, BadId, BadObjectState, }
}
define_error! {
    /// Error type for [`System::sleep_ms`](crate::System::sleep_ms).
    pub enum SleepError { BadContext, BadParam, }
}
define_error! {
    /// Error type for [`System::yield_now`](crate::System::yield_now).
    pub enum YieldError { BadContext, }
}
define_error! {
    /// Error type for
    /// [`System::set_task_affinity`](crate::System::set_task_affinity).
    pub enum SetAffinityError { BadContext, BadId, BadParam, BadObjectState, }
}

define_error! {
    /// Error type for [`System::create_mutex`](crate::System::create_mutex).
    pub enum CreateMutexError { BadContext, NoMemory, }
}
define_error! {
    /// Error type for [`System::lock_mutex`](crate::System::lock_mutex).
    pub enum LockMutexError { BadContext, BadId, Timeout, Deleted, WouldOverflow, }
}
define_error! {
    /// Error type for [`System::unlock_mutex`](crate::System::unlock_mutex).
    pub enum UnlockMutexError { BadContext, BadId, NotOwner, }
}
define_error! {
    /// Error type for [`System::delete_mutex`](crate::System::delete_mutex).
    pub enum DeleteMutexError { BadContext, BadId, }
}

define_error! {
    /// Error type for
    /// [`System::create_semaphore`](crate::System::create_semaphore).
    pub enum CreateSemaphoreError { BadContext, BadParam, NoMemory, }
}
define_error! {
    /// Error type for
    /// [`System::take_semaphore`](crate::System::take_semaphore).
    pub enum TakeSemaphoreError { BadContext, BadId, Timeout, Deleted, Empty, }
}
define_error! {
    /// Error type for
    /// [`System::give_semaphore`](crate::System::give_semaphore).
    pub enum GiveSemaphoreError { BadContext, BadId, }
}
define_error! {
    /// Error type for
    /// [`System::delete_semaphore`](crate::System::delete_semaphore).
    pub enum DeleteSemaphoreError { BadContext, BadId, }
}

define_error! {
    /// Error type for [`System::create_queue`](crate::System::create_queue).
    pub enum CreateQueueError { BadContext, BadParam, NoMemory, }
}
define_error! {
    /// Error type for [`System::send_queue`](crate::System::send_queue).
    pub enum SendQueueError { BadContext, BadId, BadParam, Timeout, Deleted, Full, }
}
define_error! {
    /// Error type for
    /// [`System::receive_queue`](crate::System::receive_queue).
    pub enum ReceiveQueueError { BadContext, BadId, BadParam, Timeout, Deleted, Empty, }
}
define_error! {
    /// Error type for [`System::peek_queue`](crate::System::peek_queue).
    pub enum PeekQueueError { BadContext, BadId, BadParam, Empty, }
}
define_error! {
    /// Error type for [`System::delete_queue`](crate::System::delete_queue).
    pub enum DeleteQueueError { BadContext, BadId, }
}

define_error! {
    /// Error type for
    /// [`System::create_event_group`](crate::System::create_event_group).
    pub enum CreateEventGroupError { BadContext, NoMemory, }
}
define_error! {
    /// Error type for [`System::set_bits`](crate::System::set_bits) and
    /// [`System::clear_bits`](crate::System::clear_bits).
    pub enum UpdateEventGroupError { BadContext, BadId, }
}
define_error! {
    /// Error type for [`System::wait_bits`](crate::System::wait_bits).
    pub enum WaitEventGroupError { BadContext, BadId, BadParam, Timeout, Deleted, Empty, }
}
define_error! {
    /// Error type for
    /// [`System::delete_event_group`](crate::System::delete_event_group).
    pub enum DeleteEventGroupError { BadContext, BadId, }
}

define_error! {
    /// Error type for
    /// [`System::create_stream_buffer`](crate::System::create_stream_buffer).
    pub enum CreateStreamBufferError { BadContext, BadParam, NoMemory, }
}
define_error! {
    /// Error type for [`System::send_stream`](crate::System::send_stream).
    pub enum SendStreamError { BadContext, BadId, BadParam, Timeout, Deleted, Full, }
}
define_error! {
    /// Error type for
    /// [`System::receive_stream`](crate::System::receive_stream).
    pub enum ReceiveStreamError { BadContext, BadId, Timeout, Deleted, Empty, Corrupted, }
}
define_error! {
    /// Error type for the stream-buffer zero-copy services.
    pub enum StreamGrantError { BadContext, BadId, BadParam, Full, Empty, GrantInUse, Corrupted, }
}
define_error! {
    /// Error type for
    /// [`System::delete_stream_buffer`](crate::System::delete_stream_buffer).
    pub enum DeleteStreamBufferError { BadContext, BadId, }
}

define_error! {
    /// Error type for [`System::create_timer`](crate::System::create_timer).
    pub enum CreateTimerError { BadContext, BadParam, NoMemory, }
}
define_error! {
    /// Error type for [`System::start_timer`](crate::System::start_timer)
    /// and [`System::stop_timer`](crate::System::stop_timer).
    pub enum StartTimerError { BadContext, BadId, BadObjectState, }
}
define_error! {
    /// Error type for
    /// [`System::set_timer_period`](crate::System::set_timer_period).
    pub enum SetTimerPeriodError { BadContext, BadId, BadParam, }
}
define_error! {
    /// Error type for [`System::delete_timer`](crate::System::delete_timer).
    pub enum DeleteTimerError { BadContext, BadId, }
}
define_error! {
    /// Error type for the remaining object introspection services.
    pub enum QueryObjectError { BadContext, BadId, }
}

// Shared sub-error types
// ---------------------------------------------------------------------------

define_suberror! {
    /// `BadContext`
    #[into(CreateTaskError)]
    #[into(DeleteTaskError)]
    #[into(SuspendTaskError)]
    #[into(ResumeTaskError)]
    #[into(SetTaskPriorityError)]
    #[into(QueryTaskError)]
    #[into(SleepError)]
    #[into(YieldError)]
    #[into(SetAffinityError)]
    #[into(CreateMutexError)]
    #[into(LockMutexError)]
    #[into(UnlockMutexError)]
    #[into(DeleteMutexError)]
    #[into(CreateSemaphoreError)]
    #[into(TakeSemaphoreError)]
    #[into(GiveSemaphoreError)]
    #[into(DeleteSemaphoreError)]
    #[into(CreateQueueError)]
    #[into(SendQueueError)]
    #[into(ReceiveQueueError)]
    #[into(PeekQueueError)]
    #[into(DeleteQueueError)]
    #[into(CreateEventGroupError)]
    #[into(UpdateEventGroupError)]
    #[into(WaitEventGroupError)]
    #[into(DeleteEventGroupError)]
    #[into(CreateStreamBufferError)]
    #[into(SendStreamError)]
    #[into(ReceiveStreamError)]
    #[into(StreamGrantError)]
    #[into(DeleteStreamBufferError)]
    #[into(CreateTimerError)]
    #[into(StartTimerError)]
    #[into(SetTimerPeriodError)]
    #[into(DeleteTimerError)]
    #[into(QueryObjectError)]
    pub(crate) enum BadContextError {
        BadContext,
    }
}

define_suberror! {
    /// `BadId`
    #[into(DeleteTaskError)]
    #[into(SuspendTaskError)]
    #[into(ResumeTaskError)]
    #[into(SetTaskPriorityError)]
    #[into(QueryTaskError)]
    #[into(SetAffinityError)]
    #[into(LockMutexError)]
    #[into(UnlockMutexError)]
    #[into(DeleteMutexError)]
    #[into(TakeSemaphoreError)]
    #[into(GiveSemaphoreError)]
    #[into(DeleteSemaphoreError)]
    #[into(SendQueueError)]
    #[into(ReceiveQueueError)]
    #[into(PeekQueueError)]
    #[into(DeleteQueueError)]
    #[into(UpdateEventGroupError)]
    #[into(WaitEventGroupError)]
    #[into(DeleteEventGroupError)]
    #[into(SendStreamError)]
    #[into(ReceiveStreamError)]
    #[into(StreamGrantError)]
    #[into(DeleteStreamBufferError)]
    #[into(StartTimerError)]
    #[into(SetTimerPeriodError)]
    #[into(DeleteTimerError)]
    #[into(QueryObjectError)]
    pub(crate) enum BadIdError {
        BadId,
    }
}

define_suberror! {
    /// `BadParam`
    #[into(CreateTaskError)]
    #[into(SetTaskPriorityError)]
    #[into(SleepError)]
    #[into(SetAffinityError)]
    #[into(CreateSemaphoreError)]
    #[into(CreateQueueError)]
    #[into(SendQueueError)]
    #[into(ReceiveQueueError)]
    #[into(PeekQueueError)]
    #[into(WaitEventGroupError)]
    #[into(CreateStreamBufferError)]
    #[into(SendStreamError)]
    #[into(StreamGrantError)]
    #[into(CreateTimerError)]
    #[into(SetTimerPeriodError)]
    pub(crate) enum BadParamError {
        BadParam,
    }
}

define_suberror! {
    /// `BadObjectState`
    #[into(DeleteTaskError)]
    #[into(SuspendTaskError)]
    #[into(ResumeTaskError)]
    #[into(SetTaskPriorityError)]
    #[into(QueryTaskError)]
    #[into(SetAffinityError)]
    #[into(StartTimerError)]
    pub(crate) enum BadObjectStateError {
        BadObjectState,
    }
}

define_suberror! {
    /// `NoMemory`
    #[into(CreateTaskError)]
    #[into(CreateMutexError)]
    #[into(CreateSemaphoreError)]
    #[into(CreateQueueError)]
    #[into(CreateEventGroupError)]
    #[into(CreateStreamBufferError)]
    #[into(CreateTimerError)]
    pub(crate) enum NoMemoryError {
        NoMemory,
    }
}

define_suberror! {
    /// The disposition a blocked task is woken with when its wait did not
    /// complete normally.
    #[into(LockMutexError)]
    #[into(TakeSemaphoreError)]
    #[into(SendQueueError)]
    #[into(ReceiveQueueError)]
    #[into(WaitEventGroupError)]
    #[into(SendStreamError)]
    #[into(ReceiveStreamError)]
    pub(crate) enum WaitError {
        Timeout,
        Deleted,
    }
}

// Diagnostic error ring
// ---------------------------------------------------------------------------

/// The number of entries retained by the diagnostic error ring.
pub const ERROR_LOG_LEN: usize = 16;

/// One recorded failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorEntry {
    pub code: ResultCode,
    /// The tick at which the failure was recorded.
    pub tick: UTicks,
}

/// A fixed-size ring of the most recent usage errors, plus the overridable
/// sink hook.
pub(crate) struct ErrorLog<Traits> {
    entries: klock::CpuLockCell<Traits, [Option<ErrorEntry>; ERROR_LOG_LEN]>,
    next: klock::CpuLockCell<Traits, usize>,
    sink: klock::CpuLockCell<Traits, Option<fn(ResultCode)>>,
}

impl<Traits> Init for ErrorLog<Traits> {
    const INIT: Self = Self {
        entries: klock::CpuLockCell::new([None; ERROR_LOG_LEN]),
        next: klock::CpuLockCell::new(0),
        sink: klock::CpuLockCell::new(None),
    };
}

/// Record a usage error in the error ring and notify the sink hook.
/// Contention outcomes are ignored.
pub(crate) fn report<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    code: ResultCode,
) {
    if code.is_contention() {
        return;
    }

    let log = Traits::state().errors();
    let tick = Traits::state()
        .timeouts()
        .tick_count_for(lock.borrow_mut());
    let i = log.next.get(&*lock);
    log.entries.write(&mut *lock)[i] = Some(ErrorEntry { code, tick });
    log.next.replace(&mut *lock, (i + 1) % ERROR_LOG_LEN);

    // The sink runs with the kernel lock held; it must not block.
    if let Some(sink) = log.sink.get(&*lock) {
        sink(code);
    }
}

/// Record the code of `r`'s error, if any, then pass `r` through. Used at
/// every public service boundary.
pub(crate) fn reported<Traits: KernelTraits, T, E: Copy + Into<ResultCode>>(
    r: Result<T, E>,
) -> Result<T, E> {
    if let Err(e) = &r {
        let code: ResultCode = (*e).into();
        if !code.is_contention() {
            if let Ok(mut lock) = klock::lock_cpu::<Traits>() {
                report::<Traits>(lock.borrow_mut(), code);
            }
        }
    }
    r
}

impl<Traits: KernelTraits> crate::System<Traits> {
    /// Install the error-sink hook, invoked with the kernel lock held for
    /// every recorded usage error.
    pub fn set_error_sink(sink: fn(ResultCode)) {
        if let Ok(mut lock) = klock::lock_cpu::<Traits>() {
            Traits::state().errors().sink.replace(&mut *lock, Some(sink));
        }
    }

    /// A copy of the error ring, oldest first.
    pub fn error_log_snapshot() -> arrayvec::ArrayVec<ErrorEntry, ERROR_LOG_LEN> {
        let mut out = arrayvec::ArrayVec::new();
        let Ok(lock) = klock::lock_cpu::<Traits>() else {
            return out;
        };
        let log = Traits::state().errors();
        let next = log.next.get(&*lock);
        for i in 0..ERROR_LOG_LEN {
            let slot = log.entries.read(&*lock)[(next + i) % ERROR_LOG_LEN];
            if let Some(entry) = slot {
                out.push(entry);
            }
        }
        out
    }

    /// Discard the contents of the error ring.
    pub fn clear_error_log() {
        if let Ok(mut lock) = klock::lock_cpu::<Traits>() {
            let log = Traits::state().errors();
            log.entries
                .replace(&mut *lock, [None; ERROR_LOG_LEN]);
            log.next.replace(&mut *lock, 0);
        }
    }
}

