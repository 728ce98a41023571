//! Exclusive, deadline-bounded ownership of one physical I2C bus
//!
//! One [`BusHandle`] exists per physical bus per process. It is the only code
//! in the crate that touches the raw device, and it wraps every transfer in
//! three disciplines:
//!
//!   - **Mutual exclusion.** A single lock flag admits one [`Session`] at a
//!     time. Acquisition never blocks and never queues: a second concurrent
//!     session is a usage error and is told so immediately with [`BusyError`].
//!     A queue would make a wedged bus look like a busy one, which is the
//!     exact failure this crate exists to surface instead of mask.
//!
//!   - **Deadlines.** Every transfer runs under [`run_with_timeout`]. A
//!     transfer that misses its deadline marks the handle *wedged*; further
//!     transfers are refused with [`BusError::Wedged`] until [`reset`] installs
//!     a freshly opened device.
//!
//!   - **Epoch fencing.** The device lives behind a reference-counted cell
//!     that [`reset`] swaps out wholesale. A transfer abandoned by the timeout
//!     still holds the *old* cell, so even if it limps to completion later it
//!     cannot interleave with transactions on the replacement device.
//!
//! [`Session`]: crate::session::Session
//! [`run_with_timeout`]: crate::timeout::run_with_timeout
//! [`reset`]: BusHandle::reset

use std::fmt;
use std::io;
use std::sync::atomic::{ AtomicBool, Ordering };
use std::sync::{ Arc, Mutex, MutexGuard, TryLockError };
use std::time::Duration;

use crate::raw::RawI2c;
use crate::timeout::{ self, TimeoutError };

/// Deadline applied to every transfer unless [`BusHandle::with_timeout`]
/// says otherwise
///
/// Two seconds is far beyond any legitimate transfer on a 100 kHz bus; hitting
/// it means the bus electrically stalled, not that the peripheral was slow.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

// Errnos the kernel i2c-dev driver raises when a peripheral does not
// acknowledge its address or a data byte. Spelled out locally so the
// classification (and its tests) work on non-Linux development hosts too.
pub(crate) const ENXIO: i32 = 6;
pub(crate) const ENODEV: i32 = 19;
pub(crate) const EREMOTEIO: i32 = 121;

/// The current device behind a [`BusHandle`]
///
/// Swapped atomically as a unit by [`BusHandle::reset`]; see the module notes
/// on epoch fencing.
type DeviceEpoch<D> = Arc<Mutex<D>>;

/// The bus lock was already held when acquisition was attempted
///
/// This is a usage error, not a transient condition: the design admits one
/// open session per bus, so two live sessions means the calling code failed
/// to serialize its pollers. Nothing is queued and nothing waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusyError {}

impl fmt::Display for BusyError
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "the bus is held by another session; sessions must not overlap or nest")
    }
}

impl std::error::Error for BusyError {}

/// A transfer against the bus failed
#[derive(Debug)]
pub enum BusError
{
    /// The transfer outlived the configured deadline and was abandoned
    ///
    /// The handle is now wedged; see [`BusHandle::reset`].
    Timeout(TimeoutError),
    /// The peripheral at `addr` did not acknowledge the transaction
    ///
    /// The bus itself is healthy -- something is wrong with (or missing at)
    /// that address.
    Nack { addr: u16 },
    /// The device reported a fault unrelated to peripheral acknowledgement
    Io(io::Error),
    /// A previous transfer timed out and the device has not been replaced
    /// with [`BusHandle::reset`] since
    Wedged,
}

impl From<TimeoutError> for BusError
{
    fn from(deadline: TimeoutError) -> Self
    {
        Self::Timeout(deadline)
    }
}

impl fmt::Display for BusError
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            Self::Timeout(deadline) => write!(f, "bus transfer {}", deadline),
            Self::Nack { addr } => write!(f, "no acknowledgement from peripheral at {:#04x}", addr),
            Self::Io(err) => write!(f, "I2C device fault: {}", err),
            Self::Wedged => write!(f, "bus state is unknown after a timed out transfer; reset the device before retrying"),
        }
    }
}

impl std::error::Error for BusError {}

/// Sort a raw transfer error into the [`BusError`] taxonomy
fn classify(addr: u16, err: io::Error) -> BusError
{
    match err.raw_os_error() {
        Some(ENXIO) | Some(ENODEV) | Some(EREMOTEIO) => BusError::Nack { addr },
        _ => BusError::Io(err),
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T>
{
    // A poisoning panic happened on the blocking pool and was already resumed
    // on its owning task; the data itself is a plain device handle.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Owner of one physical bus: device, lock flag, wedged flag, deadline
///
/// Construct one per process per bus, then pass it by reference to every
/// [`Session`]. Sensor drivers should never see this type -- they get the
/// session, which cannot outlive its scope without releasing the bus.
///
/// [`Session`]: crate::session::Session
pub struct BusHandle<D>
{
    device: Mutex<DeviceEpoch<D>>,
    locked: AtomicBool,
    wedged: AtomicBool,
    timeout: Duration,
}

impl <D> BusHandle<D>
{
    /// The deadline applied to each transfer on this bus
    pub fn timeout(&self) -> Duration
    {
        self.timeout
    }

    /// Whether a timed out transfer has compromised the device
    pub fn is_wedged(&self) -> bool
    {
        self.wedged.load(Ordering::Acquire)
    }

    /// Whether a session currently holds the bus
    pub fn is_locked(&self) -> bool
    {
        self.locked.load(Ordering::Acquire)
    }

    /// Take the bus lock, failing immediately if it is already held
    pub fn acquire(&self) -> Result<BusLock<'_, D>, BusyError>
    {
        match self.locked.compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed) {
            Ok(_) => Ok(BusLock { bus: self, armed: true }),
            Err(_) => Err(BusyError {}),
        }
    }

    /// Clear the held state
    ///
    /// An unconditional store, so exit paths may call it no matter whether the
    /// lock is still held: releasing an already released bus is a no-op,
    /// never an error.
    fn unlock(&self)
    {
        self.locked.store(false, Ordering::Release);
    }
}

impl <D> BusHandle<D>
    where D: RawI2c
{
    /// Wrap a raw device with the default two second transfer deadline
    pub fn with(device: D) -> Self
    {
        Self::with_timeout(device, DEFAULT_TIMEOUT)
    }

    /// Wrap a raw device with an explicit transfer deadline
    ///
    /// The deadline is fixed for the life of the handle. Keeping it uniform
    /// across all peripherals keeps failure behavior predictable: every sensor
    /// driver on the bus sees a stall surface in the same way at the same
    /// time.
    pub fn with_timeout(device: D, timeout: Duration) -> Self
    {
        Self {
            device: Mutex::new(Arc::new(Mutex::new(device))),
            locked: AtomicBool::new(false),
            wedged: AtomicBool::new(false),
            timeout,
        }
    }

    /// Replace the device after a timeout and accept transfers again
    ///
    /// The old device is abandoned in place: if a timed out transfer is still
    /// holding it, that transfer keeps the old handle alive until it finally
    /// returns, and nothing it does from then on can reach the new device.
    pub fn reset(&self, device: D)
    {
        let mut epoch = lock_unpoisoned(&self.device);
        *epoch = Arc::new(Mutex::new(device));
        self.wedged.store(false, Ordering::Release);
    }

    fn current_epoch(&self) -> DeviceEpoch<D>
    {
        lock_unpoisoned(&self.device).clone()
    }

    /// Write `payload` to the peripheral at `addr`, bounded by the deadline
    pub async fn write_bytes(&self, addr: u16, payload: &[u8]) -> Result<(), BusError>
    {
        if self.is_wedged() {
            return Err(BusError::Wedged);
        }

        log::trace!("write addr={:#04x} bytes={:02x?}", addr, payload);

        let epoch = self.current_epoch();
        let bytes = payload.to_vec();
        let outcome = timeout::run_with_timeout(self.timeout, move || {
            let mut device = lock_unpoisoned(&epoch);
            device.raw_write(addr, &bytes)
        })
        .await;

        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(classify(addr, err)),
            Err(deadline) => Err(self.wedge(addr, deadline)),
        }
    }

    /// Read exactly `count` bytes from the peripheral at `addr`, bounded by
    /// the deadline
    pub async fn read_bytes(&self, addr: u16, count: usize) -> Result<Vec<u8>, BusError>
    {
        if self.is_wedged() {
            return Err(BusError::Wedged);
        }

        let epoch = self.current_epoch();
        let outcome = timeout::run_with_timeout(self.timeout, move || {
            let mut device = lock_unpoisoned(&epoch);
            let mut payload = vec![0u8; count];
            device.raw_read(addr, &mut payload)?;
            Ok(payload)
        })
        .await;

        match outcome {
            Ok(Ok(payload)) => {
                log::trace!("read addr={:#04x} bytes={:02x?}", addr, payload);
                Ok(payload)
            }
            Ok(Err(err)) => Err(classify(addr, err)),
            Err(deadline) => Err(self.wedge(addr, deadline)),
        }
    }

    /// Non-async write used only by teardown on drop
    ///
    /// Refuses rather than waits when the device is wedged or a transfer is
    /// still in flight, so a `Drop` impl can call it without any risk of
    /// hanging on a bus that is already known to be in trouble.
    pub(crate) fn blocking_write(&self, addr: u16, payload: &[u8]) -> Result<(), BusError>
    {
        if self.is_wedged() {
            return Err(BusError::Wedged);
        }

        let epoch = self.current_epoch();
        let mut device = match epoch.try_lock() {
            Ok(device) => device,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                return Err(BusError::Io(io::Error::new(
                    io::ErrorKind::WouldBlock,
                    "a transfer is still in flight",
                )));
            }
        };

        device.raw_write(addr, payload).map_err(|err| classify(addr, err))
    }

    fn wedge(&self, addr: u16, deadline: TimeoutError) -> BusError
    {
        self.wedged.store(true, Ordering::Release);
        log::warn!(
            "transfer to {:#04x} abandoned after {:?}; refusing further transfers until the device is reset",
            addr,
            deadline.limit()
        );

        BusError::Timeout(deadline)
    }
}

/// Witness that the bus lock is held
///
/// Holding one is the proof of exclusive bus access that a [`Session`]
/// carries. The lock is returned either explicitly through [`release`] or
/// implicitly when the witness drops, whichever comes first; both paths end
/// at the same idempotent unlock.
///
/// [`Session`]: crate::session::Session
/// [`release`]: BusLock::release
pub struct BusLock<'b, D>
{
    bus: &'b BusHandle<D>,
    armed: bool,
}

impl <D> BusLock<'_, D>
{
    /// Give the bus back
    pub fn release(mut self)
    {
        self.armed = false;
        self.bus.unlock();
    }
}

impl <D> Drop for BusLock<'_, D>
{
    fn drop(&mut self)
    {
        if self.armed {
            self.bus.unlock();
        }
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::mock::Script;
    use std::time::Instant;

    #[test]
    fn acquire_is_exclusive()
    {
        let script = Script::default();
        let bus = BusHandle::with(script.device());

        let first = bus.acquire().expect("fresh bus must be acquirable");
        assert!(matches!(bus.acquire(), Err(BusyError {})));

        first.release();
        assert!(bus.acquire().is_ok());
    }

    #[test]
    fn unlock_is_idempotent()
    {
        let script = Script::default();
        let bus = BusHandle::with(script.device());

        let lock = bus.acquire().unwrap();
        lock.release();

        // Cleanup paths may unlock unconditionally, any number of times.
        bus.unlock();
        bus.unlock();

        assert!(!bus.is_locked());
        assert!(bus.acquire().is_ok());
    }

    #[test]
    fn lock_releases_on_drop()
    {
        let script = Script::default();
        let bus = BusHandle::with(script.device());

        {
            let _lock = bus.acquire().unwrap();
            assert!(bus.is_locked());
        }

        assert!(!bus.is_locked());
    }

    #[tokio::test]
    async fn write_reaches_the_device()
    {
        let script = Script::default();
        let bus = BusHandle::with(script.device());

        bus.write_bytes(0x67, &[0x01, 0x02]).await.unwrap();

        assert_eq!(script.written(), vec![(0x67, vec![0x01, 0x02])]);
    }

    #[tokio::test]
    async fn read_returns_exactly_the_requested_count()
    {
        let script = Script::default();
        script.queue_read(&[0xBE, 0xEF]);
        let bus = BusHandle::with(script.device());

        let payload = bus.read_bytes(0x67, 2).await.unwrap();

        assert_eq!(payload, vec![0xBE, 0xEF]);
    }

    #[tokio::test]
    async fn unacknowledged_write_is_a_nack()
    {
        let script = Script::default();
        script.fail_writes(Some(EREMOTEIO));
        let bus = BusHandle::with(script.device());

        let err = bus.write_bytes(0x67, &[0x00]).await.unwrap_err();

        assert!(matches!(err, BusError::Nack { addr: 0x67 }));
        assert!(!bus.is_wedged());
    }

    #[tokio::test]
    async fn other_errnos_stay_io_errors()
    {
        let script = Script::default();
        script.fail_reads(Some(5)); // EIO
        let bus = BusHandle::with(script.device());

        let err = bus.read_bytes(0x67, 1).await.unwrap_err();

        assert!(matches!(err, BusError::Io(_)));
    }

    #[tokio::test]
    async fn deadline_wedges_the_bus_until_reset()
    {
        let script = Script::default();
        script.delay_all(Some(Duration::from_millis(300)));
        let bus = BusHandle::with_timeout(script.device(), Duration::from_millis(30));

        let err = bus.write_bytes(0x67, &[0x00]).await.unwrap_err();
        assert!(matches!(err, BusError::Timeout(_)));
        assert!(bus.is_wedged());

        // Refusal must be immediate, not another deadline's worth of waiting.
        let started = Instant::now();
        let err = bus.write_bytes(0x67, &[0x00]).await.unwrap_err();
        assert!(matches!(err, BusError::Wedged));
        assert!(started.elapsed() < Duration::from_millis(25));

        let replacement = Script::default();
        bus.reset(replacement.device());
        assert!(!bus.is_wedged());

        bus.write_bytes(0x67, &[0x0A]).await.unwrap();
        assert_eq!(replacement.written(), vec![(0x67, vec![0x0A])]);
    }

    #[tokio::test]
    async fn blocking_write_refuses_a_wedged_bus()
    {
        let script = Script::default();
        script.delay_all(Some(Duration::from_millis(300)));
        let bus = BusHandle::with_timeout(script.device(), Duration::from_millis(30));

        bus.write_bytes(0x67, &[0x00]).await.unwrap_err();

        assert!(matches!(bus.blocking_write(0x70, &[0x00]), Err(BusError::Wedged)));
    }
}
