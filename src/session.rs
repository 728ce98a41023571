//! Scoped bus access: acquire on open, guaranteed teardown on every exit
//!
//! # Purpose
//! A [`Session`] is the only thing sensor drivers touch. Opening one takes
//! the bus lock and, in multiplexed mode, connects the requested channel;
//! from then until the session ends the caller owns the bus outright. The
//! session's whole job is the exit guarantee: *deselect, then release, on
//! every path out* -- normal completion, error return, early drop, or task
//! cancellation -- so the next session always starts from a free bus and a
//! cleared multiplexer.
//!
//! Construction is all-or-nothing. If the lock is taken the caller gets
//! [`OpenError::Busy`] and nothing changed; if the channel select fails the
//! lock is given back before the error is returned. No partially open
//! session is ever observable.
//!
//! # Cancel Safety
//! The happy-path exit is [`Session::close`], which runs the channel clear
//! under the normal transfer deadline and reports a failed clear as a
//! warning-class error. If a session is dropped without `close` -- an early
//! return, a panic unwinding, a `select!` arm losing, a task being aborted at
//! shutdown -- the `Drop` impl runs the same teardown in degraded form: a
//! best-effort blocking clear that refuses (rather than hangs) when the bus
//! is wedged or mid-transfer, followed by the unconditional lock release.
//! Teardown order is fixed either way: the multiplexer is never left
//! connected while the bus reads as free.
//!
//! # Incompatible Peripherals
//! Some parts demand a register write and a data read under one uninterrupted
//! bus claim, with no clear in between. That usage contradicts the exit
//! guarantee above and is deliberately unsupported: it would need a distinct
//! session type with explicitly different teardown semantics, not a quiet
//! relaxation of this one.

use std::fmt;
use std::time::Instant;

use crate::bus::{ BusError, BusHandle, BusLock, BusyError };
use crate::mux::{ MuxController, ProtocolError };
use crate::raw::RawI2c;

/// Session construction failed; the bus is exactly as it was
#[derive(Debug)]
pub enum OpenError
{
    /// Another session already holds the bus
    Busy(BusyError),
    /// The multiplexer channel could not be connected
    Mux(ProtocolError),
}

impl From<BusyError> for OpenError
{
    fn from(err: BusyError) -> Self
    {
        Self::Busy(err)
    }
}

impl From<ProtocolError> for OpenError
{
    fn from(err: ProtocolError) -> Self
    {
        Self::Mux(err)
    }
}

impl fmt::Display for OpenError
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            Self::Busy(err) => write!(f, "{}", err),
            Self::Mux(err) => write!(f, "could not open session: {}", err),
        }
    }
}

impl std::error::Error for OpenError {}

/// Exclusive use of the bus (and optionally one mux channel) for one scope
///
/// Hold one for the duration of a single logical transaction group -- a
/// register poke and the reads that follow it -- then [`close`](Self::close)
/// it. Holding a session across unrelated transactions, or trying to open a
/// second one on the same bus, fails fast with [`OpenError::Busy`] by design.
pub struct Session<'b, D>
    where D: RawI2c
{
    bus: &'b BusHandle<D>,
    lock: Option<BusLock<'b, D>>,
    mux: Option<MuxController<'b, D>>,
    opened_at: Instant,
    closed: bool,
}

impl <'b, D> Session<'b, D>
    where D: RawI2c
{
    /// Open a session on a bus whose peripherals are wired directly
    pub async fn open(bus: &'b BusHandle<D>) -> Result<Session<'b, D>, OpenError>
    {
        let lock = bus.acquire()?;
        log::debug!("session opened in direct mode");

        Ok(Session {
            bus,
            lock: Some(lock),
            mux: None,
            opened_at: Instant::now(),
            closed: false,
        })
    }

    /// Open a session on a peripheral behind channel `channel` of the
    /// multiplexer at `mux_addr`
    ///
    /// The channel is connected before this returns; if the select fails the
    /// bus lock is released and the error comes back as [`OpenError::Mux`].
    pub async fn open_muxed(
        bus: &'b BusHandle<D>,
        mux_addr: u16,
        channel: u8,
    ) -> Result<Session<'b, D>, OpenError>
    {
        let lock = bus.acquire()?;
        let mut mux = MuxController::with(bus, mux_addr);

        if let Err(err) = mux.select(channel).await {
            // No partially open session: give the bus back, then report.
            lock.release();
            return Err(OpenError::Mux(err));
        }

        log::debug!("session opened on mux {:#04x} channel {}", mux_addr, channel);

        Ok(Session {
            bus,
            lock: Some(lock),
            mux: Some(mux),
            opened_at: Instant::now(),
            closed: false,
        })
    }

    /// Which mux channel this session holds connected, if any
    pub fn channel(&self) -> Option<u8>
    {
        self.mux.as_ref().and_then(|mux| mux.selected())
    }

    /// Write `payload` to the peripheral at `addr`
    ///
    /// The session does not remember peripheral addresses; which device to
    /// talk to is the sensor driver's concern, supplied on every call.
    pub async fn write_bytes(&mut self, addr: u16, payload: &[u8]) -> Result<(), BusError>
    {
        self.bus.write_bytes(addr, payload).await
    }

    /// Read exactly `count` bytes from the peripheral at `addr`
    pub async fn read_bytes(&mut self, addr: u16, count: usize) -> Result<Vec<u8>, BusError>
    {
        self.bus.read_bytes(addr, count).await
    }

    /// End the session: disconnect the channel, then release the bus
    ///
    /// The lock is released no matter what; an `Err` here is the
    /// warning-class report that the channel clear write failed and the
    /// multiplexer's cleared state could not be confirmed. Callers polling on
    /// a schedule typically log it and move on.
    pub async fn close(mut self) -> Result<(), BusError>
    {
        self.closed = true;

        let cleared = match self.mux.as_mut() {
            Some(mux) => mux.deselect().await,
            None => Ok(()),
        };

        if let Some(lock) = self.lock.take() {
            lock.release();
        }

        log::debug!("session closed after {:?}", self.opened_at.elapsed());
        cleared
    }
}

impl <D> Drop for Session<'_, D>
    where D: RawI2c
{
    fn drop(&mut self)
    {
        if self.closed {
            return;
        }

        if let Some(mux) = self.mux.as_mut() {
            if let Err(err) = mux.deselect_blocking() {
                log::warn!("session dropped without close(): {}", err);
            }
        }
        // The lock field drops after this body and releases the bus, keeping
        // the deselect-then-release order.
    }
}
