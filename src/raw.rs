//! The byte-level boundary between this crate and the platform's I2C device
//!
//! Everything above this trait is policy: locking, deadlines, channel
//! selection, teardown ordering. Everything below it is a plain blocking
//! transfer against whatever the platform calls an I2C master. Keeping the
//! boundary this small is what lets the whole locking and fault-isolation
//! layer run against scripted stand-ins in the test suite while production
//! code runs against `/dev/i2c` (see [`I2cCharDev`]).
//!
//! [`I2cCharDev`]: crate::cdev::I2cCharDev

use std::io;

/// Blocking raw transfers to peripherals on one physical I2C bus
///
/// Implementations perform exactly one bus transaction per call and return as
/// soon as the kernel (or the fake) does. They must not retry, sleep, or hold
/// state across calls beyond the open device itself -- deadline enforcement
/// and retry policy are layered on top by [`BusHandle`] and its callers.
///
/// The `Send + 'static` bounds exist because transfers are pushed onto the
/// async runtime's blocking pool so a wedged peripheral cannot stall the
/// process.
///
/// [`BusHandle`]: crate::bus::BusHandle
pub trait RawI2c: Send + 'static
{
    /// Write `bytes` to the peripheral at `addr` in a single transaction
    fn raw_write(&mut self, addr: u16, bytes: &[u8]) -> io::Result<()>;

    /// Read exactly `buf.len()` bytes from the peripheral at `addr`
    ///
    /// A short read is an error, never a partial fill.
    fn raw_read(&mut self, addr: u16, buf: &mut [u8]) -> io::Result<()>;
}
