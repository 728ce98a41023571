//! **A**synchronous-**R**ust **C**ontrol of **S**hared **I2C** buses on single board computers
//!
//! # Purpose
//! General-purpose I2C libraries assume the bus cooperates. On a headless
//! sensor rig it eventually will not: a peripheral or a channel multiplexer
//! hangs mid-transfer, the blocking syscall never returns, and the whole
//! process wedges in a way that is indistinguishable from "still working" --
//! until someone drives out to power-cycle the box. This crate is the narrow,
//! hardware-specific layer that makes those failures loud and contained
//! instead of silent and total:
//!
//!   - every bus or multiplexer transfer runs under a fixed deadline and is
//!     abandoned, flagged, and fenced off when it misses it;
//!   - the bus is owned by at most one [`Session`] at a time, with a second
//!     claim refused immediately rather than queued behind a possibly hung
//!     one;
//!   - every session exit -- return, error, drop, task cancellation -- puts
//!     the bus back in a known state: multiplexer cleared first, lock
//!     released second.
//!
//! Sensor drivers sit on top and speak to an open [`Session`] with plain
//! [`write_bytes`](Session::write_bytes) / [`read_bytes`](Session::read_bytes)
//! calls; they decode registers themselves and decide for themselves whether
//! a failed poll is worth a log line or an escalation.
//!
//! # Getting Started
//! Open the bus device once per process, wrap it in a [`BusHandle`], and open
//! a short-lived session per transaction group:
//!
//! ```no_run
//! use arcs_i2c::{ BusHandle, I2cCharDev, Session };
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Raspberry Pi header pins are bus 1.
//!     let bus = BusHandle::with(I2cCharDev::open(1)?);
//!
//!     // A thermocouple amplifier behind channel 1 of a TCA9548A at 0x70.
//!     let mut session = Session::open_muxed(&bus, 0x70, 1).await?;
//!     session.write_bytes(0x67, &[0x01]).await?;
//!     let reply = session.read_bytes(0x67, 2).await?;
//!     session.close().await?;
//!
//!     println!("raw reading: {:02x?}", reply);
//!     Ok(())
//! }
//! ```
//!
//! Directly wired peripherals skip the multiplexer arguments and use
//! [`Session::open`].
//!
//! # When the bus wedges
//! A transfer that outlives the deadline returns [`BusError::Timeout`] and
//! the [`BusHandle`] refuses everything afterwards with [`BusError::Wedged`].
//! That is deliberate: the abandoned transfer may still be squatting on the
//! hardware, so the only safe recovery is to open the device node again and
//! hand the fresh handle to [`BusHandle::reset`]. Retrying into a wedged bus
//! is the failure mode this crate exists to eliminate, so nothing here will
//! do it for you.
//!
//! # Compatibility
//! One session covers one group of independent transfers. Peripherals that
//! need the bus held across a write and a dependent read with no teardown in
//! between are not supported; see the notes on [`Session`].

pub mod bus;
#[cfg(target_os = "linux")]
pub mod cdev;
pub mod mux;
pub mod raw;
pub mod session;
pub mod timeout;

#[cfg(test)]
mod mock;

pub use bus::{ BusError, BusHandle, BusLock, BusyError, DEFAULT_TIMEOUT };
#[cfg(target_os = "linux")]
pub use cdev::I2cCharDev;
pub use mux::{ MuxController, ProtocolError, CHANNEL_COUNT };
pub use raw::RawI2c;
pub use session::{ OpenError, Session };
pub use timeout::{ run_with_timeout, TimeoutError };
