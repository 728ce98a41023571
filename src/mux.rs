//! Channel selection on an addressable I2C multiplexer
//!
//! TCA9548A class multiplexers hang eight downstream channels off one
//! upstream bus and are themselves just another peripheral: writing a one-hot
//! mask to their address connects the matching channel, writing zero
//! disconnects everything. Reading one byte back returns the control register,
//! which is the only confirmation the part offers that a select actually
//! latched.
//!
//! The controller here is a two-state machine, `Idle` or selected, and it is
//! deliberately strict: selecting on top of a live channel is refused rather
//! than silently switched, and deselecting *always* ends in `Idle` even when
//! the clear write fails, because a stale mask the software believes in is
//! worse than a cleared state the hardware may not have confirmed. Channel
//! state is volatile hardware state -- nothing here survives a process
//! restart, and every session re-establishes the channel it needs from
//! scratch.

use std::fmt;

use crate::bus::{ BusError, BusHandle };
use crate::raw::RawI2c;

/// Downstream channels on the supported multiplexers
pub const CHANNEL_COUNT: u8 = 8;

/// Control byte that disconnects every downstream channel
const CLEAR_CHANNELS: u8 = 0x00;

/// Multiplexer misuse or a failed channel transaction
#[derive(Debug)]
pub enum ProtocolError
{
    /// `select` was called while another channel was still connected
    ///
    /// Callers must deselect first; implicit channel switching would let two
    /// logical transactions interleave on different channels under one lock.
    AlreadySelected { selected: u8, requested: u8 },
    /// The requested channel does not exist on an 8-channel part
    ChannelOutOfRange(u8),
    /// The control register did not read back the mask that was written
    ///
    /// The part never latched the select; the state machine stays `Idle`.
    ChannelMismatch { expected: u8, observed: u8 },
    /// The select transaction itself failed on the bus
    Bus(BusError),
}

impl From<BusError> for ProtocolError
{
    fn from(err: BusError) -> Self
    {
        Self::Bus(err)
    }
}

impl fmt::Display for ProtocolError
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            Self::AlreadySelected { selected, requested } => write!(
                f,
                "channel {} is still connected; deselect before selecting channel {}",
                selected, requested
            ),
            Self::ChannelOutOfRange(channel) => write!(
                f,
                "channel {} does not exist; multiplexer channels are 0..={}",
                channel,
                CHANNEL_COUNT - 1
            ),
            Self::ChannelMismatch { expected, observed } => write!(
                f,
                "multiplexer did not latch the select: wrote {:#04x}, read back {:#04x}",
                expected, observed
            ),
            Self::Bus(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// State machine for one multiplexer on one bus
///
/// Borrows the [`BusHandle`] for its lifetime; channel-select commands are
/// ordinary bus transfers and inherit the same deadline discipline as sensor
/// traffic.
pub struct MuxController<'b, D>
{
    bus: &'b BusHandle<D>,
    addr: u16,
    selected: Option<u8>,
}

impl <'b, D> MuxController<'b, D>
    where D: RawI2c
{
    /// Controller for the multiplexer at `addr`, starting `Idle`
    pub fn with(bus: &'b BusHandle<D>, addr: u16) -> Self
    {
        Self {
            bus,
            addr,
            selected: None,
        }
    }

    /// The channel currently believed connected, if any
    pub fn selected(&self) -> Option<u8>
    {
        self.selected
    }

    /// Connect a downstream channel
    ///
    /// Writes the one-hot mask for `channel` and confirms it by reading the
    /// control register back once. Any failure -- range check, bus fault,
    /// readback disagreement -- leaves the state machine `Idle`. No retries
    /// happen here; a caller that wants another attempt opens another
    /// session.
    pub async fn select(&mut self, channel: u8) -> Result<(), ProtocolError>
    {
        if channel >= CHANNEL_COUNT {
            return Err(ProtocolError::ChannelOutOfRange(channel));
        }
        if let Some(selected) = self.selected {
            return Err(ProtocolError::AlreadySelected { selected, requested: channel });
        }

        let mask = 1u8 << channel;
        self.bus.write_bytes(self.addr, &[mask]).await?;

        let readback = self.bus.read_bytes(self.addr, 1).await?;
        if readback[0] != mask {
            return Err(ProtocolError::ChannelMismatch { expected: mask, observed: readback[0] });
        }

        self.selected = Some(channel);
        Ok(())
    }

    /// Disconnect whatever channel is connected
    ///
    /// The state machine moves to `Idle` no matter what the clear write does.
    /// A failed clear is reported back as a warning-class error so the caller
    /// can log or escalate, but it never blocks teardown: a bus left
    /// permanently locked is a worse outcome than a multiplexer whose cleared
    /// state was not confirmed.
    pub async fn deselect(&mut self) -> Result<(), BusError>
    {
        if self.selected.is_none() {
            return Ok(());
        }

        self.selected = None;
        match self.bus.write_bytes(self.addr, &[CLEAR_CHANNELS]).await {
            Ok(()) => Ok(()),
            Err(err) => {
                log::warn!("multiplexer at {:#04x} may still have a channel connected: {}", self.addr, err);
                Err(err)
            }
        }
    }

    /// Drop-path variant of [`deselect`](Self::deselect)
    ///
    /// Uses the refusing blocking write so destructors cannot hang; same
    /// unconditional transition to `Idle`.
    pub(crate) fn deselect_blocking(&mut self) -> Result<(), BusError>
    {
        if self.selected.is_none() {
            return Ok(());
        }

        self.selected = None;
        match self.bus.blocking_write(self.addr, &[CLEAR_CHANNELS]) {
            Ok(()) => Ok(()),
            Err(err) => {
                log::warn!("multiplexer at {:#04x} may still have a channel connected: {}", self.addr, err);
                Err(err)
            }
        }
    }
}
