//! Scripted stand-ins for the platform I2C device, for the unit tests
//!
//! A [`Script`] is the test's handle: it queues read payloads, injects
//! errnos, inserts stalls, and inspects the write traffic afterwards. The
//! [`MockDevice`] it hands out is the thing that moves into a `BusHandle`,
//! sharing the script's state so the test keeps visibility after the move.

use std::collections::VecDeque;
use std::io;
use std::sync::{ Arc, Mutex };
use std::time::Duration;

use crate::bus::EREMOTEIO;
use crate::raw::RawI2c;

#[derive(Default)]
struct Shared
{
    written: Mutex<Vec<(u16, Vec<u8>)>>,
    reads: Mutex<VecDeque<Vec<u8>>>,
    write_errno: Mutex<Option<i32>>,
    read_errno: Mutex<Option<i32>>,
    delay: Mutex<Option<Duration>>,
}

/// Shared view of everything a [`MockDevice`] has seen and will do next
#[derive(Clone, Default)]
pub struct Script
{
    shared: Arc<Shared>,
}

impl Script
{
    /// A device wired to this script; may be called again after a bus reset
    pub fn device(&self) -> MockDevice
    {
        MockDevice { script: self.clone() }
    }

    /// Queue the payload the next read will return
    pub fn queue_read(&self, bytes: &[u8])
    {
        self.shared.reads.lock().unwrap().push_back(bytes.to_vec());
    }

    /// Every write fails with `errno` until told otherwise
    pub fn fail_writes(&self, errno: Option<i32>)
    {
        *self.shared.write_errno.lock().unwrap() = errno;
    }

    /// Every read fails with `errno` until told otherwise
    pub fn fail_reads(&self, errno: Option<i32>)
    {
        *self.shared.read_errno.lock().unwrap() = errno;
    }

    /// Stall every transfer, emulating a hung peripheral
    pub fn delay_all(&self, delay: Option<Duration>)
    {
        *self.shared.delay.lock().unwrap() = delay;
    }

    /// All `(addr, payload)` writes that reached the device, in order
    pub fn written(&self) -> Vec<(u16, Vec<u8>)>
    {
        self.shared.written.lock().unwrap().clone()
    }
}

pub struct MockDevice
{
    script: Script,
}

impl MockDevice
{
    fn stall(&self)
    {
        let delay = *self.script.shared.delay.lock().unwrap();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
    }
}

impl RawI2c for MockDevice
{
    fn raw_write(&mut self, addr: u16, bytes: &[u8]) -> io::Result<()>
    {
        self.stall();

        if let Some(errno) = *self.script.shared.write_errno.lock().unwrap() {
            return Err(io::Error::from_raw_os_error(errno));
        }

        self.script.shared.written.lock().unwrap().push((addr, bytes.to_vec()));
        Ok(())
    }

    fn raw_read(&mut self, _addr: u16, buf: &mut [u8]) -> io::Result<()>
    {
        self.stall();

        if let Some(errno) = *self.script.shared.read_errno.lock().unwrap() {
            return Err(io::Error::from_raw_os_error(errno));
        }

        match self.script.shared.reads.lock().unwrap().pop_front() {
            Some(bytes) if bytes.len() == buf.len() => {
                buf.copy_from_slice(&bytes);
                Ok(())
            }
            // Nothing scripted, or a length the test did not anticipate:
            // behave like an absent peripheral.
            Some(_) | None => Err(io::Error::from_raw_os_error(EREMOTEIO)),
        }
    }
}
