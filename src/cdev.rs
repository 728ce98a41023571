//! Linux `/dev/i2c` character device backend
//!
//! This is the production implementation of [`RawI2c`] for Raspberry Pi class
//! boards: open the bus's character device, tell the kernel which peripheral
//! the next transfer targets via the `I2C_SLAVE` ioctl, then use ordinary file
//! reads and writes. The kernel driver performs one complete I2C transaction
//! per read/write call, which is exactly the granularity the layers above
//! assume.
//!
//! Only 7-bit addressing is supported; the address is masked accordingly
//! before it reaches the kernel.

use std::fs::{ File, OpenOptions };
use std::io::{ self, Read, Write };
use std::os::unix::io::AsRawFd;
use std::path::{ Path, PathBuf };

use crate::raw::RawI2c;

/// `I2C_SLAVE` ioctl request from `linux/i2c-dev.h`
const I2C_SLAVE: u16 = 0x0703;

mod ioctl
{
    nix::ioctl_write_int_bad!(set_slave_address, super::I2C_SLAVE);
}

/// An open handle to one `/dev/i2c-N` bus
///
/// The device is opened once and lives for the whole process; every
/// [`Session`] borrows it through its [`BusHandle`]. Dropping the value closes
/// the file descriptor.
///
/// # Bus numbering
/// Raspberry Pi boards expose the header I2C pins as bus 1 by default. Using
/// any other bus number requires a device tree overlay in the boot
/// configuration.
///
/// [`Session`]: crate::session::Session
/// [`BusHandle`]: crate::bus::BusHandle
pub struct I2cCharDev
{
    device: File,
    path: PathBuf,
}

impl I2cCharDev
{
    /// Open the character device for bus number `bus` (`/dev/i2c-{bus}`)
    pub fn open(bus: u32) -> io::Result<Self>
    {
        Self::open_path(format!("/dev/i2c-{}", bus))
    }

    /// Open an explicitly named device node
    ///
    /// Useful for boards whose overlays place buses at nonstandard paths.
    pub fn open_path<P: AsRef<Path>>(path: P) -> io::Result<Self>
    {
        let device = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())?;

        Ok(Self {
            device,
            path: path.as_ref().to_owned(),
        })
    }

    /// The device node this handle was opened from
    pub fn path(&self) -> &Path
    {
        &self.path
    }

    /// Point the kernel driver at the peripheral for the next transfer
    // TODO support 10-bit addressing via I2C_TENBIT once a peripheral needs it
    fn select_device(&self, addr: u16) -> io::Result<()>
    {
        let masked = (addr & 0x7F) as nix::libc::c_int;

        unsafe { ioctl::set_slave_address(self.device.as_raw_fd(), masked) }
            .map_err(|errno| io::Error::from_raw_os_error(errno as i32))?;

        Ok(())
    }
}

impl RawI2c for I2cCharDev
{
    fn raw_write(&mut self, addr: u16, bytes: &[u8]) -> io::Result<()>
    {
        self.select_device(addr)?;
        self.device.write_all(bytes)
    }

    fn raw_read(&mut self, addr: u16, buf: &mut [u8]) -> io::Result<()>
    {
        self.select_device(addr)?;
        self.device.read_exact(buf)
    }
}
