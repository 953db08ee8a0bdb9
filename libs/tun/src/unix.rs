use std::{
    io,
    os::fd::{AsRawFd as _, OwnedFd},
};

use tokio::io::unix::AsyncFd;

use crate::Tun;

/// A [`Tun`] over a raw TUN file descriptor handed in by the host.
///
/// The fd is switched to non-blocking and driven through the tokio reactor;
/// each read or write moves exactly one IP packet.
pub struct FdTun {
    fd: AsyncFd<OwnedFd>,
    name: String,
}

impl FdTun {
    pub fn new(fd: OwnedFd) -> io::Result<Self> {
        Self::with_name(fd, "tun")
    }

    pub fn with_name(fd: OwnedFd, name: &str) -> io::Result<Self> {
        set_nonblocking(&fd)?;

        Ok(Self {
            fd: AsyncFd::new(fd)?,
            name: name.to_owned(),
        })
    }

    /// A second handle onto the same device, so each copy direction can be
    /// driven from its own task.
    pub fn try_clone(&self) -> io::Result<Self> {
        let fd = self.fd.get_ref().try_clone()?;

        Ok(Self {
            fd: AsyncFd::new(fd)?,
            name: self.name.clone(),
        })
    }
}

#[async_trait::async_trait]
impl Tun for FdTun {
    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable_mut().await?;

            match guard.try_io(|fd| read(fd.as_raw_fd(), buf)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    async fn send(&mut self, packet: &[u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.writable_mut().await?;

            match guard.try_io(|fd| write(fd.as_raw_fd(), packet)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

fn read(fd: i32, buf: &mut [u8]) -> io::Result<usize> {
    // SAFETY: The buffer outlives the call and its length is passed along.
    let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };

    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(n as usize)
}

fn write(fd: i32, buf: &[u8]) -> io::Result<usize> {
    // SAFETY: The buffer outlives the call and its length is passed along.
    let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };

    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(n as usize)
}

fn set_nonblocking(fd: &OwnedFd) -> io::Result<()> {
    // SAFETY: fcntl on an owned, open descriptor.
    let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL) };

    if flags < 0 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: See above.
    let rc = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) };

    if rc < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}
