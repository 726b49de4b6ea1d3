// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Non-blocking I/O helpers for the PTY master file descriptor.

use std::io;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use tokio::io::unix::AsyncFd;

/// Newtype wrapper around the PTY master `OwnedFd` for use with `AsyncFd`.
#[derive(Debug)]
pub struct MasterFd(pub OwnedFd);

impl AsRawFd for MasterFd {
    fn as_raw_fd(&self) -> std::os::fd::RawFd {
        self.0.as_raw_fd()
    }
}

/// Put the fd into non-blocking mode so `AsyncFd` readiness is accurate.
pub fn set_nonblocking(fd: &impl AsFd) -> io::Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(io_err)?;
    let flags = OFlag::from_bits_truncate(flags);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK)).map_err(io_err)?;
    Ok(())
}

/// Read one chunk from the master fd, waiting for readiness.
pub async fn read_chunk(afd: &AsyncFd<MasterFd>, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        let mut guard = afd.readable().await?;
        match guard.try_io(|inner| {
            let n = nix::unistd::read(&inner.get_ref().0, buf).map_err(io_err)?;
            Ok(n)
        }) {
            Ok(result) => return result,
            Err(_would_block) => continue,
        }
    }
}

/// Write the whole buffer to the master fd, waiting for writability.
pub async fn write_all(afd: &AsyncFd<MasterFd>, data: &[u8]) -> io::Result<()> {
    let mut offset = 0;
    while offset < data.len() {
        let mut guard = afd.writable().await?;
        match guard.try_io(|inner| {
            let n = nix::unistd::write(&inner.get_ref().0, &data[offset..]).map_err(io_err)?;
            Ok(n)
        }) {
            Ok(Ok(n)) => offset += n,
            Ok(Err(e)) => return Err(e),
            Err(_would_block) => continue,
        }
    }
    Ok(())
}

fn io_err(e: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}
