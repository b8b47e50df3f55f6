// SPDX-License-Identifier: GPL-3.0-or-later

//! Transport to the TPM device.
//!
//! The broker talks to exactly one TPM through a [`Tcti`], either the
//! kernel character device or a simulator listening on a TCP socket.
//! Both speak raw TPM 2.0 framing; the difference is in how a response
//! is read back.

use log::debug;
use std::{
    fs::{self, File, OpenOptions},
    io::{Read, Write},
    net::TcpStream,
    os::unix::fs::FileTypeExt,
    path::Path,
    time::Duration,
};
use tpm2_proto::codec;

/// Status for TPM transport operations.
#[derive(Debug, strum_macros::Display, PartialEq, Eq)]
pub enum TctiError {
    /// Invalid data was received from the device.
    InvalidData,
    /// A read operation from the device failed.
    InvalidRead,
    /// A write operation to the device failed.
    InvalidWrite,
    /// The transport does not implement the operation.
    Unsupported,
}

/// Blocking transport carrying raw TPM 2.0 frames.
pub trait Tcti: Send {
    /// Transmit one complete command buffer.
    ///
    /// # Errors
    ///
    /// `TctiError::InvalidWrite` when the transport cannot take the
    /// whole buffer.
    fn transmit(&mut self, buf: &[u8]) -> Result<(), TctiError>;

    /// Receive one complete response into `buf`, blocking until the
    /// response arrives or `timeout` elapses (`None` blocks forever).
    /// Returns the response size.
    ///
    /// # Errors
    ///
    /// `TctiError::InvalidRead` on transport failure,
    /// `TctiError::InvalidData` when what arrives is not a response.
    fn receive(&mut self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize, TctiError>;

    /// Select the locality tagged onto subsequent transmissions.
    ///
    /// # Errors
    ///
    /// `TctiError::Unsupported` when the transport has no locality
    /// control.
    fn set_locality(&mut self, locality: u8) -> Result<(), TctiError>;
}

/// TCTI over a TPM character device such as `/dev/tpm0`.
///
/// The kernel device returns a whole response per read, so a single
/// read call suffices.
pub struct DeviceTcti {
    file: File,
}

impl DeviceTcti {
    /// Open the TPM character device at `path`.
    ///
    /// # Errors
    ///
    /// `TctiError::InvalidData` when the path does not name a character
    /// device or cannot be opened read-write.
    pub fn open(path: &str) -> Result<DeviceTcti, TctiError> {
        let path = Path::new(path);
        let metadata = fs::metadata(path).or(Err(TctiError::InvalidData))?;
        if !metadata.file_type().is_char_device() {
            return Err(TctiError::InvalidData);
        }
        let path = fs::canonicalize(path).or(Err(TctiError::InvalidData))?;
        debug!("device tcti: {}", path.display());
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .or(Err(TctiError::InvalidData))?;
        Ok(DeviceTcti { file })
    }
}

impl Tcti for DeviceTcti {
    fn transmit(&mut self, buf: &[u8]) -> Result<(), TctiError> {
        self.file.write_all(buf).or(Err(TctiError::InvalidWrite))
    }

    fn receive(&mut self, buf: &mut [u8], _timeout: Option<Duration>) -> Result<usize, TctiError> {
        let n = self.file.read(buf).or(Err(TctiError::InvalidRead))?;
        if n < codec::HEADER_SIZE || codec::size(buf) as usize != n {
            return Err(TctiError::InvalidData);
        }
        Ok(n)
    }

    fn set_locality(&mut self, _locality: u8) -> Result<(), TctiError> {
        Err(TctiError::Unsupported)
    }
}

/// TCTI over a TCP connection to a TPM simulator.
///
/// The stream has no record boundaries, so a response is read as its
/// 10 byte header followed by the remainder the header promises.
pub struct SocketTcti {
    stream: TcpStream,
    locality: u8,
}

impl SocketTcti {
    /// Connect to the simulator at `address:port`.
    ///
    /// # Errors
    ///
    /// `TctiError::InvalidData` when the endpoint cannot be reached.
    pub fn connect(address: &str, port: u16) -> Result<SocketTcti, TctiError> {
        let stream = TcpStream::connect((address, port)).or(Err(TctiError::InvalidData))?;
        stream.set_nodelay(true).or(Err(TctiError::InvalidData))?;
        debug!("socket tcti: {address}:{port}");
        Ok(SocketTcti {
            stream,
            locality: 0,
        })
    }
}

impl Tcti for SocketTcti {
    fn transmit(&mut self, buf: &[u8]) -> Result<(), TctiError> {
        self.stream.write_all(buf).or(Err(TctiError::InvalidWrite))
    }

    fn receive(&mut self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize, TctiError> {
        self.stream
            .set_read_timeout(timeout)
            .or(Err(TctiError::InvalidRead))?;
        if buf.len() < codec::HEADER_SIZE {
            return Err(TctiError::InvalidData);
        }
        self.stream
            .read_exact(&mut buf[..codec::HEADER_SIZE])
            .or(Err(TctiError::InvalidRead))?;
        let size = codec::size(buf) as usize;
        if size < codec::HEADER_SIZE || size > buf.len() {
            return Err(TctiError::InvalidData);
        }
        self.stream
            .read_exact(&mut buf[codec::HEADER_SIZE..size])
            .or(Err(TctiError::InvalidRead))?;
        Ok(size)
    }

    fn set_locality(&mut self, locality: u8) -> Result<(), TctiError> {
        // Raw framing carries no locality; remember it so the intent is
        // at least visible in the logs.
        self.locality = locality;
        debug!("socket tcti: locality {locality}");
        Ok(())
    }
}
