use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use std::time::Duration;

use chainerror::*;

use crate::error::*;

/// A connected byte stream a [`StreamTransport`](crate::StreamTransport)
/// can be built on.
pub trait Stream: Read + Write + Send + Sync {
    fn split(&mut self) -> Result<(Box<dyn Read + Send + Sync>, Box<dyn Write + Send + Sync>)>;
    fn shutdown(&mut self) -> Result<()>;
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<()>;
}

impl Stream for TcpStream {
    #[inline]
    fn split(&mut self) -> Result<(Box<dyn Read + Send + Sync>, Box<dyn Write + Send + Sync>)> {
        Ok((
            Box::new(TcpStream::try_clone(self).map_context(ErrorKind::from_io)?),
            Box::new(TcpStream::try_clone(self).map_context(ErrorKind::from_io)?),
        ))
    }

    #[inline]
    fn shutdown(&mut self) -> Result<()> {
        TcpStream::shutdown(self, Shutdown::Both).map_context(ErrorKind::from_io)?;
        Ok(())
    }

    #[inline]
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        TcpStream::set_read_timeout(self, timeout).map_context(ErrorKind::from_io)?;
        Ok(())
    }
}

#[cfg(unix)]
impl Stream for UnixStream {
    #[inline]
    fn split(&mut self) -> Result<(Box<dyn Read + Send + Sync>, Box<dyn Write + Send + Sync>)> {
        Ok((
            Box::new(UnixStream::try_clone(self).map_context(ErrorKind::from_io)?),
            Box::new(UnixStream::try_clone(self).map_context(ErrorKind::from_io)?),
        ))
    }

    #[inline]
    fn shutdown(&mut self) -> Result<()> {
        UnixStream::shutdown(self, Shutdown::Both).map_context(ErrorKind::from_io)?;
        Ok(())
    }

    #[inline]
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        UnixStream::set_read_timeout(self, timeout).map_context(ErrorKind::from_io)?;
        Ok(())
    }
}
