//! Passing a socket descriptor to another process over a unix socket.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::ptr;

/// Sends `fd` over the unix socket `socket` as `SCM_RIGHTS` ancillary data.
///
/// Stream sockets need at least one byte of real data to carry ancillary
/// data, so a single zero byte is sent with it unless `socket` is a
/// datagram socket.
pub fn send_fd(socket: BorrowedFd<'_>, fd: BorrowedFd<'_>) -> io::Result<()> {
    let datagram = socket_type(socket)? == libc::SOCK_DGRAM;

    let mut dummy = [0u8; 1];
    let mut iov = libc::iovec {
        iov_base: dummy.as_mut_ptr().cast(),
        iov_len: dummy.len(),
    };

    let fds: [RawFd; 1] = [fd.as_raw_fd()];
    let payload_len = mem::size_of_val(&fds) as libc::c_uint;
    // SAFETY: CMSG_SPACE is a pure size computation.
    let space = unsafe { libc::CMSG_SPACE(payload_len) } as usize;
    let mut control = vec![0u8; space];

    // SAFETY: msghdr is plain data; all-zero is a valid empty header.
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    if !datagram {
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
    }
    msg.msg_control = control.as_mut_ptr().cast();
    msg.msg_controllen = space as _;

    // SAFETY: `control` is CMSG_SPACE bytes long, enough for one header
    // carrying `fds`, and outlives every pointer derived from it here.
    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        if cmsg.is_null() {
            return Err(io::Error::other("control buffer too small"));
        }
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(payload_len) as _;
        ptr::copy_nonoverlapping(fds.as_ptr(), libc::CMSG_DATA(cmsg).cast::<RawFd>(), fds.len());
    }

    loop {
        // SAFETY: `msg` points at live buffers for the duration of the call.
        let sent = unsafe { libc::sendmsg(socket.as_raw_fd(), &msg, 0) };
        if sent >= 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

fn socket_type(socket: BorrowedFd<'_>) -> io::Result<libc::c_int> {
    let mut kind: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    // SAFETY: `kind` and `len` are valid for writes of the sizes passed.
    let rc = unsafe {
        libc::getsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_TYPE,
            (&mut kind as *mut libc::c_int).cast(),
            &mut len,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::fd::{AsFd, FromRawFd, OwnedFd};
    use std::os::unix::net::{UnixDatagram, UnixStream};

    fn recv_fd(socket: BorrowedFd<'_>) -> io::Result<(OwnedFd, usize)> {
        let mut data = [0u8; 1];
        let mut iov = libc::iovec {
            iov_base: data.as_mut_ptr().cast(),
            iov_len: data.len(),
        };
        let space = unsafe { libc::CMSG_SPACE(mem::size_of::<RawFd>() as libc::c_uint) } as usize;
        let mut control = vec![0u8; space];

        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr().cast();
        msg.msg_controllen = space as _;

        let read = unsafe { libc::recvmsg(socket.as_raw_fd(), &mut msg, 0) };
        if read < 0 {
            return Err(io::Error::last_os_error());
        }
        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            assert!(!cmsg.is_null(), "no control message received");
            assert_eq!((*cmsg).cmsg_level, libc::SOL_SOCKET);
            assert_eq!((*cmsg).cmsg_type, libc::SCM_RIGHTS);
            let fd = ptr::read_unaligned(libc::CMSG_DATA(cmsg).cast::<RawFd>());
            Ok((OwnedFd::from_raw_fd(fd), read as usize))
        }
    }

    #[test]
    fn test_passes_working_descriptor_over_stream_socket() {
        let (sender, receiver) = UnixStream::pair().unwrap();
        let (mut ours, theirs) = UnixStream::pair().unwrap();

        send_fd(sender.as_fd(), theirs.as_fd()).unwrap();
        drop(theirs);

        let (fd, data_len) = recv_fd(receiver.as_fd()).unwrap();
        assert_eq!(data_len, 1);

        let mut passed = UnixStream::from(fd);
        passed.write_all(b"via passed fd").unwrap();
        drop(passed);

        let mut got = Vec::new();
        ours.read_to_end(&mut got).unwrap();
        assert_eq!(got, b"via passed fd");
    }

    #[test]
    fn test_datagram_socket_sends_no_dummy_byte() {
        let (sender, receiver) = UnixDatagram::pair().unwrap();
        let (_ours, theirs) = UnixStream::pair().unwrap();

        send_fd(sender.as_fd(), theirs.as_fd()).unwrap();
        let (_fd, data_len) = recv_fd(receiver.as_fd()).unwrap();
        assert_eq!(data_len, 0);
    }

    #[test]
    fn test_rejects_non_socket() {
        let file = tempfile::tempfile().unwrap();
        let (_ours, theirs) = UnixStream::pair().unwrap();
        assert!(send_fd(file.as_fd(), theirs.as_fd()).is_err());
    }
}
