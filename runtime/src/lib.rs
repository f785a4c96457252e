extern crate alloc;

use alloc::collections::VecDeque;
use core::cell::RefCell;
use core::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use core::time::Duration;
use std::io::{self, ErrorKind};

use collections::bytes::{Cursor, Slice};
use log::error;
use stakker::Fwd;

mod rt;
pub mod time;

pub use rt::*;

#[cfg(target_family = "unix")]
mod sys {
	pub use std::os::fd::{AsRawFd, RawFd};

	pub use libc::{
		c_void as BufType, in_addr, poll, pollfd as Poll, recv, recvfrom, send, sendto, sockaddr, sockaddr_in, socklen_t, AF_INET, POLLERR, POLLHUP,
		POLLIN, POLLNVAL, POLLOUT,
	};

	pub fn as_raw<T: AsRawFd>(t: &T) -> RawFd {
		t.as_raw_fd()
	}
}

#[cfg(target_family = "windows")]
mod sys {
	pub use std::os::windows::io::AsRawSocket as AsRawFd;

	pub use u8 as BufType;
	pub use windows_sys::Win32::Networking::WinSock::{
		recv, recvfrom, send, sendto, AF_INET, IN_ADDR as in_addr, SOCKADDR as sockaddr, SOCKADDR_IN as sockaddr_in, SOCKET as RawFd,
		WSAPoll as poll, WSAPOLLFD as Poll, POLLERR, POLLHUP, POLLNVAL, POLLRDNORM as POLLIN, POLLWRNORM as POLLOUT,
	};

	pub type socklen_t = i32;

	pub fn as_raw<T: AsRawFd>(t: &T) -> RawFd {
		t.as_raw_socket() as _
	}
}

pub mod udp;

pub use sys::AsRawFd;
use sys::*;
use utils::error::*;

fn as_timeout(t: Option<Duration>) -> i32 {
	t.and_then(|d| d.as_millis().try_into().ok()).unwrap_or(-1)
}

fn ret_to_err(val: isize) -> Result<Option<usize>> {
	match TryInto::<usize>::try_into(val) {
		Ok(n) => Ok(Some(n)),
		Err(_) => {
			let err = io::Error::last_os_error();

			if matches!(err.kind(), ErrorKind::WouldBlock) {
				return Ok(None);
			}

			error!("I/O operation failed: {err}");
			Err(())
		}
	}
}

fn send(fd: RawFd, buf: &[u8]) -> Result<bool> {
	let r = unsafe { sys::send(fd, buf.as_ptr() as *mut BufType, buf.len() as _, 0) };

	if let Some(n) = ret_to_err(r as _)? {
		if n != buf.len() {
			error!("Only sent {}/{} bytes to socket", n, buf.len());
			return Err(());
		}

		Ok(true)
	} else {
		Ok(false)
	}
}

fn recv(fd: RawFd, buf: &mut Slice) -> Result<bool> {
	let r = unsafe { sys::recv(fd, buf.as_mut_ptr() as *mut BufType, buf.len() as _, 0) };

	if let Some(n) = ret_to_err(r as _)? {
		buf.truncate(n);
		Ok(true)
	} else {
		Ok(false)
	}
}

/// Build a `sockaddr_in` from an IPv4 [SocketAddr]. Panics on an IPv6 address: this runtime only
/// speaks IPv4 on its datagram sockets.
fn to_sockaddr(addr: SocketAddr) -> sockaddr_in {
	let SocketAddr::V4(addr) = addr else { panic!("IPv6 is not supported on datagram sockets") };

	let mut sa: sockaddr_in = unsafe { core::mem::zeroed() };

	sa.sin_family = AF_INET as _;
	sa.sin_port = addr.port().to_be();
	sa.sin_addr = in_addr { s_addr: u32::from_ne_bytes(addr.ip().octets()) };

	sa
}

fn from_sockaddr(sa: &sockaddr_in) -> SocketAddr {
	let ip = Ipv4Addr::from(sa.sin_addr.s_addr.to_ne_bytes());
	let port = u16::from_be(sa.sin_port);

	SocketAddr::V4(SocketAddrV4::new(ip, port))
}

fn send_to(fd: RawFd, buf: &[u8], addr: SocketAddr) -> Result<bool> {
	let sa = to_sockaddr(addr);

	let r = unsafe {
		sys::sendto(
			fd,
			buf.as_ptr() as *const BufType,
			buf.len() as _,
			0,
			&sa as *const sockaddr_in as *const sockaddr,
			core::mem::size_of::<sockaddr_in>() as socklen_t,
		)
	};

	if let Some(n) = ret_to_err(r as _)? {
		if n != buf.len() {
			error!("Only sent {}/{} bytes to socket", n, buf.len());
			return Err(());
		}

		Ok(true)
	} else {
		Ok(false)
	}
}

fn recv_from(fd: RawFd, buf: &mut Slice) -> Result<Option<SocketAddr>> {
	let mut sa: sockaddr_in = unsafe { core::mem::zeroed() };
	let mut len: socklen_t = core::mem::size_of::<sockaddr_in>() as socklen_t;

	let r = unsafe {
		sys::recvfrom(
			fd,
			buf.as_mut_ptr() as *mut BufType,
			buf.len() as _,
			0,
			&mut sa as *mut sockaddr_in as *mut sockaddr,
			&mut len,
		)
	};

	if let Some(n) = ret_to_err(r as _)? {
		buf.truncate(n);
		Ok(Some(from_sockaddr(&sa)))
	} else {
		Ok(None)
	}
}

thread_local! {
	static GLOBAL: RefCell<State> = const {
		RefCell::new(State {
			fds: Vec::new(),
			entries: Vec::new()
		})
	};
}

struct State {
	fds: Vec<Poll>,
	entries: Vec<Entry>,
}

impl State {
	fn with<X, F: FnOnce(&mut Self) -> X>(f: F) -> X {
		GLOBAL.with(|x| f(&mut x.borrow_mut()))
	}

	fn idx_of<T: AsRawFd>(&mut self, socket: &T) -> usize {
		let raw = as_raw(socket);
		self.fds.iter().position(|f| f.fd == raw).expect("Socket is present")
	}

	/// Returns whether any more I/O is waiting.
	fn is_io(&self) -> bool {
		!self.fds.is_empty()
	}

	/// Poll the fds. Returns whether any file descriptors are ready for I/O.
	fn poll(&mut self, timeout: Option<Duration>) -> Result<bool> {
		let ret = unsafe {
			poll(
				self.fds.as_mut_ptr(),
				self.fds.len().try_into().expect("Fewer than u32::MAX fds"),
				as_timeout(timeout),
			)
		};

		let mut pending: u32 = ret.try_into().map_err(|_| error!("poll() failed: {}", io::Error::last_os_error()))?;

		if pending == 0 {
			return Ok(false);
		}

		for idx in 0.. {
			let Poll { fd, events, revents } = &mut self.fds[idx];
			let entry = &mut self.entries[idx];

			if *revents == 0 {
				continue;
			}

			if *revents & POLLERR != 0 {
				panic!("Socket error while polling");
			}

			if *revents & POLLHUP != 0 {
				panic!("Socket hangup");
			}

			if *revents & POLLNVAL != 0 {
				panic!("Socket invalid");
			}

			if *revents & POLLIN != 0 {
				entry.flush_read(*fd)?;
			}

			if *revents & POLLOUT != 0 {
				entry.flush_write(*fd)?;
			};

			*events = POLLIN;

			if entry.has_pending_write() {
				*events |= POLLOUT;
			}

			*revents = 0;

			pending -= 1;

			if pending == 0 {
				break;
			}
		}

		Ok(true)
	}
}

enum Entry {
	/// A connected stream-like fd: plain `recv`/`send`, as used for the tunnel device.
	Stream { fwd: Fwd<Slice>, queue: VecDeque<Box<[u8]>> },
	/// An unconnected datagram socket: `recvfrom`/`sendto`, carrying a peer address per packet.
	Datagram { fwd: Fwd<(SocketAddr, Slice)>, queue: VecDeque<(SocketAddr, Box<[u8]>)> },
}

impl Entry {
	fn has_pending_write(&self) -> bool {
		match self {
			Entry::Stream { queue, .. } => !queue.is_empty(),
			Entry::Datagram { queue, .. } => !queue.is_empty(),
		}
	}

	fn flush_read(&mut self, fd: RawFd) -> Result {
		match self {
			Entry::Stream { fwd, .. } => {
				let mut buf = Slice::new(1500);

				while recv(fd, &mut buf)? {
					fwd.fwd(buf);
					buf = Slice::new(1500);
				}
			}
			Entry::Datagram { fwd, .. } => {
				let mut buf = Slice::new(1500);

				while let Some(addr) = recv_from(fd, &mut buf)? {
					fwd.fwd((addr, buf));
					buf = Slice::new(1500);
				}
			}
		}

		Ok(())
	}

	fn flush_write(&mut self, fd: RawFd) -> Result {
		match self {
			Entry::Stream { queue, .. } => {
				assert!(!queue.is_empty());

				loop {
					let Some(buf) = queue.back_mut() else { return Ok(()) };

					if !send(fd, buf)? {
						return Ok(());
					}

					queue.pop_back();
				}
			}
			Entry::Datagram { queue, .. } => {
				assert!(!queue.is_empty());

				loop {
					let Some((addr, buf)) = queue.back_mut() else { return Ok(()) };

					if !send_to(fd, buf, *addr)? {
						return Ok(());
					}

					queue.pop_back();
				}
			}
		}
	}
}

pub struct Io<T: AsRawFd> {
	inner: T,
}

impl<T: AsRawFd> Io<T> {
	pub fn new(inner: T, fwd: Fwd<Slice>) -> Self {
		State::with(|i| {
			i.fds.push(Poll { fd: as_raw(&inner), events: POLLIN, revents: 0 });

			i.entries.push(Entry::Stream { fwd, queue: VecDeque::new() });

			Self { inner }
		})
	}

	pub fn write<X>(&self, f: impl FnOnce(Cursor) -> X) -> Result<X> {
		let mut vec = vec![0; 1500];
		let res = Cursor::vec(&mut vec, f);

		if !send(as_raw(&self.inner), &mut vec)? {
			State::with(|i| {
				let idx = i.idx_of(&self.inner);

				let Entry::Stream { queue, .. } = &mut i.entries[idx] else { unreachable!() };
				queue.push_front(vec.into_boxed_slice());
				i.fds[idx].events |= POLLOUT;
			});
		}

		Ok(res)
	}
}

impl<T: AsRawFd> Drop for Io<T> {
	fn drop(&mut self) {
		State::with(|i| {
			let idx = i.idx_of(&self.inner);
			i.entries.swap_remove(idx);
			i.fds.swap_remove(idx);
		})
	}
}
