//! A reactor-integrated, unconnected UDP socket: `recvfrom`/`sendto` against an address supplied
//! per packet, as opposed to [`Io`](crate::Io)'s connected stream semantics.

use core::net::SocketAddr;
use std::net::UdpSocket as StdUdpSocket;

use collections::bytes::Slice;
use stakker::Fwd;

use crate::sys::{as_raw, AsRawFd, Poll, POLLIN};
use crate::{Entry, State};
use utils::error::*;

/// An unconnected, non-blocking UDP socket bound to a fixed local address.
pub struct Socket {
	inner: StdUdpSocket,
}

impl Socket {
	/// Binds a new socket and registers its reads with the reactor. `fwd` receives `(peer, datagram)`
	/// for every packet read off the wire.
	pub fn bind(addr: SocketAddr, fwd: Fwd<(SocketAddr, Slice)>) -> Result<Self> {
		let inner = StdUdpSocket::bind(addr).map_err(|err| log::error!("Failed to bind UDP socket on {addr}: {err}"))?;

		inner
			.set_nonblocking(true)
			.map_err(|err| log::error!("Failed to set UDP socket non-blocking: {err}"))?;

		State::with(|i| {
			i.fds.push(Poll { fd: as_raw(&inner), events: POLLIN, revents: 0 });
			i.entries.push(Entry::Datagram { fwd, queue: Default::default() });
		});

		Ok(Self { inner })
	}

	/// Enables sending to the broadcast address (e.g. 255.255.255.255) on this socket.
	pub fn set_broadcast(&self, on: bool) -> Result {
		self.inner.set_broadcast(on).map_err(|err| log::error!("Failed to set SO_BROADCAST: {err}"))
	}

	pub fn local_addr(&self) -> Result<SocketAddr> {
		self.inner.local_addr().map_err(|err| log::error!("Failed to read local address: {err}"))
	}

	/// Queues `buf` for delivery to `addr`. Sends immediately if the socket isn't currently
	/// write-blocked; otherwise appends to the reactor's outbound queue for this fd.
	pub fn send_to(&self, addr: SocketAddr, buf: Vec<u8>) -> Result {
		if !crate::send_to(as_raw(&self.inner), &buf, addr)? {
			State::with(|i| {
				let idx = i.idx_of(&self.inner);

				let Entry::Datagram { queue, .. } = &mut i.entries[idx] else {
					unreachable!("UDP socket fd registered as a stream entry")
				};

				queue.push_front((addr, buf.into_boxed_slice()));
				i.fds[idx].events |= crate::sys::POLLOUT;
			});
		}

		Ok(())
	}
}

impl Drop for Socket {
	fn drop(&mut self) {
		State::with(|i| {
			let idx = i.idx_of(&self.inner);
			i.entries.swap_remove(idx);
			i.fds.swap_remove(idx);
		})
	}
}
