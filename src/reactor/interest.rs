use mio::Interest as MioInterest;

bitflags::bitflags! {
    /// The readiness events a registration (see
    /// [`ReactorCore::register`](super::ReactorCore::register)) may be
    /// interested in. `ACCEPT` and `CONNECT` are distinct names for the same
    /// underlying readiness bit `mio` exposes (readable / writable
    /// respectively); the distinction is meaningful to callers even though
    /// the OS does not separate them.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct Interest: u8 {
        const READ = 0b0001;
        const WRITE = 0b0010;
        const ACCEPT = 0b0100;
        const CONNECT = 0b1000;
    }
}

impl Interest {
    /// Translates this semantic interest set to the `mio` interest it
    /// requires. Panics if empty: callers must deregister instead of
    /// registering with no bits set.
    pub(crate) fn to_mio(self) -> MioInterest {
        let readable = self.intersects(Interest::READ | Interest::ACCEPT);
        let writable = self.intersects(Interest::WRITE | Interest::CONNECT);
        match (readable, writable) {
            (true, true) => MioInterest::READABLE | MioInterest::WRITABLE,
            (true, false) => MioInterest::READABLE,
            (false, true) => MioInterest::WRITABLE,
            (false, false) => panic!("Interest::to_mio called on an empty interest set"),
        }
    }
}
