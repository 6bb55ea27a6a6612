/// Tunables for a [`Stack`](crate::Stack).
#[derive(Debug, Clone)]
pub struct Config {
    /// Initial capacity of each epoll set's reusable token buffer. Grows on
    /// demand when more watched sockets have outstanding operations.
    pub token_capacity: usize,
    /// Initial capacity of each epoll set's host event batch buffer.
    pub host_event_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            token_capacity: 32,
            host_event_capacity: 64,
        }
    }
}
