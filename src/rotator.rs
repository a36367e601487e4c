use std::net::SocketAddr;

/// Round-robin over the configured connection targets. The sole policy: no
/// weights, no health awareness.
#[derive(Debug, Clone, Default)]
pub struct AddressRotator {
    addresses: Vec<SocketAddr>,
    cursor: usize,
}

impl AddressRotator {
    pub fn new(addresses: Vec<SocketAddr>) -> AddressRotator {
        AddressRotator {
            addresses,
            cursor: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    pub fn next_target(&mut self) -> Option<SocketAddr> {
        if self.addresses.is_empty() {
            self.cursor = 0;
            return None;
        }
        let address = self.addresses[self.cursor];
        self.cursor = (self.cursor + 1) % self.addresses.len();
        Some(address)
    }

    /// Replaces the target list; the cursor restarts at the front.
    pub fn update(&mut self, addresses: Vec<SocketAddr>) {
        self.addresses = addresses;
        self.cursor = 0;
    }
}
