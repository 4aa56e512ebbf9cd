/// Where a client connects to: a Modbus/TCP server and the unit id it addresses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionTarget {
    pub host: String,
    pub port: u16,
    /// "host:port", kept in sync by the builders
    pub addr: String,
    pub unit_id: u8,
}

const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 502;
const DEFAULT_UNIT_ID: u8 = 1;

impl ConnectionTarget {
    #[must_use]
    pub fn new() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            addr: format!("{DEFAULT_HOST}:{DEFAULT_PORT}"),
            unit_id: DEFAULT_UNIT_ID,
        }
    }
    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self.addr = format!("{}:{}", self.host, self.port);
        self
    }
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self.addr = format!("{}:{}", self.host, self.port);
        self
    }
    #[must_use]
    pub const fn with_unit_id(mut self, unit_id: u8) -> Self {
        self.unit_id = unit_id;
        self
    }
    #[must_use]
    pub fn direct(host: impl Into<String>, port: u16) -> Self {
        Self::new().with_host(host).with_port(port)
    }
}

impl Default for ConnectionTarget {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_keep_addr_in_sync() {
        let t = ConnectionTarget::direct("10.0.0.5", 1502).with_unit_id(17);
        assert_eq!(t.addr, "10.0.0.5:1502");
        assert_eq!(t.unit_id, 17);
        assert_eq!(ConnectionTarget::default().addr, "127.0.0.1:502");
    }
}
