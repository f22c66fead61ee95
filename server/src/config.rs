//! Server and daemon configuration
//!
//! Options are read from JSON using the LibSOE option names. Anything left
//! out takes its default; unknown keys are reported and ignored.

use log::warn;
use serde::Deserialize;
use soe_shared::{DEFAULT_PORT, DEFAULT_PROTOCOL_NAME, DEFAULT_UDP_LENGTH};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::ServerError;

const MIN_UDP_LENGTH: u32 = 16;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ServerConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(rename = "ID")]
    pub id: u32,
    pub roles: Vec<String>,
    pub app_name: String,
    pub short_app_name: String,
    pub protocol_name: String,
    /// Seconds of silence before a client is dropped
    pub client_timeout: u64,
    /// Milliseconds between idle sweeps
    pub keep_alive_interval: u64,
    /// Milliseconds to back off after a failed receive
    pub server_thread_sleep: u64,
    /// Accepted for LibSOE configs; pools always run `MaxThreadPoolSize` workers
    pub want_dynamic_threading: bool,
    pub min_thread_pool_size: usize,
    pub max_thread_pool_size: usize,
    pub want_packet_threading: bool,
    pub want_message_threading: bool,
    pub udp_length: u32,
    pub max_message_size: usize,
    pub receive_buffer_size: usize,
    #[serde(flatten)]
    unrecognized: HashMap<String, serde_json::Value>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "SOEServer".to_string(),
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            id: 4001,
            roles: Vec::new(),
            app_name: "Sony Online".to_string(),
            short_app_name: "SOE".to_string(),
            protocol_name: DEFAULT_PROTOCOL_NAME.to_string(),
            client_timeout: 30,
            keep_alive_interval: 1000,
            server_thread_sleep: 13,
            want_dynamic_threading: true,
            min_thread_pool_size: 2,
            max_thread_pool_size: 8,
            want_packet_threading: true,
            want_message_threading: true,
            udp_length: DEFAULT_UDP_LENGTH,
            max_message_size: 1 << 20,
            receive_buffer_size: 4096,
            unrecognized: HashMap::new(),
        }
    }
}

impl ServerConfig {
    /// Parses one server's options from a JSON object
    pub fn from_json(json: &str) -> Result<Self, ServerError> {
        let config: ServerConfig = serde_json::from_str(json)?;
        Ok(config.validated())
    }

    /// Warns about unknown options and clamps values the transport cannot run with
    pub fn validated(mut self) -> Self {
        let mut unknown: Vec<_> = self.unrecognized.drain().map(|(key, _)| key).collect();
        unknown.sort();
        for key in unknown {
            warn!("{}: ignoring unrecognized option '{}'", self.name, key);
        }

        if self.max_thread_pool_size == 0 {
            warn!("{}: MaxThreadPoolSize must be at least 1", self.name);
            self.max_thread_pool_size = 1;
        }
        if self.min_thread_pool_size > self.max_thread_pool_size {
            warn!(
                "{}: MinThreadPoolSize {} exceeds MaxThreadPoolSize, using {}",
                self.name, self.min_thread_pool_size, self.max_thread_pool_size
            );
            self.min_thread_pool_size = self.max_thread_pool_size;
        }
        if self.udp_length < MIN_UDP_LENGTH {
            warn!(
                "{}: UdpLength {} is too small, using {}",
                self.name, self.udp_length, MIN_UDP_LENGTH
            );
            self.udp_length = MIN_UDP_LENGTH;
        }
        if self.receive_buffer_size < self.udp_length as usize {
            self.receive_buffer_size = self.udp_length as usize;
        }
        self
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval.max(1))
    }

    pub fn server_thread_sleep(&self) -> Duration {
        Duration::from_millis(self.server_thread_sleep)
    }

    /// Largest payload that fits a single `RELIABLE_DATA` packet
    pub fn max_reliable_payload(&self) -> usize {
        self.udp_length as usize - soe_shared::RELIABLE_HEADER_LEN
    }

    /// Payload bytes carried by each fragment of a fragmented message
    pub fn fragment_size(&self) -> usize {
        self.udp_length as usize - soe_shared::FRAGMENT_HEADER_LEN
    }
}

/// Every server the daemon runs, keyed by name
#[derive(Debug, Clone, Default)]
pub struct DaemonConfig {
    pub servers: BTreeMap<String, ServerConfig>,
}

impl DaemonConfig {
    pub fn from_json(json: &str) -> Result<Self, ServerError> {
        let raw: BTreeMap<String, ServerConfig> = serde_json::from_str(json)?;
        let servers = raw
            .into_iter()
            .map(|(name, mut config)| {
                config.name = name.clone();
                (name, config.validated())
            })
            .collect();
        Ok(Self { servers })
    }

    pub fn load(path: &Path) -> Result<Self, ServerError> {
        let json = fs::read_to_string(path)?;
        Self::from_json(&json)
    }
}
