//! Shared protocol constants for the CT transfer and discovery wire formats

// Default ports
pub const DEFAULT_PORT: u16 = 8000;
pub const DISCOVERY_PORT: u16 = 47563;
pub const EXEC_PORT: u16 = 8765;

// Discovery markers. A reply is DISCOVER_REPLY, one space, then the JSON announcement.
pub const DISCOVER_REQUEST: &[u8] = b"CT_DISCOVER_REQUEST";
pub const DISCOVER_REPLY: &[u8] = b"CT_DISCOVER_REPLY";

// Largest discovery datagram we will read
pub const MAX_DATAGRAM: usize = 4096;

// Credentials travel in the clear on every request (LAN only, no TLS)
pub const TOKEN_HEADER: &str = "X-CT-Token";
pub const PASSWORD_HEADER: &str = "X-CT-Password";

// Maximum upload body accepted by a host (1 GiB)
pub const MAX_UPLOAD_BYTES: usize = 1024 * 1024 * 1024;

// Read size for streamed download bodies
pub const CHUNK_SIZE: usize = 64 * 1024;

// Activation manifest the run bootstrap uploads into the sandbox root
pub const RUNNER_MANIFEST: &str = "__ct_runserver__.json";

// Endpoint paths
pub mod endpoint {
    pub const LIST: &str = "/list";
    pub const DOWNLOAD: &str = "/download";
    pub const UPLOAD: &str = "/upload";
    pub const MKDIR: &str = "/mkdir";
    pub const DELETE: &str = "/delete";
    pub const RUN: &str = "/run";
}

// Centralized timeout constants for client calls and host-side execution
pub mod timeouts {
    use std::time::Duration;

    // Discovery window used by `join` (ms)
    pub const JOIN_DISCOVERY_MS: u64 = 1500;

    // Discovery window used by `ctlist` (ms)
    pub const LIST_DISCOVERY_MS: u64 = 2000;

    // TCP connect limit for every client call
    pub const CONNECT: Duration = Duration::from_secs(6);

    // Per-operation inactivity limits: the longest the client waits for the
    // response head or for the next body chunk, never the whole transfer
    pub const LIST: Duration = Duration::from_secs(6);
    pub const DOWNLOAD: Duration = Duration::from_secs(30);
    pub const UPLOAD: Duration = Duration::from_secs(30);
    // Uploads are sent in one request, so the host has until this deadline to
    // take the whole body: UPLOAD plus one second per started MiB
    pub fn upload_deadline(payload_len: usize) -> Duration {
        let mib = (payload_len as u64).div_ceil(1_048_576);
        UPLOAD + Duration::from_secs(mib)
    }

    pub const MKDIR: Duration = Duration::from_secs(10);
    pub const DELETE: Duration = Duration::from_secs(15);

    // Client waits a little longer than the host lets a command run
    pub const RUN: Duration = Duration::from_secs(25);
    pub const RUN_COMMAND: Duration = Duration::from_secs(20);

    // Download retry policy: transient connection failures only
    pub const DOWNLOAD_ATTEMPTS: u32 = 3;
    pub const RETRY_BACKOFF: Duration = Duration::from_secs(2);

    // How long the bootstrap waits for an execution listener to appear
    pub const ACTIVATION_POLLS: u32 = 5;
    pub const ACTIVATION_POLL_INTERVAL: Duration = Duration::from_secs(1);

    // Poll interval of the host-side runner watcher
    pub const WATCH_INTERVAL: Duration = Duration::from_secs(1);
}

/// Build the discovery reply datagram for an already-serialized announcement.
pub fn discovery_reply(announcement_json: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(DISCOVER_REPLY.len() + 1 + announcement_json.len());
    out.extend_from_slice(DISCOVER_REPLY);
    out.push(b' ');
    out.extend_from_slice(announcement_json);
    out
}

/// Split a discovery reply into its JSON payload; `None` if the marker is missing.
pub fn parse_discovery_reply(datagram: &[u8]) -> Option<&[u8]> {
    let rest = datagram.strip_prefix(DISCOVER_REPLY)?;
    rest.strip_prefix(b" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn reply_marker_is_stripped() {
        let dgram = discovery_reply(br#"{"port":8000}"#);
        assert!(dgram.starts_with(DISCOVER_REPLY));
        assert_eq!(parse_discovery_reply(&dgram), Some(&br#"{"port":8000}"#[..]));
    }

    #[test]
    fn foreign_datagrams_are_ignored() {
        assert!(parse_discovery_reply(b"HELLO {}").is_none());
        assert!(parse_discovery_reply(DISCOVER_REQUEST).is_none());
        // marker without separator
        assert!(parse_discovery_reply(DISCOVER_REPLY).is_none());
    }

    #[test]
    fn upload_deadline_grows_with_payload() {
        assert_eq!(timeouts::upload_deadline(0), timeouts::UPLOAD);
        assert_eq!(timeouts::upload_deadline(1), timeouts::UPLOAD + Duration::from_secs(1));
        let gib = timeouts::upload_deadline(MAX_UPLOAD_BYTES);
        assert_eq!(gib, timeouts::UPLOAD + Duration::from_secs(1024));
    }
}
