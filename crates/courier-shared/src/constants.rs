/// Application name
pub const APP_NAME: &str = "Courier";

/// Default WebSocket endpoint of the message server
pub const DEFAULT_SERVER_URL: &str = "ws://localhost:8080/ws";

/// Heartbeat (ping) interval in seconds
pub const DEFAULT_HEARTBEAT_SECS: u64 = 30;

/// Heartbeat intervals without any inbound frame before the link is
/// considered dead and force-closed
pub const DEFAULT_LIVENESS_MISSED_HEARTBEATS: u32 = 3;

/// First reconnect delay in milliseconds; doubled per attempt
pub const DEFAULT_RECONNECT_BASE_MS: u64 = 1_000;

/// Upper bound on the reconnect delay in seconds
pub const DEFAULT_RECONNECT_MAX_SECS: u64 = 32;

/// Reconnect attempts before the connection enters the terminal error state
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Default page size for conversation history reads
pub const DEFAULT_PAGE_SIZE: u32 = 50;

/// Sync-state key of the global checkpoint
pub const GLOBAL_SYNC_KEY: &str = "last_sync";

/// Prefix of per-conversation sync-state keys
pub const CONVERSATION_SYNC_PREFIX: &str = "conversation:";

/// Prefix of client ids synthesized for inbound messages that carry none
pub const SYNTHETIC_CLIENT_ID_PREFIX: &str = "srv-";

/// Maximum accepted inbound frame size in bytes (256 KiB)
pub const MAX_FRAME_SIZE: usize = 262_144;
