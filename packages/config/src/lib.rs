// ABOUTME: Environment variable name constants
// ABOUTME: Centralized definitions of all environment variable names used across ChunkHost

// Storage
pub const CHUNKHOST_DATABASE_URL: &str = "CHUNKHOST_DATABASE_URL";

// Provisioning template
pub const DEFAULT_OS_IMAGE: &str = "DEFAULT_OS_IMAGE";
pub const CHUNKHOST_WELCOME_MESSAGE: &str = "CHUNKHOST_WELCOME_MESSAGE";
pub const CHUNKHOST_WATERMARK: &str = "CHUNKHOST_WATERMARK";

// Container runtime
pub const DOCKER_NETWORK: &str = "DOCKER_NETWORK";
pub const CHUNKHOST_BUILD_DIR: &str = "CHUNKHOST_BUILD_DIR";
pub const CHUNKHOST_BUILD_TIMEOUT_SECS: &str = "CHUNKHOST_BUILD_TIMEOUT_SECS";
pub const CHUNKHOST_RUN_TIMEOUT_SECS: &str = "CHUNKHOST_RUN_TIMEOUT_SECS";
pub const CHUNKHOST_STOP_TIMEOUT_SECS: &str = "CHUNKHOST_STOP_TIMEOUT_SECS";

// Quota
pub const MAX_VPS_PER_USER: &str = "MAX_VPS_PER_USER";

// Abuse monitor
pub const CHUNKHOST_MONITOR_INTERVAL_SECS: &str = "CHUNKHOST_MONITOR_INTERVAL_SECS";

// Logging
pub const RUST_LOG: &str = "RUST_LOG";
