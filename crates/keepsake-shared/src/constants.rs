/// Application name
pub const APP_NAME: &str = "Keepsake";

/// PBKDF2 salt size in bytes
pub const SALT_SIZE: usize = 32;

/// AES-256-GCM nonce (IV) size in bytes
pub const IV_SIZE: usize = 12;

/// AES-256-GCM authentication tag size in bytes
pub const TAG_SIZE: usize = 16;

/// Derived symmetric key size in bytes (AES-256)
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// PBKDF2-HMAC-SHA256 iteration count.
/// Changing this breaks decryption of every blob already written.
pub const PBKDF2_ITERATIONS: u32 = 100_000;

/// Mean Earth radius in meters (spherical approximation)
pub const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// Maximum upload size in bytes (10 MiB)
pub const MAX_UPLOAD_SIZE: usize = 10 * 1024 * 1024;

/// Capsules a user may own without a paid entitlement
pub const FREE_TIER_CAPSULE_LIMIT: u32 = 2;

/// Default HTTP API port (server)
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Public wall listing cap
pub const WALL_PAGE_LIMIT: u32 = 100;

/// Likes above which a wall entry is shown as featured
pub const FEATURED_LIKES_THRESHOLD: i64 = 50;

/// Number of entries returned by the featured wall query
pub const FEATURED_LIMIT: u32 = 6;

/// Snapshot text used when a public capsule has no body
pub const EMPTY_WALL_CONTENT: &str = "No content available";
