//! MIME types.

/// /nix-cache-info
pub const NIX_CACHE_INFO: &str = "text/x-nix-cache-info";

/// .narinfo
pub const NARINFO: &str = "text/x-nix-narinfo";

/// .nar
pub const NAR: &str = "application/x-nix-nar";
