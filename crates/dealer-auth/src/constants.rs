//! Auth-server constants shared by the store and the refresh exchange.

/// Key under which the current credential pair is persisted.
pub const CREDENTIALS_KEY: &str = "dealer.credentials";

/// Default refresh endpoint path, relative to the API base URL.
pub const DEFAULT_REFRESH_PATH: &str = "/auth/refresh-token";
