/// Tavern Crypto Library
///
/// Seals the identity cookie handed to browsers. The cookie wraps a signed
/// JWT in AES-256-GCM so the token itself never reaches client script.
pub mod cookie;
pub mod keys;

pub use cookie::{open_cookie, seal_cookie};
pub use keys::CookieKey;
