use std::env;
use std::path::PathBuf;

/// Directory holding the transaction rendezvous sockets.
///
/// Overridable with `UIHARNESS_SOCKET_DIR`; both endpoints of a pairing must
/// agree on it.
pub fn socket_dir() -> PathBuf {
    env::var_os("UIHARNESS_SOCKET_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(env::temp_dir)
}

/// Socket the client emits on and the server listens on.
pub(crate) fn call_socket_path(dir: &std::path::Path, token: &str) -> PathBuf {
    dir.join(format!("uiharness-call_{token}.sock"))
}

/// Socket the server emits on and the client listens on.
pub(crate) fn reply_socket_path(dir: &std::path::Path, token: &str) -> PathBuf {
    dir.join(format!("uiharness-reply_{token}.sock"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_names_are_role_and_token_specific() {
        let dir = PathBuf::from("/tmp");
        let call = call_socket_path(&dir, "abc123");
        let reply = reply_socket_path(&dir, "abc123");
        assert_eq!(call, PathBuf::from("/tmp/uiharness-call_abc123.sock"));
        assert_eq!(reply, PathBuf::from("/tmp/uiharness-reply_abc123.sock"));
        assert_ne!(call, call_socket_path(&dir, "other"));
    }
}
