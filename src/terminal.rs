//! Resolution of the `TerminalIdentity` that scopes upload status and id
//! allocation. Out of scope per spec.md §1: probing the terminal's pixel
//! font size via ioctl/terminfo. This module only reads environment hints.

use sha2::{Digest, Sha256};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TerminalIdentity {
    pub terminal_name: String,
    pub terminal_id: String,
    pub session_id: String,
}

impl TerminalIdentity {
    /// Resolve once per process from environment variables, falling back to
    /// a fingerprint of `$TERM` plus the parent process id when the
    /// terminal doesn't expose a native window/session id.
    pub fn resolve() -> TerminalIdentity {
        let terminal_name = std::env::var("TERM").unwrap_or_else(|_| "unknown".to_string());

        let terminal_id = std::env::var("KITTY_WINDOW_ID").unwrap_or_else(|_| {
            let tty = std::env::var("SSH_TTY")
                .or_else(|_| std::env::var("GPG_TTY"))
                .unwrap_or_default();
            let mut hasher = Sha256::new();
            hasher.update(terminal_name.as_bytes());
            hasher.update(tty.as_bytes());
            let digest = hasher.finalize();
            digest.iter().take(8).map(|b| format!("{b:02x}")).collect()
        });

        let session_id = std::env::var("KITTY_PID").unwrap_or_else(|_| parent_pid().to_string());

        TerminalIdentity { terminal_name, terminal_id, session_id }
    }

    /// Name the per-(terminal identity, id space) database file.
    pub fn db_file_name(&self, space_name: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.terminal_name.as_bytes());
        hasher.update(b"\0");
        hasher.update(self.terminal_id.as_bytes());
        let digest = hasher.finalize();
        let short: String = digest.iter().take(8).map(|b| format!("{b:02x}")).collect();
        format!("{short}-{space_name}.db")
    }
}

#[cfg(unix)]
fn parent_pid() -> u32 {
    rustix::process::getppid()
        .map(|p| p.as_raw_nonzero().get() as u32)
        .unwrap_or_else(std::process::id)
}

#[cfg(not(unix))]
fn parent_pid() -> u32 {
    std::process::id()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_file_name_is_stable_for_same_identity() {
        let id = TerminalIdentity {
            terminal_name: "xterm-kitty".into(),
            terminal_id: "42".into(),
            session_id: "1".into(),
        };
        assert_eq!(id.db_file_name("24bit"), id.db_file_name("24bit"));
        assert_ne!(id.db_file_name("24bit"), id.db_file_name("8bit"));
    }
}
