//! XDG-style path discovery, generalized from the teacher's `paths.rs`
//! (which located a daemon socket and model directories) down to the one
//! thing this crate's ambient tooling needs: where `config.toml` lives.

use std::path::PathBuf;

/// The directory `TomlVoiceConfig` looks under for `spiel/config.toml`.
///
/// Tries `XDG_CONFIG_HOME` first, then falls back to the `dirs` crate's
/// platform-appropriate config directory (`~/.config` on Linux).
pub fn config_dir() -> Option<PathBuf> {
    std::env::var("XDG_CONFIG_HOME")
        .ok()
        .map(PathBuf::from)
        .or_else(dirs::config_dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xdg_config_home_takes_precedence() {
        std::env::set_var("XDG_CONFIG_HOME", "/tmp/xdg-config-test");
        assert_eq!(config_dir(), Some(PathBuf::from("/tmp/xdg-config-test")));
        std::env::remove_var("XDG_CONFIG_HOME");
    }
}
